// src/docker/client.rs

//! `ContainerEngine` backed by the local Docker daemon.

use super::{
    ContainerEngine, ContainerSpec, ContainerStatus, ContainerSummary, EngineError, RestartPolicy,
};
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    InspectContainerOptions, ListContainersOptions, LogsOptions, NetworkingConfig,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{BuildImageOptions, CreateImageOptions};
use bollard::models::{
    BuildInfo, ContainerStateStatusEnum, CreateImageInfo, EndpointSettings, HealthConfig,
    HostConfig, Mount, MountTypeEnum, PortBinding, RestartPolicy as DockerRestartPolicy,
    RestartPolicyNameEnum,
};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::Docker;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, instrument};

const NOT_RUNNING: &str = "docker is not installed or not running";

pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect using `DOCKER_HOST` / the platform default socket and ping.
    ///
    /// On macOS a colima socket in the home directory is tried as a fallback.
    pub async fn connect() -> Result<Self, EngineError> {
        if let Ok(docker) = Docker::connect_with_local_defaults() {
            if docker.ping().await.is_ok() {
                return Ok(Self { docker });
            }
        }

        #[cfg(target_os = "macos")]
        {
            if let Some(socket) = dirs::home_dir().map(|h| h.join(".colima/docker.sock")) {
                if socket.exists() {
                    debug!(socket = %socket.display(), "trying colima socket");
                    let docker = Docker::connect_with_unix(
                        &socket.to_string_lossy(),
                        120,
                        bollard::API_DEFAULT_VERSION,
                    )
                    .map_err(|e| EngineError::Unavailable(format!("{NOT_RUNNING}: {e}")))?;

                    if docker.ping().await.is_ok() {
                        return Ok(Self { docker });
                    }
                }
            }
        }

        Err(EngineError::Unavailable(NOT_RUNNING.to_string()))
    }

    async fn wait_exit_code(docker: Docker, id: String) -> Result<i64, EngineError> {
        let options = WaitContainerOptions {
            condition: "next-exit",
        };
        let mut stream = docker.wait_container(&id, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Non-zero exits surface as an error carrying the code.
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(EngineError::api("wait", e)),
            None => Err(EngineError::api(
                "wait",
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "wait stream ended"),
            )),
        }
    }
}

fn is_status(err: &BollardError, code: u16) -> bool {
    matches!(err, BollardError::DockerResponseServerError { status_code, .. } if *status_code == code)
}

/// Gzipped tarball of a build context directory.
fn context_tarball(dir: &Path) -> std::io::Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", dir)?;
    builder.into_inner()?.finish()
}

fn container_config(spec: &ContainerSpec) -> Config<String> {
    let mounts = spec
        .mounts
        .iter()
        .map(|m| Mount {
            typ: Some(MountTypeEnum::BIND),
            source: Some(m.source.to_string_lossy().into_owned()),
            target: Some(m.target.clone()),
            read_only: Some(m.read_only),
            ..Default::default()
        })
        .collect::<Vec<_>>();

    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for (container_port, host_port) in &spec.ports {
        let key = format!("{container_port}/tcp");
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(host_port.to_string()),
            }]),
        );
    }

    let restart_policy = match spec.restart {
        RestartPolicy::Always => Some(DockerRestartPolicy {
            name: Some(RestartPolicyNameEnum::ALWAYS),
            maximum_retry_count: None,
        }),
        RestartPolicy::Never => None,
    };

    let healthcheck = spec.health_check.as_ref().map(|h| HealthConfig {
        test: Some(h.test.clone()),
        interval: Some(h.interval.as_nanos() as i64),
        timeout: Some(h.timeout.as_nanos() as i64),
        retries: Some(i64::from(h.retries)),
        ..Default::default()
    });

    let networking_config = spec.network.as_ref().map(|network| NetworkingConfig {
        endpoints_config: HashMap::from([(
            network.clone(),
            EndpointSettings {
                aliases: (!spec.network_aliases.is_empty()).then(|| spec.network_aliases.clone()),
                ..Default::default()
            },
        )]),
    });

    Config {
        image: Some(spec.image.clone()),
        cmd: (!spec.cmd.is_empty()).then(|| spec.cmd.clone()),
        env: Some(spec.env.clone()),
        labels: Some(spec.labels.clone().into_iter().collect()),
        exposed_ports: Some(exposed_ports),
        healthcheck,
        tty: Some(spec.tty),
        open_stdin: Some(spec.open_stdin),
        attach_stdin: Some(spec.open_stdin),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        host_config: Some(HostConfig {
            mounts: Some(mounts),
            port_bindings: Some(port_bindings),
            restart_policy,
            network_mode: spec.network.clone(),
            auto_remove: Some(spec.auto_remove),
            ..Default::default()
        }),
        networking_config,
        ..Default::default()
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_status(&e, 404) => Ok(false),
            Err(e) => Err(EngineError::api("inspect image", e)),
        }
    }

    #[instrument(skip(self))]
    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        let mut stderr = std::io::stderr();

        while let Some(item) = stream.next().await {
            match item {
                Ok(CreateImageInfo {
                    error: Some(message),
                    ..
                }) => {
                    return Err(EngineError::Pull {
                        image: image.to_string(),
                        message,
                    })
                }
                Ok(CreateImageInfo {
                    status: Some(status),
                    progress,
                    id,
                    ..
                }) => {
                    let line = match (id, progress) {
                        (Some(id), Some(p)) => format!("{id}: {status} {p}"),
                        (Some(id), None) => format!("{id}: {status}"),
                        (None, _) => status,
                    };
                    let _ = writeln!(stderr, "{line}");
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(EngineError::Pull {
                        image: image.to_string(),
                        message: e.to_string(),
                    })
                }
            }
        }

        Ok(())
    }

    #[instrument(skip(self, context_dir))]
    async fn build_image(
        &self,
        context_dir: &Path,
        dockerfile: &str,
        tag: &str,
    ) -> Result<(), EngineError> {
        let tarball = context_tarball(context_dir).map_err(EngineError::BuildContext)?;

        let options = BuildImageOptions {
            dockerfile: dockerfile.to_string(),
            t: tag.to_string(),
            rm: true,
            ..Default::default()
        };

        let mut stream = self.docker.build_image(options, None, Some(tarball.into()));
        let mut stderr = std::io::stderr();

        while let Some(item) = stream.next().await {
            match item {
                Ok(BuildInfo {
                    error: Some(err),
                    error_detail,
                    ..
                }) => {
                    let detail = error_detail.and_then(|d| d.message).unwrap_or_default();
                    error!(image = %tag, error = %err, "build failed");
                    return Err(EngineError::Build(if detail.is_empty() || detail == err {
                        err
                    } else {
                        format!("{err}: {detail}")
                    }));
                }
                Ok(BuildInfo {
                    stream: Some(s), ..
                }) => {
                    let _ = stderr.write_all(s.as_bytes());
                    let _ = stderr.flush();
                }
                Ok(BuildInfo {
                    status: Some(s), ..
                }) => debug!(status = %s, "build status"),
                Ok(_) => {}
                Err(e) => return Err(EngineError::api("build", e)),
            }
        }

        Ok(())
    }

    async fn find_container(&self, name: &str) -> Result<Option<String>, EngineError> {
        let options = ListContainersOptions {
            all: true,
            filters: HashMap::from([("name".to_string(), vec![format!("^/{name}$")])]),
            ..Default::default()
        };

        let found = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| EngineError::api("list containers", e))?;

        Ok(found.into_iter().find_map(|c| {
            let exact = c
                .names
                .as_ref()
                .is_some_and(|names| names.iter().any(|n| n.trim_start_matches('/') == name));
            if exact {
                c.id
            } else {
                None
            }
        }))
    }

    #[instrument(skip(self, spec), fields(image = %spec.image))]
    async fn create_container(
        &self,
        name: &str,
        spec: &ContainerSpec,
    ) -> Result<String, EngineError> {
        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config(spec))
            .await
            .map_err(|e| EngineError::api("create container", e))?;

        for warning in &response.warnings {
            tracing::warn!(container = %name, warning = %warning, "docker warning");
        }

        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| EngineError::api("start container", e))
    }

    async fn stop_container(&self, id: &str) -> Result<(), EngineError> {
        match self
            .docker
            .stop_container(id, Some(StopContainerOptions { t: 10 }))
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(e) if is_status(&e, 304) => Ok(()),
            Err(e) if is_status(&e, 404) => Err(EngineError::NotFound {
                kind: "container",
                name: id.to_string(),
            }),
            Err(e) => Err(EngineError::api("stop container", e)),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) => Err(EngineError::api("remove container", e)),
        }
    }

    async fn inspect_status(&self, id: &str) -> Result<ContainerStatus, EngineError> {
        let response = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| {
                if is_status(&e, 404) {
                    EngineError::NotFound {
                        kind: "container",
                        name: id.to_string(),
                    }
                } else {
                    EngineError::api("inspect container", e)
                }
            })?;

        let state = response.state.unwrap_or_default();
        let code = state.exit_code.unwrap_or(0);

        if state.dead == Some(true) {
            return Ok(ContainerStatus::Dead(code));
        }
        if state.restarting == Some(true) {
            return Ok(ContainerStatus::Restarting);
        }
        if state.paused == Some(true) {
            return Ok(ContainerStatus::Paused);
        }
        if state.running == Some(true) {
            return Ok(ContainerStatus::Running);
        }

        Ok(match state.status {
            Some(ContainerStateStatusEnum::CREATED) => ContainerStatus::Created,
            Some(ContainerStateStatusEnum::REMOVING) => ContainerStatus::Removing,
            Some(ContainerStateStatusEnum::EXITED) => ContainerStatus::Exited(code),
            Some(ContainerStateStatusEnum::DEAD) => ContainerStatus::Dead(code),
            _ => ContainerStatus::Unknown,
        })
    }

    async fn list_containers(
        &self,
        label: &str,
        all: bool,
    ) -> Result<Vec<ContainerSummary>, EngineError> {
        let options = ListContainersOptions {
            all,
            filters: HashMap::from([("label".to_string(), vec![label.to_string()])]),
            ..Default::default()
        };

        let found = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| EngineError::api("list containers", e))?;

        Ok(found
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .and_then(|n| n.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                state: c.state.unwrap_or_default(),
            })
            .collect())
    }

    async fn find_network(&self, name: &str) -> Result<Option<String>, EngineError> {
        let options = ListNetworksOptions {
            filters: HashMap::from([("name".to_string(), vec![name.to_string()])]),
        };

        let networks = self
            .docker
            .list_networks(Some(options))
            .await
            .map_err(|e| EngineError::api("list networks", e))?;

        // The name filter matches substrings.
        Ok(networks
            .into_iter()
            .find(|n| n.name.as_deref() == Some(name))
            .and_then(|n| n.id))
    }

    async fn create_network(&self, name: &str) -> Result<String, EngineError> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: "bridge".to_string(),
            check_duplicate: true,
            ..Default::default()
        };

        self.docker
            .create_network(options)
            .await
            .map_err(|e| EngineError::api("create network", e))?;

        self.find_network(name)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                kind: "network",
                name: name.to_string(),
            })
    }

    #[instrument(skip(self))]
    async fn run_attached(&self, id: &str) -> Result<i64, EngineError> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(true),
            ..Default::default()
        };

        let AttachContainerResults {
            mut output,
            mut input,
        } = self
            .docker
            .attach_container(id, Some(options))
            .await
            .map_err(|e| EngineError::api("attach", e))?;

        // Register the wait before starting so auto-removed containers
        // cannot exit unobserved.
        let waiter = tokio::spawn(Self::wait_exit_code(self.docker.clone(), id.to_string()));

        if let Err(e) = self.start_container(id).await {
            waiter.abort();
            return Err(e);
        }

        let stdin_pump = tokio::spawn(async move {
            let mut stdin = tokio::io::stdin();
            let _ = tokio::io::copy(&mut stdin, &mut input).await;
        });

        let mut stdout = tokio::io::stdout();
        while let Some(chunk) = output.next().await {
            let chunk = chunk.map_err(|e| EngineError::api("attach", e))?;
            stdout.write_all(&chunk.into_bytes()).await?;
            stdout.flush().await?;
        }
        stdin_pump.abort();

        waiter
            .await
            .map_err(|e| EngineError::api("wait", e))?
    }

    fn logs<'a>(&'a self, id: &'a str) -> BoxStream<'a, Result<Vec<u8>, EngineError>> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        };

        self.docker
            .logs(id, Some(options))
            .map(|item| {
                item.map(|out| out.into_bytes().to_vec())
                    .map_err(|e| EngineError::api("logs", e))
            })
            .boxed()
    }
}
