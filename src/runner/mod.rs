// src/runner/mod.rs

//! Local runner lifecycle controller.
//!
//! One session = one label. `start` walks a fixed sequence:
//!
//! 1. build the runner image
//! 2. refuse if the session label already has running containers
//! 3. refuse if the host port is taken
//! 4. ensure the session network
//! 5. optionally wipe the database directory
//! 6. start the database container and wait until it runs
//! 7. assemble the runner environment
//! 8. start the runner container
//!
//! Readiness, log following and stop are separate calls so the CLI can
//! present each step. Any failure after containers exist stops the session.

pub mod ephemeral;

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::compose::{Compose, ComposeError};
use crate::docker::{
    BindMount, ContainerSpec, Gateway, GatewayError, HealthCheck, LogsEnd, RestartPolicy,
};
use crate::env::{self, EnvError, Envs};
use crate::installer::DB_DATA_DIR;
use crate::readiness::{ReadinessError, ReadinessPoller};
use crate::util::{ensure_dir, is_port_free, normalize_version, recreate_dir, short_id};

pub const LABEL_KEY: &str = "io.mwaactl.session";
pub const IMAGE_REPOSITORY: &str = "amazon/mwaa-local";

const AIRFLOW_HOME: &str = "/usr/local/airflow";
const WEBSERVER_PORT: u16 = 8080;
const DEPENDENCY_SERVICE: &str = "postgres";
const DEPENDENCY_DATA_DIR: &str = "/var/lib/postgresql/data";
const DEPENDENCY_READY_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const FIXED_OVERRIDES: &[&str] = &["LOAD_EX=n", "EXECUTOR=Local"];

/* ---------------- errors ---------------- */

/// Lifecycle step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Build,
    Guard,
    Network,
    Reset,
    Dependency,
    Environment,
    Primary,
    Readiness,
    Stop,
    Logs,
    Ephemeral,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Build => "image build",
            Phase::Guard => "session check",
            Phase::Network => "network setup",
            Phase::Reset => "database reset",
            Phase::Dependency => "database container",
            Phase::Environment => "environment assembly",
            Phase::Primary => "runner container",
            Phase::Readiness => "readiness check",
            Phase::Stop => "stop",
            Phase::Logs => "log streaming",
            Phase::Ephemeral => "ephemeral container",
        })
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("local runner session {0} is already running")]
    AlreadyRunning(String),

    #[error("port {0} is already in use")]
    PortInUse(u16),

    #[error("interrupted during {0}")]
    Interrupted(Phase),

    #[error("{phase} failed")]
    Gateway {
        phase: Phase,
        #[source]
        source: GatewayError,
    },

    #[error("{phase} failed")]
    Compose {
        phase: Phase,
        #[source]
        source: ComposeError,
    },

    #[error("{phase} failed")]
    Env {
        phase: Phase,
        #[source]
        source: EnvError,
    },

    #[error("{phase} failed at {path:?}")]
    Io {
        phase: Phase,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{phase} failed")]
    Readiness {
        phase: Phase,
        #[source]
        source: ReadinessError,
    },
}

#[cfg(test)]
impl RunnerError {
    pub fn phase(&self) -> Option<Phase> {
        match self {
            RunnerError::AlreadyRunning(_) => Some(Phase::Guard),
            RunnerError::PortInUse(_) => Some(Phase::Guard),
            RunnerError::Interrupted(phase) => Some(*phase),
            RunnerError::Gateway { phase, .. }
            | RunnerError::Compose { phase, .. }
            | RunnerError::Env { phase, .. }
            | RunnerError::Io { phase, .. }
            | RunnerError::Readiness { phase, .. } => Some(*phase),
        }
    }
}

fn at(phase: Phase) -> impl FnOnce(GatewayError) -> RunnerError {
    move |source| RunnerError::Gateway { phase, source }
}

/* ---------------- options ---------------- */

/// Static description of one local runner session.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Absolute root of the installed runner files.
    pub clone_path: PathBuf,
    /// Absolute directory holding the `dags/` folder.
    pub dags_path: PathBuf,
    pub version: String,
    /// `mwaa-local-runner-<normalised version>`; prefixes container names.
    pub project: String,
    pub network: String,
    /// `key=value` label shared by every container of the session.
    pub label: String,
}

impl RunnerOptions {
    pub fn new(version: &str, clone_path: PathBuf, dags_path: PathBuf) -> Self {
        let project = format!("mwaa-local-runner-{}", normalize_version(version));
        Self {
            clone_path,
            dags_path,
            version: version.to_string(),
            network: project.clone(),
            label: format!("{LABEL_KEY}={project}"),
            project,
        }
    }

    pub fn image_tag(&self) -> String {
        format!("{IMAGE_REPOSITORY}:{}", normalize_version(&self.version))
    }

    pub fn container_name(&self, role: &str) -> String {
        format!("{}-{role}", self.project)
    }

    pub fn build_context(&self) -> PathBuf {
        self.clone_path.join("docker")
    }

    pub fn compose_file(&self) -> PathBuf {
        self.clone_path.join("docker").join("docker-compose-local.yml")
    }

    pub fn env_file(&self) -> PathBuf {
        self.clone_path
            .join("docker")
            .join("config")
            .join(".env.localrunner")
    }

    pub fn db_data_dir(&self) -> PathBuf {
        self.clone_path.join(DB_DATA_DIR)
    }

    fn label_pair(&self) -> (String, String) {
        let (k, v) = self.label.split_once('=').unwrap_or((self.label.as_str(), ""));
        (k.to_string(), v.to_string())
    }

    fn mount(&self, root: &Path, dir: &str, target: &str) -> BindMount {
        BindMount::new(root.join(dir), format!("{AIRFLOW_HOME}/{target}"))
    }

    /// dags, plugins and requirements mounts shared by most containers.
    pub fn workspace_mounts(&self) -> Vec<BindMount> {
        vec![
            self.mount(&self.dags_path, "dags", "dags"),
            self.mount(&self.clone_path, "plugins", "plugins"),
            self.mount(&self.clone_path, "requirements", "requirements"),
        ]
    }

    pub fn startup_mount(&self) -> BindMount {
        self.mount(&self.clone_path, "startup_script", "startup")
    }
}

/// Per-invocation start parameters.
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub port: u16,
    pub reset_db: bool,
    pub envs: Envs,
    /// Stream runner logs once the webserver is healthy.
    pub follow_logs: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            port: WEBSERVER_PORT,
            reset_db: false,
            envs: Envs::default(),
            follow_logs: false,
        }
    }
}

/// Containers of a started session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub dependency_id: String,
    pub primary_id: String,
    pub port: u16,
}

impl Session {
    pub fn url(&self) -> String {
        format!("http://localhost:{}", self.port)
    }
}

/* ---------------- controller ---------------- */

#[derive(Clone)]
pub struct Runner {
    gateway: Gateway,
    options: RunnerOptions,
    dependency_timeout: Duration,
}

impl Runner {
    pub fn new(gateway: Gateway, options: RunnerOptions) -> Self {
        Self {
            gateway,
            options,
            dependency_timeout: DEPENDENCY_READY_TIMEOUT,
        }
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    pub async fn build_image(&self) -> Result<(), RunnerError> {
        self.gateway
            .build_image(&self.options.build_context(), "Dockerfile", &self.options.image_tag())
            .await
            .map_err(at(Phase::Build))
    }

    /// Whether any container of this session is running.
    pub async fn is_running(&self) -> Result<bool, RunnerError> {
        let running = self
            .gateway
            .list_containers_by_label(&self.options.label, false)
            .await
            .map_err(at(Phase::Guard))?;

        for c in &running {
            warn!(container = %c.name, image = %c.image, state = %c.state, "session container still running");
        }
        Ok(!running.is_empty())
    }

    pub async fn start(&self, opts: &StartOptions) -> Result<Session, RunnerError> {
        self.build_image().await?;

        if self.is_running().await? {
            return Err(RunnerError::AlreadyRunning(self.options.project.clone()));
        }

        if !is_port_free(opts.port) {
            return Err(RunnerError::PortInUse(opts.port));
        }

        self.gateway
            .create_network(&self.options.network)
            .await
            .map_err(at(Phase::Network))?;

        self.prepare_db_data(opts.reset_db)?;

        let dependency_id = match self.start_dependency().await {
            Ok(id) => id,
            Err(e) => return Err(self.abort(e).await),
        };

        let env = match self.primary_environment(&opts.envs) {
            Ok(env) => env,
            Err(e) => return Err(self.abort(e).await),
        };

        let primary_id = match self.start_primary(env, opts.port).await {
            Ok(id) => id,
            Err(e) => return Err(self.abort(e).await),
        };

        Ok(Session {
            dependency_id,
            primary_id,
            port: opts.port,
        })
    }

    /// Wipe (when asked) and ensure the database directory, before the
    /// database container ever mounts it.
    fn prepare_db_data(&self, reset: bool) -> Result<(), RunnerError> {
        let dir = self.options.db_data_dir();
        let result = if reset {
            info!(path = %dir.display(), "resetting database directory");
            recreate_dir(&dir)
        } else {
            ensure_dir(&dir)
        };

        result.map_err(|source| RunnerError::Io {
            phase: Phase::Reset,
            path: dir,
            source,
        })
    }

    async fn start_dependency(&self) -> Result<String, RunnerError> {
        let compose_err = |source| RunnerError::Compose {
            phase: Phase::Dependency,
            source,
        };

        let compose = Compose::load(&self.options.compose_file()).map_err(compose_err)?;
        let image = compose
            .service_image(DEPENDENCY_SERVICE)
            .map_err(compose_err)?
            .to_string();
        let env = compose
            .service_environment(DEPENDENCY_SERVICE)
            .map_err(compose_err)?;

        let (label_key, label_value) = self.options.label_pair();
        let spec = ContainerSpec {
            image,
            env,
            labels: [(label_key, label_value)].into_iter().collect(),
            mounts: vec![BindMount::new(self.options.db_data_dir(), DEPENDENCY_DATA_DIR)],
            network: Some(self.options.network.clone()),
            network_aliases: vec![DEPENDENCY_SERVICE.to_string()],
            restart: RestartPolicy::Always,
            ..ContainerSpec::default()
        };

        let name = self.options.container_name(DEPENDENCY_SERVICE);
        let id = self
            .gateway
            .run_container(&name, &spec)
            .await
            .map_err(at(Phase::Dependency))?;

        self.gateway
            .wait_for_container_ready(&id, self.dependency_timeout)
            .await
            .map_err(at(Phase::Dependency))?;

        info!(container = %name, id = %short_id(&id), "database ready");
        Ok(id)
    }

    /// Base env file, fixed overrides, then the session overlay; empty
    /// overlay values never replace defaults.
    pub fn primary_environment(&self, envs: &Envs) -> Result<Vec<String>, RunnerError> {
        let base = env::parse_file(&self.options.env_file()).map_err(|source| RunnerError::Env {
            phase: Phase::Environment,
            source,
        })?;

        let overrides: Vec<String> = FIXED_OVERRIDES.iter().map(|s| s.to_string()).collect();
        Ok(env::merge([base, overrides, envs.to_vars()], true))
    }

    async fn start_primary(&self, env: Vec<String>, port: u16) -> Result<String, RunnerError> {
        let (label_key, label_value) = self.options.label_pair();

        let mut mounts = self.options.workspace_mounts();
        mounts.push(self.options.startup_mount());

        let spec = ContainerSpec {
            image: self.options.image_tag(),
            cmd: vec!["local-runner".to_string()],
            env,
            labels: [(label_key, label_value)].into_iter().collect(),
            mounts,
            ports: vec![(WEBSERVER_PORT, port)],
            network: Some(self.options.network.clone()),
            restart: RestartPolicy::Always,
            health_check: Some(HealthCheck {
                test: vec![
                    "CMD-SHELL".to_string(),
                    format!("[ -f {AIRFLOW_HOME}/airflow-webserver.pid ]"),
                ],
                interval: Duration::from_secs(30),
                timeout: Duration::from_secs(30),
                retries: 3,
            }),
            ..ContainerSpec::default()
        };

        self.gateway
            .run_container(&self.options.container_name("local-runner"), &spec)
            .await
            .map_err(at(Phase::Primary))
    }

    /// Stop whatever the session started and hand back the original error.
    async fn abort(&self, err: RunnerError) -> RunnerError {
        warn!(error = %err, "start failed, stopping session");
        if let Err(stop_err) = self.stop().await {
            error!(error = %stop_err, "failed to stop session after error");
        }
        err
    }

    /// Poll `<url>/health` until it answers 200. On failure, or when `cancel`
    /// fires first, the session is stopped before the error is returned.
    pub async fn wait_until_healthy(
        &self,
        session: &Session,
        poller: &ReadinessPoller,
        cancel: &CancellationToken,
    ) -> Result<(), RunnerError> {
        let url = format!("{}/health", session.url());
        debug!(url = %url, "waiting for webserver");

        let err = tokio::select! {
            biased;
            _ = cancel.cancelled() => RunnerError::Interrupted(Phase::Readiness),
            res = poller.wait(&url) => match res {
                Ok(()) => return Ok(()),
                Err(source) => RunnerError::Readiness {
                    phase: Phase::Readiness,
                    source,
                },
            },
        };
        Err(self.abort(err).await)
    }

    /// Stream runner logs to `out` until they end or `cancel` fires; a
    /// cancelled follow stops the session.
    pub async fn follow_logs<W: Write + Send>(
        &self,
        session: &Session,
        out: &mut W,
        cancel: &CancellationToken,
    ) -> Result<LogsEnd, RunnerError> {
        let end = self
            .gateway
            .stream_logs(&session.primary_id, out, cancel)
            .await
            .map_err(at(Phase::Logs))?;

        if end == LogsEnd::Cancelled {
            info!("log follow cancelled, stopping session");
            self.stop().await?;
        }
        Ok(end)
    }

    /// Label-scoped stop. Returns the number of containers stopped.
    pub async fn stop(&self) -> Result<usize, RunnerError> {
        self.gateway
            .stop_containers_by_label(&self.options.label)
            .await
            .map_err(at(Phase::Stop))
    }
}
