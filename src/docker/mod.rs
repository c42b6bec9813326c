// src/docker/mod.rs

//! Container engine gateway.
//!
//! `ContainerEngine` is the raw capability set of a local container daemon.
//! `Gateway` layers the lifecycle semantics on top of it:
//! - "create" always means "create fresh" (stale containers are removed)
//! - images are pulled on demand before creation
//! - readiness waits poll state until running, dead or timeout
//! - networks are created idempotently
//! - label-scoped listing and stopping
//!
//! The gateway holds no container state of its own between calls.

mod client;
mod error;

#[cfg(test)]
pub mod fake;

pub use client::DockerEngine;
pub use error::{EngineError, GatewayError};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::util::{short_id, strip_non_printable};

/* ---------------- container description ---------------- */

/// Bind mount from the host into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

impl BindMount {
    pub fn new(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }
}

/// Engine-level health probe declared at creation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub test: Vec<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RestartPolicy {
    #[default]
    Never,
    Always,
}

/// Everything needed to create one container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub mounts: Vec<BindMount>,
    /// `(container_port, host_port)` TCP mappings.
    pub ports: Vec<(u16, u16)>,
    pub network: Option<String>,
    pub network_aliases: Vec<String>,
    pub restart: RestartPolicy,
    pub health_check: Option<HealthCheck>,
    pub tty: bool,
    pub open_stdin: bool,
    pub auto_remove: bool,
}

/// Container state as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Restarting,
    Paused,
    Removing,
    Exited(i64),
    Dead(i64),
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
}

/* ---------------- engine capability ---------------- */

/// Raw operations of a local container engine.
///
/// Implementations translate engine failures into `EngineError` and never
/// cache state between calls.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn image_exists(&self, image: &str) -> Result<bool, EngineError>;

    /// Pull an image, reporting progress to the operator.
    async fn pull_image(&self, image: &str) -> Result<(), EngineError>;

    /// Build `tag` from `context_dir` using `dockerfile` (relative to the context).
    async fn build_image(
        &self,
        context_dir: &Path,
        dockerfile: &str,
        tag: &str,
    ) -> Result<(), EngineError>;

    /// Id of the container with exactly this name, running or not.
    async fn find_container(&self, name: &str) -> Result<Option<String>, EngineError>;

    async fn create_container(&self, name: &str, spec: &ContainerSpec)
        -> Result<String, EngineError>;

    async fn start_container(&self, id: &str) -> Result<(), EngineError>;

    async fn stop_container(&self, id: &str) -> Result<(), EngineError>;

    async fn remove_container(&self, id: &str) -> Result<(), EngineError>;

    async fn inspect_status(&self, id: &str) -> Result<ContainerStatus, EngineError>;

    /// Containers carrying `label` (`key=value`); running ones only unless `all`.
    async fn list_containers(
        &self,
        label: &str,
        all: bool,
    ) -> Result<Vec<ContainerSummary>, EngineError>;

    async fn find_network(&self, name: &str) -> Result<Option<String>, EngineError>;

    async fn create_network(&self, name: &str) -> Result<String, EngineError>;

    /// Attach the terminal to a created container, start it and block until
    /// it stops. Returns the exit code.
    async fn run_attached(&self, id: &str) -> Result<i64, EngineError>;

    /// Follow combined stdout/stderr of a container.
    fn logs<'a>(&'a self, id: &'a str) -> BoxStream<'a, Result<Vec<u8>, EngineError>>;
}

/* ---------------- gateway ---------------- */

/// How a log follow ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogsEnd {
    StreamEnded,
    Cancelled,
}

#[derive(Clone)]
pub struct Gateway {
    engine: Arc<dyn ContainerEngine>,
    poll_interval: Duration,
}

impl Gateway {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub async fn build_image(
        &self,
        context_dir: &Path,
        dockerfile: &str,
        tag: &str,
    ) -> Result<(), GatewayError> {
        info!(image = %tag, context = %context_dir.display(), "building image");
        self.engine.build_image(context_dir, dockerfile, tag).await?;
        info!(image = %tag, "image built");
        Ok(())
    }

    /// Make sure `image` is present locally, pulling it if needed.
    pub async fn ensure_image(&self, image: &str) -> Result<(), GatewayError> {
        if self.engine.image_exists(image).await? {
            debug!(image = %image, "image present");
            return Ok(());
        }
        info!(image = %image, "pulling image");
        self.engine.pull_image(image).await?;
        Ok(())
    }

    /// Create a fresh container named `name`.
    ///
    /// An existing container with the same name is force-removed first.
    pub async fn ensure_container(
        &self,
        name: &str,
        spec: &ContainerSpec,
    ) -> Result<String, GatewayError> {
        if let Some(existing) = self.engine.find_container(name).await? {
            info!(container = %name, id = %short_id(&existing), "removing stale container");
            self.engine.remove_container(&existing).await?;
        }

        self.ensure_image(&spec.image).await?;

        let id = self
            .engine
            .create_container(name, spec)
            .await
            .map_err(|source| GatewayError::ContainerCreation {
                name: name.to_string(),
                source,
            })?;

        debug!(container = %name, id = %short_id(&id), "container created");
        Ok(id)
    }

    /// `ensure_container` followed by start.
    pub async fn run_container(
        &self,
        name: &str,
        spec: &ContainerSpec,
    ) -> Result<String, GatewayError> {
        let id = self.ensure_container(name, spec).await?;

        self.engine
            .start_container(&id)
            .await
            .map_err(|source| GatewayError::ContainerStart {
                name: name.to_string(),
                source,
            })?;

        info!(container = %name, id = %short_id(&id), "container started");
        Ok(id)
    }

    /// Poll container state until it is running.
    ///
    /// - restarting is logged and treated as pending
    /// - dead or a non-zero exit code fails with the code
    /// - anything still pending at `timeout` fails with a timeout
    pub async fn wait_for_container_ready(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<(), GatewayError> {
        let deadline = Instant::now() + timeout;
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = sleep_until(deadline) => {
                    return Err(GatewayError::ContainerTimeout {
                        id: short_id(id).to_string(),
                        timeout,
                    });
                }
                _ = ticker.tick() => {
                    match self.engine.inspect_status(id).await? {
                        ContainerStatus::Running => {
                            debug!(id = %short_id(id), "container running");
                            return Ok(());
                        }
                        ContainerStatus::Restarting => {
                            warn!(id = %short_id(id), "container is restarting, still waiting");
                        }
                        ContainerStatus::Dead(code) => {
                            return Err(GatewayError::ContainerExited {
                                id: short_id(id).to_string(),
                                code,
                            });
                        }
                        ContainerStatus::Exited(code) if code != 0 => {
                            return Err(GatewayError::ContainerExited {
                                id: short_id(id).to_string(),
                                code,
                            });
                        }
                        other => debug!(id = %short_id(id), status = ?other, "container not ready"),
                    }
                }
            }
        }
    }

    /// Return the id of the bridge network `name`, creating it if absent.
    pub async fn create_network(&self, name: &str) -> Result<String, GatewayError> {
        if let Some(id) = self.engine.find_network(name).await? {
            debug!(network = %name, "reusing network");
            return Ok(id);
        }
        let id = self.engine.create_network(name).await?;
        info!(network = %name, "network created");
        Ok(id)
    }

    pub async fn list_containers_by_label(
        &self,
        label: &str,
        include_stopped: bool,
    ) -> Result<Vec<ContainerSummary>, GatewayError> {
        Ok(self.engine.list_containers(label, include_stopped).await?)
    }

    /// Stop every running container carrying `label`.
    ///
    /// Returns how many were stopped; zero is not an error.
    pub async fn stop_containers_by_label(&self, label: &str) -> Result<usize, GatewayError> {
        let running = self.engine.list_containers(label, false).await?;

        for c in &running {
            info!(container = %c.name, id = %short_id(&c.id), "stopping container");
            self.engine.stop_container(&c.id).await?;
        }

        Ok(running.len())
    }

    /// Run a created container in the foreground with the terminal attached.
    pub async fn attach_to_container(&self, id: &str) -> Result<i64, GatewayError> {
        Ok(self.engine.run_attached(id).await?)
    }

    /// Follow a container's logs into `out` until the stream ends or
    /// `cancel` fires. Non-printable characters are stripped.
    pub async fn stream_logs<W: Write + Send>(
        &self,
        id: &str,
        out: &mut W,
        cancel: &CancellationToken,
    ) -> Result<LogsEnd, GatewayError> {
        let mut stream = self.engine.logs(id);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(LogsEnd::Cancelled),
                next = stream.next() => match next {
                    Some(Ok(chunk)) => {
                        let text = strip_non_printable(&String::from_utf8_lossy(&chunk));
                        out.write_all(text.as_bytes()).map_err(GatewayError::Output)?;
                        out.flush().map_err(GatewayError::Output)?;
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(LogsEnd::StreamEnded),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeEngine;
    use super::*;

    fn spec(image: &str) -> ContainerSpec {
        ContainerSpec {
            image: image.to_string(),
            ..ContainerSpec::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn restarting_then_running_is_ready() {
        let engine = Arc::new(FakeEngine::default());
        let gateway = Gateway::new(engine.clone());

        let id = gateway.run_container("db", &spec("postgres:13")).await.unwrap();
        engine.script_status(
            "db",
            [
                ContainerStatus::Created,
                ContainerStatus::Restarting,
                ContainerStatus::Restarting,
                ContainerStatus::Running,
            ],
        );

        gateway
            .wait_for_container_ready(&id, Duration::from_secs(30))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn non_zero_exit_carries_code() {
        let engine = Arc::new(FakeEngine::default());
        let gateway = Gateway::new(engine.clone());

        let id = gateway.run_container("db", &spec("postgres:13")).await.unwrap();
        engine.script_status("db", [ContainerStatus::Created, ContainerStatus::Exited(137)]);

        let err = gateway
            .wait_for_container_ready(&id, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ContainerExited { code: 137, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn dead_container_fails() {
        let engine = Arc::new(FakeEngine::default());
        let gateway = Gateway::new(engine.clone());

        let id = gateway.run_container("db", &spec("postgres:13")).await.unwrap();
        engine.script_status("db", [ContainerStatus::Dead(1)]);

        let err = gateway
            .wait_for_container_ready(&id, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ContainerExited { code: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_state_times_out() {
        let engine = Arc::new(FakeEngine::default());
        let gateway = Gateway::new(engine.clone());

        let id = gateway.ensure_container("db", &spec("postgres:13")).await.unwrap();

        let err = gateway
            .wait_for_container_ready(&id, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ContainerTimeout { .. }));
    }

    #[tokio::test]
    async fn network_is_created_once() {
        let engine = Arc::new(FakeEngine::default());
        let gateway = Gateway::new(engine.clone());

        let first = gateway.create_network("session-net").await.unwrap();
        let second = gateway.create_network("session-net").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(engine.count_calls("create_network:"), 1);
    }

    #[tokio::test]
    async fn ensure_container_replaces_stale_container_and_pulls_missing_image() {
        let engine = Arc::new(FakeEngine::default());
        let gateway = Gateway::new(engine.clone());

        let first = gateway.ensure_container("web", &spec("nginx:latest")).await.unwrap();
        let second = gateway.ensure_container("web", &spec("nginx:latest")).await.unwrap();

        assert_ne!(first, second);
        assert_eq!(engine.count_calls(&format!("remove:{first}")), 1);
        assert_eq!(engine.count_calls("pull:nginx:latest"), 1);
        assert_eq!(engine.container_names(), vec!["web".to_string()]);
    }

    #[tokio::test]
    async fn creation_and_start_failures_are_distinct() {
        let engine = Arc::new(FakeEngine::default());
        let gateway = Gateway::new(engine.clone());

        engine.fail_create("broken");
        let err = gateway.run_container("broken", &spec("img")).await.unwrap_err();
        assert!(matches!(err, GatewayError::ContainerCreation { .. }));

        engine.fail_start("lazy");
        let err = gateway.run_container("lazy", &spec("img")).await.unwrap_err();
        assert!(matches!(err, GatewayError::ContainerStart { .. }));
    }

    #[tokio::test]
    async fn stopping_nothing_is_fine() {
        let engine = Arc::new(FakeEngine::default());
        let gateway = Gateway::new(engine.clone());

        assert_eq!(gateway.stop_containers_by_label("session=none").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stop_is_label_scoped() {
        let engine = Arc::new(FakeEngine::default());
        let gateway = Gateway::new(engine.clone());

        let mut mine = spec("img");
        mine.labels.insert("session".into(), "a".into());
        let mut other = spec("img");
        other.labels.insert("session".into(), "b".into());

        gateway.run_container("a-1", &mine).await.unwrap();
        gateway.run_container("a-2", &mine).await.unwrap();
        let foreign = gateway.run_container("b-1", &other).await.unwrap();

        assert_eq!(gateway.stop_containers_by_label("session=a").await.unwrap(), 2);
        assert_eq!(engine.status_of(&foreign), Some(ContainerStatus::Running));
        assert!(gateway
            .list_containers_by_label("session=a", false)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            gateway.list_containers_by_label("session=a", true).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn logs_are_sanitised() {
        let engine = Arc::new(FakeEngine::default());
        let gateway = Gateway::new(engine.clone());

        let id = gateway.run_container("web", &spec("img")).await.unwrap();
        engine.push_logs("web", [b"\x1b[2Jhello\n".to_vec(), b"bell\x07 done\n".to_vec()]);

        let mut out = Vec::new();
        let end = gateway
            .stream_logs(&id, &mut out, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(end, LogsEnd::StreamEnded);
        assert_eq!(String::from_utf8(out).unwrap(), "[2Jhello\nbell done\n");
    }

    #[tokio::test]
    async fn log_follow_stops_on_cancel() {
        let engine = Arc::new(FakeEngine::default());
        let gateway = Gateway::new(engine.clone());

        let id = gateway.run_container("web", &spec("img")).await.unwrap();
        engine.push_logs("web", [b"line\n".to_vec()]);
        engine.follow_forever("web");

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let mut out = Vec::new();
        let end = gateway.stream_logs(&id, &mut out, &cancel).await.unwrap();
        assert_eq!(end, LogsEnd::Cancelled);
        assert_eq!(out, b"line\n");
    }

    #[tokio::test]
    async fn attach_reports_exit_code() {
        let engine = Arc::new(FakeEngine::default());
        let gateway = Gateway::new(engine.clone());

        let id = gateway.ensure_container("job", &spec("img")).await.unwrap();
        engine.set_exit_code("job", 3);

        assert_eq!(gateway.attach_to_container(&id).await.unwrap(), 3);
    }
}
