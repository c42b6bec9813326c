// src/docker/fake.rs

//! In-memory `ContainerEngine` for tests.

use super::{ContainerEngine, ContainerSpec, ContainerStatus, ContainerSummary, EngineError};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub name: String,
    pub spec: ContainerSpec,
    pub status: ContainerStatus,
}

/// Observation taken at creation time for each bind-mount source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountObservation {
    pub container: String,
    pub source: PathBuf,
    pub existed: bool,
    pub empty: bool,
}

#[derive(Default)]
struct State {
    next_id: u64,
    containers: BTreeMap<String, FakeContainer>,
    networks: BTreeMap<String, String>,
    images: BTreeSet<String>,
    calls: Vec<String>,
    scripted: BTreeMap<String, VecDeque<ContainerStatus>>,
    logs: BTreeMap<String, Vec<Vec<u8>>>,
    follow_forever: BTreeSet<String>,
    exit_codes: BTreeMap<String, i64>,
    fail_create: BTreeSet<String>,
    fail_start: BTreeSet<String>,
    fail_build: bool,
    mounts: Vec<MountObservation>,
}

#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<State>,
}

impl FakeEngine {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Statuses returned by successive inspections of container `name`.
    /// The last one repeats.
    pub fn script_status(&self, name: &str, statuses: impl IntoIterator<Item = ContainerStatus>) {
        self.lock()
            .scripted
            .insert(name.to_string(), statuses.into_iter().collect());
    }

    pub fn push_logs(&self, name: &str, chunks: impl IntoIterator<Item = Vec<u8>>) {
        self.lock()
            .logs
            .entry(name.to_string())
            .or_default()
            .extend(chunks);
    }

    pub fn follow_forever(&self, name: &str) {
        self.lock().follow_forever.insert(name.to_string());
    }

    pub fn set_exit_code(&self, name: &str, code: i64) {
        self.lock().exit_codes.insert(name.to_string(), code);
    }

    pub fn fail_create(&self, name: &str) {
        self.lock().fail_create.insert(name.to_string());
    }

    pub fn fail_start(&self, name: &str) {
        self.lock().fail_start.insert(name.to_string());
    }

    pub fn fail_build(&self) {
        self.lock().fail_build = true;
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.lock()
            .containers
            .values()
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.lock()
            .containers
            .values()
            .find(|c| c.name == name)
            .cloned()
    }

    pub fn status_of(&self, id: &str) -> Option<ContainerStatus> {
        self.lock().containers.get(id).map(|c| c.status)
    }

    pub fn mount_observations(&self) -> Vec<MountObservation> {
        self.lock().mounts.clone()
    }

    fn name_of(state: &State, id: &str) -> Result<String, EngineError> {
        state
            .containers
            .get(id)
            .map(|c| c.name.clone())
            .ok_or_else(|| EngineError::NotFound {
                kind: "container",
                name: id.to_string(),
            })
    }
}

fn refused(operation: &'static str) -> EngineError {
    EngineError::api(
        operation,
        std::io::Error::new(std::io::ErrorKind::Other, "refused by fake engine"),
    )
}

fn dir_is_empty(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true)
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        Ok(self.lock().images.contains(image))
    }

    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.calls.push(format!("pull:{image}"));
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn build_image(
        &self,
        _context_dir: &Path,
        _dockerfile: &str,
        tag: &str,
    ) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.calls.push(format!("build:{tag}"));
        if state.fail_build {
            return Err(EngineError::Build("step 3/9 failed".into()));
        }
        state.images.insert(tag.to_string());
        Ok(())
    }

    async fn find_container(&self, name: &str) -> Result<Option<String>, EngineError> {
        Ok(self
            .lock()
            .containers
            .iter()
            .find(|(_, c)| c.name == name)
            .map(|(id, _)| id.clone()))
    }

    async fn create_container(
        &self,
        name: &str,
        spec: &ContainerSpec,
    ) -> Result<String, EngineError> {
        let mut state = self.lock();
        state.calls.push(format!("create:{name}"));

        if state.fail_create.contains(name) {
            return Err(refused("create"));
        }

        for m in &spec.mounts {
            state.mounts.push(MountObservation {
                container: name.to_string(),
                source: m.source.clone(),
                existed: m.source.exists(),
                empty: dir_is_empty(&m.source),
            });
        }

        state.next_id += 1;
        let id = format!("{:064x}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                name: name.to_string(),
                spec: spec.clone(),
                status: ContainerStatus::Created,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.calls.push(format!("start:{id}"));
        let name = Self::name_of(&state, id)?;
        if state.fail_start.contains(&name) {
            return Err(refused("start"));
        }
        if let Some(c) = state.containers.get_mut(id) {
            c.status = ContainerStatus::Running;
        }
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.calls.push(format!("stop:{id}"));
        match state.containers.get_mut(id) {
            Some(c) => {
                c.status = ContainerStatus::Exited(0);
                Ok(())
            }
            None => Err(EngineError::NotFound {
                kind: "container",
                name: id.to_string(),
            }),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.calls.push(format!("remove:{id}"));
        state.containers.remove(id);
        Ok(())
    }

    async fn inspect_status(&self, id: &str) -> Result<ContainerStatus, EngineError> {
        let mut state = self.lock();
        let name = Self::name_of(&state, id)?;

        if let Some(queue) = state.scripted.get_mut(&name) {
            let next = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().copied()
            };
            if let Some(status) = next {
                return Ok(status);
            }
        }

        Ok(state.containers[id].status)
    }

    async fn list_containers(
        &self,
        label: &str,
        all: bool,
    ) -> Result<Vec<ContainerSummary>, EngineError> {
        let (key, value) = label.split_once('=').unwrap_or((label, ""));
        let state = self.lock();

        Ok(state
            .containers
            .iter()
            .filter(|(_, c)| c.spec.labels.get(key).map(String::as_str) == Some(value))
            .filter(|(_, c)| {
                all || matches!(
                    c.status,
                    ContainerStatus::Running | ContainerStatus::Restarting
                )
            })
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                name: c.name.clone(),
                image: c.spec.image.clone(),
                state: format!("{:?}", c.status),
            })
            .collect())
    }

    async fn find_network(&self, name: &str) -> Result<Option<String>, EngineError> {
        Ok(self.lock().networks.get(name).cloned())
    }

    async fn create_network(&self, name: &str) -> Result<String, EngineError> {
        let mut state = self.lock();
        state.calls.push(format!("create_network:{name}"));
        let id = format!("net-{}", state.networks.len() + 1);
        state.networks.insert(name.to_string(), id.clone());
        Ok(id)
    }

    async fn run_attached(&self, id: &str) -> Result<i64, EngineError> {
        let mut state = self.lock();
        state.calls.push(format!("attach:{id}"));
        let name = Self::name_of(&state, id)?;
        let code = state.exit_codes.get(&name).copied().unwrap_or(0);

        let auto_remove = state.containers[id].spec.auto_remove;
        if auto_remove {
            state.containers.remove(id);
        } else if let Some(c) = state.containers.get_mut(id) {
            c.status = ContainerStatus::Exited(code);
        }
        Ok(code)
    }

    fn logs<'a>(&'a self, id: &'a str) -> BoxStream<'a, Result<Vec<u8>, EngineError>> {
        let state = self.lock();
        let name = match Self::name_of(&state, id) {
            Ok(name) => name,
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };

        let chunks = state.logs.get(&name).cloned().unwrap_or_default();
        let head = stream::iter(chunks.into_iter().map(Ok));

        if state.follow_forever.contains(&name) {
            head.chain(stream::pending()).boxed()
        } else {
            head.boxed()
        }
    }
}
