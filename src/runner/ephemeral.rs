// src/runner/ephemeral.rs

//! Foreground, auto-removed containers built from the runner image.
//!
//! These never join the session: no label, no network, nothing to clean
//! up afterwards. A non-zero exit is reported as an error.

use super::{at, Phase, Runner, RunnerError};
use crate::docker::{ContainerSpec, GatewayError};
use crate::env::Envs;
use tracing::info;

/// One-shot jobs shipped in the runner image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EphemeralFlow {
    TestRequirements,
    TestStartupScript,
    PackageRequirements,
}

impl EphemeralFlow {
    /// Image entrypoint command, also used as container name suffix.
    pub fn command(self) -> &'static str {
        match self {
            EphemeralFlow::TestRequirements => "test-requirements",
            EphemeralFlow::TestStartupScript => "test-startup-script",
            EphemeralFlow::PackageRequirements => "package-requirements",
        }
    }
}

impl Runner {
    /// Build the image, then run `flow` attached until it exits.
    pub async fn run_ephemeral(&self, flow: EphemeralFlow, envs: &Envs) -> Result<(), RunnerError> {
        self.build_image().await?;

        let spec = self.ephemeral_spec(flow, envs);
        let name = self.options.container_name(flow.command());

        info!(container = %name, command = flow.command(), "running ephemeral container");
        let id = self
            .gateway
            .ensure_container(&name, &spec)
            .await
            .map_err(at(Phase::Ephemeral))?;

        let code = self
            .gateway
            .attach_to_container(&id)
            .await
            .map_err(at(Phase::Ephemeral))?;

        if code != 0 {
            return Err(RunnerError::Gateway {
                phase: Phase::Ephemeral,
                source: GatewayError::ContainerExited { id, code },
            });
        }
        Ok(())
    }

    pub fn ephemeral_spec(&self, flow: EphemeralFlow, envs: &Envs) -> ContainerSpec {
        let (env, mounts) = match flow {
            EphemeralFlow::TestStartupScript => (envs.to_vars(), vec![self.options.startup_mount()]),
            EphemeralFlow::TestRequirements | EphemeralFlow::PackageRequirements => {
                (Vec::new(), self.options.workspace_mounts())
            }
        };

        ContainerSpec {
            image: self.options.image_tag(),
            cmd: vec![flow.command().to_string()],
            env,
            mounts,
            tty: true,
            open_stdin: true,
            auto_remove: true,
            ..ContainerSpec::default()
        }
    }

    pub async fn test_requirements(&self) -> Result<(), RunnerError> {
        self.run_ephemeral(EphemeralFlow::TestRequirements, &Envs::default())
            .await
    }

    pub async fn test_startup_script(&self, envs: &Envs) -> Result<(), RunnerError> {
        self.run_ephemeral(EphemeralFlow::TestStartupScript, envs).await
    }

    pub async fn package_requirements(&self) -> Result<(), RunnerError> {
        self.run_ephemeral(EphemeralFlow::PackageRequirements, &Envs::default())
            .await
    }
}
