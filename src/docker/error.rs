// src/docker/error.rs

use std::time::Duration;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failures reported by a `ContainerEngine` implementation.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Unavailable(String),

    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("docker {operation} failed")]
    Api {
        operation: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("image build failed: {0}")]
    Build(String),

    #[error("image pull failed for {image}: {message}")]
    Pull { image: String, message: String },

    #[error("failed to prepare build context")]
    BuildContext(#[source] std::io::Error),

    #[error("terminal I/O failed")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn api(operation: &'static str, source: impl Into<BoxError>) -> Self {
        EngineError::Api {
            operation,
            source: source.into(),
        }
    }
}

/// Failures surfaced by the `Gateway` façade.
///
/// Creation and start failures are kept apart so callers can tell
/// "could not create" from "created but would not start".
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("failed to create container {name}")]
    ContainerCreation {
        name: String,
        #[source]
        source: EngineError,
    },

    #[error("failed to start container {name}")]
    ContainerStart {
        name: String,
        #[source]
        source: EngineError,
    },

    #[error("container {id} exited with code {code}")]
    ContainerExited { id: String, code: i64 },

    #[error("container {id} did not become ready within {timeout:?}")]
    ContainerTimeout { id: String, timeout: Duration },

    #[error("failed to write container output")]
    Output(#[source] std::io::Error),
}
