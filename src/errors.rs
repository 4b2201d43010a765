use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RigError {
    #[error("Docker is not available. Please install Docker and make sure the daemon is running.")]
    DockerUnavailable,

    #[error("Docker error: {0}")]
    DockerError(String),

    #[error("Compose error: {0}")]
    ComposeError(String),

    #[error("Compose file not found: {0}")]
    ComposeFileNotFound(String),

    #[error("No running container for '{0}'")]
    ContainerNotFound(String),

    #[error("Invalid image name '{0}': {1}")]
    InvalidImageName(String, String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Timed out after {elapsed:?} waiting for {what}{}", last_error_suffix(.last_error))]
    Timeout {
        what: String,
        elapsed: Duration,
        last_error: Option<String>,
    },

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Port allocation error: {0}")]
    PortAllocationError(String),

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    last_error
        .as_ref()
        .map(|e| format!(" (last error: {})", e))
        .unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, RigError>;
