// Command implementations for the `rig` binary

pub mod compose;
pub mod doctor;
pub mod image;
pub mod kafka;

use crate::config::Config;
use crate::docker::client::CliDocker;
use crate::errors::{Result, RigError};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

/// Config for the current directory, or from an explicit file
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    match explicit {
        Some(path) => Config::load_file(path),
        None => Config::discover(&std::env::current_dir()?),
    }
}

/// Docker client for the configured binary, failing early when the daemon is down
pub fn connect(config: &Config) -> Result<Arc<CliDocker>> {
    use crate::docker::DockerClient;

    let docker = CliDocker::with_binary(&config.docker.binary);
    if !docker.is_available() {
        return Err(RigError::DockerUnavailable);
    }
    Ok(Arc::new(docker))
}

/// Run a user command with extra environment and return its exit code
pub fn run_child(command: &[String], env: &BTreeMap<String, String>) -> Result<i32> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| RigError::InvalidArgument("No command given after '--'".to_string()))?;

    tracing::info!(%program, ?args, "running command against fixture");
    let status = Command::new(program).args(args).envs(env).status()?;
    Ok(status.code().unwrap_or(1))
}
