// Private bridge networks for multi-container fixtures

use crate::docker::client::DockerClient;
use crate::errors::Result;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;

/// Random lower-case identifier with the given prefix, e.g. `rig-k3x9a2m1`
pub fn random_name(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    format!("{}{}", prefix, suffix)
}

/// A user-defined network; removed on drop
pub struct Network {
    docker: Arc<dyn DockerClient>,
    name: String,
    id: String,
    removed: bool,
}

impl Network {
    /// Create a network with a random name
    pub fn create(docker: Arc<dyn DockerClient>) -> Result<Self> {
        Self::create_named(docker, &random_name("stackrig-net-"))
    }

    pub fn create_named(docker: Arc<dyn DockerClient>, name: &str) -> Result<Self> {
        let id = docker.create_network(name)?;
        tracing::debug!(network = name, %id, "created network");
        Ok(Self {
            docker,
            name: name.to_string(),
            id,
            removed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Remove the network; calling it again is a no-op
    pub fn remove(&mut self) -> Result<()> {
        if self.removed {
            return Ok(());
        }
        self.docker.remove_network(&self.name)?;
        self.removed = true;
        tracing::debug!(network = %self.name, "removed network");
        Ok(())
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            tracing::warn!(network = %self.name, error = %e, "failed to remove network");
        }
    }
}
