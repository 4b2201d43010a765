// Single-container fixtures: a spec describing `docker run`, and a handle
// that owns the running container until it is stopped or dropped.

use crate::docker::client::{DockerClient, ExecResult};
use crate::errors::{Result, RigError};
use crate::image::ImageName;
use crate::wait::{Await, DEFAULT_POLL_INTERVAL};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Label put on every container started by stackrig
pub const MANAGED_LABEL: &str = "org.stackrig.managed";

pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// How to decide a freshly started container is usable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitStrategy {
    /// The container reports as running
    Running,
    /// The container logs contain a line matching this regex
    LogMessage(String),
}

/// Everything needed to `docker run` a container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: ImageName,
    pub name: Option<String>,
    pub network: Option<String>,
    pub network_aliases: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    /// Container port -> fixed host port (None publishes on a random port)
    pub ports: BTreeMap<u16, Option<u16>>,
    pub command: Vec<String>,
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    pub wait_strategy: WaitStrategy,
}

impl ContainerSpec {
    pub fn new(image: ImageName) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        Self {
            image,
            name: None,
            network: None,
            network_aliases: Vec::new(),
            env: BTreeMap::new(),
            labels,
            ports: BTreeMap::new(),
            command: Vec::new(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            wait_strategy: WaitStrategy::Running,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_network(mut self, network: &str) -> Self {
        self.network = Some(network.to_string());
        self
    }

    pub fn with_network_alias(mut self, alias: &str) -> Self {
        self.network_aliases.push(alias.to_string());
        self
    }

    pub fn with_env(mut self, key: &str, value: impl ToString) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Publish a container port on a random host port
    pub fn with_exposed_port(mut self, container_port: u16) -> Self {
        self.ports.insert(container_port, None);
        self
    }

    /// Publish a container port on a fixed host port
    pub fn with_port_binding(mut self, container_port: u16, host_port: u16) -> Self {
        self.ports.insert(container_port, Some(host_port));
        self
    }

    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_wait_strategy(mut self, strategy: WaitStrategy) -> Self {
        self.wait_strategy = strategy;
        self
    }

    /// Human-readable name for logs and errors
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.network_aliases.first().cloned())
            .unwrap_or_else(|| self.image.to_string())
    }

    /// Arguments following `docker run -d`
    pub fn run_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(name) = &self.name {
            args.push("--name".to_string());
            args.push(name.clone());
        }

        if let Some(network) = &self.network {
            args.push("--network".to_string());
            args.push(network.clone());
            for alias in &self.network_aliases {
                args.push("--network-alias".to_string());
                args.push(alias.clone());
            }
        }

        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        for (key, value) in &self.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        for (container_port, host_port) in &self.ports {
            args.push("-p".to_string());
            match host_port {
                Some(host) => args.push(format!("{}:{}", host, container_port)),
                None => args.push(container_port.to_string()),
            }
        }

        args.push(self.image.to_string());
        args.extend(self.command.iter().cloned());
        args
    }
}

/// A running container; stopped and removed on drop
pub struct Container {
    docker: Arc<dyn DockerClient>,
    id: String,
    spec: ContainerSpec,
    stopped: bool,
}

impl Container {
    /// Run `spec` detached, then wait until its wait strategy is satisfied
    ///
    /// A container that never becomes ready is removed before the error is returned.
    pub fn start(docker: Arc<dyn DockerClient>, spec: ContainerSpec) -> Result<Self> {
        let log_pattern = match &spec.wait_strategy {
            WaitStrategy::LogMessage(pattern) => Some(Regex::new(pattern).map_err(|e| {
                RigError::InvalidArgument(format!("Invalid log pattern '{}': {}", pattern, e))
            })?),
            WaitStrategy::Running => None,
        };

        tracing::info!(container = %spec.display_name(), image = %spec.image, "starting container");
        let id = docker.run_container(&spec)?;

        let mut container = Self {
            docker,
            id,
            spec,
            stopped: false,
        };

        if let Err(e) = container.wait_until_ready(log_pattern.as_ref()) {
            tracing::warn!(
                container = %container.spec.display_name(),
                error = %e,
                "container did not become ready"
            );
            if let Ok(logs) = container.logs() {
                tracing::debug!(container = %container.spec.display_name(), %logs, "startup logs");
            }
            if let Err(stop_err) = container.stop() {
                tracing::warn!(
                    error = %stop_err,
                    "failed to remove container after startup failure"
                );
            }
            return Err(e);
        }

        tracing::debug!(
            container = %container.spec.display_name(),
            id = %container.id,
            "container ready"
        );
        Ok(container)
    }

    fn wait_until_ready(&self, log_pattern: Option<&Regex>) -> Result<()> {
        let waiter =
            Await::at_most(self.spec.startup_timeout).poll_interval(self.spec.poll_interval);
        let what = format!("container '{}' to start", self.spec.display_name());

        waiter.until_asserted(&what, || {
            if !self.docker.is_running(&self.id)? {
                return Err(RigError::NotReady(format!(
                    "container '{}' is not running",
                    self.spec.display_name()
                )));
            }
            if let Some(pattern) = log_pattern {
                let logs = self.docker.container_logs(&self.id)?;
                if !pattern.is_match(&logs) {
                    return Err(RigError::NotReady(format!(
                        "log message /{}/ not seen yet",
                        pattern.as_str()
                    )));
                }
            }
            Ok(())
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn spec(&self) -> &ContainerSpec {
        &self.spec
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Run a command inside the container
    pub fn exec<S: AsRef<str>>(&self, command: &[S]) -> Result<ExecResult> {
        let command: Vec<String> = command.iter().map(|s| s.as_ref().to_string()).collect();
        self.docker.exec(&self.id, &command)
    }

    pub fn logs(&self) -> Result<String> {
        self.docker.container_logs(&self.id)
    }

    /// Host port for a published container port
    pub fn mapped_port(&self, container_port: u16) -> Result<u16> {
        match self.spec.ports.get(&container_port) {
            Some(Some(host_port)) => Ok(*host_port),
            Some(None) => self.docker.mapped_port(&self.id, container_port),
            None => Err(RigError::InvalidArgument(format!(
                "Port {} is not exposed by '{}'",
                container_port,
                self.spec.display_name()
            ))),
        }
    }

    /// Stop, then remove the container; calling it again is a no-op
    ///
    /// A failed graceful stop is logged and the removal is forced.
    pub fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        tracing::debug!(container = %self.spec.display_name(), id = %self.id, "stopping container");
        if let Err(e) = self.docker.stop_container(&self.id) {
            tracing::warn!(
                container = %self.spec.display_name(),
                error = %e,
                "graceful stop failed"
            );
        }
        self.docker.remove_container(&self.id)?;
        self.stopped = true;
        Ok(())
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(
                container = %self.spec.display_name(),
                error = %e,
                "failed to remove container"
            );
        }
    }
}
