// Compose-defined environments
// Bring a stack up for a test, tear it down (optionally with its images) afterwards

use crate::config::ComposeConfig;
use crate::docker::client::{
    ComposeInvocation, ContainerFilter, ContainerSummary, DockerClient, ExecResult,
};
use crate::docker::network::random_name;
use crate::errors::{Result, RigError};
use crate::wait::{Await, DEFAULT_POLL_INTERVAL};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub const PROJECT_LABEL: &str = "com.docker.compose.project";
pub const SERVICE_LABEL: &str = "com.docker.compose.service";

pub const DEFAULT_COMPOSE_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Which images `compose down` removes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveImages {
    /// Only images built by the stack (no custom tag)
    Local,
    /// Every image used by any service
    All,
}

impl RemoveImages {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoveImages::Local => "local",
            RemoveImages::All => "all",
        }
    }
}

impl fmt::Display for RemoveImages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RemoveImages {
    type Err = RigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(RemoveImages::Local),
            "all" => Ok(RemoveImages::All),
            other => Err(RigError::InvalidArgument(format!(
                "Invalid remove-images mode '{}'. Expected 'local' or 'all'",
                other
            ))),
        }
    }
}

/// Compose project names must be lowercase alphanumerics and hyphens,
/// without leading, trailing or repeated hyphens
pub fn sanitize_project_name(name: &str) -> String {
    let sanitized = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>();

    sanitized
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// A Compose stack owned by a test; brought down on drop
pub struct ComposeStack {
    docker: Arc<dyn DockerClient>,
    files: Vec<PathBuf>,
    working_dir: PathBuf,
    project_name: String,
    exposed: Vec<(String, u16)>,
    build: bool,
    remove_images: Option<RemoveImages>,
    remove_volumes: bool,
    env: BTreeMap<String, String>,
    startup_timeout: Duration,
    poll_interval: Duration,
    resolved_ports: HashMap<(String, u16), u16>,
    started: bool,
}

fn resolve_compose_file(file: &Path) -> Result<PathBuf> {
    fs::canonicalize(file).map_err(|_| RigError::ComposeFileNotFound(file.display().to_string()))
}

impl ComposeStack {
    /// Stack for a compose file, under a random project name
    pub fn new(docker: Arc<dyn DockerClient>, file: impl AsRef<Path>) -> Result<Self> {
        let file = resolve_compose_file(file.as_ref())?;
        let working_dir = file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            docker,
            files: vec![file],
            working_dir,
            project_name: random_name("rig"),
            exposed: Vec::new(),
            build: false,
            remove_images: None,
            remove_volumes: true,
            env: BTreeMap::new(),
            startup_timeout: DEFAULT_COMPOSE_STARTUP_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            resolved_ports: HashMap::new(),
            started: false,
        })
    }

    /// Stack described by the `compose` section of the config
    pub fn from_config(
        docker: Arc<dyn DockerClient>,
        config: &ComposeConfig,
        base_dir: &Path,
    ) -> Result<Self> {
        let remove_images = config
            .remove_images
            .as_deref()
            .map(str::parse::<RemoveImages>)
            .transpose()?;

        Ok(Self::new(docker, base_dir.join(&config.file))?
            .with_build(config.build)
            .with_remove_images(remove_images)
            .with_remove_volumes(config.remove_volumes)
            .with_startup_timeout(config.startup_timeout()?))
    }

    /// Add an override file, applied after the ones already given
    pub fn with_file(mut self, file: impl AsRef<Path>) -> Result<Self> {
        self.files.push(resolve_compose_file(file.as_ref())?);
        Ok(self)
    }

    pub fn with_project_name(mut self, name: &str) -> Self {
        let sanitized = sanitize_project_name(name);
        if sanitized.is_empty() {
            tracing::warn!(
                name,
                project = %self.project_name,
                "unusable project name, keeping generated one"
            );
        } else {
            self.project_name = sanitized;
        }
        self
    }

    /// Wait for `service` to publish `port` during start
    pub fn with_exposed_service(mut self, service: &str, port: u16) -> Self {
        self.exposed.push((service.to_string(), port));
        self
    }

    /// Build images before starting (`up --build`)
    pub fn with_build(mut self, build: bool) -> Self {
        self.build = build;
        self
    }

    pub fn with_remove_images(mut self, remove_images: Option<RemoveImages>) -> Self {
        self.remove_images = remove_images;
        self
    }

    pub fn with_remove_volumes(mut self, remove_volumes: bool) -> Self {
        self.remove_volumes = remove_volumes;
        self
    }

    /// Environment variable visible to compose file interpolation
    pub fn with_env(mut self, key: &str, value: impl ToString) -> Self {
        self.env.insert(key.to_string(), value.to_string());
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

    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec!["-p".to_string(), self.project_name.clone()];
        for file in &self.files {
            args.push("-f".to_string());
            args.push(file.to_string_lossy().to_string());
        }
        args
    }

    /// Arguments for `compose up`
    pub fn up_args(&self) -> Vec<String> {
        let mut args = self.base_args();
        args.push("up".to_string());
        args.push("-d".to_string());
        if self.build {
            args.push("--build".to_string());
        }
        args
    }

    /// Arguments for `compose down`
    pub fn down_args(&self) -> Vec<String> {
        let mut args = self.base_args();
        args.push("down".to_string());
        if self.remove_volumes {
            args.push("-v".to_string());
        }
        if let Some(mode) = self.remove_images {
            args.push("--rmi".to_string());
            args.push(mode.as_str().to_string());
        }
        args
    }

    fn compose(&self, args: Vec<String>) -> Result<ExecResult> {
        self.docker.compose(&ComposeInvocation {
            working_dir: self.working_dir.clone(),
            args,
            env: self.env.clone(),
        })
    }

    /// Bring the stack up and wait for every exposed service
    ///
    /// On failure the stack is brought down again before the error is returned.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }

        if let Some((service, _)) = self.exposed.iter().find(|(_, port)| *port == 0) {
            return Err(RigError::InvalidArgument(format!(
                "Exposed port for service '{}' must be greater than 0",
                service
            )));
        }

        tracing::info!(project = %self.project_name, build = self.build, "starting compose stack");
        let up = self.compose(self.up_args())?;
        // Even a failed `up` can leave containers behind
        self.started = true;

        if let Err(e) = up
            .checked("compose up")
            .map_err(|e| RigError::ComposeError(e.to_string()))
            .and_then(|_| self.await_exposed_services())
        {
            tracing::warn!(
                project = %self.project_name,
                error = %e,
                "compose stack failed to start"
            );
            if let Err(stop_err) = self.stop() {
                tracing::warn!(
                    project = %self.project_name,
                    error = %stop_err,
                    "cleanup after failed start also failed"
                );
            }
            return Err(e);
        }

        tracing::info!(project = %self.project_name, "compose stack is up");
        Ok(())
    }

    fn await_exposed_services(&mut self) -> Result<()> {
        let waiter = Await::at_most(self.startup_timeout).poll_interval(self.poll_interval);

        for (service, port) in self.exposed.clone() {
            let what = format!("service '{}' to publish port {}", service, port);
            let host_port = waiter.until_asserted(&what, || {
                self.container_for_service(&service)?;
                self.resolve_port(&service, port)
            })?;
            tracing::debug!(
                project = %self.project_name,
                %service,
                port,
                host_port,
                "service exposed"
            );
            self.resolved_ports.insert((service, port), host_port);
        }

        Ok(())
    }

    fn resolve_port(&self, service: &str, port: u16) -> Result<u16> {
        let mut args = self.base_args();
        args.extend(["port".to_string(), service.to_string(), port.to_string()]);

        let stdout = self.compose(args)?.checked("compose port")?;
        crate::docker::client::parse_port_output(&stdout).ok_or_else(|| {
            RigError::NotReady(format!("port {} of '{}' is not published yet", port, service))
        })
    }

    /// Bring the stack down, removing images per the remove-images mode
    pub fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }

        tracing::info!(
            project = %self.project_name,
            remove_images = self.remove_images.map(|m| m.as_str()).unwrap_or("none"),
            "stopping compose stack"
        );
        self.compose(self.down_args())?
            .checked("compose down")
            .map_err(|e| RigError::ComposeError(e.to_string()))?;

        self.started = false;
        self.resolved_ports.clear();
        Ok(())
    }

    /// Leave the stack running past this value's lifetime; returns the project name
    pub fn keep_running(mut self) -> String {
        self.started = false;
        std::mem::take(&mut self.project_name)
    }

    /// Treat the project as already up, e.g. one started by `keep_running`
    /// in another process, so `stop` tears it down
    pub fn attach_running(mut self) -> Self {
        self.started = true;
        self
    }

    /// Running container for a service of this project
    pub fn container_for_service(&self, service: &str) -> Result<ContainerSummary> {
        let filter = ContainerFilter::default()
            .label(PROJECT_LABEL, &self.project_name)
            .label(SERVICE_LABEL, service);

        self.docker
            .list_containers(&filter)?
            .into_iter()
            .find(ContainerSummary::is_running)
            .ok_or_else(|| {
                RigError::ContainerNotFound(format!("{}/{}", self.project_name, service))
            })
    }

    /// Image the service's container runs, e.g. `rigab12cd34-customredis` for a built service
    pub fn image_for_service(&self, service: &str) -> Result<String> {
        self.container_for_service(service).map(|c| c.image)
    }

    /// Every container of this project, running or not
    pub fn containers(&self) -> Result<Vec<ContainerSummary>> {
        let filter = ContainerFilter::default()
            .label(PROJECT_LABEL, &self.project_name)
            .all();
        self.docker.list_containers(&filter)
    }

    pub fn service_host(&self, _service: &str) -> &'static str {
        "localhost"
    }

    /// Host port an exposed service port was published on
    pub fn service_port(&self, service: &str, port: u16) -> Result<u16> {
        self.resolved_ports
            .get(&(service.to_string(), port))
            .copied()
            .ok_or_else(|| {
                RigError::InvalidArgument(format!(
                    "Service '{}' port {} was not exposed (or the stack is not started)",
                    service, port
                ))
            })
    }

    /// Logs of one service (or all services)
    pub fn logs(&self, service: Option<&str>) -> Result<String> {
        let mut args = self.base_args();
        args.push("logs".to_string());
        args.push("--no-color".to_string());
        if let Some(service) = service {
            args.push(service.to_string());
        }
        self.compose(args)?.checked("compose logs")
    }
}

impl Drop for ComposeStack {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(
                project = %self.project_name,
                error = %e,
                "failed to stop compose stack"
            );
        }
    }
}
