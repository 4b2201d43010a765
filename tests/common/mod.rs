/// Common test utilities for stackrig integration tests
///
/// `FakeDocker` stands in for the daemon: it keeps containers, networks and
/// images in memory, simulates `docker compose` for a configured set of
/// services, and records every call so tests can assert on ordering.
use stackrig::docker::client::{
    ComposeInvocation, ContainerFilter, ContainerSummary, DockerClient, ExecResult, ImageSummary,
};
use stackrig::docker::compose::{PROJECT_LABEL, SERVICE_LABEL};
use stackrig::docker::container::ContainerSpec;
use stackrig::errors::{Result, RigError};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Mutex;

/// A service the fake compose knows how to bring up
#[derive(Debug, Clone)]
pub struct FakeService {
    pub name: String,
    /// Pulled image reference, or None when the service is built
    pub image: Option<String>,
}

impl FakeService {
    #[allow(dead_code)]
    pub fn built(name: &str) -> Self {
        Self {
            name: name.to_string(),
            image: None,
        }
    }

    #[allow(dead_code)]
    pub fn pulled(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            image: Some(image.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
struct FakeContainer {
    summary: ContainerSummary,
    alias: String,
}

#[derive(Default)]
struct FakeState {
    calls: Vec<String>,
    containers: BTreeMap<String, FakeContainer>,
    networks: BTreeSet<String>,
    images: BTreeSet<String>,
    next_id: usize,
    services: Vec<FakeService>,
    next_host_port: u16,
    /// Cap on the broker ids ZooKeeper reports
    registered_limit: Option<usize>,
    /// Alias whose `docker run` fails
    fail_run_alias: Option<String>,
    fail_compose_up: bool,
    /// Stderr of a failing `zookeeper-shell`
    zookeeper_shell_error: Option<String>,
    unavailable: bool,
}

pub struct FakeDocker {
    state: Mutex<FakeState>,
}

#[allow(dead_code)]
impl FakeDocker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_host_port: 49152,
                ..FakeState::default()
            }),
        }
    }

    pub fn with_services(self, services: Vec<FakeService>) -> Self {
        self.state.lock().unwrap().services = services;
        self
    }

    pub fn with_registered_limit(self, limit: usize) -> Self {
        self.state.lock().unwrap().registered_limit = Some(limit);
        self
    }

    pub fn failing_run_for(self, alias: &str) -> Self {
        self.state.lock().unwrap().fail_run_alias = Some(alias.to_string());
        self
    }

    pub fn failing_compose_up(self) -> Self {
        self.state.lock().unwrap().fail_compose_up = true;
        self
    }

    pub fn failing_zookeeper_shell(self, stderr: &str) -> Self {
        self.state.lock().unwrap().zookeeper_shell_error = Some(stderr.to_string());
        self
    }

    pub fn unavailable(self) -> Self {
        self.state.lock().unwrap().unavailable = true;
        self
    }

    pub fn add_image(&self, reference: &str) {
        self.state.lock().unwrap().images.insert(reference.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    pub fn network_count(&self) -> usize {
        self.state.lock().unwrap().networks.len()
    }

    pub fn has_image(&self, reference: &str) -> bool {
        self.state.lock().unwrap().images.contains(reference)
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }
}

fn image_matches(image: &str, reference: &str) -> bool {
    image == reference || (!reference.contains(':') && image.split(':').next() == Some(reference))
}

/// Project name and the arguments after `-p`/`-f` pairs
fn split_compose_args(args: &[String]) -> (String, Vec<String>) {
    let mut project = String::new();
    let mut i = 0;
    while i + 1 < args.len() && (args[i] == "-p" || args[i] == "-f") {
        if args[i] == "-p" {
            project = args[i + 1].clone();
        }
        i += 2;
    }
    (project, args[i..].to_vec())
}

impl DockerClient for FakeDocker {
    fn is_available(&self) -> bool {
        !self.state.lock().unwrap().unavailable
    }

    fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .values()
            .map(|c| c.summary.clone())
            .filter(|c| filter.all || c.is_running())
            .filter(|c| filter.matches(c))
            .collect())
    }

    fn list_images(&self, reference: &str) -> Result<Vec<ImageSummary>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .images
            .iter()
            .filter(|image| image_matches(image, reference))
            .map(|image| {
                let (repository, tag) = image.split_once(':').unwrap_or((image.as_str(), "latest"));
                ImageSummary {
                    id: format!("sha256:{}", repository),
                    repository: repository.to_string(),
                    tag: tag.to_string(),
                }
            })
            .collect())
    }

    fn create_network(&self, name: &str) -> Result<String> {
        self.record(format!("network create {}", name));
        self.state.lock().unwrap().networks.insert(name.to_string());
        Ok(format!("net-{}", name))
    }

    fn remove_network(&self, name: &str) -> Result<()> {
        self.record(format!("network rm {}", name));
        let mut state = self.state.lock().unwrap();
        if state
            .containers
            .values()
            .any(|c| c.summary.labels.get("network").map(String::as_str) == Some(name))
        {
            return Err(RigError::DockerError(format!("network {} has active endpoints", name)));
        }
        state.networks.remove(name);
        Ok(())
    }

    fn run_container(&self, spec: &ContainerSpec) -> Result<String> {
        let alias = spec.display_name();
        self.record(format!("run {}", alias));

        let mut state = self.state.lock().unwrap();
        if state.fail_run_alias.as_deref() == Some(alias.as_str()) {
            return Err(RigError::DockerError(format!("cannot start {}", alias)));
        }
        if let Some(network) = &spec.network {
            if !state.networks.contains(network) {
                return Err(RigError::DockerError(format!("network {} not found", network)));
            }
        }

        state.next_id += 1;
        let id = format!("c{}", state.next_id);
        let mut labels: HashMap<String, String> = spec.labels.clone().into_iter().collect();
        if let Some(network) = &spec.network {
            labels.insert("network".to_string(), network.clone());
        }
        let summary = ContainerSummary {
            id: id.clone(),
            image: spec.image.to_string(),
            names: vec![alias.clone()],
            labels,
            state: "running".to_string(),
        };
        state.images.insert(spec.image.to_string());
        state.containers.insert(id.clone(), FakeContainer { summary, alias });
        Ok(id)
    }

    fn is_running(&self, id: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().containers.contains_key(id))
    }

    fn mapped_port(&self, id: &str, _container_port: u16) -> Result<u16> {
        let mut state = self.state.lock().unwrap();
        if !state.containers.contains_key(id) {
            return Err(RigError::ContainerNotFound(id.to_string()));
        }
        state.next_host_port += 1;
        Ok(state.next_host_port)
    }

    fn container_logs(&self, id: &str) -> Result<String> {
        let state = self.state.lock().unwrap();
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| RigError::ContainerNotFound(id.to_string()))?;
        Ok(format!(
            "INFO [KafkaServer id=0] started (kafka.server.KafkaServer) for {}\n",
            container.alias
        ))
    }

    fn exec(&self, id: &str, command: &[String]) -> Result<ExecResult> {
        self.record(format!("exec {}", command.join(" ")));
        let state = self.state.lock().unwrap();
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| RigError::ContainerNotFound(id.to_string()))?;

        if container.alias != "zookeeper" {
            return Ok(ExecResult {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            });
        }

        if let Some(stderr) = &state.zookeeper_shell_error {
            return Ok(ExecResult {
                exit_code: 1,
                stdout: String::new(),
                stderr: stderr.clone(),
            });
        }

        let mut ids: Vec<String> = state
            .containers
            .values()
            .filter_map(|c| c.alias.strip_prefix("broker-").map(str::to_string))
            .collect();
        if let Some(limit) = state.registered_limit {
            ids.truncate(limit);
        }

        Ok(ExecResult {
            exit_code: 0,
            stdout: format!("Connecting to zookeeper:2181\n\n[{}]\n", ids.join(", ")),
            stderr: String::new(),
        })
    }

    fn stop_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let alias = state
            .containers
            .get(id)
            .map(|c| c.alias.clone())
            .ok_or_else(|| RigError::ContainerNotFound(id.to_string()))?;
        state.calls.push(format!("stop {}", alias));
        Ok(())
    }

    fn remove_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let alias = state
            .containers
            .get(id)
            .map(|c| c.alias.clone())
            .unwrap_or_else(|| id.to_string());
        state.calls.push(format!("rm {}", alias));
        state.containers.remove(id);
        Ok(())
    }

    fn compose(&self, invocation: &ComposeInvocation) -> Result<ExecResult> {
        let (project, tail) = split_compose_args(&invocation.args);
        self.record(format!("compose {}", tail.join(" ")));

        let ok = |stdout: String| -> Result<ExecResult> {
            Ok(ExecResult {
                exit_code: 0,
                stdout,
                stderr: String::new(),
            })
        };

        let mut state = self.state.lock().unwrap();
        match tail.first().map(String::as_str) {
            Some("up") => {
                if state.fail_compose_up {
                    return Ok(ExecResult {
                        exit_code: 1,
                        stdout: String::new(),
                        stderr: "service \"customredis\" failed to build".to_string(),
                    });
                }
                for service in state.services.clone() {
                    let image = service
                        .image
                        .clone()
                        .unwrap_or_else(|| format!("{}-{}", project, service.name));
                    state.images.insert(image.clone());
                    state.next_id += 1;
                    let id = format!("c{}", state.next_id);
                    let mut labels = HashMap::new();
                    labels.insert(PROJECT_LABEL.to_string(), project.clone());
                    labels.insert(SERVICE_LABEL.to_string(), service.name.clone());
                    labels.insert(
                        "built".to_string(),
                        service.image.is_none().to_string(),
                    );
                    let summary = ContainerSummary {
                        id: id.clone(),
                        image,
                        names: vec![format!("{}_{}_1", project, service.name)],
                        labels,
                        state: "running".to_string(),
                    };
                    state.containers.insert(
                        id,
                        FakeContainer {
                            summary,
                            alias: service.name.clone(),
                        },
                    );
                }
                ok(String::new())
            }
            Some("down") => {
                let rmi = tail
                    .iter()
                    .position(|a| a == "--rmi")
                    .and_then(|i| tail.get(i + 1))
                    .cloned();
                let removed: Vec<FakeContainer> = state
                    .containers
                    .values()
                    .filter(|c| c.summary.label(PROJECT_LABEL) == Some(project.as_str()))
                    .cloned()
                    .collect();
                for container in &removed {
                    state.containers.remove(&container.summary.id);
                    let built = container.summary.label("built") == Some("true");
                    let remove = match rmi.as_deref() {
                        Some("all") => true,
                        Some("local") => built,
                        _ => false,
                    };
                    if remove {
                        state.images.remove(&container.summary.image);
                    }
                }
                ok(String::new())
            }
            Some("port") => {
                let service = tail.get(1).cloned().unwrap_or_default();
                let running = state.containers.values().any(|c| {
                    c.summary.label(PROJECT_LABEL) == Some(project.as_str())
                        && c.summary.label(SERVICE_LABEL) == Some(service.as_str())
                });
                if running {
                    state.next_host_port += 1;
                    ok(format!("0.0.0.0:{}\n", state.next_host_port))
                } else {
                    Ok(ExecResult {
                        exit_code: 1,
                        stdout: String::new(),
                        stderr: format!("no container found for {}", service),
                    })
                }
            }
            Some("logs") => {
                let wanted = tail.iter().skip(1).find(|a| !a.starts_with("--"));
                let lines: Vec<String> = state
                    .containers
                    .values()
                    .filter(|c| c.summary.label(PROJECT_LABEL) == Some(project.as_str()))
                    .filter(|c| {
                        wanted.map_or(true, |w| c.summary.label(SERVICE_LABEL) == Some(w.as_str()))
                    })
                    .map(|c| format!("{}-1  | Ready to accept connections", c.alias))
                    .collect();
                ok(lines.join("\n"))
            }
            _ => ok(String::new()),
        }
    }
}

/// Write a minimal compose file into `dir` and return its path
#[allow(dead_code)]
pub fn write_compose_file(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("docker-compose.yml");
    std::fs::write(
        &path,
        "services:\n  customredis:\n    build: .\n  normalredis:\n    image: redis:7-alpine\n",
    )
    .expect("Failed to write compose file");
    path
}
