// Docker engine boundary
//
// Everything that touches the daemon goes through `DockerClient` so fixtures
// can be exercised against a fake in tests. `CliDocker` drives the `docker`
// binary directly (no shell) and parses its `{{json .}}` output.

use crate::docker::container::ContainerSpec;
use crate::errors::{Result, RigError};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::{Command, Output};

/// A container as reported by `docker ps`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerSummary {
    pub id: String,
    pub image: String,
    pub names: Vec<String>,
    pub labels: HashMap<String, String>,
    pub state: String,
}

impl ContainerSummary {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// An image as reported by `docker images`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImageSummary {
    pub id: String,
    pub repository: String,
    pub tag: String,
}

/// Output of a command run inside a container (or of a compose invocation)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout on success, otherwise an error naming `context`
    pub fn checked(self, context: &str) -> Result<String> {
        if self.success() {
            Ok(self.stdout)
        } else {
            Err(RigError::CommandFailed(format!(
                "{} exited with {}: {}",
                context,
                self.exit_code,
                self.stderr.trim()
            )))
        }
    }
}

/// Which containers `list_containers` returns
#[derive(Debug, Clone, Default)]
pub struct ContainerFilter {
    /// Label equality filters, applied by the daemon
    pub labels: Vec<(String, String)>,
    /// Keep only containers with a name ending in this suffix
    pub name_suffix: Option<String>,
    /// Include stopped containers
    pub all: bool,
}

impl ContainerFilter {
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.push((key.to_string(), value.to_string()));
        self
    }

    pub fn name_suffix(mut self, suffix: &str) -> Self {
        self.name_suffix = Some(suffix.to_string());
        self
    }

    pub fn all(mut self) -> Self {
        self.all = true;
        self
    }

    /// Client-side part of the filter
    pub fn matches(&self, container: &ContainerSummary) -> bool {
        let labels_match = self
            .labels
            .iter()
            .all(|(k, v)| container.label(k) == Some(v.as_str()));
        let name_matches = match &self.name_suffix {
            Some(suffix) => container.names.iter().any(|n| n.ends_with(suffix.as_str())),
            None => true,
        };
        labels_match && name_matches
    }
}

/// A `docker compose` call: arguments after `compose`, run in `working_dir`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposeInvocation {
    pub working_dir: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// Operations the fixtures need from the Docker engine
pub trait DockerClient: Send + Sync {
    /// True when the daemon answers
    fn is_available(&self) -> bool;

    fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>>;

    /// Images matching a reference filter such as `redis` or `redis:7-alpine`
    fn list_images(&self, reference: &str) -> Result<Vec<ImageSummary>>;

    /// Create a bridge network and return its id
    fn create_network(&self, name: &str) -> Result<String>;

    fn remove_network(&self, name: &str) -> Result<()>;

    /// Run a detached container and return its id
    fn run_container(&self, spec: &ContainerSpec) -> Result<String>;

    fn is_running(&self, id: &str) -> Result<bool>;

    /// Host port published for a container port
    fn mapped_port(&self, id: &str, container_port: u16) -> Result<u16>;

    fn container_logs(&self, id: &str) -> Result<String>;

    /// Run a command inside a container; a non-zero exit is not an error here
    fn exec(&self, id: &str, command: &[String]) -> Result<ExecResult>;

    fn stop_container(&self, id: &str) -> Result<()>;

    /// Force-remove a container and its anonymous volumes
    fn remove_container(&self, id: &str) -> Result<()>;

    /// Run `docker compose` with the given arguments
    fn compose(&self, invocation: &ComposeInvocation) -> Result<ExecResult>;

    fn image_exists(&self, reference: &str) -> Result<bool> {
        Ok(!self.list_images(reference)?.is_empty())
    }
}

/// First running container whose name ends with `suffix`
pub fn find_container_by_name_suffix(
    docker: &dyn DockerClient,
    suffix: &str,
) -> Result<ContainerSummary> {
    docker
        .list_containers(&ContainerFilter::default().name_suffix(suffix))?
        .into_iter()
        .next()
        .ok_or_else(|| RigError::ContainerNotFound(format!("*{}", suffix)))
}

/// Docker Compose command variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeVariant {
    /// Modern `docker compose` plugin
    Subcommand,
    /// Legacy standalone `docker-compose`
    Hyphenated,
}

impl ComposeVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComposeVariant::Subcommand => "docker compose",
            ComposeVariant::Hyphenated => "docker-compose",
        }
    }
}

/// `DockerClient` backed by the docker CLI
#[derive(Debug, Clone)]
pub struct CliDocker {
    binary: String,
    compose_variant: ComposeVariant,
}

impl Default for CliDocker {
    fn default() -> Self {
        Self::new()
    }
}

impl CliDocker {
    pub fn new() -> Self {
        Self::with_binary("docker")
    }

    pub fn with_binary(binary: &str) -> Self {
        let compose_variant = Self::detect_compose_variant(binary);
        tracing::debug!(binary, variant = compose_variant.as_str(), "docker client ready");
        Self {
            binary: binary.to_string(),
            compose_variant,
        }
    }

    pub fn compose_variant(&self) -> ComposeVariant {
        self.compose_variant
    }

    /// Prefer `docker compose`, fall back to `docker-compose`
    fn detect_compose_variant(binary: &str) -> ComposeVariant {
        let modern = Command::new(binary)
            .args(["compose", "version"])
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false);

        if modern {
            ComposeVariant::Subcommand
        } else {
            ComposeVariant::Hyphenated
        }
    }

    /// Program and full argument list for a compose call
    pub fn compose_command(&self, args: &[String]) -> (String, Vec<String>) {
        match self.compose_variant {
            ComposeVariant::Subcommand => {
                let mut full = vec!["compose".to_string()];
                full.extend_from_slice(args);
                (self.binary.clone(), full)
            }
            ComposeVariant::Hyphenated => ("docker-compose".to_string(), args.to_vec()),
        }
    }

    fn output(&self, args: &[String]) -> Result<Output> {
        tracing::trace!(binary = %self.binary, ?args, "docker");
        Command::new(&self.binary).args(args).output().map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                RigError::DockerUnavailable
            } else {
                RigError::Io(e)
            }
        })
    }

    /// Run a docker command and return stdout, failing on a non-zero exit
    fn run_checked(&self, args: &[String]) -> Result<String> {
        let output = self.output(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RigError::DockerError(format!(
                "`docker {}` failed: {}",
                args.first().map(String::as_str).unwrap_or_default(),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Arguments for `docker ps`; the name suffix is applied client-side
pub fn ps_args(filter: &ContainerFilter) -> Vec<String> {
    let mut args = to_args(&["ps", "--no-trunc", "--format", "{{json .}}"]);
    if filter.all {
        args.push("-a".to_string());
    }
    for (key, value) in &filter.labels {
        args.push("--filter".to_string());
        args.push(format!("label={}={}", key, value));
    }
    args
}

/// Arguments for `docker images` restricted to `reference`
pub fn images_args(reference: &str) -> Vec<String> {
    let mut args = to_args(&["images", "--no-trunc", "--format", "{{json .}}", "--filter"]);
    args.push(format!("reference={}", reference));
    args
}

/// Arguments for a detached `docker run` of `spec`
pub fn run_container_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = to_args(&["run", "-d"]);
    args.extend(spec.run_args());
    args
}

/// Force removal, anonymous volumes included
pub fn remove_container_args(id: &str) -> Vec<String> {
    to_args(&["rm", "-f", "-v", id])
}

fn exec_result(output: Output) -> ExecResult {
    ExecResult {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    }
}

impl DockerClient for CliDocker {
    fn is_available(&self) -> bool {
        self.output(&to_args(&["version", "--format", "{{.Server.Version}}"]))
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>> {
        let stdout = self.run_checked(&ps_args(filter))?;
        let containers = parse_ps_output(&stdout)?;
        Ok(containers.into_iter().filter(|c| filter.matches(c)).collect())
    }

    fn list_images(&self, reference: &str) -> Result<Vec<ImageSummary>> {
        let stdout = self.run_checked(&images_args(reference))?;
        parse_images_output(&stdout)
    }

    fn create_network(&self, name: &str) -> Result<String> {
        let id = self.run_checked(&to_args(&["network", "create", name]))?;
        Ok(id.trim().to_string())
    }

    fn remove_network(&self, name: &str) -> Result<()> {
        self.run_checked(&to_args(&["network", "rm", name]))?;
        Ok(())
    }

    fn run_container(&self, spec: &ContainerSpec) -> Result<String> {
        let id = self.run_checked(&run_container_args(spec))?;
        Ok(id.trim().to_string())
    }

    fn is_running(&self, id: &str) -> Result<bool> {
        let out = self.run_checked(&to_args(&["inspect", "-f", "{{.State.Running}}", id]))?;
        Ok(out.trim() == "true")
    }

    fn mapped_port(&self, id: &str, container_port: u16) -> Result<u16> {
        let port_arg = format!("{}/tcp", container_port);
        let out = self.run_checked(&to_args(&["port", id, port_arg.as_str()]))?;
        parse_port_output(&out).ok_or_else(|| {
            RigError::DockerError(format!(
                "Port {} of container {} is not published",
                container_port, id
            ))
        })
    }

    fn container_logs(&self, id: &str) -> Result<String> {
        let output = self.output(&to_args(&["logs", id]))?;
        if !output.status.success() {
            return Err(RigError::DockerError(format!(
                "Failed to read logs of {}: {}",
                id,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        // Containers log to both streams
        let mut logs = String::from_utf8_lossy(&output.stdout).to_string();
        logs.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(logs)
    }

    fn exec(&self, id: &str, command: &[String]) -> Result<ExecResult> {
        let mut args = to_args(&["exec", id]);
        args.extend_from_slice(command);
        Ok(exec_result(self.output(&args)?))
    }

    fn stop_container(&self, id: &str) -> Result<()> {
        self.run_checked(&to_args(&["stop", id]))?;
        Ok(())
    }

    fn remove_container(&self, id: &str) -> Result<()> {
        self.run_checked(&remove_container_args(id))?;
        Ok(())
    }

    fn compose(&self, invocation: &ComposeInvocation) -> Result<ExecResult> {
        let (program, args) = self.compose_command(&invocation.args);
        tracing::debug!(%program, ?args, dir = %invocation.working_dir.display(), "compose");

        let output = Command::new(&program)
            .args(&args)
            .envs(&invocation.env)
            .current_dir(&invocation.working_dir)
            .output()
            .map_err(|e| {
                if e.kind() == ErrorKind::NotFound {
                    RigError::ComposeError(format!("{} is not installed", program))
                } else {
                    RigError::Io(e)
                }
            })?;

        Ok(exec_result(output))
    }
}

#[derive(Deserialize)]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "Names", default)]
    names: String,
    #[serde(rename = "Labels", default)]
    labels: String,
    #[serde(rename = "State", default)]
    state: String,
}

#[derive(Deserialize)]
struct ImagesLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Repository")]
    repository: String,
    #[serde(rename = "Tag", default)]
    tag: String,
}

/// Parse `docker ps --format '{{json .}}'` output, one object per line
pub fn parse_ps_output(output: &str) -> Result<Vec<ContainerSummary>> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| -> Result<ContainerSummary> {
            let raw: PsLine = serde_json::from_str(line)?;
            Ok(ContainerSummary {
                id: raw.id,
                image: raw.image,
                names: raw
                    .names
                    .split(',')
                    .filter(|n| !n.is_empty())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .collect(),
                labels: parse_labels(&raw.labels),
                state: raw.state,
            })
        })
        .collect()
}

/// Parse `docker images --format '{{json .}}'` output
pub fn parse_images_output(output: &str) -> Result<Vec<ImageSummary>> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| -> Result<ImageSummary> {
            let raw: ImagesLine = serde_json::from_str(line)?;
            Ok(ImageSummary {
                id: raw.id,
                repository: raw.repository,
                tag: raw.tag,
            })
        })
        .collect()
}

/// `k=v,k2=v2` as printed by `docker ps`
pub fn parse_labels(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .collect()
}

/// First host port in `docker port` style output such as `0.0.0.0:49153`
pub fn parse_port_output(output: &str) -> Option<u16> {
    output
        .lines()
        .filter_map(|line| line.trim().rsplit_once(':'))
        .find_map(|(_, port)| port.parse::<u16>().ok())
        .filter(|port| *port > 0)
}
