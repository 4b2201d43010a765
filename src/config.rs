use crate::errors::{Result, RigError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = ".stackrig.yml";

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub compose: ComposeConfig,
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub wait: WaitConfig,
    #[serde(default)]
    pub ports: PortsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DockerConfig {
    /// Docker CLI binary to invoke
    #[serde(default = "default_docker_binary")]
    pub binary: String,
}

fn default_docker_binary() -> String {
    "docker".to_string()
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: default_docker_binary(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ComposeConfig {
    #[serde(default = "default_compose_file")]
    pub file: String,
    #[serde(default)]
    pub build: bool,
    /// "local" or "all"; absent keeps every image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_images: Option<String>,
    #[serde(default = "default_true")]
    pub remove_volumes: bool,
    #[serde(default = "default_compose_startup_timeout")]
    pub startup_timeout: String,
}

fn default_compose_file() -> String {
    "docker-compose.yml".to_string()
}

fn default_true() -> bool {
    true
}

fn default_compose_startup_timeout() -> String {
    "60s".to_string()
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            file: default_compose_file(),
            build: false,
            remove_images: None,
            remove_volumes: true,
            startup_timeout: default_compose_startup_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct KafkaConfig {
    #[serde(default = "default_confluent_version")]
    pub confluent_version: String,
    #[serde(default = "default_brokers")]
    pub brokers: usize,
    #[serde(default = "default_internal_topics_rf")]
    pub internal_topics_rf: usize,
    #[serde(default = "default_kafka_startup_timeout")]
    pub startup_timeout: String,
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout: String,
}

fn default_confluent_version() -> String {
    "7.4.0".to_string()
}

fn default_brokers() -> usize {
    3
}

fn default_internal_topics_rf() -> usize {
    2
}

fn default_kafka_startup_timeout() -> String {
    "1m".to_string()
}

fn default_readiness_timeout() -> String {
    "10s".to_string()
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            confluent_version: default_confluent_version(),
            brokers: default_brokers(),
            internal_topics_rf: default_internal_topics_rf(),
            startup_timeout: default_kafka_startup_timeout(),
            readiness_timeout: default_readiness_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WaitConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,
    /// How long to wait for images to appear or disappear after a lifecycle change
    #[serde(default = "default_image_timeout")]
    pub image_timeout: String,
}

fn default_poll_interval() -> String {
    "100ms".to_string()
}

fn default_image_timeout() -> String {
    "10s".to_string()
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            image_timeout: default_image_timeout(),
        }
    }
}

/// Host port range for fixed port bindings; unset means ephemeral ports
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct PortsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_start: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_end: Option<u16>,
}

impl PortsConfig {
    pub fn range(&self) -> Result<Option<(u16, u16)>> {
        match (self.range_start, self.range_end) {
            (None, None) => Ok(None),
            (Some(start), Some(end)) if start > 0 && start <= end => Ok(Some((start, end))),
            (Some(start), Some(end)) => Err(RigError::ConfigError(format!(
                "Invalid port range {}-{}",
                start, end
            ))),
            _ => Err(RigError::ConfigError(
                "ports.range_start and ports.range_end must be set together".to_string(),
            )),
        }
    }
}

impl Config {
    /// Load config from .stackrig.yml in the given directory, defaults if absent
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE_NAME);

        if !config_path.exists() {
            return Ok(Config::default());
        }

        Self::load_file(&config_path)
    }

    /// Load config from an explicit file
    pub fn load_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_yml::from_str(&content).map_err(|e| {
            RigError::ConfigError(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Project config found upward from `start_path`, then the user config, then defaults
    pub fn discover(start_path: &Path) -> Result<Self> {
        if let Some(path) = Self::find_config_file(start_path) {
            tracing::debug!(path = %path.display(), "using project config");
            return Self::load_file(&path);
        }

        if let Some(path) = Self::user_config_path().filter(|p| p.exists()) {
            tracing::debug!(path = %path.display(), "using user config");
            return Self::load_file(&path);
        }

        Ok(Config::default())
    }

    /// Walk up from `start_path` looking for .stackrig.yml
    pub fn find_config_file(start_path: &Path) -> Option<PathBuf> {
        let mut current = Some(start_path);

        while let Some(dir) = current {
            let candidate = dir.join(CONFIG_FILE_NAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            current = dir.parent();
        }

        None
    }

    /// ~/.config/stackrig/config.yml (platform equivalent)
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("stackrig").join("config.yml"))
    }

    /// Check every duration and range up front so failures name the config key
    pub fn validate(&self) -> Result<()> {
        for (key, value) in [
            ("compose.startup_timeout", &self.compose.startup_timeout),
            ("kafka.startup_timeout", &self.kafka.startup_timeout),
            ("kafka.readiness_timeout", &self.kafka.readiness_timeout),
            ("wait.poll_interval", &self.wait.poll_interval),
            ("wait.image_timeout", &self.wait.image_timeout),
        ] {
            parse_duration(value)
                .map_err(|e| RigError::ConfigError(format!("{}: {}", key, e)))?;
        }

        if let Some(mode) = &self.compose.remove_images {
            mode.parse::<crate::docker::compose::RemoveImages>()?;
        }

        self.ports.range()?;
        Ok(())
    }
}

/// Parse a duration string such as "500ms", "30s", "1m" (bare numbers are seconds)
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let invalid = || RigError::ConfigError(format!("Invalid duration value: {}", value));

    if let Some(num) = value.strip_suffix("ms") {
        num.trim().parse::<u64>().map(Duration::from_millis).map_err(|_| invalid())
    } else if let Some(num) = value.strip_suffix('s') {
        num.trim().parse::<u64>().map(Duration::from_secs).map_err(|_| invalid())
    } else if let Some(num) = value.strip_suffix('m') {
        let minutes = num.trim().parse::<u64>().map_err(|_| invalid())?;
        Ok(Duration::from_secs(minutes * 60))
    } else {
        value.parse::<u64>().map(Duration::from_secs).map_err(|_| invalid())
    }
}

impl ComposeConfig {
    pub fn startup_timeout(&self) -> Result<Duration> {
        parse_duration(&self.startup_timeout)
    }
}

impl KafkaConfig {
    pub fn startup_timeout(&self) -> Result<Duration> {
        parse_duration(&self.startup_timeout)
    }

    pub fn readiness_timeout(&self) -> Result<Duration> {
        parse_duration(&self.readiness_timeout)
    }
}

impl WaitConfig {
    pub fn poll_interval(&self) -> Result<Duration> {
        parse_duration(&self.poll_interval)
    }

    pub fn image_timeout(&self) -> Result<Duration> {
        parse_duration(&self.image_timeout)
    }
}
