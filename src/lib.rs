// Library interface for stackrig
// Docker-backed test fixtures: Compose stacks and multi-broker Kafka clusters

pub mod cli;
pub mod clock;
pub mod config;
pub mod docker;
pub mod errors;
pub mod image;
pub mod kafka;
pub mod logging;
pub mod wait;

pub use docker::client::{CliDocker, DockerClient};
pub use docker::compose::{ComposeStack, RemoveImages};
pub use errors::{Result, RigError};
pub use image::ImageName;
pub use kafka::KafkaCluster;
pub use wait::Await;
