// Docker integration: engine client, single containers, networks, host ports
// and Compose stacks

pub mod client;
pub mod compose;
pub mod container;
pub mod network;
pub mod ports;

pub use client::{
    CliDocker, ContainerFilter, ContainerSummary, DockerClient, ExecResult, ImageSummary,
};
pub use compose::{ComposeStack, RemoveImages};
pub use container::{Container, ContainerSpec, WaitStrategy};
pub use network::Network;
pub use ports::PortAllocator;
