// Host port allocation for containers that must advertise a fixed address
// (a Kafka broker has to know its published port before it starts).

use crate::errors::{Result, RigError};
use std::collections::HashMap;
use std::net::{Ipv4Addr, TcpListener};

/// Hands out free host ports, never the same one twice to live owners
#[derive(Debug, Default)]
pub struct PortAllocator {
    /// Owner -> container port -> host port
    allocations: HashMap<String, HashMap<u16, u16>>,
    range: Option<(u16, u16)>,
}

impl PortAllocator {
    /// Allocator that asks the OS for ephemeral ports
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator restricted to `range_start..=range_end`
    pub fn with_range(range_start: u16, range_end: u16) -> Result<Self> {
        if range_start == 0 || range_start > range_end {
            return Err(RigError::PortAllocationError(format!(
                "Invalid port range {}-{}",
                range_start, range_end
            )));
        }
        Ok(Self {
            allocations: HashMap::new(),
            range: Some((range_start, range_end)),
        })
    }

    /// Allocate a host port for each container port of `owner`
    ///
    /// Allocating again for the same owner returns the existing ports.
    pub fn allocate(&mut self, owner: &str, container_ports: &[u16]) -> Result<HashMap<u16, u16>> {
        if let Some(existing) = self.allocations.get(owner) {
            return Ok(existing.clone());
        }

        let mut allocated = HashMap::new();
        for &container_port in container_ports {
            let host_port = self.next_free_port(&allocated)?;
            allocated.insert(container_port, host_port);
        }

        tracing::debug!(owner, ports = ?allocated, "allocated host ports");
        self.allocations.insert(owner.to_string(), allocated.clone());
        Ok(allocated)
    }

    pub fn get_ports(&self, owner: &str) -> Result<HashMap<u16, u16>> {
        self.allocations.get(owner).cloned().ok_or_else(|| {
            RigError::PortAllocationError(format!("No ports allocated for '{}'", owner))
        })
    }

    pub fn release(&mut self, owner: &str) {
        self.allocations.remove(owner);
    }

    pub fn list_all(&self) -> Vec<(String, HashMap<u16, u16>)> {
        self.allocations
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn is_reserved(&self, port: u16, pending: &HashMap<u16, u16>) -> bool {
        pending.values().any(|&p| p == port)
            || self
                .allocations
                .values()
                .any(|ports| ports.values().any(|&p| p == port))
    }

    fn next_free_port(&self, pending: &HashMap<u16, u16>) -> Result<u16> {
        match self.range {
            Some((start, end)) => (start..=end)
                .find(|&port| !self.is_reserved(port, pending) && is_port_free(port))
                .ok_or_else(|| {
                    RigError::PortAllocationError(format!(
                        "No available ports in range {}-{}",
                        start, end
                    ))
                }),
            None => {
                // The OS may hand back a port we reserved but nobody bound yet
                for _ in 0..32 {
                    let port = ephemeral_port()?;
                    if !self.is_reserved(port, pending) {
                        return Ok(port);
                    }
                }
                Err(RigError::PortAllocationError(
                    "OS kept returning reserved ports".to_string(),
                ))
            }
        }
    }
}

/// True when nothing is listening on the port locally
pub fn is_port_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

fn ephemeral_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}
