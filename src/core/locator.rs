//! Container address and status lookup
//!
//! The lifecycle manager and the resync engine need two facts about a
//! container: its current IP and whether it is running. Both come from the
//! Proxmox API through `pvesh`, so lookups share the executor (and its
//! timeout and elevation) with the firewall commands.
//!
//! Lookups never fail loudly. Any problem, from a bad node name to a stopped
//! container to unparseable JSON, is logged and reported as "unavailable".

use crate::core::executor::{CommandExecutor, DEFAULT_COMMAND_TIMEOUT};
use crate::validators::validate_node_name;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tracing::{debug, warn};

/// Runtime status reported for a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub status: String,
}

impl ContainerStatus {
    pub fn running() -> Self {
        Self {
            status: "running".to_string(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

/// Resolves container facts. `None` means "unavailable".
pub trait ContainerLocator: Send + Sync {
    fn container_ip(&self, node: &str, vmid: u32) -> impl Future<Output = Option<IpAddr>> + Send;

    fn container_status(
        &self,
        node: &str,
        vmid: u32,
    ) -> impl Future<Output = Option<ContainerStatus>> + Send;
}

#[derive(Debug, Deserialize)]
struct GuestInterface {
    name: String,
    #[serde(default)]
    inet: Option<String>,
}

/// [`ContainerLocator`] backed by `pvesh get /nodes/<node>/lxc/<vmid>/...`
#[derive(Debug, Clone)]
pub struct PveshLocator<E> {
    executor: E,
    program: Vec<String>,
    timeout: Duration,
}

impl<E: CommandExecutor> PveshLocator<E> {
    pub fn new(executor: E, program: Vec<String>) -> Self {
        Self {
            executor,
            program,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn get_json(&self, node: &str, vmid: u32, endpoint: &str) -> Option<serde_json::Value> {
        if let Err(e) = validate_node_name(node) {
            warn!("Refusing container lookup for node {node:?}: {e}");
            return None;
        }

        let mut argv = self.program.clone();
        argv.extend([
            "get".to_string(),
            format!("/nodes/{node}/lxc/{vmid}/{endpoint}"),
            "--output-format".to_string(),
            "json".to_string(),
        ]);

        let outcome = self.executor.invoke(&argv, self.timeout).await;
        if !outcome.ok {
            warn!("Lookup of {node}/{vmid} {endpoint} failed: {}", outcome.output);
            return None;
        }

        match serde_json::from_str(&outcome.output) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Unparseable {endpoint} response for {node}/{vmid}: {e}");
                None
            }
        }
    }
}

impl<E: CommandExecutor> ContainerLocator for PveshLocator<E> {
    async fn container_ip(&self, node: &str, vmid: u32) -> Option<IpAddr> {
        let value = self.get_json(node, vmid, "interfaces").await?;
        let interfaces: Vec<GuestInterface> = match serde_json::from_value(value) {
            Ok(interfaces) => interfaces,
            Err(e) => {
                warn!("Unexpected interfaces payload for {node}/{vmid}: {e}");
                return None;
            }
        };

        let Some(ip) = pick_address(&interfaces) else {
            warn!("Container {node}/{vmid} has no usable IPv4 address");
            return None;
        };
        debug!("Container {node}/{vmid} resolved to {ip}");
        Some(IpAddr::V4(ip))
    }

    async fn container_status(&self, node: &str, vmid: u32) -> Option<ContainerStatus> {
        let value = self.get_json(node, vmid, "status/current").await?;
        let status = value.get("status")?.as_str()?.to_string();
        Some(ContainerStatus { status })
    }
}

/// First IPv4 on a non-loopback interface.
///
/// DNAT entries go through `iptables`, which only handles IPv4, so a
/// container reachable only over IPv6 has no usable address.
fn pick_address(interfaces: &[GuestInterface]) -> Option<Ipv4Addr> {
    interfaces
        .iter()
        .filter(|iface| iface.name != "lo")
        .filter_map(|iface| iface.inet.as_deref().and_then(parse_cidr))
        .find_map(|ip| match ip {
            IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified() => Some(v4),
            _ => None,
        })
}

fn parse_cidr(value: &str) -> Option<IpAddr> {
    let addr = value.split_once('/').map_or(value, |(addr, _)| addr);
    addr.trim().parse().ok()
}
