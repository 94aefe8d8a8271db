//! NAT rule data structures
//!
//! A [`NatRule`] is the declarative unit this crate manages: one host port
//! forwarded to one port of one LXC container. The firewall entry that backs
//! an enabled rule is never stored; it is re-derived from the rule by the
//! codec whenever it has to be added or removed.
//!
//! # Field mutability
//!
//! - `id`, `node`, `vmid` and `created_at` are fixed once the store assigns them
//! - the forwarding triple (`host_port`, `protocol`, `container_port`),
//!   `description` and `enabled` change through [`RulePatch`]
//! - `container_ip_at_creation` is a cached snapshot of the container address
//!   at the time the entry was last applied, refreshed on update and resync
//!
//! # Example
//!
//! ```
//! use natkeeper::core::rule::{NewRule, Protocol};
//!
//! let request = NewRule {
//!     node: "pve1".to_string(),
//!     vmid: 100,
//!     host_port: 2222,
//!     container_port: 22,
//!     protocol: "TCP".parse::<Protocol>().unwrap(),
//!     description: Some("ssh".to_string()),
//! };
//! assert_eq!(request.protocol.as_str(), "tcp");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Identifier assigned by the rule store. Never reused.
pub type RuleId = u64;

/// Maximum number of rules returned by a single listing page
pub const MAX_PAGE_SIZE: usize = 1000;

/// Transport protocol of a forward
///
/// Parsing is case-insensitive; rendering is always lowercase, which is the
/// form iptables expects after `-p`.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Protocol {
    #[default]
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// A persisted port-forwarding rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NatRule {
    pub id: RuleId,
    pub node: String,
    pub vmid: u32,
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: Protocol,
    pub container_ip_at_creation: IpAddr,
    #[serde(default)]
    pub description: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NatRule {
    /// The `(host_port, protocol)` pair that must be unique among enabled rules
    pub fn slot(&self) -> (u16, Protocol) {
        (self.host_port, self.protocol)
    }

    /// `ip:port` the DNAT entry redirects to
    pub fn destination(&self) -> String {
        match self.container_ip_at_creation {
            IpAddr::V4(ip) => format!("{ip}:{}", self.container_port),
            IpAddr::V6(ip) => format!("[{ip}]:{}", self.container_port),
        }
    }

    /// True when the forwarding triple differs from `other`
    pub fn networking_differs(&self, other: &NatRule) -> bool {
        self.host_port != other.host_port
            || self.protocol != other.protocol
            || self.container_port != other.container_port
    }
}

impl fmt::Display for NatRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {}/{} -> {}/{} {} ({})",
            self.id,
            self.host_port,
            self.protocol,
            self.node,
            self.vmid,
            self.destination(),
            if self.enabled { "enabled" } else { "disabled" }
        )
    }
}

/// Request to create a rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewRule {
    pub node: String,
    pub vmid: u32,
    pub host_port: u16,
    pub container_port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub description: Option<String>,
}

/// Partial update of a rule. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RulePatch {
    pub host_port: Option<u16>,
    pub container_port: Option<u16>,
    pub protocol: Option<Protocol>,
    pub description: Option<String>,
    pub enabled: Option<bool>,
}

impl RulePatch {
    pub fn is_empty(&self) -> bool {
        self == &RulePatch::default()
    }

    /// Returns a copy of `rule` with the patch applied
    pub fn apply_to(&self, rule: &NatRule) -> NatRule {
        let mut next = rule.clone();
        if let Some(port) = self.host_port {
            next.host_port = port;
        }
        if let Some(port) = self.container_port {
            next.container_port = port;
        }
        if let Some(protocol) = self.protocol {
            next.protocol = protocol;
        }
        if let Some(description) = &self.description {
            next.description = if description.is_empty() {
                None
            } else {
                Some(description.clone())
            };
        }
        if let Some(enabled) = self.enabled {
            next.enabled = enabled;
        }
        next
    }
}

/// Everything the store needs to insert a new row; the store assigns the id
/// and timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleDraft {
    pub node: String,
    pub vmid: u32,
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: Protocol,
    pub container_ip: IpAddr,
    pub description: Option<String>,
    pub enabled: bool,
}

/// Which rules a listing covers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RuleScope {
    #[default]
    All,
    Container { node: String, vmid: u32 },
}

/// One page of a listing plus the total number of matching rules
#[derive(Debug, Clone, Serialize)]
pub struct RulePage {
    pub rules: Vec<NatRule>,
    pub total: usize,
}
