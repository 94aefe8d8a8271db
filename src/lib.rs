//! natkeeper - NAT port forwards for Proxmox LXC containers
//!
//! Keeps iptables DNAT entries in the `nat` table's PREROUTING chain in line
//! with a persistent table of port-forwarding rules.
//!
//! # Architecture
//!
//! - [`core`] - Rule model, iptables codec, store, lifecycle and resync
//! - [`audit`] - Audit logging for every mutating operation
//! - [`validators`] - Input validation and sanitization
//! - [`config`] - Configuration persistence
//! - [`elevation`] - Privilege elevation for external commands
//! - [`utils`] - Utility functions (XDG directories, command lines)
//!
//! # Safety Features
//!
//! - Entries are recognized only by a private comment marker; foreign
//!   entries in the chain are never touched
//! - Store writes are transactional and atomic on disk (0600, SHA-256 sidecar)
//! - Every external command runs with a bounded timeout
//! - Failed firewall steps degrade the rule (disable it) instead of leaving
//!   the table and the chain out of agreement

#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

pub use core::codec::{IptablesCodec, RuleCodec};
pub use core::error::{Error, Result};
pub use core::executor::{CommandExecutor, SystemExecutor};
pub use core::firewall::NatFirewall;
pub use core::lifecycle::{NatService, RuleDeletion, RuleMutation};
pub use core::locator::{ContainerLocator, PveshLocator};
pub use core::resync::{ResyncReport, ResyncStats, WatchExit};
pub use core::rule::{NatRule, NewRule, Protocol, RulePatch, RuleScope};
pub use core::store::{JsonRuleStore, RuleAmendment, RuleStore};
