//! Core NAT rule management functionality
//!
//! This module contains the types and logic for keeping iptables DNAT
//! entries in line with the rule store. It provides:
//!
//! - [`rule`]: Data structures for rules, requests and listings
//! - [`codec`]: iptables argument encoding and chain dump decoding
//! - [`executor`]: External command execution with timeouts
//! - [`firewall`]: Apply/remove/list of live entries
//! - [`store`]: Transactional rule persistence
//! - [`locator`]: Container IP and status lookup
//! - [`conflict`]: Host port conflict checking
//! - [`lifecycle`]: Create, update and delete across store and firewall
//! - [`resync`]: Full reconciliation pass
//! - [`error`]: Error types and iptables error translation

pub mod codec;
pub mod conflict;
pub mod error;
pub mod executor;
pub mod firewall;
pub mod lifecycle;
pub mod locator;
pub mod resync;
pub mod rule;
pub mod store;

#[cfg(test)]
pub mod test_helpers;

#[cfg(test)]
mod tests;
