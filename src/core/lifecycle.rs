//! Rule lifecycle management
//!
//! [`NatService`] implements create, update and delete against the rule store
//! and the live firewall together. The store is the source of truth and the
//! firewall a mirror of it, which fixes the error policy:
//!
//! - a store failure is an `Err` and means nothing changed
//! - a firewall failure after a successful commit is *not* an `Err`; the rule
//!   is flipped to disabled so the table never claims an entry that is not
//!   there, and the outcome is reported as a degraded [`MutationStatus`]
//!
//! # Ordering
//!
//! When an update needs both, the old entry is always removed before the new
//! one is added, so a host port never has two live mappings.

use crate::core::codec::{IptablesCodec, RuleCodec};
use crate::core::conflict::has_conflict;
use crate::core::error::{Error, Result};
use crate::core::executor::CommandExecutor;
use crate::core::firewall::NatFirewall;
use crate::core::locator::ContainerLocator;
use crate::core::rule::{
    MAX_PAGE_SIZE, NatRule, NewRule, RuleDraft, RuleId, RulePage, RulePatch, RuleScope,
};
use crate::core::store::{RuleFilter, RuleStore};
use crate::validators::{validate_node_name, validate_port, validate_vmid};
use serde::Serialize;
use tracing::{error, info, warn};

/// What happened to one firewall entry during an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum EntryEffect {
    NotAttempted,
    Done,
    Failed(String),
}

impl EntryEffect {
    fn from_result(result: &Result<()>) -> Self {
        match result {
            Ok(()) => EntryEffect::Done,
            Err(e) => EntryEffect::Failed(e.to_string()),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, EntryEffect::Failed(_))
    }

    /// Short human description, e.g. for "old entry removal: ..."
    pub fn describe(&self) -> String {
        match self {
            EntryEffect::NotAttempted => "not needed".to_string(),
            EntryEffect::Done => "succeeded".to_string(),
            EntryEffect::Failed(reason) => format!("failed ({reason})"),
        }
    }
}

/// Result class of a create or update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MutationStatus {
    Created,
    /// Row persisted, entry could not be applied, rule now disabled
    CreatedButFirewallFailed,
    Updated,
    /// Fresh container IP lookup failed, rule now disabled
    UpdatedButIpUnavailable,
    /// New entry could not be applied, rule now disabled
    UpdatedButFirewallFailed,
}

impl MutationStatus {
    /// True when the request was committed but the rule ended up disabled
    pub fn is_degraded(self) -> bool {
        !matches!(self, MutationStatus::Created | MutationStatus::Updated)
    }
}

/// Committed create/update together with its firewall side effects
#[derive(Debug, Clone, Serialize)]
pub struct RuleMutation {
    pub rule: NatRule,
    pub status: MutationStatus,
    /// Removal of the previously installed entry (updates only)
    pub old_entry: EntryEffect,
    pub new_entry: EntryEffect,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeleteStatus {
    RemovedWithEntry,
    /// Row deleted, entry removal failed; manual cleanup may be needed
    RemovedEntryCleanupFailed,
    RemovedWasDisabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleDeletion {
    pub id: RuleId,
    pub status: DeleteStatus,
    pub entry: EntryEffect,
    pub message: String,
}

/// Owns the store, the locator and the firewall, and keeps them consistent.
pub struct NatService<S, L, E, C = IptablesCodec> {
    pub(crate) store: S,
    pub(crate) locator: L,
    pub(crate) firewall: NatFirewall<E, C>,
    pub(crate) resync_gate: tokio::sync::Mutex<()>,
}

impl<S, L, E, C> NatService<S, L, E, C>
where
    S: RuleStore,
    L: ContainerLocator,
    E: CommandExecutor,
    C: RuleCodec,
{
    pub fn new(store: S, locator: L, firewall: NatFirewall<E, C>) -> Self {
        Self {
            store,
            locator,
            firewall,
            resync_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn firewall(&self) -> &NatFirewall<E, C> {
        &self.firewall
    }

    /// # Errors
    ///
    /// [`Error::NotFound`] if no rule has this id.
    pub async fn get_rule(&self, id: RuleId) -> Result<NatRule> {
        self.store.get(id).await?.ok_or(Error::NotFound(id))
    }

    /// Lists rules newest first. `limit` is clamped to `1..=MAX_PAGE_SIZE`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the store cannot be read.
    pub async fn list_rules(&self, scope: &RuleScope, offset: usize, limit: usize) -> Result<RulePage> {
        let filter = match scope {
            RuleScope::All => RuleFilter::all(),
            RuleScope::Container { node, vmid } => RuleFilter::container(node.clone(), *vmid),
        };
        let (rules, total) = self
            .store
            .list(&filter, offset, limit.clamp(1, MAX_PAGE_SIZE))
            .await?;
        Ok(RulePage { rules, total })
    }

    /// Creates a rule and installs its entry.
    ///
    /// # Errors
    ///
    /// `Validation`, `PortConflict`, `ContainerUnreachable`,
    /// `ContainerNotRunning`, `StoreConflict` or `Store`; in every case no
    /// row was created. A failed firewall apply is reported through
    /// [`MutationStatus::CreatedButFirewallFailed`] instead.
    pub async fn create_rule(&self, request: NewRule) -> Result<RuleMutation> {
        validate_port(request.host_port).map_err(|m| Error::validation("host_port", m))?;
        validate_port(request.container_port).map_err(|m| Error::validation("container_port", m))?;
        validate_node_name(&request.node).map_err(|m| Error::validation("node", m))?;
        validate_vmid(request.vmid).map_err(|m| Error::validation("vmid", m))?;

        let NewRule {
            node,
            vmid,
            host_port,
            container_port,
            protocol,
            description,
        } = request;

        if has_conflict(&self.store, host_port, protocol, None).await? {
            info!("Create rejected: {host_port}/{protocol} already in use");
            return Err(Error::PortConflict {
                host_port,
                protocol,
            });
        }

        let Some(container_ip) = self.locator.container_ip(&node, vmid).await else {
            return Err(Error::ContainerUnreachable { node, vmid });
        };

        match self.locator.container_status(&node, vmid).await {
            Some(status) if status.is_running() => {}
            other => {
                let status = other.map_or_else(|| "unknown".to_string(), |s| s.status);
                return Err(Error::ContainerNotRunning { node, vmid, status });
            }
        }

        let rule = self
            .store
            .create(RuleDraft {
                node,
                vmid,
                host_port,
                container_port,
                protocol,
                container_ip,
                description: normalize_description(description),
                enabled: true,
            })
            .await?;

        match self.firewall.apply(&rule).await {
            Ok(()) => {
                info!("Created rule {rule}");
                let message = format!("NAT rule {} created and applied.", rule.id);
                Ok(RuleMutation {
                    rule,
                    status: MutationStatus::Created,
                    old_entry: EntryEffect::NotAttempted,
                    new_entry: EntryEffect::Done,
                    message,
                })
            }
            Err(e) => {
                let reason = e.to_string();
                warn!("Rule {} saved but its entry could not be applied, disabling", rule.id);
                let (rule, disable_error) = self.disable_after_failure(rule).await;
                let mut message = format!(
                    "NAT rule {} saved, but the firewall entry could not be applied ({reason}).",
                    rule.id
                );
                push_disable_note(&mut message, disable_error.as_deref());
                Ok(RuleMutation {
                    rule,
                    status: MutationStatus::CreatedButFirewallFailed,
                    old_entry: EntryEffect::NotAttempted,
                    new_entry: EntryEffect::Failed(reason),
                    message,
                })
            }
        }
    }

    /// Applies a partial update and reconciles the firewall entry.
    ///
    /// # Errors
    ///
    /// `Validation`, `NotFound`, `PortConflict`, `StoreConflict` or `Store`;
    /// in every case the stored rule is unchanged. Firewall-side problems
    /// after the commit are reported as degraded statuses.
    pub async fn update_rule(&self, id: RuleId, patch: RulePatch) -> Result<RuleMutation> {
        if let Some(port) = patch.host_port {
            validate_port(port).map_err(|m| Error::validation("host_port", m))?;
        }
        if let Some(port) = patch.container_port {
            validate_port(port).map_err(|m| Error::validation("container_port", m))?;
        }

        let current = self.get_rule(id).await?;
        let mut target = patch.apply_to(&current);
        target.description = normalize_description(target.description.take());

        let changed_networking = target.networking_differs(&current);
        let re_enabling = !current.enabled && target.enabled;

        if (target.slot() != current.slot() || re_enabling)
            && has_conflict(&self.store, target.host_port, target.protocol, Some(id)).await?
        {
            info!(
                "Update of rule {id} rejected: {}/{} already in use",
                target.host_port, target.protocol
            );
            return Err(Error::PortConflict {
                host_port: target.host_port,
                protocol: target.protocol,
            });
        }

        // `current` is exactly what was installed, so it drives the removal
        let mut old_entry = EntryEffect::NotAttempted;
        if current.enabled && (changed_networking || !target.enabled) {
            old_entry = EntryEffect::from_result(&self.firewall.remove(&current).await);
            if let EntryEffect::Failed(reason) = &old_entry {
                error!("Removing old entry of rule {id} failed: {reason}");
            }
        }

        let stored = match self.store.update(&target).await {
            Ok(stored) => stored,
            Err(e) => {
                if old_entry == EntryEffect::Done {
                    self.restore_entry(&current).await;
                }
                return Err(e.into());
            }
        };

        if !(stored.enabled && (changed_networking || re_enabling)) {
            info!("Updated rule {stored}");
            let mut message = format!("NAT rule {id} updated.");
            if let EntryEffect::Failed(reason) = &old_entry {
                message.push_str(&format!(
                    " Removing the old firewall entry failed ({reason}); manual cleanup may be needed."
                ));
            }
            return Ok(RuleMutation {
                rule: stored,
                status: MutationStatus::Updated,
                old_entry,
                new_entry: EntryEffect::NotAttempted,
                message,
            });
        }

        // Mandatory fresh lookup, never the cached snapshot
        let Some(ip) = self.locator.container_ip(&stored.node, stored.vmid).await else {
            warn!(
                "Container {}/{} unreachable while updating rule {id}, disabling",
                stored.node, stored.vmid
            );
            let (rule, disable_error) = self.disable_after_failure(stored).await;
            let mut message = format!(
                "NAT rule {id} updated, but the container IP could not be resolved. Old entry removal: {}.",
                old_entry.describe()
            );
            push_disable_note(&mut message, disable_error.as_deref());
            return Ok(RuleMutation {
                rule,
                status: MutationStatus::UpdatedButIpUnavailable,
                old_entry,
                new_entry: EntryEffect::NotAttempted,
                message,
            });
        };

        let mut stored = stored;
        if ip != stored.container_ip_at_creation {
            info!(
                "Container {}/{} moved from {} to {ip}, refreshing rule {id}",
                stored.node, stored.vmid, stored.container_ip_at_creation
            );
            let mut refreshed = stored.clone();
            refreshed.container_ip_at_creation = ip;
            match self.store.update(&refreshed).await {
                Ok(rule) => stored = rule,
                Err(e) => {
                    let reason = format!("could not record the new container IP {ip}: {e}");
                    error!("Rule {id}: {reason}");
                    return Ok(self
                        .apply_failed_after_update(stored, old_entry, reason)
                        .await);
                }
            }
        }

        match self.firewall.apply(&stored).await {
            Ok(()) => {
                info!("Updated rule {stored}");
                let mut message = format!("NAT rule {id} updated and applied.");
                if let EntryEffect::Failed(reason) = &old_entry {
                    message.push_str(&format!(
                        " Removing the old firewall entry failed ({reason}); manual cleanup may be needed."
                    ));
                }
                Ok(RuleMutation {
                    rule: stored,
                    status: MutationStatus::Updated,
                    old_entry,
                    new_entry: EntryEffect::Done,
                    message,
                })
            }
            Err(e) => Ok(self
                .apply_failed_after_update(stored, old_entry, e.to_string())
                .await),
        }
    }

    /// Deletes a rule, removing its entry first when enabled.
    ///
    /// Entry removal failure never blocks the deletion.
    ///
    /// # Errors
    ///
    /// `NotFound` or `Store`; the row still exists in both cases.
    pub async fn delete_rule(&self, id: RuleId) -> Result<RuleDeletion> {
        let rule = self.get_rule(id).await?;

        let entry = if rule.enabled {
            let effect = EntryEffect::from_result(&self.firewall.remove(&rule).await);
            if let EntryEffect::Failed(reason) = &effect {
                warn!("Entry removal for rule {id} failed, deleting the row anyway: {reason}");
            }
            effect
        } else {
            EntryEffect::NotAttempted
        };

        if let Err(e) = self.store.delete(id).await {
            if entry == EntryEffect::Done {
                self.restore_entry(&rule).await;
            }
            return Err(e.into());
        }

        let (status, message) = match &entry {
            EntryEffect::Done => (
                DeleteStatus::RemovedWithEntry,
                format!("NAT rule {id} deleted and its firewall entry removed."),
            ),
            EntryEffect::Failed(reason) => (
                DeleteStatus::RemovedEntryCleanupFailed,
                format!(
                    "NAT rule {id} deleted, but removing its firewall entry failed ({reason}); manual cleanup may be needed."
                ),
            ),
            EntryEffect::NotAttempted => (
                DeleteStatus::RemovedWasDisabled,
                format!("NAT rule {id} deleted; it was disabled, so no firewall change was needed."),
            ),
        };
        info!("{message}");

        Ok(RuleDeletion {
            id,
            status,
            entry,
            message,
        })
    }

    async fn apply_failed_after_update(
        &self,
        rule: NatRule,
        old_entry: EntryEffect,
        reason: String,
    ) -> RuleMutation {
        warn!("New entry for rule {} could not be applied, disabling", rule.id);
        let id = rule.id;
        let (rule, disable_error) = self.disable_after_failure(rule).await;
        let mut message = format!(
            "NAT rule {id} updated, but the new firewall entry could not be applied ({reason}). Old entry removal: {}.",
            old_entry.describe()
        );
        push_disable_note(&mut message, disable_error.as_deref());
        RuleMutation {
            rule,
            status: MutationStatus::UpdatedButFirewallFailed,
            old_entry,
            new_entry: EntryEffect::Failed(reason),
            message,
        }
    }

    /// Persists `enabled = false`. On store failure returns the rule unchanged
    /// together with the error text.
    async fn disable_after_failure(&self, rule: NatRule) -> (NatRule, Option<String>) {
        let mut disabled = rule.clone();
        disabled.enabled = false;
        match self.store.update(&disabled).await {
            Ok(stored) => (stored, None),
            Err(e) => {
                error!("Could not mark rule {} disabled: {e}", rule.id);
                (rule, Some(e.to_string()))
            }
        }
    }

    /// Re-installs an entry this operation removed before a failed commit.
    async fn restore_entry(&self, rule: &NatRule) {
        match self.firewall.apply(rule).await {
            Ok(()) => info!("Restored entry of rule {} after failed commit", rule.id),
            Err(e) => error!(
                "Could not restore entry of rule {} after failed commit, run a resync: {e}",
                rule.id
            ),
        }
    }
}

fn normalize_description(description: Option<String>) -> Option<String> {
    description
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
}

fn push_disable_note(message: &mut String, disable_error: Option<&str>) {
    match disable_error {
        None => message.push_str(" The rule has been disabled."),
        Some(e) => message.push_str(&format!(
            " Disabling the rule failed as well ({e}); check it manually or run a resync."
        )),
    }
}
