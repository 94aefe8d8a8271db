//! Full reconciliation of the live chain with the rule store
//!
//! A pass has two phases separated by a barrier:
//!
//! 1. remove every entry in the chain that carries the private marker
//! 2. re-resolve and re-apply every enabled rule
//!
//! Rules whose container cannot be resolved, or whose entry cannot be
//! applied, are disabled. All row changes of a pass (IP refreshes and
//! disable flags) are committed in a single batch of field-level amendments
//! at the end, so edits made to a rule while the pass ran are kept and rules
//! deleted meanwhile are skipped.

use crate::core::codec::RuleCodec;
use crate::core::error::{Error, Result};
use crate::core::executor::CommandExecutor;
use crate::core::lifecycle::NatService;
use crate::core::locator::ContainerLocator;
use crate::core::rule::{MAX_PAGE_SIZE, NatRule, RuleId};
use crate::core::store::{RuleAmendment, RuleFilter, RuleStore};
use crate::utils::format_command_line;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Counters of one resync pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResyncStats {
    pub cleared_rules: usize,
    pub failed_to_clear_rules: usize,
    /// Marker-bearing lines that could not be parsed and were left alone
    pub skipped_lines: usize,
    pub attempted_to_apply_rules: usize,
    pub applied_rules: usize,
    pub failed_to_apply_rules: usize,
    /// Sorted, without duplicates
    pub rules_disabled_due_to_error_ids: Vec<RuleId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResyncReport {
    pub ok: bool,
    pub message: String,
    pub stats: ResyncStats,
}

/// How [`NatService::watch`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchExit {
    /// Shutdown arrived between passes
    Stopped,
    /// Shutdown arrived while a pass was running and the pass was dropped
    Interrupted,
}

impl ResyncReport {
    fn failed(message: String, stats: ResyncStats) -> Self {
        error!("Resync failed: {message}");
        Self {
            ok: false,
            message,
            stats,
        }
    }
}

impl<S, L, E, C> NatService<S, L, E, C>
where
    S: RuleStore,
    L: ContainerLocator,
    E: CommandExecutor,
    C: RuleCodec,
{
    /// Rebuilds every owned entry from the rule store.
    ///
    /// Never returns an opaque failure: counts are reported even when the
    /// final commit fails. Only a chain that cannot be listed aborts the pass
    /// before anything is touched. At most one pass runs at a time; a second
    /// caller gets `ok = false` immediately.
    pub async fn resync_all(&self) -> ResyncReport {
        let Ok(_gate) = self.resync_gate.try_lock() else {
            warn!("Resync requested while another pass is running");
            return ResyncReport {
                ok: false,
                message: Error::ResyncInProgress.to_string(),
                stats: ResyncStats::default(),
            };
        };

        info!("Starting resync of all NAT rules");
        let mut stats = ResyncStats::default();

        let decoded = match self.firewall.owned_entries().await {
            Ok(decoded) => decoded,
            Err(e) => {
                return ResyncReport::failed(
                    format!("Could not list existing entries, nothing was changed: {e}"),
                    stats,
                );
            }
        };
        stats.skipped_lines = decoded.skipped_lines;

        for argv in decoded.removals() {
            let outcome = self.firewall.run(argv).await;
            if outcome.ok {
                stats.cleared_rules += 1;
            } else {
                stats.failed_to_clear_rules += 1;
                warn!(
                    "Resync: failed to clear {}: {}",
                    format_command_line(argv),
                    outcome.output
                );
            }
        }
        info!(
            "Resync: cleared {} entries, {} failed",
            stats.cleared_rules, stats.failed_to_clear_rules
        );

        let enabled = match self.enabled_rules().await {
            Ok(rules) => rules,
            Err(e) => {
                return ResyncReport::failed(
                    format!("Entries were cleared but enabled rules could not be loaded: {e}"),
                    stats,
                );
            }
        };
        stats.attempted_to_apply_rules = enabled.len();

        let mut amendments = Vec::new();
        for mut rule in enabled {
            let Some(ip) = self.locator.container_ip(&rule.node, rule.vmid).await else {
                warn!(
                    "Resync: container {}/{} unreachable, disabling rule {}",
                    rule.node, rule.vmid, rule.id
                );
                stats.rules_disabled_due_to_error_ids.push(rule.id);
                amendments.push(RuleAmendment::disable(rule.id));
                continue;
            };

            let mut amendment = RuleAmendment {
                id: rule.id,
                container_ip: None,
                disable: false,
            };
            if ip != rule.container_ip_at_creation {
                info!(
                    "Resync: container {}/{} moved from {} to {ip}, refreshing rule {}",
                    rule.node, rule.vmid, rule.container_ip_at_creation, rule.id
                );
                rule.container_ip_at_creation = ip;
                amendment.container_ip = Some(ip);
            }

            match self.firewall.apply(&rule).await {
                Ok(()) => stats.applied_rules += 1,
                Err(e) => {
                    error!("Resync: applying rule {} failed, disabling: {e}", rule.id);
                    stats.failed_to_apply_rules += 1;
                    stats.rules_disabled_due_to_error_ids.push(rule.id);
                    amendment.disable = true;
                }
            }

            if !amendment.is_empty() {
                amendments.push(amendment);
            }
        }

        stats.rules_disabled_due_to_error_ids.sort_unstable();
        stats.rules_disabled_due_to_error_ids.dedup();

        if let Err(e) = self.store.amend_many(&amendments).await {
            return ResyncReport::failed(
                format!(
                    "Resync partially completed, but saving {} rule changes failed: {e}",
                    amendments.len()
                ),
                stats,
            );
        }

        let message = format!(
            "Resync complete: cleared {} entries ({} failed), applied {} rules ({} failed), {} rules disabled due to errors.",
            stats.cleared_rules,
            stats.failed_to_clear_rules,
            stats.applied_rules,
            stats.failed_to_apply_rules,
            stats.rules_disabled_due_to_error_ids.len()
        );
        info!("{message}");

        ResyncReport {
            ok: true,
            message,
            stats,
        }
    }

    /// Runs a pass every `interval` (the first one immediately) until
    /// `shutdown` resolves, handing each report to `on_report`.
    ///
    /// Shutdown is honored mid-pass too: the pass is dropped, which kills the
    /// command it was waiting on. Entries it had cleared but not re-applied
    /// stay missing until the next pass.
    pub async fn watch(
        &self,
        interval: Duration,
        shutdown: impl Future<Output = ()>,
        mut on_report: impl AsyncFnMut(ResyncReport),
    ) -> WatchExit {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = &mut shutdown => {
                    info!("Watch mode stopped");
                    return WatchExit::Stopped;
                }
            }
            tokio::select! {
                report = self.resync_all() => on_report(report).await,
                () = &mut shutdown => {
                    warn!("Resync interrupted mid-pass; run a resync to restore any missing entries");
                    return WatchExit::Interrupted;
                }
            }
        }
    }

    /// Every enabled rule, oldest first
    async fn enabled_rules(&self) -> Result<Vec<NatRule>> {
        let filter = RuleFilter::enabled();
        let mut rules = Vec::new();
        loop {
            let (page, total) = self
                .store
                .list(&filter, rules.len(), MAX_PAGE_SIZE)
                .await?;
            let exhausted = page.is_empty();
            rules.extend(page);
            if exhausted || rules.len() >= total {
                break;
            }
        }
        rules.reverse();
        Ok(rules)
    }
}
