//! Live firewall access
//!
//! [`NatFirewall`] pairs a [`CommandExecutor`] with a [`RuleCodec`]: the codec
//! decides *what* to run, the executor runs it. This is the only place that
//! turns a failed command into a typed [`Error`]; the lifecycle manager and
//! the resync engine decide what such an error means for the stored rule.

use crate::core::codec::{DecodedDump, EntryAction, IptablesCodec, RuleCodec};
use crate::core::error::{Error, Result};
use crate::core::executor::{
    CommandExecutor, CommandFailure, CommandOutcome, DEFAULT_COMMAND_TIMEOUT,
};
use crate::core::rule::NatRule;
use std::time::Duration;
use tracing::{info, warn};

/// Adds, removes and lists the DNAT entries backing enabled rules
#[derive(Debug, Clone)]
pub struct NatFirewall<E, C = IptablesCodec> {
    executor: E,
    codec: C,
    timeout: Duration,
}

impl<E: CommandExecutor, C: RuleCodec> NatFirewall<E, C> {
    pub fn new(executor: E, codec: C) -> Self {
        Self {
            executor,
            codec,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Installs the entry for `rule` as it is now (IP snapshot included).
    ///
    /// # Errors
    ///
    /// [`Error::FirewallApplyFailed`], [`Error::CommandNotFound`] or
    /// [`Error::CommandTimeout`].
    pub async fn apply(&self, rule: &NatRule) -> Result<()> {
        let argv = self.codec.entry_command(rule, EntryAction::Add);
        let outcome = self.run(&argv).await;
        if outcome.ok {
            info!("Applied firewall entry for rule {rule}");
            Ok(())
        } else {
            warn!("Could not apply entry for rule {}: {}", rule.id, outcome.output);
            Err(outcome.into_error(&argv, self.timeout, Error::FirewallApplyFailed))
        }
    }

    /// Removes the entry that `rule` (as given, not as stored) would have installed.
    ///
    /// A description change never touches the live entry, so its comment can
    /// be stale. When the exact delete is rejected, the chain is searched for
    /// entries tagged with this rule's id, node and vmid, and those are
    /// removed instead.
    ///
    /// # Errors
    ///
    /// [`Error::FirewallRemoveFailed`], [`Error::CommandNotFound`] or
    /// [`Error::CommandTimeout`].
    pub async fn remove(&self, rule: &NatRule) -> Result<()> {
        let argv = self.codec.entry_command(rule, EntryAction::Remove);
        let outcome = self.run(&argv).await;
        if outcome.ok {
            info!("Removed firewall entry for rule {rule}");
            return Ok(());
        }

        if matches!(outcome.failure, Some(CommandFailure::Exit(_)))
            && self.remove_by_tag(rule).await
        {
            return Ok(());
        }

        warn!("Could not remove entry for rule {}: {}", rule.id, outcome.output);
        Err(outcome.into_error(&argv, self.timeout, Error::FirewallRemoveFailed))
    }

    /// Removes entries whose comment identifies `rule`; true if any went away.
    async fn remove_by_tag(&self, rule: &NatRule) -> bool {
        let Ok(decoded) = self.owned_entries().await else {
            return false;
        };

        let mut removed = false;
        for entry in decoded
            .entries
            .iter()
            .filter(|entry| self.codec.comment_identifies(rule, &entry.comment))
        {
            if self.run(&entry.removal).await.ok {
                info!(
                    "Removed entry for rule {} by its tag (live comment: {})",
                    rule.id, entry.comment
                );
                removed = true;
            }
        }
        removed
    }

    /// Reads the managed chain and derives removal commands for every owned entry.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the chain cannot be listed at all.
    pub async fn owned_entries(&self) -> Result<DecodedDump> {
        let argv = self.codec.dump_command();
        let outcome = self.run(&argv).await;
        if !outcome.ok {
            return Err(outcome.into_error(&argv, self.timeout, |message| {
                Error::Internal(format!("Failed to list firewall entries: {message}"))
            }));
        }
        Ok(self.codec.decode_dump(&outcome.output))
    }

    /// Runs a prepared command line with the firewall's timeout
    pub async fn run(&self, argv: &[String]) -> CommandOutcome {
        self.executor.invoke(argv, self.timeout).await
    }
}
