//! Rule persistence
//!
//! The store is the source of truth for which forwards should exist. Every
//! write is all-or-nothing: a mutation is applied to a copy of the table,
//! checked against the uniqueness constraint, persisted, and only then made
//! visible. A failed write leaves both the in-memory table and the file as
//! they were.
//!
//! # Uniqueness
//!
//! No two *enabled* rules may share a `(host_port, protocol)` slot. Disabled
//! rules are exempt, which is what lets a rule whose entry failed to apply
//! sit in the table without blocking the port.
//!
//! # Sharing a file
//!
//! Several processes may open the same file (a `resync --every` watcher next
//! to one-shot CLI calls). Every operation on a file-backed store re-reads
//! the table under an advisory `flock` on `rules.json.lock`: shared for reads,
//! exclusive for the whole read-modify-write of a transaction. Nothing is
//! cached between operations.
//!
//! # On-disk format
//!
//! `rules.json` holds the whole table plus the id counter; `rules.json.sha256`
//! holds its checksum. A checksum mismatch is logged and tolerated, since the
//! file may have been edited by hand.

use crate::core::rule::{NatRule, Protocol, RuleDraft, RuleId};
use chrono::Utc;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::future::Future;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

const STORE_FORMAT_VERSION: u32 = 1;

/// Error type for rule store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Host port {host_port}/{protocol} is already used by an enabled rule")]
    UniqueViolation { host_port: u16, protocol: Protocol },

    #[error("Rule {0} not found")]
    NotFound(RuleId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Rule store is corrupted: {0}")]
    Corrupted(String),

    #[error("Rule store unavailable: {0}")]
    Unavailable(String),
}

/// Conjunctive filter for [`RuleStore::list`]. `None` matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleFilter {
    pub node: Option<String>,
    pub vmid: Option<u32>,
    pub enabled: Option<bool>,
    pub host_port: Option<u16>,
    pub protocol: Option<Protocol>,
}

impl RuleFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn container(node: impl Into<String>, vmid: u32) -> Self {
        Self {
            node: Some(node.into()),
            vmid: Some(vmid),
            ..Self::default()
        }
    }

    pub fn enabled() -> Self {
        Self {
            enabled: Some(true),
            ..Self::default()
        }
    }

    /// Enabled rules occupying one slot
    pub fn slot(host_port: u16, protocol: Protocol) -> Self {
        Self {
            enabled: Some(true),
            host_port: Some(host_port),
            protocol: Some(protocol),
            ..Self::default()
        }
    }

    pub fn matches(&self, rule: &NatRule) -> bool {
        self.node.as_ref().is_none_or(|n| *n == rule.node)
            && self.vmid.is_none_or(|v| v == rule.vmid)
            && self.enabled.is_none_or(|e| e == rule.enabled)
            && self.host_port.is_none_or(|p| p == rule.host_port)
            && self.protocol.is_none_or(|p| p == rule.protocol)
    }
}

/// Narrow change to one row, applied by [`RuleStore::amend_many`].
///
/// Only the named fields are written, so edits made to the row between
/// planning and committing the batch survive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleAmendment {
    pub id: RuleId,
    /// New container address, if it moved
    pub container_ip: Option<IpAddr>,
    pub disable: bool,
}

impl RuleAmendment {
    pub fn disable(id: RuleId) -> Self {
        Self {
            id,
            container_ip: None,
            disable: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.container_ip.is_none() && !self.disable
    }
}

/// Transactional rule table.
///
/// Every method is atomic with respect to the others. A returned `Err` means
/// nothing changed.
pub trait RuleStore: Send + Sync {
    fn get(&self, id: RuleId) -> impl Future<Output = Result<Option<NatRule>, StoreError>> + Send;

    /// Matching rules ordered by id descending, plus the total match count
    fn list(
        &self,
        filter: &RuleFilter,
        offset: usize,
        limit: usize,
    ) -> impl Future<Output = Result<(Vec<NatRule>, usize), StoreError>> + Send;

    /// Inserts a rule with a fresh id and both timestamps set to now
    fn create(&self, draft: RuleDraft) -> impl Future<Output = Result<NatRule, StoreError>> + Send;

    /// Replaces the mutable fields of an existing rule and bumps `updated_at`.
    ///
    /// `id`, `node`, `vmid` and `created_at` are taken from the stored row.
    fn update(&self, rule: &NatRule) -> impl Future<Output = Result<NatRule, StoreError>> + Send;

    /// Applies several amendments in a single transaction and returns how
    /// many rows were changed. Ids that no longer exist are skipped.
    fn amend_many(
        &self,
        amendments: &[RuleAmendment],
    ) -> impl Future<Output = Result<usize, StoreError>> + Send;

    fn delete(&self, id: RuleId) -> impl Future<Output = Result<(), StoreError>> + Send;
}

#[derive(Debug, Clone)]
struct StoreState {
    next_id: RuleId,
    rules: BTreeMap<RuleId, NatRule>,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            next_id: 1,
            rules: BTreeMap::new(),
        }
    }
}

impl StoreState {
    fn check_unique(&self) -> Result<(), StoreError> {
        let mut seen = HashSet::new();
        for rule in self.rules.values().filter(|r| r.enabled) {
            if !seen.insert(rule.slot()) {
                return Err(StoreError::UniqueViolation {
                    host_port: rule.host_port,
                    protocol: rule.protocol,
                });
            }
        }
        Ok(())
    }

    fn insert(&mut self, draft: RuleDraft) -> NatRule {
        let now = Utc::now();
        let rule = NatRule {
            id: self.next_id,
            node: draft.node,
            vmid: draft.vmid,
            host_port: draft.host_port,
            container_port: draft.container_port,
            protocol: draft.protocol,
            container_ip_at_creation: draft.container_ip,
            description: draft.description,
            enabled: draft.enabled,
            created_at: now,
            updated_at: now,
        };
        self.next_id += 1;
        self.rules.insert(rule.id, rule.clone());
        rule
    }

    fn replace(&mut self, rule: &NatRule) -> Result<NatRule, StoreError> {
        let stored = self
            .rules
            .get_mut(&rule.id)
            .ok_or(StoreError::NotFound(rule.id))?;

        stored.host_port = rule.host_port;
        stored.container_port = rule.container_port;
        stored.protocol = rule.protocol;
        stored.container_ip_at_creation = rule.container_ip_at_creation;
        stored.description.clone_from(&rule.description);
        stored.enabled = rule.enabled;
        stored.updated_at = Utc::now();

        Ok(stored.clone())
    }

    fn amend(&mut self, amendment: &RuleAmendment) -> bool {
        let Some(stored) = self.rules.get_mut(&amendment.id) else {
            warn!("Rule {} vanished before its amendment was saved, skipping", amendment.id);
            return false;
        };
        if let Some(ip) = amendment.container_ip {
            stored.container_ip_at_creation = ip;
        }
        if amendment.disable {
            stored.enabled = false;
        }
        stored.updated_at = Utc::now();
        true
    }
}

#[derive(Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    next_id: RuleId,
    rules: Vec<NatRule>,
}

impl From<&StoreState> for StoreFile {
    fn from(state: &StoreState) -> Self {
        Self {
            version: STORE_FORMAT_VERSION,
            next_id: state.next_id,
            rules: state.rules.values().cloned().collect(),
        }
    }
}

/// [`RuleStore`] backed by a JSON file, or purely in memory
#[derive(Debug)]
pub struct JsonRuleStore {
    path: Option<PathBuf>,
    /// The table itself for an in-memory store; the last table read or
    /// written for a file-backed one. Also serializes callers in-process.
    state: Mutex<StoreState>,
}

impl JsonRuleStore {
    /// A store that never touches disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Opens (or starts) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file exists but cannot be read or parsed, or if
    /// it violates the uniqueness constraint.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let state = {
            let path = path.clone();
            blocking(move || {
                let _lock = lock_store(&path, FlockArg::LockShared)?;
                read_state(&path)
            })
            .await?
        };
        info!(
            "Opened rule store {} with {} rules",
            path.display(),
            state.rules.len()
        );

        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current table, re-read from disk when file-backed
    async fn snapshot(&self) -> Result<MutexGuard<'_, StoreState>, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(path) = self.path.clone() {
            *state = blocking(move || {
                let _lock = lock_store(&path, FlockArg::LockShared)?;
                read_state(&path)
            })
            .await?;
        }
        Ok(state)
    }

    /// Runs `mutate` on a copy of the current table and commits the copy if
    /// it succeeds and keeps slots unique. For a file-backed store the whole
    /// read-modify-write holds the exclusive lock.
    async fn transact<T, F>(&self, mutate: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut StoreState) -> Result<T, StoreError> + Send + 'static,
    {
        let mut state = self.state.lock().await;

        let Some(path) = self.path.clone() else {
            let mut candidate = state.clone();
            let out = mutate(&mut candidate)?;
            candidate.check_unique()?;
            *state = candidate;
            return Ok(out);
        };

        let (candidate, out) = blocking(move || {
            let _lock = lock_store(&path, FlockArg::LockExclusive)?;
            let mut candidate = read_state(&path)?;
            let out = mutate(&mut candidate)?;
            candidate.check_unique()?;
            persist(&path, &candidate)?;
            Ok((candidate, out))
        })
        .await?;

        *state = candidate;
        Ok(out)
    }
}

impl RuleStore for JsonRuleStore {
    async fn get(&self, id: RuleId) -> Result<Option<NatRule>, StoreError> {
        Ok(self.snapshot().await?.rules.get(&id).cloned())
    }

    async fn list(
        &self,
        filter: &RuleFilter,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<NatRule>, usize), StoreError> {
        let state = self.snapshot().await?;
        let matching: Vec<&NatRule> = state
            .rules
            .values()
            .rev()
            .filter(|r| filter.matches(r))
            .collect();
        let total = matching.len();
        let page = matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn create(&self, draft: RuleDraft) -> Result<NatRule, StoreError> {
        let rule = self.transact(move |state| Ok(state.insert(draft))).await?;
        debug!("Stored new rule {rule}");
        Ok(rule)
    }

    async fn update(&self, rule: &NatRule) -> Result<NatRule, StoreError> {
        let rule = rule.clone();
        let stored = self.transact(move |state| state.replace(&rule)).await?;
        debug!("Updated rule {stored}");
        Ok(stored)
    }

    async fn amend_many(&self, amendments: &[RuleAmendment]) -> Result<usize, StoreError> {
        let amendments: Vec<RuleAmendment> =
            amendments.iter().filter(|a| !a.is_empty()).copied().collect();
        if amendments.is_empty() {
            return Ok(0);
        }
        let applied = self
            .transact(move |state| {
                let mut applied = 0;
                for amendment in &amendments {
                    if state.amend(amendment) {
                        applied += 1;
                    }
                }
                Ok(applied)
            })
            .await?;
        debug!("Amended {applied} rules in one batch");
        Ok(applied)
    }

    async fn delete(&self, id: RuleId) -> Result<(), StoreError> {
        self.transact(move |state| {
            state
                .rules
                .remove(&id)
                .map(drop)
                .ok_or(StoreError::NotFound(id))
        })
        .await?;
        debug!("Deleted rule {id}");
        Ok(())
    }
}

async fn blocking<T, F>(work: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn checksum_path(path: &Path) -> PathBuf {
    sibling_path(path, ".sha256")
}

fn lock_path(path: &Path) -> PathBuf {
    sibling_path(path, ".lock")
}

/// Takes the advisory lock guarding `path`. Released when the guard drops.
fn lock_store(path: &Path, arg: FlockArg) -> Result<Flock<File>, StoreError> {
    use std::os::unix::fs::OpenOptionsExt;

    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .mode(0o600)
        .open(lock_path(path))?;
    Flock::lock(file, arg).map_err(|(_, errno)| StoreError::Io(errno.into()))
}

fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Reads the table at `path`; a missing file is an empty table
fn read_state(path: &Path) -> Result<StoreState, StoreError> {
    let json = match std::fs::read_to_string(path) {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("Rule store {} does not exist yet, starting empty", path.display());
            return Ok(StoreState::default());
        }
        Err(e) => return Err(e.into()),
    };

    // Verify checksum if present (warns but doesn't fail for hand-edited stores)
    if let Ok(expected) = std::fs::read_to_string(checksum_path(path)) {
        let actual = sha256_hex(json.as_bytes());
        if expected.trim() != actual {
            warn!(
                "Rule store {} checksum mismatch (expected: {}, got: {})",
                path.display(),
                expected.trim(),
                actual
            );
        }
    }

    let file: StoreFile = serde_json::from_str(&json)
        .map_err(|e| StoreError::Corrupted(format!("{}: {e}", path.display())))?;

    if file.version > STORE_FORMAT_VERSION {
        return Err(StoreError::Corrupted(format!(
            "{} has format version {} (newest supported: {STORE_FORMAT_VERSION})",
            path.display(),
            file.version
        )));
    }

    let mut state = StoreState {
        next_id: file.next_id.max(1),
        rules: BTreeMap::new(),
    };
    for rule in file.rules {
        if state.rules.insert(rule.id, rule).is_some() {
            return Err(StoreError::Corrupted(format!(
                "{} contains duplicate rule ids",
                path.display()
            )));
        }
    }

    // Keep ids monotonic even if the counter was edited down
    if let Some(max_id) = state.rules.keys().next_back() {
        state.next_id = state.next_id.max(max_id + 1);
    }

    state
        .check_unique()
        .map_err(|e| StoreError::Corrupted(format!("{}: {e}", path.display())))?;

    Ok(state)
}

/// Writes the checksum sidecar, then the table atomically (temp file in the
/// same directory, then rename). Any `Err` leaves the table file unchanged.
fn persist(path: &Path, state: &StoreState) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(&StoreFile::from(state))?;
    std::fs::write(checksum_path(path), sha256_hex(json.as_bytes()))?;
    write_atomically(path, json.as_bytes())?;
    Ok(())
}

fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use tempfile::NamedTempFile;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut temp = NamedTempFile::new_in(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?; // Ensure bits are on the platter before renaming
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
