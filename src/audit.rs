/// Audit logging for state-changing operations
///
/// Every create, update, delete and resync is appended to
/// `<state_dir>/audit.log` as one JSON object per line, whether it succeeded,
/// degraded or failed.
use crate::core::error::Result;
use crate::core::lifecycle::{RuleDeletion, RuleMutation};
use crate::core::resync::ResyncReport;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Types of auditable events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    CreateRule,
    UpdateRule,
    DeleteRule,
    Resync,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Type of event
    pub event_type: EventType,

    /// Whether the operation was committed
    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    /// Creates a new audit event
    pub fn new(
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            success,
            details,
            error,
        }
    }
}

/// Audit log writer
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Creates an audit log in the state directory
    ///
    /// # Errors
    ///
    /// Returns `Err` if state directory cannot be determined
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");

        Ok(Self { log_path })
    }

    /// Creates an audit log at an explicit path
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: path.into(),
        }
    }

    /// Appends an event to the audit log
    ///
    /// Events are written as JSON-lines format (one JSON object per line)
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn log(&self, event: AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(&event)?;

        let mut options = tokio::fs::OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&self.log_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Reads the most recent events from the log, newest first
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        Ok(events)
    }

    /// Returns the path to the audit log file
    pub fn path(&self) -> &Path {
        &self.log_path
    }

    /// Records a create or update
    pub async fn log_mutation(
        &self,
        event_type: EventType,
        target: Option<u64>,
        result: &Result<RuleMutation>,
    ) {
        let event = match result {
            Ok(mutation) => AuditEvent::new(
                event_type,
                true,
                serde_json::json!({
                    "rule_id": mutation.rule.id,
                    "node": mutation.rule.node,
                    "vmid": mutation.rule.vmid,
                    "host_port": mutation.rule.host_port,
                    "container_port": mutation.rule.container_port,
                    "protocol": mutation.rule.protocol,
                    "enabled": mutation.rule.enabled,
                    "status": mutation.status,
                    "degraded": mutation.status.is_degraded(),
                }),
                mutation.status.is_degraded().then(|| mutation.message.clone()),
            ),
            Err(e) => AuditEvent::new(
                event_type,
                false,
                serde_json::json!({ "rule_id": target }),
                Some(e.to_string()),
            ),
        };
        self.write_or_warn(event).await;
    }

    /// Records a delete
    pub async fn log_deletion(&self, id: u64, result: &Result<RuleDeletion>) {
        let event = match result {
            Ok(deletion) => AuditEvent::new(
                EventType::DeleteRule,
                true,
                serde_json::json!({
                    "rule_id": deletion.id,
                    "status": deletion.status,
                }),
                deletion.entry.is_failed().then(|| deletion.message.clone()),
            ),
            Err(e) => AuditEvent::new(
                EventType::DeleteRule,
                false,
                serde_json::json!({ "rule_id": id }),
                Some(e.to_string()),
            ),
        };
        self.write_or_warn(event).await;
    }

    /// Records a resync pass with its counters
    pub async fn log_resync(&self, report: &ResyncReport) {
        let details = serde_json::to_value(&report.stats).unwrap_or_default();
        let event = AuditEvent::new(
            EventType::Resync,
            report.ok,
            details,
            (!report.ok).then(|| report.message.clone()),
        );
        self.write_or_warn(event).await;
    }

    async fn write_or_warn(&self, event: AuditEvent) {
        if let Err(e) = self.log(event).await {
            tracing::warn!("Failed to write audit log: {}", e);
        }
    }
}
