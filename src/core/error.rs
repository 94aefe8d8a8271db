use crate::core::rule::{Protocol, RuleId};
use crate::core::store::StoreError;
use thiserror::Error;

/// Core error types for natkeeper
///
/// Store-side failures always arrive here as `Err` and mean "nothing changed".
/// Firewall-side failures are usually absorbed by the lifecycle manager into a
/// degraded success; they only surface as `Err` from the low-level
/// [`NatFirewall`](crate::core::firewall::NatFirewall) calls.
#[derive(Debug, Error)]
pub enum Error {
    /// An enabled rule already occupies the slot (advisory pre-check)
    #[error("Host port {host_port}/{protocol} is already in use by an enabled rule")]
    PortConflict { host_port: u16, protocol: Protocol },

    /// The store's uniqueness constraint rejected the write (lost a race)
    #[error("Host port {host_port}/{protocol} was taken by a concurrent change")]
    StoreConflict { host_port: u16, protocol: Protocol },

    #[error("NAT rule {0} not found")]
    NotFound(RuleId),

    #[error("Cannot resolve the IP address of container {node}/{vmid}")]
    ContainerUnreachable { node: String, vmid: u32 },

    #[error("Container {node}/{vmid} is not running (status: {status})")]
    ContainerNotRunning {
        node: String,
        vmid: u32,
        status: String,
    },

    #[error("Failed to add firewall entry: {0}")]
    FirewallApplyFailed(String),

    #[error("Failed to remove firewall entry: {0}")]
    FirewallRemoveFailed(String),

    #[error("Rule store error: {0}")]
    Store(StoreError),

    #[error("Command '{0}' not found. Make sure it is installed and on PATH.")]
    CommandNotFound(String),

    #[error("Command '{command}' timed out after {secs}s")]
    CommandTimeout { command: String, secs: u64 },

    /// Input validation failed
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    #[error("A resync pass is already running")]
    ResyncInProgress,

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// True for both the pre-check and the commit-time uniqueness failure
    pub fn is_port_conflict(&self) -> bool {
        matches!(
            self,
            Error::PortConflict { .. }
                | Error::StoreConflict { .. }
                | Error::Store(StoreError::UniqueViolation { .. })
        )
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UniqueViolation {
                host_port,
                protocol,
            } => Error::StoreConflict {
                host_port,
                protocol,
            },
            StoreError::NotFound(id) => Error::NotFound(id),
            other => Error::Store(other),
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Database of iptables error patterns and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        // Permission errors
        if lower.contains("permission denied")
            || lower.contains("operation not permitted")
            || lower.contains("you must be root")
        {
            return ErrorTranslation::new("Insufficient permissions to modify NAT rules")
                .with_suggestion("Run natkeeper as root, or allow passwordless sudo for iptables")
                .with_suggestion("Set NATKEEPER_ELEVATION_METHOD=sudo to force sudo elevation")
                .with_suggestion("Check that CAP_NET_ADMIN is available to the process");
        }

        // sudo -n refusing to prompt
        if lower.contains("a password is required") || lower.contains("a terminal is required") {
            return ErrorTranslation::new("Privilege elevation needs a password")
                .with_suggestion("Add a NOPASSWD sudoers entry for iptables and pvesh")
                .with_suggestion("Or run natkeeper as root");
        }

        // Missing binary
        if lower.contains("not found") && (lower.contains("command") || lower.contains("no such file"))
        {
            return ErrorTranslation::new("iptables or pvesh is not installed or not on PATH")
                .with_suggestion("Install iptables: apt install iptables")
                .with_suggestion("Check iptables_command / pvesh_command in the config file");
        }

        // Rule to delete is not there
        if lower.contains("bad rule") || lower.contains("does a matching rule exist") {
            return ErrorTranslation::new("The firewall entry to remove does not exist")
                .with_suggestion("The entry was probably removed by hand or by a reboot")
                .with_suggestion("Run `natkeeper resync` to rebuild all entries from the rule table");
        }

        // Missing chain/target/match modules
        if lower.contains("no chain/target/match by that name")
            || lower.contains("couldn't load target")
            || lower.contains("couldn't load match")
        {
            return ErrorTranslation::new("Kernel NAT support is missing")
                .with_suggestion("Load the NAT modules: modprobe iptable_nat xt_comment")
                .with_suggestion("Check that the nat table exists: iptables -t nat -S");
        }

        // Lock contention with other iptables users
        if lower.contains("xtables lock") || lower.contains("resource temporarily unavailable") {
            return ErrorTranslation::new("Another process holds the iptables lock")
                .with_suggestion("Wait a moment and try again")
                .with_suggestion("Check for other firewall managers: systemctl status firewalld ufw");
        }

        // Bad argument values
        if lower.contains("invalid port") || lower.contains("bad value for option") {
            return ErrorTranslation::new("iptables rejected a rule argument")
                .with_suggestion("Port numbers must be between 1 and 65535")
                .with_suggestion("Check that the container IP address is valid");
        }

        // Timeout errors
        if lower.contains("timeout") || lower.contains("timed out") {
            return ErrorTranslation::new("Operation timed out")
                .with_suggestion("The command took longer than command_timeout_secs")
                .with_suggestion("Check system load: uptime");
        }

        // Generic fallback
        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Inspect the live table: iptables -t nat -S PREROUTING")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
