use crate::core::codec::DEFAULT_MARKER;
use crate::core::executor::DEFAULT_COMMAND_TIMEOUT;
use crate::utils::{get_data_dir, split_command_line};
use crate::validators::validate_marker;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Environment variable overriding [`AppConfig::iptables_command`]
pub const IPTABLES_COMMAND_ENV: &str = "NATKEEPER_IPTABLES_COMMAND";
/// Environment variable overriding [`AppConfig::pvesh_command`]
pub const PVESH_COMMAND_ENV: &str = "NATKEEPER_PVESH_COMMAND";

const MAX_COMMAND_TIMEOUT_SECS: u64 = 300;
pub const MIN_RESYNC_INTERVAL_SECS: u64 = 10;

/// Complete application configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Command line used for iptables, split on whitespace
    #[serde(default = "default_iptables_command")]
    pub iptables_command: String,
    /// Command line used for the Proxmox API client, split on whitespace
    #[serde(default = "default_pvesh_command")]
    pub pvesh_command: String,
    /// Per-command timeout (clamped to 1..=300 seconds)
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Private comment prefix identifying entries this tool owns
    #[serde(default = "default_marker")]
    pub comment_marker: String,
    /// Rule store location; `<data_dir>/rules.json` when unset
    #[serde(default)]
    pub store_path: Option<PathBuf>,
    /// Interval for `resync --every` without an explicit value (minimum 10s)
    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,
    #[serde(default = "default_true")]
    pub audit_log: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            iptables_command: default_iptables_command(),
            pvesh_command: default_pvesh_command(),
            command_timeout_secs: default_command_timeout(),
            comment_marker: default_marker(),
            store_path: None,
            resync_interval_secs: default_resync_interval(),
            audit_log: true,
        }
    }
}

fn default_iptables_command() -> String {
    "iptables".to_string()
}

fn default_pvesh_command() -> String {
    "pvesh".to_string()
}

fn default_command_timeout() -> u64 {
    DEFAULT_COMMAND_TIMEOUT.as_secs()
}

fn default_marker() -> String {
    DEFAULT_MARKER.to_string()
}

fn default_resync_interval() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    /// Applies environment overrides and clamps out-of-range values.
    ///
    /// An invalid marker is replaced with the default: entries tagged with a
    /// malformed marker could never be recognized again by a resync.
    pub fn normalized(mut self) -> Self {
        if let Ok(cmd) = std::env::var(IPTABLES_COMMAND_ENV)
            && !cmd.trim().is_empty()
        {
            self.iptables_command = cmd;
        }
        if let Ok(cmd) = std::env::var(PVESH_COMMAND_ENV)
            && !cmd.trim().is_empty()
        {
            self.pvesh_command = cmd;
        }

        if split_command_line(&self.iptables_command).is_empty() {
            self.iptables_command = default_iptables_command();
        }
        if split_command_line(&self.pvesh_command).is_empty() {
            self.pvesh_command = default_pvesh_command();
        }

        self.command_timeout_secs = self.command_timeout_secs.clamp(1, MAX_COMMAND_TIMEOUT_SECS);
        self.resync_interval_secs = self.resync_interval_secs.max(MIN_RESYNC_INTERVAL_SECS);

        if let Err(e) = validate_marker(&self.comment_marker) {
            warn!(
                "Ignoring comment marker {:?}: {e}; using {DEFAULT_MARKER:?}",
                self.comment_marker
            );
            self.comment_marker = default_marker();
        }
        self
    }

    pub fn iptables_argv(&self) -> Vec<String> {
        split_command_line(&self.iptables_command)
    }

    pub fn pvesh_argv(&self) -> Vec<String> {
        split_command_line(&self.pvesh_command)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    /// Where the rule store lives, if a location can be determined
    pub fn resolved_store_path(&self) -> Option<PathBuf> {
        self.store_path
            .clone()
            .or_else(|| get_data_dir().map(|dir| dir.join("rules.json")))
    }
}

/// Default config location: `<data_dir>/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    get_data_dir().map(|dir| dir.join("config.json"))
}

/// Saves the config using an atomic write pattern.
/// 1. Writes to a temporary file next to the target.
/// 2. Sets restrictive permissions (0o600).
/// 3. Atomically renames to the target path.
pub async fn save_config(config: &AppConfig, path: &Path) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;

    let mut temp_path = path.as_os_str().to_owned();
    temp_path.push(".tmp");
    let temp_path = PathBuf::from(temp_path);

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }

    #[cfg(unix)]
    {
        use tokio::fs::OpenOptions;
        use tokio::io::AsyncWriteExt;

        // Mode is set at creation so the file is never briefly world-readable
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&temp_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    #[cfg(not(unix))]
    {
        use tokio::io::AsyncWriteExt;

        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    tokio::fs::rename(&temp_path, path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration. Free up space and try again.",
            )
        } else {
            e
        }
    })
}

/// A config file that exists but cannot be used
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Loads the config from `path` (or the default location). A missing file
/// means defaults. Environment overrides and clamping are applied either way.
///
/// # Errors
///
/// Returns `Err` if the file exists but cannot be read or parsed.
pub async fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let Some(path) = path.map(Path::to_path_buf).or_else(default_config_path) else {
        return Ok(AppConfig::default().normalized());
    };

    let config = match tokio::fs::read_to_string(&path).await {
        Ok(json) => serde_json::from_str::<AppConfig>(&json)
            .map_err(|source| ConfigError::Parse { path, source })?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
        Err(source) => return Err(ConfigError::Read { path, source }),
    };
    Ok(config.normalized())
}
