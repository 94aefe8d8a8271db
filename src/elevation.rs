//! Privilege elevation for firewall and Proxmox commands
//!
//! Writing to the nat table needs root (or `CAP_NET_ADMIN`). natkeeper is
//! usually run as root from a systemd unit, in which case commands are
//! spawned directly. When it is not, the executor wraps each command with an
//! elevation helper chosen once at start-up.
//!
//! # Elevation Strategy
//!
//! - **Root or test mode**: run the program directly
//! - **Explicit**: `NATKEEPER_ELEVATION_METHOD` = `sudo`, `run0` or `none`
//! - **Automatic**: `run0` when available (no SUID), else `sudo`
//!
//! `sudo` is always invoked with `-n`: a password prompt would otherwise
//! hold the command until the executor's timeout fires.
//!
//! # Environment Variables
//!
//! - `NATKEEPER_ELEVATION_METHOD`: force a method (case-insensitive)
//! - `NATKEEPER_NO_ELEVATION`: bypass elevation entirely (for testing only)

use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `NATKEEPER_ELEVATION_METHOD`
    #[error("Invalid NATKEEPER_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, none")]
    InvalidMethod(String),

    /// Not root and neither run0 nor sudo is installed
    #[error("Not running as root and neither run0 nor sudo is available")]
    NoMethodAvailable,
}

/// How external commands are spawned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
pub enum ElevationMethod {
    /// Run the program as the current user
    #[default]
    #[strum(serialize = "direct")]
    Direct,
    #[strum(serialize = "sudo")]
    Sudo,
    #[strum(serialize = "run0")]
    Run0,
}

impl ElevationMethod {
    /// Picks the elevation method from the environment and the current uid.
    pub fn detect() -> Result<Self, ElevationError> {
        // 1. Strict Test Mode Override (Highest Priority)
        if std::env::var_os("NATKEEPER_NO_ELEVATION").is_some() {
            return Ok(ElevationMethod::Direct);
        }

        // 2. Direct Root Execution
        if nix::unistd::getuid().is_root() {
            return Ok(ElevationMethod::Direct);
        }

        // 3. Explicit elevation method override
        if let Ok(method) = std::env::var("NATKEEPER_ELEVATION_METHOD") {
            let method = method.to_lowercase();
            if !method.is_empty() {
                return Self::from_name(&method);
            }
        }

        // 4. Automatic detection
        if binary_exists("run0") {
            return Ok(ElevationMethod::Run0);
        }
        if binary_exists("sudo") {
            return Ok(ElevationMethod::Sudo);
        }
        Err(ElevationError::NoMethodAvailable)
    }

    fn from_name(method: &str) -> Result<Self, ElevationError> {
        match method {
            "none" | "direct" => Ok(ElevationMethod::Direct),
            "sudo" => {
                if binary_exists("sudo") {
                    Ok(ElevationMethod::Sudo)
                } else {
                    Err(ElevationError::MethodNotAvailable("sudo".into()))
                }
            }
            "run0" => {
                if binary_exists("run0") {
                    Ok(ElevationMethod::Run0)
                } else {
                    Err(ElevationError::MethodNotAvailable("run0".into()))
                }
            }
            _ => Err(ElevationError::InvalidMethod(method.to_string())),
        }
    }

    /// Builds the command that runs `program args...` with this method.
    ///
    /// Arguments are passed straight to the program, never through a shell.
    pub fn command(self, program: &str, args: &[String]) -> Command {
        match self {
            ElevationMethod::Direct => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
            ElevationMethod::Sudo => {
                let mut cmd = Command::new("sudo");
                cmd.arg("-n").arg("--").arg(program).args(args);
                cmd
            }
            ElevationMethod::Run0 => {
                let mut cmd = Command::new("run0");
                cmd.arg(program).args(args);
                cmd
            }
        }
    }
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}
