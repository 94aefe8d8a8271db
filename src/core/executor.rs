//! External command execution
//!
//! Every iptables and pvesh call goes through [`CommandExecutor::invoke`].
//! The contract is deliberately narrow: a command either succeeded, with its
//! stdout, or failed, with a message. Nothing is raised past this boundary;
//! spawn errors, missing binaries, non-zero exits and timeouts all collapse
//! into a failed [`CommandOutcome`], and callers decide how much a failure
//! matters.
//!
//! Output is captured with `LC_ALL`/`LANG` forced to `C.UTF-8` so that the
//! dump parser sees the same text on every host.

use crate::core::error::Error;
use crate::elevation::ElevationMethod;
use crate::utils::format_command_line;
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, error, info};

/// Default bound on a single command
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

/// Why a command did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandFailure {
    /// Ran to completion with a non-zero (or signal) exit
    Exit(Option<i32>),
    /// The program does not exist
    NotFound,
    /// Did not finish within the timeout and was killed
    TimedOut,
    /// Could not be spawned or waited on
    Fault,
}

/// Result of one command invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub ok: bool,
    /// stdout on success; stderr (or stdout when stderr is empty) on failure
    pub output: String,
    pub failure: Option<CommandFailure>,
}

impl CommandOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            ok: true,
            output: output.into(),
            failure: None,
        }
    }

    pub fn failed(failure: CommandFailure, output: impl Into<String>) -> Self {
        Self {
            ok: false,
            output: output.into(),
            failure: Some(failure),
        }
    }

    /// Maps a failed outcome onto the error taxonomy.
    ///
    /// `generic` builds the error for ordinary failures (non-zero exit, spawn
    /// fault); missing binaries and timeouts get their own variants.
    pub fn into_error(self, argv: &[String], timeout: Duration, generic: fn(String) -> Error) -> Error {
        let program = argv.first().cloned().unwrap_or_default();
        match self.failure {
            Some(CommandFailure::NotFound) => Error::CommandNotFound(program),
            Some(CommandFailure::TimedOut) => Error::CommandTimeout {
                command: program,
                secs: timeout.as_secs(),
            },
            _ => generic(self.output),
        }
    }
}

/// Runs external commands. Implemented by [`SystemExecutor`] in production and
/// by recording fakes in tests.
pub trait CommandExecutor: Send + Sync {
    /// Runs `argv[0]` with `argv[1..]`, bounded by `timeout`.
    fn invoke(&self, argv: &[String], timeout: Duration)
    -> impl Future<Output = CommandOutcome> + Send;
}

/// Spawns real processes with `tokio::process`
#[derive(Debug, Clone, Default)]
pub struct SystemExecutor {
    elevation: ElevationMethod,
}

impl SystemExecutor {
    pub fn new(elevation: ElevationMethod) -> Self {
        Self { elevation }
    }
}

impl CommandExecutor for SystemExecutor {
    async fn invoke(&self, argv: &[String], timeout: Duration) -> CommandOutcome {
        let Some((program, args)) = argv.split_first() else {
            return CommandOutcome::failed(CommandFailure::Fault, "empty command line");
        };

        let line = format_command_line(argv);
        info!("Executing command: {line}");

        let mut cmd = self.elevation.command(program, args);
        cmd.env("LC_ALL", "C.UTF-8")
            .env("LANG", "C.UTF-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                error!("Command not found: {program}");
                return CommandOutcome::failed(
                    CommandFailure::NotFound,
                    format!("Command '{program}' not found. Make sure it is installed and on PATH."),
                );
            }
            Err(e) => {
                error!("Failed to spawn {line}: {e}");
                return CommandOutcome::failed(
                    CommandFailure::Fault,
                    format!("Unexpected error while running command: {e}"),
                );
            }
        };

        // Dropping the wait future on timeout drops the child, and kill_on_drop reaps it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                error!("Failed to wait for {line}: {e}");
                return CommandOutcome::failed(
                    CommandFailure::Fault,
                    format!("Unexpected error while running command: {e}"),
                );
            }
            Err(_) => {
                error!("Command timed out (>{}s): {line}", timeout.as_secs_f32());
                return CommandOutcome::failed(
                    CommandFailure::TimedOut,
                    format!("Command timed out (>{}s).", timeout.as_secs_f32()),
                );
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if output.status.success() {
            debug!("Command succeeded: {line}\nOutput: {stdout}");
            CommandOutcome::success(stdout)
        } else {
            let message = if stderr.is_empty() { stdout } else { stderr };
            error!(
                "Command failed (exit code {:?}): {line}\nError: {message}",
                output.status.code()
            );
            CommandOutcome::failed(CommandFailure::Exit(output.status.code()), message)
        }
    }
}
