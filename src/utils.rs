//! Utility functions for directory management and command-line handling
//!
//! Directories follow the XDG Base Directory specification:
//!
//! - Data: `~/.local/share/natkeeper/` - configuration and the rule store
//! - State: `~/.local/state/natkeeper/` - log file and audit log
//!
//! # Example
//!
//! ```
//! use natkeeper::utils::{format_command_line, split_command_line};
//!
//! let argv = split_command_line("ip netns exec fw iptables");
//! assert_eq!(argv.len(), 5);
//! assert_eq!(format_command_line(&["echo".to_string(), "a b".to_string()]), "echo 'a b'");
//! ```

use directories::ProjectDirs;
use std::path::PathBuf;

pub fn get_data_dir() -> Option<PathBuf> {
    ProjectDirs::from("org", "natkeeper", "natkeeper").map(|pd| pd.data_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    ProjectDirs::from("org", "natkeeper", "natkeeper")
        .and_then(|pd| pd.state_dir().map(std::path::Path::to_path_buf))
        .or_else(get_data_dir)
}

pub fn ensure_dirs() -> std::io::Result<()> {
    use std::fs::DirBuilder;
    use std::os::unix::fs::DirBuilderExt;

    let mut builder = DirBuilder::new();
    builder.mode(0o700); // User read/write/execute only
    builder.recursive(true);

    if let Some(dir) = get_data_dir() {
        builder.create(dir)?;
    }
    if let Some(dir) = get_state_dir() {
        builder.create(dir)?;
    }

    Ok(())
}

/// Truncates a string to a maximum byte length and adds an ellipsis if needed.
///
/// The result, ellipsis included, never exceeds `max_len` bytes and never
/// splits a multi-byte character.
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        let end = s
            .char_indices()
            .map(|(idx, _)| idx)
            .take_while(|&idx| idx <= max_len.saturating_sub(3))
            .last()
            .unwrap_or(0);
        format!("{}...", &s[..end])
    }
}

/// Splits a configured command line (e.g. `"ip netns exec fw iptables"`) into argv.
pub fn split_command_line(line: &str) -> Vec<String> {
    line.split_whitespace().map(String::from).collect()
}

/// Renders argv for logs, single-quoting anything the shell would split or expand.
pub fn format_command_line(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            let plain = !arg.is_empty()
                && arg.chars().all(|c| {
                    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | ',' | '@' | '+')
                });
            if plain {
                arg.clone()
            } else {
                format!("'{}'", arg.replace('\'', r"'\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
