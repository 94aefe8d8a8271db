//! Input validation and sanitization functions for natkeeper
//!
//! Everything that ends up in an iptables argument or a `pvesh` API path
//! passes through here first. Arguments are never interpreted by a shell, so
//! the goal is keeping the comment tag parseable and the API path well-formed
//! rather than escaping.

use crate::utils::truncate_string;

/// Longest description kept in a comment tag, in bytes
pub const MAX_DESCRIPTION_TAG_LEN: usize = 180;

/// Longest node name accepted
pub const MAX_NODE_NAME_LEN: usize = 64;

/// Proxmox guest ids start at 100
pub const MIN_VMID: u32 = 100;
pub const MAX_VMID: u32 = 999_999_999;

/// Sanitizes a rule description for embedding in the firewall comment tag.
///
/// Double quotes become single quotes and semicolons become underscores,
/// since `;` separates the tag's fields and `"` delimits the comment in
/// `iptables -S` output. Control characters and backslashes are dropped.
/// The result is capped at [`MAX_DESCRIPTION_TAG_LEN`] bytes.
///
/// # Examples
///
/// ```
/// use natkeeper::validators::sanitize_description;
///
/// assert_eq!(sanitize_description("say \"hi\"; bye"), "say 'hi'_ bye");
/// assert!(!sanitize_description("a\nb").contains('\n'));
/// ```
pub fn sanitize_description(input: &str) -> String {
    let cleaned: String = input
        .chars()
        .filter(|c| !c.is_control() && *c != '\\')
        .map(|c| match c {
            '"' => '\'',
            ';' => '_',
            other => other,
        })
        .collect();
    truncate_string(cleaned.trim(), MAX_DESCRIPTION_TAG_LEN)
}

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates a Proxmox node name.
///
/// Node names go into the `pvesh` API path and the comment tag, so only
/// hostname characters are allowed.
///
/// # Errors
///
/// Returns `Err` if the name is empty, too long, contains characters outside
/// `[A-Za-z0-9._-]`, or is `.`/`..`.
pub fn validate_node_name(name: &str) -> Result<&str, String> {
    if name.is_empty() {
        return Err("Node name cannot be empty".to_string());
    }

    if name.len() > MAX_NODE_NAME_LEN {
        return Err(format!(
            "Node name too long (max {MAX_NODE_NAME_LEN} characters)"
        ));
    }

    if name == "." || name == ".." {
        return Err("Invalid node name".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Node name contains invalid characters".to_string());
    }

    Ok(name)
}

/// Validates a container id.
///
/// # Errors
///
/// Returns `Err` outside `100..=999999999`.
pub fn validate_vmid(vmid: u32) -> Result<u32, String> {
    if (MIN_VMID..=MAX_VMID).contains(&vmid) {
        Ok(vmid)
    } else {
        Err(format!("Container id must be between {MIN_VMID} and {MAX_VMID}"))
    }
}

/// Validates the private comment marker.
///
/// # Errors
///
/// Returns `Err` unless the marker is 2..=32 bytes of `[A-Za-z0-9_-]`
/// followed by a trailing `:`.
pub fn validate_marker(marker: &str) -> Result<&str, String> {
    let Some(body) = marker.strip_suffix(':') else {
        return Err("Comment marker must end with ':'".to_string());
    };

    if body.is_empty() || marker.len() > 32 {
        return Err("Comment marker must be 2-32 characters long".to_string());
    }

    if !body
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
    {
        return Err("Comment marker contains invalid characters".to_string());
    }

    Ok(marker)
}
