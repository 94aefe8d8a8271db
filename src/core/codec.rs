//! iptables argument encoding and dump decoding
//!
//! Every enabled rule is mirrored by exactly one entry in the nat table's
//! PREROUTING chain:
//!
//! ```text
//! iptables -t nat -A PREROUTING -p tcp --dport 2222 -j DNAT \
//!     --to-destination 10.0.0.5:22 -m comment --comment "pve-nat:id=1;node=pve1;vmid=100;desc=ssh"
//! ```
//!
//! The comment tag is the only link between a live entry and its rule. It
//! carries the private marker so that a resync pass can find every entry this
//! crate owns in `iptables -t nat -S PREROUTING` output and turn each `-A`
//! line back into the matching `-D` command, without touching entries that
//! belong to anybody else.

use crate::core::rule::NatRule;
use crate::utils::truncate_string;
use crate::validators::sanitize_description;
use logos::Logos;
use tracing::{debug, warn};

pub const NAT_TABLE: &str = "nat";
pub const PREROUTING_CHAIN: &str = "PREROUTING";

/// Kernel limit for `-m comment` is 256 bytes including the NUL
pub const MAX_COMMENT_LEN: usize = 255;

/// Marker used when the configuration does not set one
pub const DEFAULT_MARKER: &str = "pve-nat:";

/// Whether a command adds or deletes an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
pub enum EntryAction {
    #[strum(serialize = "-A")]
    Add,
    #[strum(serialize = "-D")]
    Remove,
}

/// One owned entry found in a chain dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedEntry {
    /// Full comment tag, marker included
    pub comment: String,
    /// argv that deletes exactly this entry
    pub removal: Vec<String>,
}

/// Owned entries decoded from a chain dump
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedDump {
    pub entries: Vec<OwnedEntry>,
    /// Owned-looking lines that could not be tokenized
    pub skipped_lines: usize,
}

impl DecodedDump {
    pub fn removals(&self) -> impl Iterator<Item = &Vec<String>> {
        self.entries.iter().map(|entry| &entry.removal)
    }
}

/// Converts rules to firewall commands and live dumps back to removal commands.
pub trait RuleCodec: Send + Sync {
    fn marker(&self) -> &str;

    /// Full argv that adds or removes the entry for `rule`
    fn entry_command(&self, rule: &NatRule, action: EntryAction) -> Vec<String>;

    /// Full argv that prints the managed chain
    fn dump_command(&self) -> Vec<String>;

    /// Removal argv for every entry in `dump` that carries the marker
    fn decode_dump(&self, dump: &str) -> DecodedDump;

    /// True if `comment` was written for this rule, whatever its description
    /// was at the time.
    fn comment_identifies(&self, rule: &NatRule, comment: &str) -> bool;
}

/// [`RuleCodec`] for the iptables command-line interface
#[derive(Debug, Clone)]
pub struct IptablesCodec {
    program: Vec<String>,
    marker: String,
}

impl Default for IptablesCodec {
    fn default() -> Self {
        Self::new(vec!["iptables".to_string()], DEFAULT_MARKER)
    }
}

impl IptablesCodec {
    /// `program` is the iptables invocation prefix, e.g. `["iptables"]` or
    /// `["ip", "netns", "exec", "fw", "iptables"]`.
    pub fn new(program: Vec<String>, marker: impl Into<String>) -> Self {
        Self {
            program,
            marker: marker.into(),
        }
    }

    /// Builds the comment tag for a rule.
    ///
    /// Falls back to the tag without `desc=` when the full tag would exceed
    /// [`MAX_COMMENT_LEN`].
    pub fn comment_tag(&self, rule: &NatRule) -> String {
        let base = self.base_tag(rule);

        let description = rule
            .description
            .as_deref()
            .map(sanitize_description)
            .filter(|d| !d.is_empty());

        if let Some(desc) = description {
            let full = format!("{base};desc={desc}");
            if full.len() <= MAX_COMMENT_LEN {
                return full;
            }
            debug!("Comment tag for rule {} too long, dropping description", rule.id);
        }

        if base.len() <= MAX_COMMENT_LEN {
            base
        } else {
            truncate_string(&base, MAX_COMMENT_LEN)
        }
    }

    fn base_tag(&self, rule: &NatRule) -> String {
        format!(
            "{}id={};node={};vmid={}",
            self.marker, rule.id, rule.node, rule.vmid
        )
    }

    fn prefix(&self, action: &str) -> Vec<String> {
        let mut argv = self.program.clone();
        argv.extend(
            ["-t", NAT_TABLE, action, PREROUTING_CHAIN]
                .into_iter()
                .map(String::from),
        );
        argv
    }
}

impl RuleCodec for IptablesCodec {
    fn marker(&self) -> &str {
        &self.marker
    }

    fn entry_command(&self, rule: &NatRule, action: EntryAction) -> Vec<String> {
        let mut argv = self.prefix(action.as_ref());
        argv.extend([
            "-p".to_string(),
            rule.protocol.as_str().to_string(),
            "--dport".to_string(),
            rule.host_port.to_string(),
            "-j".to_string(),
            "DNAT".to_string(),
            "--to-destination".to_string(),
            rule.destination(),
            "-m".to_string(),
            "comment".to_string(),
            "--comment".to_string(),
            self.comment_tag(rule),
        ]);
        argv
    }

    fn dump_command(&self) -> Vec<String> {
        self.prefix("-S")
    }

    fn decode_dump(&self, dump: &str) -> DecodedDump {
        let add_prefix = format!("-A {PREROUTING_CHAIN} ");
        let mut decoded = DecodedDump::default();

        for line in dump.lines().map(str::trim) {
            if !line.starts_with(&add_prefix) || !line.contains(&self.marker) {
                continue;
            }

            let tokens = match tokenize_dump_line(line) {
                Ok(tokens) => tokens,
                Err(e) => {
                    warn!("Skipping unparseable chain entry ({e}): {line}");
                    decoded.skipped_lines += 1;
                    continue;
                }
            };

            let comment = tokens
                .windows(2)
                .find(|pair| pair[0] == "--comment" && pair[1].starts_with(&self.marker))
                .map(|pair| pair[1].clone());
            let Some(comment) = comment else {
                debug!("Marker text outside the comment, not ours: {line}");
                continue;
            };

            let mut removal = self.prefix(EntryAction::Remove.as_ref());
            removal.extend(tokens.into_iter().skip(2));
            decoded.entries.push(OwnedEntry { comment, removal });
        }

        decoded
    }

    fn comment_identifies(&self, rule: &NatRule, comment: &str) -> bool {
        let base = self.base_tag(rule);
        comment
            .strip_prefix(&base)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with(';'))
    }
}

/// Error type for dump line tokenization
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenizeError {
    #[error("unexpected input at byte {0}")]
    Unexpected(usize),

    #[error("quoted argument glued to adjacent text at byte {0}")]
    Glued(usize),
}

#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
enum DumpToken {
    #[regex(r"[ \t]+")]
    Space,

    #[regex(r#""([^"\\]|\\.)*""#)]
    Quoted,

    #[regex(r#"[^ \t"\\]+"#)]
    Bare,
}

/// Splits one `iptables -S` line into arguments.
///
/// Handles the double-quoted form iptables uses for comments, including
/// `\"` and `\\` escapes. Anything else a shell would interpret is an error.
pub fn tokenize_dump_line(line: &str) -> Result<Vec<String>, TokenizeError> {
    let mut lexer = DumpToken::lexer(line);
    let mut tokens = Vec::new();
    let mut last_end: Option<usize> = None;

    while let Some(token) = lexer.next() {
        let span = lexer.span();
        let token = token.map_err(|()| TokenizeError::Unexpected(span.start))?;

        let value = match token {
            DumpToken::Space => {
                last_end = None;
                continue;
            }
            DumpToken::Bare => lexer.slice().to_string(),
            DumpToken::Quoted => unescape(&lexer.slice()[1..lexer.slice().len() - 1]),
        };

        if last_end == Some(span.start) {
            return Err(TokenizeError::Glued(span.start));
        }
        last_end = Some(span.end);
        tokens.push(value);
    }

    Ok(tokens)
}

fn unescape(quoted: &str) -> String {
    let mut out = String::with_capacity(quoted.len());
    let mut chars = quoted.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}
