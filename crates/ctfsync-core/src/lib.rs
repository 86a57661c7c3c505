//! Core domain model for ctfsync: challenges, workspace naming, and submission records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ctfsync-core";

/// Category directory used when the platform reports a blank category.
pub const DEFAULT_CATEGORY: &str = "misc";

/// One downloadable attachment of a challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hint {
    pub id: u64,
    #[serde(default)]
    pub cost: u32,
    /// `None` while the hint is still locked.
    #[serde(default)]
    pub content: Option<String>,
}

/// Normalized remote challenge. Immutable for the duration of one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub id: u64,
    pub name: String,
    pub category: String,
    pub value: u32,
    pub description: String,
    pub files: Vec<FileDescriptor>,
    pub hints: Vec<Hint>,
    pub connection_info: Option<String>,
    pub solved: bool,
    pub tags: Vec<String>,
    pub kind: String,
    pub state: String,
    pub max_attempts: Option<u32>,
    pub solves: u32,
}

impl Challenge {
    pub fn category_dir(&self) -> String {
        category_dir_name(&self.category)
    }

    pub fn connection(&self) -> Option<ConnectionInfo> {
        self.connection_info.as_deref().and_then(ConnectionInfo::parse)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    Web,
    Netcat,
    Ssh,
    Telnet,
    Raw,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionKind::Web => "web",
            ConnectionKind::Netcat => "netcat",
            ConnectionKind::Ssh => "ssh",
            ConnectionKind::Telnet => "telnet",
            ConnectionKind::Raw => "raw",
        };
        f.write_str(label)
    }
}

/// Classified `connection_info` string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub kind: ConnectionKind,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub command: String,
}

impl ConnectionInfo {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        if let Some(rest) = raw
            .strip_prefix("https://")
            .map(|r| (r, 443))
            .or_else(|| raw.strip_prefix("http://").map(|r| (r, 80)))
        {
            let (after_scheme, default_port) = rest;
            let authority = after_scheme.split(['/', '?', '#']).next().unwrap_or_default();
            let authority = authority.rsplit('@').next().unwrap_or(authority);
            let (host, port) = match authority.rsplit_once(':') {
                Some((h, p)) => (h.to_string(), p.parse().ok().or(Some(default_port))),
                None => (authority.to_string(), Some(default_port)),
            };
            return Some(Self {
                kind: ConnectionKind::Web,
                host: Some(host),
                port,
                command: raw.to_string(),
            });
        }

        let parts: Vec<&str> = raw.split_whitespace().collect();
        match parts.as_slice() {
            ["nc", host, port, ..] => {
                if let Ok(port) = port.parse() {
                    return Some(Self {
                        kind: ConnectionKind::Netcat,
                        host: Some(host.to_string()),
                        port: Some(port),
                        command: raw.to_string(),
                    });
                }
            }
            ["ssh", target, ..] => {
                let host = target.rsplit('@').next().unwrap_or(target);
                return Some(Self {
                    kind: ConnectionKind::Ssh,
                    host: Some(host.to_string()),
                    port: Some(22),
                    command: raw.to_string(),
                });
            }
            ["telnet", host, rest @ ..] => {
                let port = rest.first().and_then(|p| p.parse().ok()).unwrap_or(23);
                return Some(Self {
                    kind: ConnectionKind::Telnet,
                    host: Some(host.to_string()),
                    port: Some(port),
                    command: raw.to_string(),
                });
            }
            _ => {}
        }

        Some(Self {
            kind: ConnectionKind::Raw,
            host: None,
            port: None,
            command: raw.to_string(),
        })
    }
}

/// Normalized outcome of a submission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Correct,
    Incorrect,
    AlreadySolved,
    RateLimited,
    Error,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Verdict::Correct => "correct",
            Verdict::Incorrect => "incorrect",
            Verdict::AlreadySolved => "already solved",
            Verdict::RateLimited => "rate limited",
            Verdict::Error => "error",
        };
        f.write_str(label)
    }
}

/// Ephemeral result of one submission call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionOutcome {
    pub verdict: Verdict,
    pub message: String,
}

impl SubmissionOutcome {
    pub fn new(verdict: Verdict, message: impl Into<String>) -> Self {
        Self {
            verdict,
            message: message.into(),
        }
    }
}

/// Persisted, append-only record of one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionAttempt {
    pub attempt_id: Uuid,
    pub challenge_id: u64,
    pub submitted: String,
    pub timestamp: DateTime<Utc>,
    /// Endpoint variant label; `None` when nothing was posted.
    pub endpoint_variant: Option<String>,
    pub verdict: Verdict,
    pub message: String,
}

impl SubmissionAttempt {
    pub fn record(
        challenge_id: u64,
        submitted: &str,
        endpoint_variant: Option<&str>,
        outcome: &SubmissionOutcome,
    ) -> Self {
        Self {
            attempt_id: Uuid::new_v4(),
            challenge_id,
            submitted: submitted.to_string(),
            timestamp: Utc::now(),
            endpoint_variant: endpoint_variant.map(str::to_string),
            verdict: outcome.verdict,
            message: outcome.message.clone(),
        }
    }
}

/// Filesystem-safe slug: lowercase ascii alphanumerics joined by single dashes.
pub fn slugify(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

pub fn category_dir_name(category: &str) -> String {
    let slug = slugify(category);
    if slug.is_empty() {
        DEFAULT_CATEGORY.to_string()
    } else {
        slug
    }
}

/// Comparison key for category filters.
pub fn category_key(category: &str) -> String {
    let trimmed = category.trim();
    if trimmed.is_empty() {
        DEFAULT_CATEGORY.to_string()
    } else {
        trimmed.to_lowercase()
    }
}

pub fn mask_flag(flag: &str) -> String {
    let chars: Vec<char> = flag.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let visible: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}", "*".repeat(chars.len() - 4), visible)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_punctuation_and_case() {
        assert_eq!(slugify("Baby's First  Pwn!"), "baby-s-first-pwn");
        assert_eq!(slugify("../../etc/passwd"), "etc-passwd");
        assert_eq!(slugify("???"), "");
    }

    #[test]
    fn blank_category_maps_to_misc() {
        assert_eq!(category_dir_name("  "), "misc");
        assert_eq!(category_dir_name("Web Exploitation"), "web-exploitation");
        assert_eq!(category_key(" Crypto "), "crypto");
        assert_eq!(category_key(""), "misc");
    }

    #[test]
    fn connection_info_classification() {
        let web = ConnectionInfo::parse("https://chal.example.org/login").unwrap();
        assert_eq!(web.kind, ConnectionKind::Web);
        assert_eq!(web.host.as_deref(), Some("chal.example.org"));
        assert_eq!(web.port, Some(443));

        let nc = ConnectionInfo::parse("nc pwn.example.org 31337").unwrap();
        assert_eq!(nc.kind, ConnectionKind::Netcat);
        assert_eq!(nc.port, Some(31337));

        let ssh = ConnectionInfo::parse("ssh ctf@box.example.org").unwrap();
        assert_eq!(ssh.kind, ConnectionKind::Ssh);
        assert_eq!(ssh.host.as_deref(), Some("box.example.org"));

        let raw = ConnectionInfo::parse("ask an admin").unwrap();
        assert_eq!(raw.kind, ConnectionKind::Raw);
        assert!(ConnectionInfo::parse("   ").is_none());
    }

    #[test]
    fn flag_masking_keeps_last_four() {
        assert_eq!(mask_flag("flag{abc}"), "*****abc}");
        assert_eq!(mask_flag("abc"), "***");
    }
}
