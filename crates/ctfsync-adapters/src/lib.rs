//! Platform client contract, the CTFd HTTP implementation, and remote model normalization.

use async_trait::async_trait;
use ctfsync_core::{Challenge, FileDescriptor, Hint, DEFAULT_CATEGORY};
use ctfsync_storage::{is_reserved_name, FetchError};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod ctfd;
pub mod fetcher;
pub mod memory;
pub mod submission;

pub use ctfd::CtfdClient;
pub use fetcher::{fetch_challenges, FetchOptions, RemoteSnapshot, SkippedChallenge};
pub use memory::{load_platform_fixture, FixtureChallenge, InMemoryPlatform, PlatformFixture};
pub use submission::{default_strategies, parse_verdict, ProbeResult, SubmissionStrategy};

pub const CRATE_NAME: &str = "ctfsync-adapters";

/// Response body did not have the shape we expected.
#[derive(Debug, Clone, Error)]
#[error("malformed response: {0}")]
pub struct MalformedResponse(pub String);

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("network failure: {0}")]
    Network(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("authentication rejected (http {status})")]
    Auth { status: u16 },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error(transparent)]
    Malformed(#[from] MalformedResponse),
}

impl From<FetchError> for RemoteError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::HttpStatus { status, .. } if status == 401 || status == 403 => {
                RemoteError::Auth { status }
            }
            FetchError::HttpStatus { status, url } => RemoteError::HttpStatus { status, url },
            FetchError::Request(ref inner) if inner.is_timeout() => {
                RemoteError::Timeout(inner.to_string())
            }
            FetchError::Request(inner) => RemoteError::Network(inner.to_string()),
        }
    }
}

/// List endpoint row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeSummary {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub value: u32,
    #[serde(default)]
    pub solved_by_me: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTag {
    Plain(String),
    Object { value: String },
}

impl RawTag {
    pub fn into_value(self) -> String {
        match self {
            RawTag::Plain(value) | RawTag::Object { value } => value,
        }
    }
}

/// Detail endpoint payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeDetail {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub value: u32,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub hints: Vec<Hint>,
    #[serde(default)]
    pub connection_info: Option<String>,
    #[serde(default)]
    pub tags: Vec<RawTag>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub solves: Option<u32>,
    #[serde(default)]
    pub solved_by_me: Option<bool>,
}

/// Raw answer to a submission POST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// One concrete submission call: which variant, where, and with what body.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionRequest {
    pub variant: &'static str,
    pub path: String,
    pub payload: JsonValue,
}

/// Authenticated access to one platform instance.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    fn base_url(&self) -> &str;

    async fn list_challenges(&self) -> Result<Vec<ChallengeSummary>, RemoteError>;

    async fn get_challenge_detail(&self, id: u64) -> Result<ChallengeDetail, RemoteError>;

    async fn download_file(&self, url: &str) -> Result<Vec<u8>, RemoteError>;

    async fn post_submission(&self, request: &SubmissionRequest) -> Result<RawResponse, RemoteError>;
}

/// Turns a platform file reference into an absolute download URL.
pub fn resolve_file_url(base_url: &str, raw: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else if raw.starts_with("/files/") {
        format!("{base}{raw}")
    } else {
        format!("{base}/files/{}", raw.trim_start_matches('/'))
    }
}

/// Last path segment without query string; blank names fall back to `file_<index>`.
pub fn file_name_from_url(url: &str, index: usize) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or_default();
    let name = without_query.rsplit('/').next().unwrap_or_default().trim();
    let name: String = name
        .chars()
        .map(|c| if matches!(c, '\\' | ':' | '*' | '"' | '<' | '>' | '|') || c.is_control() { '_' } else { c })
        .collect();
    let name = name.trim_matches('.');
    if name.is_empty() {
        format!("file_{index}")
    } else {
        name.to_string()
    }
}

/// Merge a list row and its detail into the normalized model.
pub fn normalize_challenge(
    summary: &ChallengeSummary,
    detail: ChallengeDetail,
    base_url: &str,
) -> Challenge {
    let category = if detail.category.trim().is_empty() {
        if summary.category.trim().is_empty() {
            DEFAULT_CATEGORY.to_string()
        } else {
            summary.category.trim().to_string()
        }
    } else {
        detail.category.trim().to_string()
    };

    let mut files: Vec<FileDescriptor> = Vec::with_capacity(detail.files.len());
    for (index, raw) in detail.files.iter().enumerate() {
        let url = resolve_file_url(base_url, raw);
        let mut name = file_name_from_url(&url, index);
        while is_reserved_name(&name) || files.iter().any(|f| f.name == name) {
            name = format!("{index}_{name}");
        }
        files.push(FileDescriptor { name, url });
    }

    Challenge {
        id: detail.id,
        name: detail.name,
        category,
        value: detail.value,
        description: detail.description.unwrap_or_default(),
        files,
        hints: detail.hints,
        connection_info: detail
            .connection_info
            .filter(|c| !c.trim().is_empty()),
        solved: summary.solved_by_me || detail.solved_by_me.unwrap_or(false),
        tags: detail.tags.into_iter().map(RawTag::into_value).collect(),
        kind: detail.kind.unwrap_or_else(|| "standard".to_string()),
        state: detail.state.unwrap_or_else(|| "visible".to_string()),
        max_attempts: detail.max_attempts,
        solves: detail.solves.unwrap_or(0),
    }
}

/// Unwraps the `{"success": .., "data": ..}` envelope.
pub fn unwrap_envelope(value: JsonValue) -> Result<JsonValue, MalformedResponse> {
    match value {
        JsonValue::Object(mut map) => {
            if map.get("success").and_then(JsonValue::as_bool) == Some(false) {
                let message = map
                    .get("message")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("platform reported failure")
                    .to_string();
                return Err(MalformedResponse(message));
            }
            match map.remove("data") {
                Some(data) => Ok(data),
                None => Ok(JsonValue::Object(map)),
            }
        }
        other => Ok(other),
    }
}
