//! Timed HTTP fetch utilities, atomic file writes, and the local workspace store for ctfsync.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub mod history;
pub mod index;
pub mod workspace;

pub use history::AttemptLog;
pub use index::{IndexedChallenge, IndexedFile, SyncIndex};
pub use workspace::{
    challenge_id_from_readme, is_reserved_name, locate_challenge, parse_flag_file, path_key, render_readme,
    resolve_path, resolve_paths, FlagFileState, FsWorkspace, ReadmeWrite, StoredFile, WorkspaceEntry, WorkspaceStore,
    FLAG_FILE, README_FILE, SOLVED_MARKER,
};

pub const CRATE_NAME: &str = "ctfsync-storage";

/// Directory under the workspace root holding generated state.
pub const STATE_DIR: &str = ".ctfsync";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Replace `path` with `bytes` through a temp file in the same directory and a rename,
/// so readers never observe a half-written file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Exponential delay between GET retries. POSTs never go through it.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(400),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `retry` (0-based), doubling up to `max_delay`.
    pub fn delay(&self, retry: usize) -> Duration {
        let shift = u32::try_from(retry).unwrap_or(u32::MAX).min(16);
        self.initial_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

/// 5xx and 429 may clear up on their own.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

pub fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Sent as `Authorization: Token <value>`.
    pub api_token: Option<String>,
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            api_token: None,
            concurrency: 4,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Authenticated HTTP client shared by every remote call of one command.
///
/// Every request carries the configured timeout, and in-flight requests are capped by a
/// semaphore sized from `HttpClientConfig::concurrency`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &config.api_token {
            let mut value = HeaderValue::from_str(&format!("Token {token}"))
                .context("api token is not a valid header value")?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build().context("building http client")?,
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
            retry: config.retry,
        })
    }

    /// GET, retrying transient failures. Any other non-2xx is `FetchError::HttpStatus`.
    pub async fn get_bytes(&self, url: &str) -> Result<HttpResponse, FetchError> {
        let _permit = self.permits.acquire().await.expect("semaphore not closed");
        self.get_retrying(url)
            .instrument(info_span!("http_get", url))
            .await
    }

    async fn get_retrying(&self, url: &str) -> Result<HttpResponse, FetchError> {
        let mut retry = 0;
        loop {
            let (transient, err) = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let body = resp.bytes().await?.to_vec();
                    return Ok(HttpResponse { status, body });
                }
                Ok(resp) => {
                    let status = resp.status();
                    let err = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                    };
                    (is_transient_status(status), err)
                }
                Err(err) => (is_transient_error(&err), FetchError::Request(err)),
            };
            if !transient || retry >= self.retry.max_retries {
                return Err(err);
            }
            let wait = self.retry.delay(retry);
            debug!(error = %err, retry, ?wait, "transient GET failure");
            tokio::time::sleep(wait).await;
            retry += 1;
        }
    }

    /// POST a JSON body exactly once and hand back whatever status and body the server sent.
    pub async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<HttpResponse, FetchError> {
        let _permit = self.permits.acquire().await.expect("semaphore not closed");
        let resp = self
            .client
            .post(url)
            .json(body)
            .send()
            .instrument(info_span!("http_post", url))
            .await?;
        let status = resp.status();
        let body = resp.bytes().await?.to_vec();
        Ok(HttpResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn atomic_write_replaces_content_without_leftovers() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("nested").join("README.md");

        write_atomic(&target, b"first").await.expect("first write");
        write_atomic(&target, b"second").await.expect("second write");

        assert_eq!(std::fs::read(&target).expect("read"), b"second");
        let leftovers: Vec<_> = std::fs::read_dir(target.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn retry_delay_doubles_until_capped() {
        let policy = RetryPolicy {
            max_retries: 4,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(1),
        };
        let delays: Vec<u128> = (0..4).map(|r| policy.delay(r).as_millis()).collect();
        assert_eq!(delays, vec![250, 500, 1000, 1000]);
        assert_eq!(policy.delay(usize::MAX), Duration::from_secs(1));
    }

    #[test]
    fn only_throttling_and_server_errors_are_transient() {
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
        assert!(!is_transient_status(StatusCode::UNAUTHORIZED));
    }
}
