//! Append-only attempt history, one JSON record per line, one log per profile.

use std::path::{Path, PathBuf};

use anyhow::Context;
use ctfsync_core::SubmissionAttempt;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::warn;

use crate::{write_atomic, STATE_DIR};

#[derive(Debug)]
pub struct AttemptLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AttemptLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// `<root>/.ctfsync/history/<profile>.jsonl`
    pub fn for_profile(root: &Path, profile: &str) -> Self {
        let name = ctfsync_core::slugify(profile);
        let name = if name.is_empty() { "default".to_string() } else { name };
        Self::new(root.join(STATE_DIR).join("history").join(format!("{name}.jsonl")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record. The whole log is rewritten through a temp file and renamed into
    /// place, so an interrupted append leaves the previous log intact.
    pub async fn append(&self, attempt: &SubmissionAttempt) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.path.display()))
            }
        };
        if !bytes.is_empty() && !bytes.ends_with(b"\n") {
            bytes.push(b'\n');
        }
        serde_json::to_writer(&mut bytes, attempt).context("serializing attempt record")?;
        bytes.push(b'\n');
        write_atomic(&self.path, &bytes).await
    }

    /// All records in append order. Unparseable lines are skipped with a warning.
    pub async fn list(&self) -> anyhow::Result<Vec<SubmissionAttempt>> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.path.display()))
            }
        };
        let mut attempts = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(attempt) => attempts.push(attempt),
                Err(err) => warn!(line = line_no + 1, error = %err, "skipping corrupt history record"),
            }
        }
        Ok(attempts)
    }

    /// Newest first, optionally filtered to one challenge.
    pub async fn recent(
        &self,
        challenge_id: Option<u64>,
        limit: usize,
    ) -> anyhow::Result<Vec<SubmissionAttempt>> {
        let mut attempts = self.list().await?;
        attempts.retain(|a| challenge_id.map_or(true, |id| a.challenge_id == id));
        attempts.reverse();
        attempts.truncate(limit);
        Ok(attempts)
    }
}
