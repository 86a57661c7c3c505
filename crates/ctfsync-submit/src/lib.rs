//! Flag submission: flag and challenge resolution, endpoint probing, verdicts, and bulk runs.

use std::path::{Path, PathBuf};

use ctfsync_adapters::RemoteError;
use ctfsync_storage::{locate_challenge, WorkspaceStore};
use thiserror::Error;

pub mod bulk;
pub mod engine;

pub use bulk::{parse_manifest, submit_bulk, BulkItem, BulkReport, MalformedLine, Manifest, ManifestEntry};
pub use engine::{DryRunPreview, SubmissionEngine, SubmissionReceipt, SubmitResult};

pub const CRATE_NAME: &str = "ctfsync-submit";

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("no flag given and none found in the workspace")]
    NoFlag,
    #[error("{}", unknown_challenge_message(.0))]
    UnknownChallenge(Option<u64>),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Workspace(#[from] anyhow::Error),
}

fn unknown_challenge_message(id: &Option<u64>) -> String {
    match id {
        Some(id) => format!("challenge {id} is not known to the platform"),
        None => "no challenge id given and the current directory is not a challenge workspace"
            .to_string(),
    }
}

/// Interactive flag entry, used last in the precedence chain.
pub trait FlagPrompt: Send + Sync {
    fn prompt_flag(&self, challenge_id: u64) -> anyhow::Result<Option<String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagSource {
    Argument,
    Override,
    WorkspaceFile,
    Prompt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFlag {
    pub value: String,
    pub source: FlagSource,
}

#[derive(Default)]
pub struct FlagInputs<'a> {
    pub argument: Option<&'a str>,
    pub override_flag: Option<&'a str>,
    pub prompt: Option<&'a dyn FlagPrompt>,
}

/// Where a submission goes and what the workspace already knows about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeTarget {
    pub id: u64,
    /// Challenge directory relative to the workspace root, when synced.
    pub dir: Option<PathBuf>,
    pub locally_solved: bool,
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Argument, then `--flag` override, then `flag.txt`, then the prompt.
pub async fn resolve_flag<S>(
    store: &S,
    target: &ChallengeTarget,
    inputs: &FlagInputs<'_>,
) -> Result<ResolvedFlag, SubmitError>
where
    S: WorkspaceStore + ?Sized,
{
    if let Some(value) = non_blank(inputs.argument) {
        return Ok(ResolvedFlag {
            value,
            source: FlagSource::Argument,
        });
    }
    if let Some(value) = non_blank(inputs.override_flag) {
        return Ok(ResolvedFlag {
            value,
            source: FlagSource::Override,
        });
    }
    if let Some(dir) = &target.dir {
        if let Some(entry) = store.read_entry(dir).await? {
            if let Some(value) = non_blank(entry.flag.candidate.as_deref()) {
                return Ok(ResolvedFlag {
                    value,
                    source: FlagSource::WorkspaceFile,
                });
            }
        }
    }
    if let Some(prompt) = inputs.prompt {
        if let Some(value) = non_blank(prompt.prompt_flag(target.id)?.as_deref()) {
            return Ok(ResolvedFlag {
                value,
                source: FlagSource::Prompt,
            });
        }
    }
    Err(SubmitError::NoFlag)
}

/// Explicit id wins; otherwise the challenge whose directory contains `cwd`.
pub async fn resolve_challenge<S>(
    store: &S,
    explicit: Option<u64>,
    cwd: Option<&Path>,
) -> Result<ChallengeTarget, SubmitError>
where
    S: WorkspaceStore + ?Sized,
{
    let (id, dir) = match explicit {
        Some(id) => {
            let index = store.load_index().await?;
            (id, index.challenges.get(&id).map(|c| PathBuf::from(&c.path)))
        }
        None => {
            let Some(cwd) = cwd else {
                return Err(SubmitError::UnknownChallenge(None));
            };
            match locate_challenge(store, cwd).await? {
                Some((id, dir)) => (id, Some(dir)),
                None => return Err(SubmitError::UnknownChallenge(None)),
            }
        }
    };

    let locally_solved = match &dir {
        Some(dir) => store
            .read_entry(dir)
            .await?
            .is_some_and(|entry| entry.flag.solved),
        None => false,
    };
    Ok(ChallengeTarget {
        id,
        dir,
        locally_solved,
    })
}
