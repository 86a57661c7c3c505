//! Sync orchestration: remote fetch, reconciliation into the workspace, and the sync index.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ctfsync_adapters::{fetch_challenges, FetchOptions, PlatformClient, RemoteError, SkippedChallenge};
use ctfsync_core::{category_key, Challenge};
use ctfsync_storage::{
    path_key, resolve_paths, IndexedChallenge, IndexedFile, ReadmeWrite, SyncIndex, WorkspaceStore,
};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;

pub use config::{load_profiles, CtfConfig, ProfileEntry, ProfileFile, Session};

pub const CRATE_NAME: &str = "ctfsync-sync";

/// Minimum Jaro-Winkler score for a "did you mean" category suggestion.
pub const SUGGESTION_THRESHOLD: f64 = 0.8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    pub include_files: bool,
    pub category_filter: Option<String>,
    pub only_challenge: Option<u64>,
    pub concurrency: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            include_files: true,
            category_filter: None,
            only_challenge: None,
            concurrency: 4,
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("cannot reach platform: {0}")]
    Fetch(#[from] RemoteError),
    #[error("workspace root {} is not writable", path.display())]
    Root {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("no challenge synced ({failed} of {attempted} failed)")]
    PartialSync { attempted: usize, failed: usize },
    #[error(transparent)]
    Workspace(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategorySummary {
    pub category: String,
    pub total: usize,
    pub solved: usize,
    pub available: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadmeChange {
    Created,
    Updated,
    Unchanged,
    Failed,
}

impl From<ReadmeWrite> for ReadmeChange {
    fn from(value: ReadmeWrite) -> Self {
        match value {
            ReadmeWrite::Created => ReadmeChange::Created,
            ReadmeWrite::Updated => ReadmeChange::Updated,
            ReadmeWrite::Unchanged => ReadmeChange::Unchanged,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChallengeSyncResult {
    pub id: u64,
    pub name: String,
    pub category: String,
    pub path: String,
    pub solved: bool,
    pub created_dir: bool,
    pub readme: ReadmeChange,
    pub downloaded: usize,
    pub already_present: usize,
    pub failures: Vec<String>,
}

impl ChallengeSyncResult {
    /// Directory and README exist; file failures alone do not count.
    pub fn synced(&self) -> bool {
        self.readme != ReadmeChange::Failed
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub categories: Vec<CategorySummary>,
    /// Ordered by category, then id.
    pub challenges: Vec<ChallengeSyncResult>,
    pub skipped: Vec<SkippedChallenge>,
    pub suggestion: Option<String>,
}

impl SyncReport {
    pub fn downloaded(&self) -> usize {
        self.challenges.iter().map(|c| c.downloaded).sum()
    }

    pub fn failures(&self) -> usize {
        self.skipped.len() + self.challenges.iter().map(|c| c.failures.len()).sum::<usize>()
    }

    pub fn is_partial(&self) -> bool {
        self.failures() > 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub last_sync: Option<DateTime<Utc>>,
    pub profile: Option<String>,
    pub categories: Vec<CategorySummary>,
    pub total: usize,
    pub solved: usize,
}

/// Fetch the remote model and reconcile it into `store`.
pub async fn sync_workspace<S, C>(
    store: &S,
    client: &C,
    options: &SyncOptions,
    profile: &str,
) -> Result<SyncReport, SyncError>
where
    S: WorkspaceStore + ?Sized,
    C: PlatformClient + ?Sized,
{
    let run_id = Uuid::new_v4();
    run_sync(store, client, options, profile, run_id)
        .instrument(info_span!("sync", %run_id, profile))
        .await
}

async fn run_sync<S, C>(
    store: &S,
    client: &C,
    options: &SyncOptions,
    profile: &str,
    run_id: Uuid,
) -> Result<SyncReport, SyncError>
where
    S: WorkspaceStore + ?Sized,
    C: PlatformClient + ?Sized,
{
    let fetch_options = FetchOptions {
        category_filter: options.category_filter.clone(),
        only_challenge: options.only_challenge,
        concurrency: options.concurrency,
    };
    let snapshot = fetch_challenges(client, &fetch_options).await?;

    let mut report = reconcile(store, client, &snapshot.challenges, options, profile).await?;
    report.run_id = run_id;
    report.skipped = snapshot.skipped;

    if let Some(wanted) = &options.category_filter {
        if snapshot.challenges.is_empty() && report.skipped.is_empty() {
            report.suggestion = suggest_category(wanted, &snapshot.available_categories);
        }
    }

    let attempted = report.challenges.len() + report.skipped.len();
    let synced = report.challenges.iter().filter(|c| c.synced()).count();
    if attempted > 0 && synced == 0 {
        return Err(SyncError::PartialSync {
            attempted,
            failed: attempted,
        });
    }
    Ok(report)
}

/// Project `challenges` into the workspace.
///
/// One challenge's failure is folded into its result; only an unwritable root or index aborts.
pub async fn reconcile<S, C>(
    store: &S,
    client: &C,
    challenges: &[Challenge],
    options: &SyncOptions,
    profile: &str,
) -> Result<SyncReport, SyncError>
where
    S: WorkspaceStore + ?Sized,
    C: PlatformClient + ?Sized,
{
    let started_at = Utc::now();
    store
        .ensure_dir(Path::new(""))
        .await
        .map_err(|source| SyncError::Root {
            path: store.root().to_path_buf(),
            source,
        })?;

    let mut index = store.load_index().await?;
    let paths = resolve_paths(challenges, &index);

    let jobs = challenges.iter().filter_map(|challenge| {
        paths.get(&challenge.id).map(|rel| {
            let previous = index.challenges.get(&challenge.id).cloned();
            reconcile_one(store, client, challenge, rel.clone(), previous, options)
        })
    });
    let mut outcomes: Vec<(ChallengeSyncResult, IndexedChallenge)> = stream::iter(jobs)
        .buffer_unordered(options.concurrency.max(1))
        .collect()
        .await;
    outcomes.sort_by(|(a, _), (b, _)| {
        category_key(&a.category)
            .cmp(&category_key(&b.category))
            .then(a.id.cmp(&b.id))
    });

    for (result, indexed) in &outcomes {
        if result.synced() {
            index.challenges.insert(result.id, indexed.clone());
        }
    }
    index.last_sync = Some(Utc::now());
    index.profile = Some(profile.to_string());
    store.save_index(&index).await?;

    let challenges: Vec<ChallengeSyncResult> = outcomes.into_iter().map(|(r, _)| r).collect();
    let report = SyncReport {
        run_id: Uuid::nil(),
        started_at,
        finished_at: Utc::now(),
        categories: summarize(challenges.iter().map(|c| (c.category.as_str(), c.solved))),
        challenges,
        skipped: Vec::new(),
        suggestion: None,
    };
    info!(
        challenges = report.challenges.len(),
        downloaded = report.downloaded(),
        failures = report.failures(),
        "reconcile finished"
    );
    Ok(report)
}

async fn reconcile_one<S, C>(
    store: &S,
    client: &C,
    challenge: &Challenge,
    rel: PathBuf,
    previous: Option<IndexedChallenge>,
    options: &SyncOptions,
) -> (ChallengeSyncResult, IndexedChallenge)
where
    S: WorkspaceStore + ?Sized,
    C: PlatformClient + ?Sized,
{
    let mut result = ChallengeSyncResult {
        id: challenge.id,
        name: challenge.name.clone(),
        category: challenge.category.clone(),
        path: path_key(&rel),
        solved: challenge.solved,
        created_dir: false,
        readme: ReadmeChange::Failed,
        downloaded: 0,
        already_present: 0,
        failures: Vec::new(),
    };
    let mut indexed = IndexedChallenge {
        path: result.path.clone(),
        name: challenge.name.clone(),
        category: challenge.category.clone(),
        solved: challenge.solved,
        files: previous.map(|p| p.files).unwrap_or_default(),
    };

    let span = info_span!("challenge", challenge_id = challenge.id, path = %result.path);
    async {
        match store.ensure_dir(&rel).await {
            Ok(created) => result.created_dir = created,
            Err(err) => {
                warn!(error = %err, "cannot create challenge directory");
                result.failures.push(format!("{err:#}"));
                return;
            }
        }

        let locally_solved = match store.read_entry(&rel).await {
            Ok(entry) => entry.is_some_and(|e| e.flag.solved),
            Err(err) => {
                warn!(error = %err, "cannot read workspace entry");
                false
            }
        };
        result.solved = challenge.solved || locally_solved;
        indexed.solved = result.solved;

        match store.write_readme(&rel, challenge, result.solved).await {
            Ok(write) => result.readme = write.into(),
            Err(err) => {
                warn!(error = %err, "cannot write README");
                result.failures.push(format!("{err:#}"));
                return;
            }
        }

        if options.include_files {
            for file in &challenge.files {
                match store.has_file(&rel, &file.name).await {
                    Ok(true) => {
                        result.already_present += 1;
                        continue;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        result.failures.push(format!("{}: {err:#}", file.name));
                        continue;
                    }
                }
                let stored = match client.download_file(&file.url).await {
                    Ok(bytes) => store.store_file(&rel, &file.name, &bytes).await,
                    Err(err) => Err(anyhow::Error::new(err)),
                };
                match stored {
                    Ok(stored) => {
                        result.downloaded += 1;
                        indexed.files.insert(
                            file.name.clone(),
                            IndexedFile {
                                sha256: stored.sha256,
                                size: stored.size,
                            },
                        );
                    }
                    Err(err) => {
                        warn!(file = %file.name, error = %err, "download failed");
                        result.failures.push(format!("{}: {err:#}", file.name));
                    }
                }
            }
        }

        if let Err(err) = store.ensure_flag_file(&rel).await {
            warn!(error = %err, "cannot create flag file");
            result.failures.push(format!("{err:#}"));
        }
    }
    .instrument(span)
    .await;

    (result, indexed)
}

fn summarize<'a>(items: impl Iterator<Item = (&'a str, bool)>) -> Vec<CategorySummary> {
    let mut counts: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    for (category, solved) in items {
        let entry = counts.entry(category_key(category)).or_default();
        entry.0 += 1;
        if solved {
            entry.1 += 1;
        }
    }
    counts
        .into_iter()
        .map(|(category, (total, solved))| CategorySummary {
            category,
            total,
            solved,
            available: total - solved,
        })
        .collect()
}

/// Offline summary built from the sync index.
pub async fn sync_status<S>(store: &S) -> anyhow::Result<SyncStatus>
where
    S: WorkspaceStore + ?Sized,
{
    let index: SyncIndex = store.load_index().await?;
    let categories = summarize(
        index
            .challenges
            .values()
            .map(|c| (c.category.as_str(), c.solved)),
    );
    Ok(SyncStatus {
        last_sync: index.last_sync,
        profile: index.profile,
        total: categories.iter().map(|c| c.total).sum(),
        solved: categories.iter().map(|c| c.solved).sum(),
        categories,
    })
}

/// Closest known category to `wanted`, if any scores at least [`SUGGESTION_THRESHOLD`].
pub fn suggest_category(wanted: &str, available: &[String]) -> Option<String> {
    let wanted = category_key(wanted);
    available
        .iter()
        .filter(|c| **c != wanted)
        .map(|c| (c, jaro_winkler(&wanted, c)))
        .filter(|(_, score)| *score >= SUGGESTION_THRESHOLD)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(c, _)| c.clone())
}
