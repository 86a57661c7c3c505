//! Local workspace store: one directory per challenge holding `README.md`, `flag.txt`,
//! and downloaded attachments.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use ctfsync_core::{slugify, Challenge};
use tokio::fs;

use crate::{sha256_hex, write_atomic, SyncIndex, STATE_DIR};

pub const README_FILE: &str = "README.md";
pub const FLAG_FILE: &str = "flag.txt";
pub const SOLVED_MARKER: &str = "# SOLVED";

/// Names the workspace generates itself (case-insensitive); attachments may not use them.
pub fn is_reserved_name(name: &str) -> bool {
    name.starts_with('.')
        || name.eq_ignore_ascii_case(README_FILE)
        || name.eq_ignore_ascii_case(FLAG_FILE)
}

const FLAG_PLACEHOLDER: &str = "# Put your flag on the first line that does not start with '#'.\n";
const STATUS_UNSOLVED: &str = "**Status:** UNSOLVED";
const STATUS_SOLVED: &str = "**Status:** SOLVED";
const README_ID_ROW: &str = "| Challenge ID | `";

/// Parsed view of `flag.txt`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagFileState {
    pub candidate: Option<String>,
    pub solved: bool,
}

/// On-disk projection of one challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceEntry {
    pub path: PathBuf,
    pub challenge_id: Option<u64>,
    pub readme: Option<String>,
    /// Attachment name -> size in bytes. Generated files are excluded.
    pub files: BTreeMap<String, u64>,
    pub flag: FlagFileState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadmeWrite {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub sha256: String,
    pub size: u64,
}

/// Read/write/ensure operations the reconciler and submission engine need from a workspace.
/// Paths are relative to the workspace root.
#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    fn root(&self) -> &Path;

    async fn read_entry(&self, rel: &Path) -> anyhow::Result<Option<WorkspaceEntry>>;

    async fn ensure_dir(&self, rel: &Path) -> anyhow::Result<bool>;

    async fn write_readme(
        &self,
        rel: &Path,
        challenge: &Challenge,
        solved: bool,
    ) -> anyhow::Result<ReadmeWrite>;

    /// Creates `flag.txt` with a placeholder; never touches an existing one.
    async fn ensure_flag_file(&self, rel: &Path) -> anyhow::Result<bool>;

    async fn mark_solved(&self, rel: &Path, flag: &str) -> anyhow::Result<()>;

    async fn has_file(&self, rel: &Path, name: &str) -> anyhow::Result<bool>;

    async fn store_file(&self, rel: &Path, name: &str, bytes: &[u8]) -> anyhow::Result<StoredFile>;

    async fn load_index(&self) -> anyhow::Result<SyncIndex>;

    async fn save_index(&self, index: &SyncIndex) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct FsWorkspace {
    root: PathBuf,
}

impl FsWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    pub fn index_path(&self) -> PathBuf {
        self.state_dir().join("sync_index.json")
    }

    /// Walks up from `start` looking for a directory that holds a sync index.
    pub fn discover(start: &Path) -> Option<Self> {
        start
            .ancestors()
            .find(|dir| dir.join(STATE_DIR).join("sync_index.json").exists())
            .map(Self::new)
    }

    fn abs(&self, rel: &Path) -> PathBuf {
        self.root.join(rel)
    }
}

async fn read_optional(path: &Path) -> anyhow::Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

#[async_trait]
impl WorkspaceStore for FsWorkspace {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn read_entry(&self, rel: &Path) -> anyhow::Result<Option<WorkspaceEntry>> {
        let dir = self.abs(rel);
        if !fs::try_exists(&dir)
            .await
            .with_context(|| format!("checking {}", dir.display()))?
        {
            return Ok(None);
        }

        let readme = read_optional(&dir.join(README_FILE)).await?;
        let flag = read_optional(&dir.join(FLAG_FILE))
            .await?
            .map(|text| parse_flag_file(&text))
            .unwrap_or_default();

        let mut files = BTreeMap::new();
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("listing {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if is_reserved_name(&name) {
                continue;
            }
            let meta = entry.metadata().await?;
            if meta.is_file() {
                files.insert(name, meta.len());
            }
        }

        Ok(Some(WorkspaceEntry {
            path: rel.to_path_buf(),
            challenge_id: readme.as_deref().and_then(challenge_id_from_readme),
            readme,
            files,
            flag,
        }))
    }

    async fn ensure_dir(&self, rel: &Path) -> anyhow::Result<bool> {
        let dir = self.abs(rel);
        if fs::try_exists(&dir)
            .await
            .with_context(|| format!("checking {}", dir.display()))?
        {
            return Ok(false);
        }
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        Ok(true)
    }

    async fn write_readme(
        &self,
        rel: &Path,
        challenge: &Challenge,
        solved: bool,
    ) -> anyhow::Result<ReadmeWrite> {
        let path = self.abs(rel).join(README_FILE);
        let rendered = render_readme(challenge, solved);
        let status = match read_optional(&path).await? {
            Some(existing) if existing == rendered => return Ok(ReadmeWrite::Unchanged),
            Some(_) => ReadmeWrite::Updated,
            None => ReadmeWrite::Created,
        };
        write_atomic(&path, rendered.as_bytes()).await?;
        Ok(status)
    }

    async fn ensure_flag_file(&self, rel: &Path) -> anyhow::Result<bool> {
        let path = self.abs(rel).join(FLAG_FILE);
        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(false);
        }
        write_atomic(&path, FLAG_PLACEHOLDER.as_bytes()).await?;
        Ok(true)
    }

    async fn mark_solved(&self, rel: &Path, flag: &str) -> anyhow::Result<()> {
        let dir = self.abs(rel);
        let flag_path = dir.join(FLAG_FILE);
        let previous = read_optional(&flag_path).await?.unwrap_or_default();

        let mut content = format!("{SOLVED_MARKER}\n{flag}\n");
        for line in previous.lines() {
            let trimmed = line.trim();
            if trimmed == flag || trimmed == SOLVED_MARKER || line == FLAG_PLACEHOLDER.trim_end() {
                continue;
            }
            content.push_str(line);
            content.push('\n');
        }
        write_atomic(&flag_path, content.as_bytes()).await?;

        let readme_path = dir.join(README_FILE);
        if let Some(readme) = read_optional(&readme_path).await? {
            if readme.contains(STATUS_UNSOLVED) {
                let updated = readme.replacen(STATUS_UNSOLVED, STATUS_SOLVED, 1);
                write_atomic(&readme_path, updated.as_bytes()).await?;
            }
        }
        Ok(())
    }

    async fn has_file(&self, rel: &Path, name: &str) -> anyhow::Result<bool> {
        let path = self.abs(rel).join(name);
        fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))
    }

    async fn store_file(&self, rel: &Path, name: &str, bytes: &[u8]) -> anyhow::Result<StoredFile> {
        if is_reserved_name(name) || name.contains(['/', '\\']) {
            anyhow::bail!("refusing to store attachment under reserved name `{name}`");
        }
        let path = self.abs(rel).join(name);
        write_atomic(&path, bytes).await?;
        Ok(StoredFile {
            sha256: sha256_hex(bytes),
            size: bytes.len() as u64,
        })
    }

    async fn load_index(&self) -> anyhow::Result<SyncIndex> {
        let path = self.index_path();
        match read_optional(&path).await? {
            Some(text) => {
                serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
            }
            None => Ok(SyncIndex::default()),
        }
    }

    async fn save_index(&self, index: &SyncIndex) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(index).context("serializing sync index")?;
        write_atomic(&self.index_path(), &bytes).await
    }
}

pub fn parse_flag_file(text: &str) -> FlagFileState {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    let mut state = FlagFileState::default();
    if let Some(first) = lines.clone().next() {
        state.solved = first.starts_with(SOLVED_MARKER);
    }
    state.candidate = lines.find(|l| !l.starts_with('#')).map(str::to_string);
    state
}

pub fn challenge_id_from_readme(readme: &str) -> Option<u64> {
    readme.lines().find_map(|line| {
        line.strip_prefix(README_ID_ROW)?
            .split('`')
            .next()?
            .trim()
            .parse()
            .ok()
    })
}

/// Canonical path for a challenge with no collision: `<category>/<slug>`.
pub fn resolve_path(challenge: &Challenge) -> PathBuf {
    let slug = slugify(&challenge.name);
    let slug = if slug.is_empty() {
        format!("challenge-{}", challenge.id)
    } else {
        slug
    };
    PathBuf::from(challenge.category_dir()).join(slug)
}

/// Assigns every challenge a distinct path.
///
/// Paths recorded in `index` are kept. Remaining challenges are placed in id order; the first
/// claimant of a `<category>/<slug>` gets it and later ones get `<slug>-<id>`.
pub fn resolve_paths(challenges: &[Challenge], index: &SyncIndex) -> BTreeMap<u64, PathBuf> {
    let mut assigned = BTreeMap::new();
    let mut claimed: BTreeSet<PathBuf> = BTreeSet::new();

    for challenge in challenges {
        if let Some(existing) = index.challenges.get(&challenge.id) {
            let path = PathBuf::from(&existing.path);
            if claimed.insert(path.clone()) {
                assigned.insert(challenge.id, path);
            }
        }
    }
    // Directories of challenges absent from this run stay reserved.
    for (id, existing) in &index.challenges {
        if !assigned.contains_key(id) {
            claimed.insert(PathBuf::from(&existing.path));
        }
    }

    let mut pending: Vec<&Challenge> = challenges
        .iter()
        .filter(|c| !assigned.contains_key(&c.id))
        .collect();
    pending.sort_by_key(|c| c.id);

    for challenge in pending {
        let mut path = resolve_path(challenge);
        while claimed.contains(&path) {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            path.set_file_name(format!("{name}-{}", challenge.id));
        }
        claimed.insert(path.clone());
        assigned.insert(challenge.id, path);
    }

    assigned
}

/// Deterministic README for one challenge. Same input, same bytes.
pub fn render_readme(challenge: &Challenge, solved: bool) -> String {
    let mut out = String::new();
    let status = if solved { "SOLVED" } else { "UNSOLVED" };
    let max_attempts = challenge
        .max_attempts
        .filter(|n| *n > 0)
        .map(|n| n.to_string())
        .unwrap_or_else(|| "Unlimited".to_string());

    let _ = writeln!(out, "# {}\n", challenge.name.trim());
    let _ = writeln!(out, "**Status:** {status}\n");
    out.push_str("| Field | Value |\n|-------|-------|\n");
    let _ = writeln!(out, "{README_ID_ROW}{}` |", challenge.id);
    let _ = writeln!(out, "| Category | {} |", challenge.category.trim());
    let _ = writeln!(out, "| Points | {} |", challenge.value);
    let _ = writeln!(out, "| Type | {} |", challenge.kind);
    let _ = writeln!(out, "| Solves | {} |", challenge.solves);
    let _ = writeln!(out, "| Max Attempts | {max_attempts} |");

    out.push_str("\n## Description\n\n");
    let description = challenge.description.replace("\r\n", "\n");
    let description = description.trim();
    if description.is_empty() {
        out.push_str("_No description provided_\n");
    } else {
        out.push_str(description);
        out.push('\n');
    }

    out.push_str("\n## Files\n\n");
    if challenge.files.is_empty() {
        out.push_str("_No files provided_\n");
    }
    for file in &challenge.files {
        let _ = writeln!(out, "- `{}`", file.name);
    }

    out.push_str("\n## Hints\n\n");
    if challenge.hints.is_empty() {
        out.push_str("_No hints available_\n");
    }
    for (i, hint) in challenge.hints.iter().enumerate() {
        match hint.content.as_deref().map(str::trim) {
            Some(content) if !content.is_empty() => {
                let _ = writeln!(out, "{}. {}", i + 1, content);
            }
            _ => {
                let _ = writeln!(out, "{}. _Locked (cost {})_", i + 1, hint.cost);
            }
        }
    }

    out.push_str("\n## Connection\n\n");
    match challenge.connection() {
        Some(conn) => {
            let _ = writeln!(out, "**Type:** {}", conn.kind);
            if let Some(host) = &conn.host {
                let _ = writeln!(out, "**Host:** `{host}`");
            }
            if let Some(port) = conn.port {
                let _ = writeln!(out, "**Port:** `{port}`");
            }
            let _ = writeln!(out, "**Command:** `{}`", conn.command);
        }
        None => out.push_str("_No connection information provided_\n"),
    }

    out.push_str("\n## Tags\n\n");
    if challenge.tags.is_empty() {
        out.push_str("_No tags_\n");
    } else {
        let tags = challenge
            .tags
            .iter()
            .map(|t| format!("`{t}`"))
            .collect::<Vec<_>>()
            .join(", ");
        out.push_str(&tags);
        out.push('\n');
    }

    let _ = write!(
        out,
        "\n---\n*Generated by ctfsync | Challenge ID: {}*\n",
        challenge.id
    );
    out
}

/// Index key for a relative path: components joined by `/`.
pub fn path_key(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Finds the challenge whose directory contains `dir`.
///
/// Checks the sync index first and falls back to the id row of a README, walking up from `dir`
/// until the workspace root. Returns the id and the directory relative to the root.
pub async fn locate_challenge<S>(store: &S, dir: &Path) -> anyhow::Result<Option<(u64, PathBuf)>>
where
    S: WorkspaceStore + ?Sized,
{
    let root = fs::canonicalize(store.root())
        .await
        .with_context(|| format!("resolving workspace root {}", store.root().display()))?;
    let dir = fs::canonicalize(dir)
        .await
        .with_context(|| format!("resolving {}", dir.display()))?;
    let Ok(rel) = dir.strip_prefix(&root) else {
        return Ok(None);
    };

    let index = store.load_index().await?;
    for candidate in rel.ancestors() {
        if candidate.as_os_str().is_empty() {
            break;
        }
        if let Some((id, _)) = index.find_by_path(&path_key(candidate)) {
            return Ok(Some((id, candidate.to_path_buf())));
        }
        if let Some(readme) = read_optional(&root.join(candidate).join(README_FILE)).await? {
            if let Some(id) = challenge_id_from_readme(&readme) {
                return Ok(Some((id, candidate.to_path_buf())));
            }
        }
    }
    Ok(None)
}
