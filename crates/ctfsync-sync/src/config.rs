//! Environment-first configuration with an optional `profiles.yaml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ctfsync_storage::{FsWorkspace, HttpClientConfig, WorkspaceStore, STATE_DIR};
use serde::Deserialize;

pub const DEFAULT_PROFILE: &str = "default";
pub const MAX_CONCURRENCY: usize = 8;

#[derive(Debug, Clone)]
pub struct CtfConfig {
    pub url: Option<String>,
    pub token: Option<String>,
    /// Explicitly requested profile; `None` picks the file's default.
    pub profile: Option<String>,
    pub root: PathBuf,
    /// Set when the root came from `CTFSYNC_ROOT` or `--root` rather than the default.
    pub root_is_explicit: bool,
    pub http_timeout_secs: u64,
    pub concurrency: usize,
    pub user_agent: String,
    pub profiles_path: Option<PathBuf>,
}

impl CtfConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let root = non_empty("CTFSYNC_ROOT").map(PathBuf::from);
        Self {
            url: non_empty("CTFSYNC_URL"),
            token: non_empty("CTFSYNC_TOKEN"),
            profile: non_empty("CTFSYNC_PROFILE"),
            root_is_explicit: root.is_some(),
            root: root.unwrap_or_else(|| PathBuf::from("./challenges")),
            http_timeout_secs: non_empty("CTFSYNC_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            concurrency: non_empty("CTFSYNC_CONCURRENCY")
                .and_then(|v| v.parse().ok())
                .unwrap_or(4)
                .clamp(1, MAX_CONCURRENCY),
            user_agent: non_empty("CTFSYNC_USER_AGENT")
                .unwrap_or_else(|| format!("ctfsync/{}", env!("CARGO_PKG_VERSION"))),
            profiles_path: non_empty("CTFSYNC_PROFILES").map(PathBuf::from),
        }
    }

    pub fn with_root(mut self, root: Option<PathBuf>) -> Self {
        if let Some(root) = root {
            self.root = root;
            self.root_is_explicit = true;
        }
        self
    }

    /// Inside a synced workspace, the enclosing root replaces the default one.
    pub fn with_discovered_root(mut self, cwd: &Path) -> Self {
        if self.root_is_explicit {
            return self;
        }
        if let Some(found) = FsWorkspace::discover(cwd) {
            self.root = found.root().to_path_buf();
        }
        self
    }

    pub fn with_profile(mut self, profile: Option<String>) -> Self {
        if profile.is_some() {
            self.profile = profile;
        }
        self
    }

    pub fn profiles_file(&self) -> PathBuf {
        self.profiles_path
            .clone()
            .unwrap_or_else(|| self.root.join(STATE_DIR).join("profiles.yaml"))
    }

    /// Name used for history files when no platform access is needed.
    pub fn profile_name(&self) -> Result<String> {
        if let Some(name) = &self.profile {
            return Ok(name.clone());
        }
        Ok(load_profiles(&self.profiles_file())?
            .and_then(|file| file.pick(None).map(|p| p.name.clone()))
            .unwrap_or_else(|| DEFAULT_PROFILE.to_string()))
    }

    /// Merges env values with the selected profile. Env wins.
    pub fn session(&self) -> Result<Session> {
        let profiles = load_profiles(&self.profiles_file())?;
        let entry = match (&profiles, &self.profile) {
            (Some(file), requested) => {
                let picked = file.pick(requested.as_deref());
                if picked.is_none() && requested.is_some() && self.url.is_none() {
                    bail!(
                        "profile `{}` not found in {}",
                        requested.as_deref().unwrap_or_default(),
                        self.profiles_file().display()
                    );
                }
                picked.cloned()
            }
            (None, _) => None,
        };

        let url = self
            .url
            .clone()
            .or_else(|| entry.as_ref().map(|e| e.url.clone()))
            .context("no platform URL configured; set CTFSYNC_URL or add a profile")?;
        let token = self
            .token
            .clone()
            .or_else(|| entry.as_ref().and_then(|e| e.token.clone()));
        let profile = self
            .profile
            .clone()
            .or_else(|| entry.as_ref().map(|e| e.name.clone()))
            .unwrap_or_else(|| DEFAULT_PROFILE.to_string());

        Ok(Session {
            profile,
            url: url.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn http_client_config(&self, session: &Session) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            api_token: session.token.clone(),
            concurrency: self.concurrency,
            ..Default::default()
        }
    }
}

/// Resolved platform identity passed explicitly to every remote operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub profile: String,
    pub url: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProfileEntry {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub default: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProfileFile {
    #[serde(default)]
    pub profiles: Vec<ProfileEntry>,
}

impl ProfileFile {
    /// Requested name, else the entry marked default, else the first.
    pub fn pick(&self, requested: Option<&str>) -> Option<&ProfileEntry> {
        match requested {
            Some(name) => self.profiles.iter().find(|p| p.name == name),
            None => self
                .profiles
                .iter()
                .find(|p| p.default)
                .or_else(|| self.profiles.first()),
        }
    }
}

pub fn load_profiles(path: &Path) -> Result<Option<ProfileFile>> {
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_yaml::from_str(&raw)
            .map(Some)
            .with_context(|| format!("parsing {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}
