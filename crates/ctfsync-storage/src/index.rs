//! Sync index persisted under `<root>/.ctfsync/sync_index.json`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const INDEX_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedFile {
    pub sha256: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedChallenge {
    /// Path relative to the workspace root, `/`-separated.
    pub path: String,
    pub name: String,
    pub category: String,
    pub solved: bool,
    #[serde(default)]
    pub files: BTreeMap<String, IndexedFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncIndex {
    pub version: u32,
    pub last_sync: Option<DateTime<Utc>>,
    pub profile: Option<String>,
    #[serde(default)]
    pub challenges: BTreeMap<u64, IndexedChallenge>,
}

impl Default for SyncIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            last_sync: None,
            profile: None,
            challenges: BTreeMap::new(),
        }
    }
}

impl SyncIndex {
    pub fn find_by_path(&self, rel: &str) -> Option<(u64, &IndexedChallenge)> {
        let rel = rel.trim_matches('/');
        self.challenges
            .iter()
            .find(|(_, c)| c.path == rel)
            .map(|(id, c)| (*id, c))
    }

    /// `(category, total, solved)` per category directory, sorted by category.
    pub fn category_counts(&self) -> Vec<(String, usize, usize)> {
        let mut counts: BTreeMap<String, (usize, usize)> = BTreeMap::new();
        for challenge in self.challenges.values() {
            let category = challenge
                .path
                .split('/')
                .next()
                .unwrap_or_default()
                .to_string();
            let entry = counts.entry(category).or_default();
            entry.0 += 1;
            if challenge.solved {
                entry.1 += 1;
            }
        }
        counts
            .into_iter()
            .map(|(category, (total, solved))| (category, total, solved))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_keys_survive_json() {
        let mut index = SyncIndex::default();
        index.challenges.insert(
            15,
            IndexedChallenge {
                path: "web/login".to_string(),
                name: "Login".to_string(),
                category: "Web".to_string(),
                solved: true,
                files: BTreeMap::new(),
            },
        );
        let text = serde_json::to_string(&index).unwrap();
        let back: SyncIndex = serde_json::from_str(&text).unwrap();
        assert_eq!(back, index);
        assert_eq!(back.find_by_path("web/login/").map(|(id, _)| id), Some(15));
        assert_eq!(back.category_counts(), vec![("web".to_string(), 1, 1)]);
    }
}
