//! Lists challenges, fetches their details with bounded concurrency, and normalizes them.

use ctfsync_core::{category_key, Challenge};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use crate::{normalize_challenge, PlatformClient, RemoteError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOptions {
    /// Case-insensitive category match; blank categories compare as `misc`.
    pub category_filter: Option<String>,
    pub only_challenge: Option<u64>,
    pub concurrency: usize,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            category_filter: None,
            only_challenge: None,
            concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedChallenge {
    pub id: u64,
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct RemoteSnapshot {
    /// Ordered by category, then id.
    pub challenges: Vec<Challenge>,
    pub skipped: Vec<SkippedChallenge>,
    /// Every category the platform listed, before filtering.
    pub available_categories: Vec<String>,
}

/// Builds the normalized remote model.
///
/// A failing list call fails the whole fetch. A failing detail call only drops that challenge,
/// which is reported in `skipped`.
pub async fn fetch_challenges<C>(
    client: &C,
    options: &FetchOptions,
) -> Result<RemoteSnapshot, RemoteError>
where
    C: PlatformClient + ?Sized,
{
    let summaries = client.list_challenges().await?;

    let mut available_categories: Vec<String> =
        summaries.iter().map(|s| category_key(&s.category)).collect();
    available_categories.sort();
    available_categories.dedup();

    let wanted_category = options.category_filter.as_deref().map(category_key);
    let selected: Vec<_> = summaries
        .into_iter()
        .filter(|s| options.only_challenge.map_or(true, |id| s.id == id))
        .filter(|s| {
            wanted_category
                .as_deref()
                .map_or(true, |wanted| category_key(&s.category) == wanted)
        })
        .collect();

    let base_url = client.base_url().to_string();
    let results: Vec<_> = stream::iter(selected)
        .map(|summary| {
            let base_url = base_url.as_str();
            async move {
                match client.get_challenge_detail(summary.id).await {
                    Ok(detail) => Ok(normalize_challenge(&summary, detail, base_url)),
                    Err(err) => Err(SkippedChallenge {
                        id: summary.id,
                        name: summary.name.clone(),
                        reason: err.to_string(),
                    }),
                }
            }
        })
        .buffer_unordered(options.concurrency.max(1))
        .collect()
        .await;

    let mut snapshot = RemoteSnapshot {
        available_categories,
        ..RemoteSnapshot::default()
    };
    for result in results {
        match result {
            Ok(challenge) => snapshot.challenges.push(challenge),
            Err(skipped) => {
                warn!(challenge_id = skipped.id, reason = %skipped.reason, "detail fetch failed");
                snapshot.skipped.push(skipped);
            }
        }
    }
    snapshot
        .challenges
        .sort_by(|a, b| category_key(&a.category).cmp(&category_key(&b.category)).then(a.id.cmp(&b.id)));
    snapshot.skipped.sort_by_key(|s| s.id);

    info!(
        fetched = snapshot.challenges.len(),
        skipped = snapshot.skipped.len(),
        "remote model built"
    );
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{FixtureChallenge, InMemoryPlatform};
    use serde_json::json;

    fn challenge(id: u64, category: &str) -> FixtureChallenge {
        FixtureChallenge {
            detail: serde_json::from_value(json!({
                "id": id,
                "name": format!("chal {id}"),
                "category": category,
                "files": [format!("/files/{id}/data.bin")]
            }))
            .unwrap(),
            solved_by_me: false,
            flag: None,
        }
    }

    #[tokio::test]
    async fn orders_by_category_then_id_and_skips_failed_details() {
        let platform = InMemoryPlatform::new("https://ctf.example.org")
            .with_challenge(challenge(9, "Web"))
            .with_challenge(challenge(2, "web"))
            .with_challenge(challenge(4, "Crypto"))
            .with_challenge(challenge(5, ""))
            .with_failing_detail(4);

        let snapshot = fetch_challenges(&platform, &FetchOptions::default())
            .await
            .unwrap();
        let ids: Vec<u64> = snapshot.challenges.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![5, 2, 9]);
        assert_eq!(snapshot.skipped.len(), 1);
        assert_eq!(snapshot.skipped[0].id, 4);
        assert_eq!(snapshot.available_categories, vec!["crypto", "misc", "web"]);
        assert_eq!(
            snapshot.challenges[1].files[0].url,
            "https://ctf.example.org/files/2/data.bin"
        );
    }

    #[tokio::test]
    async fn category_filter_is_case_insensitive() {
        let platform = InMemoryPlatform::new("https://ctf.example.org")
            .with_challenge(challenge(1, "Crypto"))
            .with_challenge(challenge(2, "Web"));
        let options = FetchOptions {
            category_filter: Some("CRYPTO".into()),
            ..FetchOptions::default()
        };

        let snapshot = fetch_challenges(&platform, &options).await.unwrap();
        assert_eq!(snapshot.challenges.len(), 1);
        assert_eq!(snapshot.challenges[0].id, 1);
        assert_eq!(platform.detail_calls(), 1);
    }

    #[tokio::test]
    async fn list_failure_fails_the_fetch() {
        let platform = InMemoryPlatform::new("https://ctf.example.org").unreachable();
        let err = fetch_challenges(&platform, &FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Network(_)));
    }
}
