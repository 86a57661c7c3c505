//! Fixture-backed in-memory platform.
//!
//! Answers list, detail, download and submission calls from a [`PlatformFixture`] and counts
//! every call, so reconciler and submission behaviour can be checked without a network.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    ChallengeDetail, ChallengeSummary, PlatformClient, RawResponse, RemoteError,
    SubmissionRequest,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureChallenge {
    pub detail: ChallengeDetail,
    #[serde(default)]
    pub solved_by_me: bool,
    /// Accepted flag; submissions of anything else are incorrect.
    #[serde(default)]
    pub flag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformFixture {
    pub base_url: String,
    #[serde(default)]
    pub challenges: Vec<FixtureChallenge>,
    /// Absolute download URL to file contents.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

pub fn load_platform_fixture(path: impl AsRef<Path>) -> Result<PlatformFixture> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading platform fixture {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("parsing platform fixture {}", path.display()))
}

#[derive(Debug, Default)]
struct CallCounters {
    list: AtomicUsize,
    detail: AtomicUsize,
    download: AtomicUsize,
    post: AtomicUsize,
    posts_in_flight: AtomicUsize,
    max_posts_in_flight: AtomicUsize,
}

#[derive(Debug)]
pub struct InMemoryPlatform {
    base_url: String,
    challenges: BTreeMap<u64, FixtureChallenge>,
    files: BTreeMap<String, Vec<u8>>,
    failing_details: BTreeSet<u64>,
    failing_downloads: BTreeSet<String>,
    accepted_variants: Mutex<Option<BTreeSet<&'static str>>>,
    unreachable: bool,
    rate_limited: bool,
    post_delay: Option<Duration>,
    solved: Mutex<BTreeSet<u64>>,
    posts: Mutex<Vec<SubmissionRequest>>,
    calls: CallCounters,
}

impl InMemoryPlatform {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            challenges: BTreeMap::new(),
            files: BTreeMap::new(),
            failing_details: BTreeSet::new(),
            failing_downloads: BTreeSet::new(),
            accepted_variants: Mutex::new(None),
            unreachable: false,
            rate_limited: false,
            post_delay: None,
            solved: Mutex::new(BTreeSet::new()),
            posts: Mutex::new(Vec::new()),
            calls: CallCounters::default(),
        }
    }

    pub fn from_fixture(fixture: PlatformFixture) -> Self {
        let mut platform = Self::new(&fixture.base_url);
        for challenge in fixture.challenges {
            platform = platform.with_challenge(challenge);
        }
        for (url, content) in fixture.files {
            platform = platform.with_file(&url, content.as_bytes());
        }
        platform
    }

    pub fn with_challenge(mut self, challenge: FixtureChallenge) -> Self {
        if challenge.solved_by_me {
            self.solved_mut().insert(challenge.detail.id);
        }
        self.challenges.insert(challenge.detail.id, challenge);
        self
    }

    pub fn with_file(mut self, url: &str, bytes: &[u8]) -> Self {
        self.files.insert(url.to_string(), bytes.to_vec());
        self
    }

    pub fn with_failing_detail(mut self, id: u64) -> Self {
        self.failing_details.insert(id);
        self
    }

    pub fn with_failing_download(mut self, url: &str) -> Self {
        self.failing_downloads.insert(url.to_string());
        self
    }

    /// Only the named submission variants answer; every other variant gets a 404.
    pub fn accepting_variants(self, labels: &[&'static str]) -> Self {
        self.set_accepting_variants(labels);
        self
    }

    /// Changes the served variants mid-run, as a redeployed platform would.
    pub fn set_accepting_variants(&self, labels: &[&'static str]) {
        let mut accepted = match self.accepted_variants.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *accepted = Some(labels.iter().copied().collect());
    }

    /// Every call fails as if the host were down.
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    /// Every submission is answered with HTTP 429.
    pub fn rate_limited(mut self) -> Self {
        self.rate_limited = true;
        self
    }

    /// Holds each submission this long before answering.
    pub fn with_post_delay(mut self, delay: Duration) -> Self {
        self.post_delay = Some(delay);
        self
    }

    pub fn list_calls(&self) -> usize {
        self.calls.list.load(Ordering::SeqCst)
    }

    pub fn detail_calls(&self) -> usize {
        self.calls.detail.load(Ordering::SeqCst)
    }

    pub fn download_calls(&self) -> usize {
        self.calls.download.load(Ordering::SeqCst)
    }

    pub fn post_calls(&self) -> usize {
        self.calls.post.load(Ordering::SeqCst)
    }

    /// Highest number of submissions that were being answered at the same time.
    pub fn max_concurrent_posts(&self) -> usize {
        self.calls.max_posts_in_flight.load(Ordering::SeqCst)
    }

    /// Variant labels of every POST received, in order.
    pub fn posted_variants(&self) -> Vec<&'static str> {
        self.posts
            .lock()
            .map(|posts| posts.iter().map(|p| p.variant).collect())
            .unwrap_or_default()
    }

    pub fn is_solved(&self, id: u64) -> bool {
        self.solved
            .lock()
            .map(|solved| solved.contains(&id))
            .unwrap_or(false)
    }

    fn solved_mut(&mut self) -> &mut BTreeSet<u64> {
        self.solved.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_reachable(&self) -> Result<(), RemoteError> {
        if self.unreachable {
            Err(RemoteError::Network(format!("{} is unreachable", self.base_url)))
        } else {
            Ok(())
        }
    }

    fn answer(&self, challenge_id: Option<u64>, submission: Option<&str>) -> RawResponse {
        let (Some(id), Some(submission)) = (challenge_id, submission) else {
            return RawResponse {
                status: 400,
                body: json!({"success": false, "errors": {"submission": ["Missing submission"]}})
                    .to_string()
                    .into_bytes(),
            };
        };
        let Some(challenge) = self.challenges.get(&id) else {
            return RawResponse {
                status: 404,
                body: json!({"message": "Challenge not found"}).to_string().into_bytes(),
            };
        };

        let mut solved = match self.solved.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let data = if solved.contains(&id) {
            json!({"status": "already_solved", "message": "You already solved this"})
        } else if challenge.flag.as_deref() == Some(submission) {
            solved.insert(id);
            json!({"status": "correct", "message": "Correct"})
        } else {
            json!({"status": "incorrect", "message": "Incorrect"})
        };
        RawResponse {
            status: 200,
            body: json!({"success": true, "data": data}).to_string().into_bytes(),
        }
    }
}

#[async_trait]
impl PlatformClient for InMemoryPlatform {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn list_challenges(&self) -> Result<Vec<ChallengeSummary>, RemoteError> {
        self.calls.list.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        Ok(self
            .challenges
            .values()
            .map(|c| ChallengeSummary {
                id: c.detail.id,
                name: c.detail.name.clone(),
                category: c.detail.category.clone(),
                value: c.detail.value,
                solved_by_me: self.is_solved(c.detail.id),
            })
            .collect())
    }

    async fn get_challenge_detail(&self, id: u64) -> Result<ChallengeDetail, RemoteError> {
        self.calls.detail.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        if self.failing_details.contains(&id) {
            return Err(RemoteError::HttpStatus {
                status: 500,
                url: format!("{}/api/v1/challenges/{id}", self.base_url),
            });
        }
        self.challenges
            .get(&id)
            .map(|c| c.detail.clone())
            .ok_or_else(|| RemoteError::HttpStatus {
                status: 404,
                url: format!("{}/api/v1/challenges/{id}", self.base_url),
            })
    }

    async fn download_file(&self, url: &str) -> Result<Vec<u8>, RemoteError> {
        self.calls.download.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        if self.failing_downloads.contains(url) {
            return Err(RemoteError::HttpStatus {
                status: 502,
                url: url.to_string(),
            });
        }
        self.files
            .get(url)
            .cloned()
            .ok_or_else(|| RemoteError::HttpStatus {
                status: 404,
                url: url.to_string(),
            })
    }

    async fn post_submission(&self, request: &SubmissionRequest) -> Result<RawResponse, RemoteError> {
        self.calls.post.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut posts) = self.posts.lock() {
            posts.push(request.clone());
        }
        self.check_reachable()?;

        let in_flight = self.calls.posts_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.calls
            .max_posts_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);
        if let Some(delay) = self.post_delay {
            tokio::time::sleep(delay).await;
        }
        let response = self.respond(request);
        self.calls.posts_in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(response)
    }
}

impl InMemoryPlatform {
    fn respond(&self, request: &SubmissionRequest) -> RawResponse {
        if self.rate_limited {
            return RawResponse {
                status: 429,
                body: json!({"message": "You're submitting flags too fast. Slow down."})
                    .to_string()
                    .into_bytes(),
            };
        }
        let served = self
            .accepted_variants
            .lock()
            .map(|accepted| accepted.as_ref().map_or(true, |a| a.contains(request.variant)))
            .unwrap_or(true);
        if !served {
            return RawResponse {
                status: 404,
                body: b"<html><body>404 Not Found</body></html>".to_vec(),
            };
        }

        let payload = &request.payload;
        let challenge_id = payload
            .get("challenge_id")
            .or_else(|| payload.get("challenge"))
            .and_then(|v| v.as_u64())
            .or_else(|| {
                request
                    .path
                    .strip_prefix("/challenges/")
                    .and_then(|rest| rest.strip_suffix("/attempts"))
                    .and_then(|id| id.parse().ok())
            });
        let submission = payload
            .get("submission")
            .or_else(|| payload.get("flag"))
            .and_then(|v| v.as_str());
        self.answer(challenge_id, submission)
    }
}
