//! The submission state machine.
//!
//! One engine lives for one client. The first endpoint variant that answers with a verdict is
//! remembered and used directly for every later submission through the same engine.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use ctfsync_adapters::{
    default_strategies, PlatformClient, ProbeResult, RemoteError, SubmissionStrategy,
};
use ctfsync_core::{mask_flag, SubmissionAttempt, SubmissionOutcome, Verdict};
use ctfsync_storage::{AttemptLog, WorkspaceStore};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{ChallengeTarget, ResolvedFlag, SubmitError};

/// What a dry run would have posted. The flag in `payload` is masked.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DryRunPreview {
    pub challenge_id: u64,
    pub masked_flag: String,
    pub variant: &'static str,
    pub path: String,
    pub payload: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionReceipt {
    pub attempt: SubmissionAttempt,
    pub marked_solved: bool,
}

impl SubmissionReceipt {
    pub fn verdict(&self) -> Verdict {
        self.attempt.verdict
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitResult {
    DryRun(DryRunPreview),
    Attempted(SubmissionReceipt),
}

pub struct SubmissionEngine<C, S> {
    client: C,
    store: S,
    log: AttemptLog,
    strategies: Vec<SubmissionStrategy>,
    cached_variant: Mutex<Option<usize>>,
    known_solved: Mutex<BTreeSet<u64>>,
    in_flight: Mutex<BTreeMap<u64, Arc<Mutex<()>>>>,
}

impl<C, S> SubmissionEngine<C, S>
where
    C: PlatformClient,
    S: WorkspaceStore,
{
    pub fn new(client: C, store: S, log: AttemptLog) -> Self {
        Self::with_strategies(client, store, log, default_strategies())
    }

    pub fn with_strategies(
        client: C,
        store: S,
        log: AttemptLog,
        strategies: Vec<SubmissionStrategy>,
    ) -> Self {
        Self {
            client,
            store,
            log,
            strategies,
            cached_variant: Mutex::new(None),
            known_solved: Mutex::new(BTreeSet::new()),
            in_flight: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn log(&self) -> &AttemptLog {
        &self.log
    }

    /// Label of the variant remembered from an earlier probe.
    pub async fn cached_variant(&self) -> Option<&'static str> {
        self.cached_variant
            .lock()
            .await
            .and_then(|i| self.strategies.get(i))
            .map(|s| s.label)
    }

    /// Pulls the solved set from the challenge list so known solves are not resubmitted.
    pub async fn load_remote_solved(&self) -> Result<usize, RemoteError> {
        let summaries = self.client.list_challenges().await?;
        let mut known = self.known_solved.lock().await;
        for summary in summaries.iter().filter(|s| s.solved_by_me) {
            known.insert(summary.id);
        }
        Ok(known.len())
    }

    pub async fn submit(
        &self,
        target: &ChallengeTarget,
        flag: &ResolvedFlag,
        dry_run: bool,
    ) -> Result<SubmitResult, SubmitError> {
        let span = info_span!("submit", challenge_id = target.id, dry_run);
        if dry_run {
            return Ok(SubmitResult::DryRun(self.preview(target, flag).await));
        }
        self.attempt(target, flag)
            .instrument(span)
            .await
            .map(SubmitResult::Attempted)
    }

    async fn preview(&self, target: &ChallengeTarget, flag: &ResolvedFlag) -> DryRunPreview {
        let index = self.cached_variant.lock().await.unwrap_or(0);
        let masked_flag = mask_flag(&flag.value);
        let (variant, path, payload) = match self.strategies.get(index) {
            Some(strategy) => {
                let request = strategy.request(target.id, &masked_flag);
                (request.variant, request.path, request.payload)
            }
            None => ("none", String::new(), JsonValue::Null),
        };
        DryRunPreview {
            challenge_id: target.id,
            masked_flag,
            variant,
            path,
            payload,
        }
    }

    async fn attempt(
        &self,
        target: &ChallengeTarget,
        flag: &ResolvedFlag,
    ) -> Result<SubmissionReceipt, SubmitError> {
        let lock = {
            let mut in_flight = self.in_flight.lock().await;
            in_flight.entry(target.id).or_default().clone()
        };
        let _guard = lock.lock().await;

        let already_known = target.locally_solved
            || self.known_solved.lock().await.contains(&target.id);
        if already_known {
            let outcome = SubmissionOutcome::new(
                Verdict::AlreadySolved,
                "already solved; not resubmitted",
            );
            let attempt = SubmissionAttempt::record(target.id, &flag.value, None, &outcome);
            self.log.append(&attempt).await?;
            info!("skipped known solve");
            return Ok(SubmissionReceipt {
                attempt,
                marked_solved: false,
            });
        }

        let (variant, outcome) = match self.post_with_probe(target.id, &flag.value).await {
            Ok(result) => result,
            Err(err) => {
                let outcome = SubmissionOutcome::new(Verdict::Error, err.to_string());
                let attempt = SubmissionAttempt::record(target.id, &flag.value, None, &outcome);
                self.log.append(&attempt).await?;
                return Err(SubmitError::Remote(err));
            }
        };

        let mut marked_solved = false;
        let mut mark_error = None;
        match outcome.verdict {
            Verdict::Correct | Verdict::AlreadySolved => {
                self.known_solved.lock().await.insert(target.id);
                if outcome.verdict == Verdict::Correct {
                    if let Some(dir) = &target.dir {
                        match self.store.mark_solved(dir, &flag.value).await {
                            Ok(()) => marked_solved = true,
                            Err(err) => mark_error = Some(err),
                        }
                    }
                }
            }
            Verdict::RateLimited => warn!(message = %outcome.message, "rate limited"),
            Verdict::Incorrect | Verdict::Error => {}
        }

        // Logged even when the solved marker could not be written.
        let attempt = SubmissionAttempt::record(target.id, &flag.value, variant, &outcome);
        self.log.append(&attempt).await?;
        info!(verdict = %outcome.verdict, variant, "submission recorded");
        if let Some(err) = mark_error {
            return Err(SubmitError::Workspace(
                err.context("flag accepted but the workspace could not be marked solved"),
            ));
        }
        Ok(SubmissionReceipt {
            attempt,
            marked_solved,
        })
    }

    /// Tries the cached variant first, then every other variant in order.
    async fn post_with_probe(
        &self,
        challenge_id: u64,
        flag: &str,
    ) -> Result<(Option<&'static str>, SubmissionOutcome), RemoteError> {
        let cached = *self.cached_variant.lock().await;

        if let Some(index) = cached {
            if let Some(strategy) = self.strategies.get(index) {
                match self.try_strategy(strategy, challenge_id, flag).await? {
                    ProbeResult::Verdict(outcome) => return Ok((Some(strategy.label), outcome)),
                    ProbeResult::NextVariant(reason) => {
                        warn!(variant = strategy.label, %reason, "cached variant stopped answering");
                        let mut current = self.cached_variant.lock().await;
                        if *current == Some(index) {
                            *current = None;
                        }
                    }
                }
            }
        }

        let mut last_reason = String::from("no submission variants configured");
        for (index, strategy) in self.strategies.iter().enumerate() {
            if cached == Some(index) {
                continue;
            }
            match self.try_strategy(strategy, challenge_id, flag).await? {
                ProbeResult::Verdict(outcome) => {
                    *self.cached_variant.lock().await = Some(index);
                    return Ok((Some(strategy.label), outcome));
                }
                ProbeResult::NextVariant(reason) => {
                    debug!(variant = strategy.label, %reason, "variant not served");
                    last_reason = reason;
                }
            }
        }

        Ok((
            None,
            SubmissionOutcome::new(
                Verdict::Error,
                format!("no submission endpoint accepted the request ({last_reason})"),
            ),
        ))
    }

    async fn try_strategy(
        &self,
        strategy: &SubmissionStrategy,
        challenge_id: u64,
        flag: &str,
    ) -> Result<ProbeResult, RemoteError> {
        let request = strategy.request(challenge_id, flag);
        let response = self.client.post_submission(&request).await?;
        strategy.interpret(&response)
    }
}
