//! Manifest parsing and sequential bulk submission.

use ctfsync_adapters::PlatformClient;
use ctfsync_core::{mask_flag, Verdict};
use ctfsync_storage::WorkspaceStore;
use serde::Serialize;
use tracing::{info, warn};

use crate::engine::{SubmissionEngine, SubmitResult};
use crate::{resolve_challenge, FlagSource, ResolvedFlag};

pub const DEFAULT_DELIMITER: &str = ":";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    pub line: usize,
    pub challenge_id: u64,
    pub flag: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MalformedLine {
    pub line: usize,
    pub content: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
    pub malformed: Vec<MalformedLine>,
}

/// Parses `id<delimiter>flag` lines. Blank lines and `#` comments are ignored; anything else
/// that does not parse is kept as malformed. The flag is everything after the first delimiter.
pub fn parse_manifest(text: &str, delimiter: &str) -> Manifest {
    let delimiter = if delimiter.is_empty() {
        DEFAULT_DELIMITER
    } else {
        delimiter
    };
    let mut manifest = Manifest::default();

    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let malformed = |reason: &str| MalformedLine {
            line,
            content: trimmed.to_string(),
            reason: reason.to_string(),
        };

        let Some((id, flag)) = trimmed.split_once(delimiter) else {
            manifest
                .malformed
                .push(malformed(&format!("missing `{delimiter}` delimiter")));
            continue;
        };
        let Ok(challenge_id) = id.trim().parse::<u64>() else {
            manifest
                .malformed
                .push(malformed("challenge id is not a number"));
            continue;
        };
        let flag = flag.trim();
        if flag.is_empty() {
            manifest.malformed.push(malformed("empty flag"));
            continue;
        }
        manifest.entries.push(ManifestEntry {
            line,
            challenge_id,
            flag: flag.to_string(),
        });
    }
    manifest
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkItem {
    pub line: usize,
    pub challenge_id: u64,
    pub masked_flag: String,
    pub verdict: Verdict,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkReport {
    pub items: Vec<BulkItem>,
    pub malformed: Vec<MalformedLine>,
    pub correct: usize,
    pub incorrect: usize,
    pub already_solved: usize,
    pub rate_limited: usize,
    pub errors: usize,
}

impl BulkReport {
    /// Entries that reached the engine; malformed lines are excluded.
    pub fn attempted(&self) -> usize {
        self.items.len()
    }

    pub fn success_percentage(&self) -> f64 {
        if self.items.is_empty() {
            return 0.0;
        }
        self.correct as f64 * 100.0 / self.items.len() as f64
    }

    fn push(&mut self, item: BulkItem) {
        match item.verdict {
            Verdict::Correct => self.correct += 1,
            Verdict::Incorrect => self.incorrect += 1,
            Verdict::AlreadySolved => self.already_solved += 1,
            Verdict::RateLimited => self.rate_limited += 1,
            Verdict::Error => self.errors += 1,
        }
        self.items.push(item);
    }
}

/// Runs every manifest entry through the engine, one at a time.
///
/// A failing entry becomes an `Error` row and the run continues.
pub async fn submit_bulk<C, S>(engine: &SubmissionEngine<C, S>, manifest: &Manifest) -> BulkReport
where
    C: PlatformClient,
    S: WorkspaceStore,
{
    let mut report = BulkReport {
        malformed: manifest.malformed.clone(),
        ..BulkReport::default()
    };

    if !manifest.entries.is_empty() {
        if let Err(err) = engine.load_remote_solved().await {
            warn!(error = %err, "could not load solved challenges; submitting without them");
        }
    }

    for entry in &manifest.entries {
        let flag = ResolvedFlag {
            value: entry.flag.clone(),
            source: FlagSource::Argument,
        };
        let result = match resolve_challenge(engine.store(), Some(entry.challenge_id), None).await {
            Ok(target) => engine.submit(&target, &flag, false).await,
            Err(err) => Err(err),
        };
        let (verdict, message) = match result {
            Ok(SubmitResult::Attempted(receipt)) => {
                (receipt.attempt.verdict, receipt.attempt.message)
            }
            Ok(SubmitResult::DryRun(_)) => continue,
            Err(err) => (Verdict::Error, format!("{err:#}")),
        };
        info!(line = entry.line, challenge_id = entry.challenge_id, %verdict, "bulk entry done");
        report.push(BulkItem {
            line: entry.line,
            challenge_id: entry.challenge_id,
            masked_flag: mask_flag(&entry.flag),
            verdict,
            message,
        });
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_skips_comments_and_counts_malformed() {
        let manifest = parse_manifest(
            "# round one\n\n15:flag{a}\nnot a line\nabc:flag{b}\n 7 : flag{c:d} \n9:\n",
            ":",
        );
        assert_eq!(
            manifest.entries,
            vec![
                ManifestEntry {
                    line: 3,
                    challenge_id: 15,
                    flag: "flag{a}".into()
                },
                ManifestEntry {
                    line: 6,
                    challenge_id: 7,
                    flag: "flag{c:d}".into()
                },
            ]
        );
        let lines: Vec<usize> = manifest.malformed.iter().map(|m| m.line).collect();
        assert_eq!(lines, vec![4, 5, 7]);
    }

    #[test]
    fn custom_delimiter() {
        let manifest = parse_manifest("3|flag{x:y}\n4:flag{z}\n", "|");
        assert_eq!(manifest.entries.len(), 1);
        assert_eq!(manifest.entries[0].flag, "flag{x:y}");
        assert_eq!(manifest.malformed.len(), 1);
    }

    #[test]
    fn percentage_excludes_malformed() {
        let mut report = BulkReport::default();
        assert_eq!(report.success_percentage(), 0.0);
        for verdict in [Verdict::Correct, Verdict::Incorrect] {
            report.push(BulkItem {
                line: 1,
                challenge_id: 1,
                masked_flag: String::new(),
                verdict,
                message: String::new(),
            });
        }
        report.malformed.push(MalformedLine {
            line: 2,
            content: "x".into(),
            reason: "r".into(),
        });
        assert_eq!(report.attempted(), 2);
        assert_eq!(report.success_percentage(), 50.0);
    }
}
