//! Submission endpoint variants and verdict interpretation.
//!
//! CTFd deployments disagree on where flags are posted and how the answer is shaped, so each
//! variant pairs a request builder with a response parser. Callers walk them in order until one
//! produces a verdict.

use ctfsync_core::{SubmissionOutcome, Verdict};
use serde_json::{json, Value as JsonValue};

use crate::{MalformedResponse, RawResponse, RemoteError, SubmissionRequest};

/// What one probe against one variant told us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    Verdict(SubmissionOutcome),
    /// The variant is not served here; try the next one.
    NextVariant(String),
}

type BuildFn = fn(u64, &str) -> (String, JsonValue);
type ParseFn = fn(&RawResponse) -> Result<ProbeResult, RemoteError>;

#[derive(Clone, Copy)]
pub struct SubmissionStrategy {
    pub label: &'static str,
    build: BuildFn,
    parse: ParseFn,
}

impl std::fmt::Debug for SubmissionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionStrategy")
            .field("label", &self.label)
            .finish()
    }
}

impl SubmissionStrategy {
    pub fn request(&self, challenge_id: u64, flag: &str) -> SubmissionRequest {
        let (path, payload) = (self.build)(challenge_id, flag);
        SubmissionRequest {
            variant: self.label,
            path,
            payload,
        }
    }

    pub fn interpret(&self, response: &RawResponse) -> Result<ProbeResult, RemoteError> {
        (self.parse)(response)
    }
}

pub const VARIANT_CHALLENGES_ATTEMPT: &str = "challenges-attempt";
pub const VARIANT_CHALLENGE_ATTEMPTS: &str = "challenge-id-attempts";
pub const VARIANT_SUBMISSIONS: &str = "submissions";
pub const VARIANT_SUBMISSIONS_LEGACY: &str = "submissions-legacy";

/// Probe order for CTFd-compatible platforms.
pub fn default_strategies() -> Vec<SubmissionStrategy> {
    vec![
        SubmissionStrategy {
            label: VARIANT_CHALLENGES_ATTEMPT,
            build: |id, flag| {
                (
                    "/challenges/attempt".to_string(),
                    json!({"challenge_id": id, "submission": flag}),
                )
            },
            parse: parse_verdict,
        },
        SubmissionStrategy {
            label: VARIANT_CHALLENGE_ATTEMPTS,
            build: |id, flag| {
                (
                    format!("/challenges/{id}/attempts"),
                    json!({"submission": flag}),
                )
            },
            parse: parse_verdict,
        },
        SubmissionStrategy {
            label: VARIANT_SUBMISSIONS,
            build: |id, flag| {
                (
                    "/submissions".to_string(),
                    json!({"challenge_id": id, "submission": flag}),
                )
            },
            parse: parse_verdict,
        },
        SubmissionStrategy {
            label: VARIANT_SUBMISSIONS_LEGACY,
            build: |id, flag| {
                (
                    "/submissions".to_string(),
                    json!({"challenge": id, "flag": flag}),
                )
            },
            parse: parse_verdict,
        },
    ]
}

/// Maps a raw submission response onto a verdict.
///
/// 404, 405 and a 403 without a status body mean the variant is not available. 401 is fatal.
/// 429 is a rate limit. Otherwise the body is read as `{"status": .., "message": ..}`, optionally wrapped in the
/// `{"success": .., "data": ..}` envelope. A body that cannot be read moves on to the next variant.
pub fn parse_verdict(response: &RawResponse) -> Result<ProbeResult, RemoteError> {
    if response.status == 401 {
        return Err(RemoteError::Auth { status: 401 });
    }

    let body: Option<JsonValue> = serde_json::from_slice(&response.body).ok();

    // CTFd answers a paused event with 403 and a normal status body.
    let has_status = body
        .as_ref()
        .and_then(|b| b.get("data"))
        .and_then(|d| d.get("status"))
        .is_some_and(JsonValue::is_string);
    if matches!(response.status, 404 | 405) || (response.status == 403 && !has_status) {
        return Ok(ProbeResult::NextVariant(format!(
            "http {} from endpoint",
            response.status
        )));
    }

    if response.status == 429 {
        let message = body
            .as_ref()
            .and_then(|b| find_message(b))
            .unwrap_or_else(|| "rate limited; wait before submitting again".to_string());
        return Ok(ProbeResult::Verdict(SubmissionOutcome::new(
            Verdict::RateLimited,
            message,
        )));
    }

    let Some(body) = body.filter(JsonValue::is_object) else {
        return Ok(ProbeResult::NextVariant("unparseable response body".into()));
    };
    let data = body.get("data").filter(|d| d.is_object()).unwrap_or(&body);
    let message = find_message(data)
        .or_else(|| find_message(&body))
        .unwrap_or_default();

    if let Some(status) = data.get("status").and_then(JsonValue::as_str) {
        let verdict = match status.to_ascii_lowercase().as_str() {
            "correct" | "success" => Verdict::Correct,
            "incorrect" | "wrong" => Verdict::Incorrect,
            "already_solved" => Verdict::AlreadySolved,
            "ratelimited" | "rate_limited" => Verdict::RateLimited,
            "paused" => {
                let message = if message.is_empty() {
                    "the event is paused".to_string()
                } else {
                    message
                };
                return Ok(ProbeResult::Verdict(SubmissionOutcome::new(
                    Verdict::Error,
                    message,
                )));
            }
            other => {
                let message = if message.is_empty() {
                    format!("unrecognized status `{other}`")
                } else {
                    message
                };
                return Ok(ProbeResult::Verdict(SubmissionOutcome::new(
                    Verdict::Error,
                    message,
                )));
            }
        };
        return Ok(ProbeResult::Verdict(SubmissionOutcome::new(verdict, message)));
    }

    let lowered = message.to_ascii_lowercase();
    if lowered.starts_with("correct") {
        return Ok(ProbeResult::Verdict(SubmissionOutcome::new(
            Verdict::Correct,
            message,
        )));
    }
    if lowered.contains("already solved") {
        return Ok(ProbeResult::Verdict(SubmissionOutcome::new(
            Verdict::AlreadySolved,
            message,
        )));
    }

    if (200..300).contains(&response.status) {
        if let Some(success) = body.get("success").and_then(JsonValue::as_bool) {
            let verdict = if success && !lowered.starts_with("incorrect") {
                Verdict::Correct
            } else {
                Verdict::Incorrect
            };
            return Ok(ProbeResult::Verdict(SubmissionOutcome::new(verdict, message)));
        }
        return Ok(ProbeResult::NextVariant(
            MalformedResponse("submission response has neither status nor success".into())
                .to_string(),
        ));
    }

    if !message.is_empty() {
        return Ok(ProbeResult::Verdict(SubmissionOutcome::new(
            Verdict::Error,
            message,
        )));
    }
    Ok(ProbeResult::Verdict(SubmissionOutcome::new(
        Verdict::Error,
        format!("http {} from platform", response.status),
    )))
}

fn find_message(value: &JsonValue) -> Option<String> {
    if let Some(message) = value.get("message").and_then(JsonValue::as_str) {
        return Some(message.trim().to_string());
    }
    // CTFd validation errors: {"errors": {"field": ["text", ..]}}
    let errors = value.get("errors")?.as_object()?;
    let joined: Vec<String> = errors
        .values()
        .flat_map(|v| match v {
            JsonValue::Array(items) => items
                .iter()
                .filter_map(|i| i.as_str().map(str::to_string))
                .collect(),
            JsonValue::String(s) => vec![s.clone()],
            _ => Vec::new(),
        })
        .collect();
    if joined.is_empty() {
        None
    } else {
        Some(joined.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, body: JsonValue) -> RawResponse {
        RawResponse {
            status,
            body: serde_json::to_vec(&body).unwrap(),
        }
    }

    fn verdict_of(result: Result<ProbeResult, RemoteError>) -> Verdict {
        match result.unwrap() {
            ProbeResult::Verdict(outcome) => outcome.verdict,
            ProbeResult::NextVariant(reason) => panic!("expected verdict, got next: {reason}"),
        }
    }

    #[test]
    fn probe_order_and_payloads() {
        let strategies = default_strategies();
        let labels: Vec<_> = strategies.iter().map(|s| s.label).collect();
        assert_eq!(
            labels,
            vec![
                VARIANT_CHALLENGES_ATTEMPT,
                VARIANT_CHALLENGE_ATTEMPTS,
                VARIANT_SUBMISSIONS,
                VARIANT_SUBMISSIONS_LEGACY
            ]
        );
        let second = strategies[1].request(7, "flag{x}");
        assert_eq!(second.path, "/challenges/7/attempts");
        assert_eq!(second.payload, json!({"submission": "flag{x}"}));
        let legacy = strategies[3].request(7, "flag{x}");
        assert_eq!(legacy.payload, json!({"challenge": 7, "flag": "flag{x}"}));
    }

    #[test]
    fn ctfd_envelope_statuses_map_to_verdicts() {
        let ok = response(200, json!({"success": true, "data": {"status": "correct", "message": "Correct"}}));
        assert_eq!(verdict_of(parse_verdict(&ok)), Verdict::Correct);

        let wrong = response(200, json!({"success": true, "data": {"status": "incorrect", "message": "Incorrect"}}));
        assert_eq!(verdict_of(parse_verdict(&wrong)), Verdict::Incorrect);

        let solved = response(200, json!({"success": true, "data": {"status": "already_solved", "message": "You already solved this"}}));
        assert_eq!(verdict_of(parse_verdict(&solved)), Verdict::AlreadySolved);

        let paused = response(403, json!({"success": true, "data": {"status": "paused"}}));
        assert_eq!(verdict_of(parse_verdict(&paused)), Verdict::Error);

        let forbidden = response(403, json!({"message": "Forbidden"}));
        assert!(matches!(
            parse_verdict(&forbidden).unwrap(),
            ProbeResult::NextVariant(_)
        ));
    }

    #[test]
    fn rate_limit_and_unavailable_variants() {
        let limited = response(429, json!({"success": true, "data": {"status": "ratelimited", "message": "slow down"}}));
        match parse_verdict(&limited).unwrap() {
            ProbeResult::Verdict(outcome) => {
                assert_eq!(outcome.verdict, Verdict::RateLimited);
                assert_eq!(outcome.message, "slow down");
            }
            other => panic!("unexpected {other:?}"),
        }

        let missing = RawResponse {
            status: 404,
            body: b"<html>not found</html>".to_vec(),
        };
        assert!(matches!(
            parse_verdict(&missing).unwrap(),
            ProbeResult::NextVariant(_)
        ));

        let html = RawResponse {
            status: 200,
            body: b"<html>login</html>".to_vec(),
        };
        assert!(matches!(
            parse_verdict(&html).unwrap(),
            ProbeResult::NextVariant(_)
        ));

        assert!(matches!(
            parse_verdict(&response(401, json!({}))),
            Err(RemoteError::Auth { status: 401 })
        ));
    }

    #[test]
    fn success_flag_and_message_fallbacks() {
        let bare = response(200, json!({"success": true, "message": "Correct!"}));
        assert_eq!(verdict_of(parse_verdict(&bare)), Verdict::Correct);

        let bare_wrong = response(200, json!({"success": false, "message": "nope"}));
        assert_eq!(verdict_of(parse_verdict(&bare_wrong)), Verdict::Incorrect);

        let validation = response(400, json!({"success": false, "errors": {"submission": ["Missing"]}}));
        match parse_verdict(&validation).unwrap() {
            ProbeResult::Verdict(outcome) => {
                assert_eq!(outcome.verdict, Verdict::Error);
                assert_eq!(outcome.message, "Missing");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
