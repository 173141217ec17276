//! Cheap first-pass stuck classification over recent agent output.
//!
//! Pure and stateless: the same output and agent always produce the same
//! result. Agent-specific patterns are checked before the shared set so a
//! family's own authentication or model errors win over generic network
//! phrasing. This runs before any network call is considered.

use std::time::Duration;

use crate::models::StuckAction;

/// A matched diagnosis with its remediation action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StuckMatch {
    pub diagnosis: String,
    pub action: StuckAction,
}

/// (needle, diagnosis, action). Needles are matched case-insensitively as
/// substrings, first match wins.
type Pattern = (&'static str, &'static str, StuckAction);

/// Shared across all agent families. Ordering is deliberate precedence.
const SHARED_PATTERNS: &[Pattern] = &[
    ("rate limit", "rate limited by provider", StuckAction::Retry),
    ("too many requests", "rate limited by provider", StuckAction::Retry),
    ("connection refused", "connection refused", StuckAction::Retry),
    ("network is unreachable", "network unreachable", StuckAction::Escalate),
    ("could not resolve host", "DNS resolution failure", StuckAction::Escalate),
    ("name or service not known", "DNS resolution failure", StuckAction::Escalate),
    ("out of memory", "process out of memory", StuckAction::Kill),
    ("cannot allocate memory", "process out of memory", StuckAction::Kill),
    ("permission denied", "permission denied", StuckAction::Escalate),
    ("quota exceeded", "provider quota exhausted", StuckAction::Kill),
    ("insufficient credits", "billing limit reached", StuckAction::Kill),
    ("billing", "billing limit reached", StuckAction::Kill),
    ("do you want to proceed", "agent is waiting for interactive input", StuckAction::Kill),
    ("(y/n)", "agent is waiting for interactive input", StuckAction::Kill),
    ("press enter to continue", "agent is waiting for interactive input", StuckAction::Kill),
    ("internal server error", "provider returned a 5xx error", StuckAction::Retry),
    ("502 bad gateway", "provider returned a 5xx error", StuckAction::Retry),
    ("503 service unavailable", "provider returned a 5xx error", StuckAction::Retry),
    ("timed out", "request timed out", StuckAction::Retry),
    ("timeout", "request timed out", StuckAction::Retry),
    ("invalid api key", "authentication failure", StuckAction::Kill),
    ("authentication failed", "authentication failure", StuckAction::Kill),
    ("unauthorized", "authentication failure", StuckAction::Kill),
];

/// Claude CLI specific phrasing.
const CLAUDE_PATTERNS: &[Pattern] = &[
    ("credit balance is too low", "claude: credit balance exhausted", StuckAction::Kill),
    ("oauth token has expired", "claude: login expired, re-run `claude login`", StuckAction::Kill),
    ("overloaded_error", "claude: provider overloaded", StuckAction::Retry),
    ("invalid model name", "claude: unknown model requested", StuckAction::Kill),
];

/// Codex CLI specific phrasing.
const CODEX_PATTERNS: &[Pattern] = &[
    ("stream disconnected", "codex: response stream dropped", StuckAction::Retry),
    ("login required", "codex: not logged in", StuckAction::Kill),
    ("sandbox denied", "codex: sandbox blocked an operation", StuckAction::Escalate),
];

/// Output shorter than this after `LONG_RUN` is itself suspicious.
const MIN_MEANINGFUL_OUTPUT: usize = 100;
const LONG_RUN: Duration = Duration::from_secs(300);

fn agent_patterns(agent: &str) -> &'static [Pattern] {
    match agent {
        "claude" => CLAUDE_PATTERNS,
        "codex" => CODEX_PATTERNS,
        _ => &[],
    }
}

/// Classify a bounded window of recent output. Returns the first matching
/// pattern (agent-specific first, then shared), or the "no meaningful
/// output" escalation when a long-running process has produced almost
/// nothing, or `None`.
pub fn match_stuck_patterns(agent: &str, output: &str, elapsed: Duration) -> Option<StuckMatch> {
    let haystack = output.to_lowercase();

    for (needle, diagnosis, action) in agent_patterns(agent).iter().chain(SHARED_PATTERNS) {
        if haystack.contains(needle) {
            return Some(StuckMatch {
                diagnosis: (*diagnosis).to_string(),
                action: *action,
            });
        }
    }

    if elapsed >= LONG_RUN && output.trim().len() < MIN_MEANINGFUL_OUTPUT {
        return Some(StuckMatch {
            diagnosis: format!(
                "no meaningful output after {}s ({} bytes)",
                elapsed.as_secs(),
                output.len()
            ),
            action: StuckAction::Escalate,
        });
    }

    None
}
