//! Model-backed stuck diagnosis, used only after pattern matching found
//! nothing and the silence window has elapsed.
//!
//! The model sees the agent name, timing, and the tail of the log, and must
//! answer with a JSON verdict. A false positive here kills a working agent,
//! which costs more than waiting, so the instruction biases toward
//! `continue`. Anything unparseable is coerced to `escalate` with zero
//! confidence rather than being treated as healthy.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::config::Settings;
use crate::models::Verdict;

/// How much of the log tail is shown to the model.
pub const DIAGNOSIS_TAIL_CHARS: usize = 4000;

const SYSTEM_INSTRUCTION: &str = "You are supervising an autonomous coding agent \
that has gone silent. Decide whether it is stuck. Respond with a single JSON \
object: {\"verdict\": \"continue|kill|retry|escalate\", \"diagnosis\": \"<one \
sentence>\", \"confidence\": <0.0-1.0>}. Verdicts: continue = the agent looks \
busy with legitimate long-running work, keep waiting; kill = the agent hit an \
unrecoverable error and should be terminated; retry = a transient \
infrastructure failure, terminate and suggest re-running; escalate = unclear, \
a human should look. Prefer continue when in doubt: killing a working agent is \
more costly than waiting another interval.";

/// A parsed diagnosis verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct StuckDiagnosis {
    pub verdict: Verdict,
    pub diagnosis: String,
    pub confidence: f64,
}

/// Source of model-backed verdicts. The monitor depends on this trait so
/// tests can script diagnoses without a network.
#[async_trait]
pub trait DiagnosisProvider: Send + Sync {
    async fn diagnose(
        &self,
        agent: &str,
        elapsed: Duration,
        silence: Duration,
        output_tail: &str,
    ) -> Result<StuckDiagnosis>;
}

/// Thin client over an OpenAI-compatible chat-completions endpoint.
#[derive(Clone)]
pub struct DiagnosisClient {
    http: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    model: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Deserialize)]
struct RawVerdict {
    verdict: String,
    #[serde(default)]
    diagnosis: String,
    #[serde(default)]
    confidence: f64,
}

impl DiagnosisClient {
    /// Build a client from settings. `None` when no endpoint is configured,
    /// a recoverable condition the monitor handles with a time heuristic.
    pub fn from_settings(settings: &Settings) -> Option<Self> {
        let api_url = settings.model_api_url.clone()?;
        Some(Self {
            http: reqwest::Client::new(),
            api_url,
            api_key: settings.model_api_key.clone(),
            model: settings.model_name.clone(),
        })
    }
}

#[async_trait]
impl DiagnosisProvider for DiagnosisClient {
    /// Ask the model for a verdict on a silent agent.
    ///
    /// Network or HTTP failures return `Err` (the caller falls back to a
    /// conservative heuristic); a response that cannot be parsed as a known
    /// verdict returns `escalate` with confidence 0.0.
    async fn diagnose(
        &self,
        agent: &str,
        elapsed: Duration,
        silence: Duration,
        output_tail: &str,
    ) -> Result<StuckDiagnosis> {
        let tail = tail_chars(output_tail, DIAGNOSIS_TAIL_CHARS);
        let user_prompt = format!(
            "Agent: {}\nTotal runtime: {}s\nSilent for: {}s\n\nRecent output:\n{}",
            agent,
            elapsed.as_secs(),
            silence.as_secs(),
            tail
        );

        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_INSTRUCTION},
                {"role": "user", "content": user_prompt},
            ],
        });

        let mut request = self.http.post(&self.api_url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .context("send diagnosis request")?
            .error_for_status()
            .context("diagnosis request rejected")?;

        let parsed: ChatResponse = response
            .json()
            .await
            .context("decode diagnosis response envelope")?;
        let content = parsed
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| anyhow!("diagnosis response had no choices"))?;

        Ok(parse_verdict(content))
    }
}

/// Parse the model's free-text answer. Never errors: anything that is not a
/// recognizable verdict becomes `escalate` with zero confidence.
pub fn parse_verdict(content: &str) -> StuckDiagnosis {
    let stripped = strip_code_fence(content);
    match serde_json::from_str::<RawVerdict>(stripped) {
        Ok(raw) => match Verdict::parse(&raw.verdict) {
            Some(verdict) => StuckDiagnosis {
                verdict,
                diagnosis: raw.diagnosis,
                confidence: raw.confidence.clamp(0.0, 1.0),
            },
            None => StuckDiagnosis {
                verdict: Verdict::Escalate,
                diagnosis: format!("unrecognized verdict '{}' from model", raw.verdict),
                confidence: 0.0,
            },
        },
        Err(_) => StuckDiagnosis {
            verdict: Verdict::Escalate,
            diagnosis: "model response was not valid verdict JSON".to_string(),
            confidence: 0.0,
        },
    }
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

/// Last `max` characters of the output, on a char boundary.
fn tail_chars(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
