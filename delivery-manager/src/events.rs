//! Structured event stream emitted by agent processes in `--output-format
//! stream-json` mode.
//!
//! Each stdout line is a JSON object with at least a `type` field. The shape
//! is decoded into a closed set of variants with an `Other` fallback, so new
//! event shapes from newer agent builds degrade to a generic line instead of
//! breaking the stream reader.

use serde_json::Value;

/// One decoded event from the agent's stream.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// Session-level events (`type: "system"`), e.g. model selection.
    System { subtype: String, model: Option<String> },
    /// A tool invocation (`type: "tool_call"`).
    ToolCall { name: String, input: Value },
    /// Terminal result event (`type: "result"`), carries timing.
    Result {
        subtype: String,
        duration_ms: Option<u64>,
    },
    /// Anything unrecognized. Kept so the raw line still reaches the log.
    Other { event_type: String },
}

/// Decode one stream line. Returns `None` for non-JSON lines (agents
/// occasionally emit plain text between events).
pub fn parse_event(line: &str) -> Option<AgentEvent> {
    let value: Value = serde_json::from_str(line.trim()).ok()?;
    let event_type = value.get("type")?.as_str()?.to_string();

    let event = match event_type.as_str() {
        "system" => AgentEvent::System {
            subtype: str_field(&value, "subtype").unwrap_or_default(),
            model: str_field(&value, "model"),
        },
        "tool_call" => AgentEvent::ToolCall {
            name: str_field(&value, "name").unwrap_or_else(|| "unknown".to_string()),
            input: value.get("input").cloned().unwrap_or(Value::Null),
        },
        "result" => AgentEvent::Result {
            subtype: str_field(&value, "subtype").unwrap_or_default(),
            duration_ms: value.get("duration_ms").and_then(|v| v.as_u64()),
        },
        _ => AgentEvent::Other { event_type },
    };
    Some(event)
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(String::from)
}

/// Render an event as a one-line progress indicator for live display.
pub fn render_event(event: &AgentEvent) -> String {
    match event {
        AgentEvent::System { subtype, model } => match model {
            Some(m) => format!("⚙ {} (model: {})", subtype, m),
            None => format!("⚙ {}", subtype),
        },
        AgentEvent::ToolCall { name, input } => render_tool_call(name, input),
        AgentEvent::Result { subtype, duration_ms } => match duration_ms {
            Some(ms) => format!("✓ {} in {:.1}s", subtype, *ms as f64 / 1000.0),
            None => format!("✓ {}", subtype),
        },
        AgentEvent::Other { event_type } => format!("· {}", event_type),
    }
}

/// Tool-specific detail extraction for better progress lines.
fn render_tool_call(name: &str, input: &Value) -> String {
    let path = || input.get("file_path").and_then(|v| v.as_str());
    match name {
        "Read" => match path() {
            Some(p) => format!("📖 Reading: {}", p),
            None => "📖 Reading file".to_string(),
        },
        "Write" => match path() {
            Some(p) => format!("✍ Writing: {}", p),
            None => "✍ Writing file".to_string(),
        },
        "Edit" => match path() {
            Some(p) => format!("✏ Editing: {}", p),
            None => "✏ Editing file".to_string(),
        },
        "Bash" => {
            let command = input.get("command").and_then(|v| v.as_str()).unwrap_or("");
            format!("⚡ Running: {}", truncate(command, 80))
        }
        "Grep" => {
            let pattern = input.get("pattern").and_then(|v| v.as_str()).unwrap_or("?");
            let path = input.get("path").and_then(|v| v.as_str()).unwrap_or(".");
            format!("🔍 Searching: \"{}\" in {}", pattern, path)
        }
        "Glob" => {
            let pattern = input.get("pattern").and_then(|v| v.as_str()).unwrap_or("?");
            format!("📂 Finding: {}", pattern)
        }
        _ => format!("🔧 Using tool: {}", name),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() > max {
        let cut = s
            .char_indices()
            .take_while(|(i, _)| *i < max.saturating_sub(3))
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}...", &s[..cut])
    } else {
        s.to_string()
    }
}
