//! Shared status enums and agent descriptors used across the pipeline.

use serde::{Deserialize, Serialize};

// ============================================================================
// Task lifecycle
// ============================================================================

/// Lifecycle status of one spawned agent process.
///
/// A task starts `Running` and reaches exactly one terminal status. Tasks are
/// never deleted from the registry, only terminalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
    Stuck,
    Killed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Stuck => "stuck",
            TaskStatus::Killed => "killed",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "stuck" => Ok(TaskStatus::Stuck),
            "killed" => Ok(TaskStatus::Killed),
            other => Err(anyhow::anyhow!("unknown task status '{}'", other)),
        }
    }

    /// Whether this status is terminal (the process is no longer supervised).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

// ============================================================================
// Job run lifecycle
// ============================================================================

/// Status of one scheduled invocation of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "skipped" => Ok(RunStatus::Skipped),
            other => Err(anyhow::anyhow!("unknown run status '{}'", other)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Skipped
        )
    }
}

// ============================================================================
// Stuck detection
// ============================================================================

/// Remediation action attached to a stuck-pattern match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StuckAction {
    /// Terminate the process; the failure is unrecoverable (auth, quota, OOM).
    Kill,
    /// Terminate the process but flag the result as worth re-running.
    Retry,
    /// Leave the process running and surface it for manual intervention.
    Escalate,
}

/// Verdict from stuck detection (pattern match or model diagnosis).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Continue,
    Kill,
    Retry,
    Escalate,
}

impl Verdict {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "continue" => Some(Verdict::Continue),
            "kill" => Some(Verdict::Kill),
            "retry" => Some(Verdict::Retry),
            "escalate" => Some(Verdict::Escalate),
            _ => None,
        }
    }

    /// The action this verdict maps to, or `None` for `continue`.
    pub fn action(&self) -> Option<StuckAction> {
        match self {
            Verdict::Continue => None,
            Verdict::Kill => Some(StuckAction::Kill),
            Verdict::Retry => Some(StuckAction::Retry),
            Verdict::Escalate => Some(StuckAction::Escalate),
        }
    }
}

// ============================================================================
// Agent descriptor
// ============================================================================

/// How the dispatcher renders a task's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Full terminal pass-through. No log file, liveness polled only.
    Terminal,
    /// Raw byte capture to the task's log file.
    Capture,
    /// Structured JSON event stream: parsed for live display, raw lines
    /// still appended to the log for later stuck-pattern inspection.
    Stream,
}

/// Descriptor for an invocable agent CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Agent family name ("claude", "codex"). Selects the agent-specific
    /// stuck-pattern set.
    pub name: String,
    /// The executable to invoke.
    pub command: String,
    /// Preferred model, passed as `--model` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl AgentProfile {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            model: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}
