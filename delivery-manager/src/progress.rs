//! Durable phased-execution state for one delivery pipeline.
//!
//! The plan is a single JSON document written atomically (temp file + rename)
//! after every state transition, so a crash never leaves a half-written file.
//! It has exactly one writer for the duration of a pipeline run: the phase
//! orchestrator. The structure (sections, todo items) is authored once by the
//! decomposition agent; only status fields mutate afterwards.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

// ============================================================================
// Plan structure
// ============================================================================

/// Status shared by plans, phases, assignments, and reviews.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// One todo item inside a section. Authored by the planner, read-only during
/// execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub description: String,
    #[serde(default)]
    pub done: bool,
}

/// A named group of todo items within an assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub title: String,
    #[serde(default)]
    pub todos: Vec<TodoItem>,
}

/// One worker's scoped work within a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    /// Worker role label ("engineer", "engineer-2").
    pub role: String,
    pub status: PlanStatus,
    /// Registry id of the task executing this assignment, once dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub sections: Vec<Section>,
}

/// The validation pass gating a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub status: PlanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

/// One gated unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    /// 1-based, stable ordering.
    pub number: u32,
    pub name: String,
    pub status: PlanStatus,
    pub assignments: Vec<Assignment>,
    pub review: Review,
}

/// The whole plan for one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub slug: String,
    pub status: PlanStatus,
    /// Zero-based cursor. Equal to `phases.len()` once the plan is complete.
    pub current_phase: usize,
    pub phases: Vec<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Local>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Local>>,
}

impl Plan {
    /// The phase under the cursor, or `None` once past the end.
    pub fn current_phase(&self) -> Option<&Phase> {
        self.phases.get(self.current_phase)
    }

    pub fn current_phase_mut(&mut self) -> Option<&mut Phase> {
        self.phases.get_mut(self.current_phase)
    }

    /// Whether every phase has been completed.
    pub fn is_complete(&self) -> bool {
        self.current_phase >= self.phases.len()
    }

    /// Set an assignment's status in the current phase, optionally attaching
    /// the registry task id.
    pub fn set_assignment_status(
        &mut self,
        assignment_idx: usize,
        status: PlanStatus,
        task_id: Option<String>,
    ) -> Result<()> {
        let phase_no = self.current_phase;
        let assignment = self
            .current_phase_mut()
            .and_then(|p| p.assignments.get_mut(assignment_idx))
            .ok_or_else(|| {
                anyhow!(
                    "no assignment {} in phase index {}",
                    assignment_idx,
                    phase_no
                )
            })?;
        assignment.status = status;
        if let Some(id) = task_id {
            assignment.task_id = Some(id);
        }
        Ok(())
    }

    pub fn set_phase_status(&mut self, status: PlanStatus) -> Result<()> {
        let phase = self
            .current_phase_mut()
            .ok_or_else(|| anyhow!("cursor past the last phase"))?;
        phase.status = status;
        Ok(())
    }

    pub fn set_review_status(&mut self, status: PlanStatus, task_id: Option<String>) -> Result<()> {
        let phase = self
            .current_phase_mut()
            .ok_or_else(|| anyhow!("cursor past the last phase"))?;
        phase.review.status = status;
        if let Some(id) = task_id {
            phase.review.task_id = Some(id);
        }
        Ok(())
    }

    /// Advance the cursor. When it reaches the end, the plan is marked
    /// completed and timestamped.
    pub fn advance_phase(&mut self) {
        if self.current_phase < self.phases.len() {
            self.current_phase += 1;
        }
        if self.is_complete() {
            self.status = PlanStatus::Completed;
            self.completed_at = Some(Local::now());
        }
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// Load a plan from disk.
pub fn load_progress(path: &Path) -> Result<Plan> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read progress file {}", path.display()))?;
    let plan: Plan = serde_json::from_str(&contents)
        .with_context(|| format!("parse progress file {}", path.display()))?;
    Ok(plan)
}

/// Atomically write a plan to disk (write-to-temp then rename).
pub fn save_progress(path: &Path, plan: &Plan) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("progress path {} has no parent", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("create progress directory {}", parent.display()))?;

    let mut buf = serde_json::to_string_pretty(plan).context("serialize plan")?;
    buf.push('\n');

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &buf).with_context(|| format!("write temp progress {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("replace progress file {}", path.display()))?;
    Ok(())
}
