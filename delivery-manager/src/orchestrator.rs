//! The delivery loop: drives one plan phase by phase to completion.
//!
//! Ordering is strict. Phases run in index order; every assignment in a
//! phase reaches a terminal state before the review is dispatched; the review
//! terminates before the cursor advances. Dual-assignment phases run their
//! workers concurrently in separate worktrees and join before the merge.
//!
//! The orchestrator is the single writer of the progress file for the
//! duration of a run, persisting after every state transition so a crash can
//! be resumed from the cursor.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Local;
use futures::future::join_all;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::config::Settings;
use crate::database::Database;
use crate::diagnosis::{DiagnosisClient, DiagnosisProvider};
use crate::dispatch::{dispatch_agent, DispatchRequest};
use crate::git_ops::GitOps;
use crate::models::{AgentProfile, OutputMode, TaskStatus};
use crate::monitor::{monitor_task, MonitorConfig, UnixProcess};
use crate::progress::{load_progress, save_progress, Plan, PlanStatus};
use crate::prompts::{phase_worker_prompt, progress_path, read_notes, review_prompt};

/// One unit of agent work at the orchestration level.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub prompt: String,
    pub workdir: PathBuf,
    pub command_label: String,
}

/// Terminal result of one unit of agent work.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub diagnosis: Option<String>,
    pub log_path: Option<PathBuf>,
}

impl TaskResult {
    pub fn succeeded(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    /// Human-readable failure reason with a pointer to the log.
    pub fn failure_reason(&self) -> String {
        let cause = match (&self.diagnosis, self.exit_code) {
            (Some(d), _) => d.clone(),
            (None, Some(code)) => format!("exit code {}", code),
            (None, None) => "unknown failure".to_string(),
        };
        match &self.log_path {
            Some(log) => format!("{} (log: {})", cause, log.display()),
            None => cause,
        }
    }
}

/// Dispatch-and-supervise seam. The production implementation spawns a real
/// agent process and monitors it; tests script outcomes.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, req: TaskRequest) -> Result<TaskResult>;
}

/// Real runner: dispatch the agent, then supervise it to a terminal state.
pub struct AgentTaskRunner {
    pub db: Database,
    pub settings: Settings,
    pub agent: AgentProfile,
    pub project: String,
    pub output_mode: OutputMode,
    pub diagnosis: Option<DiagnosisClient>,
}

impl AgentTaskRunner {
    pub fn new(db: Database, settings: Settings, agent: AgentProfile, project: String) -> Self {
        let diagnosis = DiagnosisClient::from_settings(&settings);
        Self {
            db,
            settings,
            agent,
            project,
            output_mode: OutputMode::Stream,
            diagnosis,
        }
    }
}

#[async_trait]
impl TaskRunner for AgentTaskRunner {
    async fn run(&self, req: TaskRequest) -> Result<TaskResult> {
        let dispatch = DispatchRequest {
            agent: self.agent.clone(),
            prompt: req.prompt,
            workdir: req.workdir,
            output_mode: self.output_mode,
            command_label: req.command_label,
            project: self.project.clone(),
        };
        let handle = dispatch_agent(&self.db, &self.settings, &dispatch).await?;
        let proc = UnixProcess::from_handle(&handle);
        let config = MonitorConfig {
            poll_interval: self.settings.poll_interval,
            output_timeout: self.settings.output_timeout,
        };
        let provider = self.diagnosis.as_ref().map(|c| c as &dyn DiagnosisProvider);

        let outcome = monitor_task(
            &self.db,
            &handle.task_id,
            &handle.agent_name,
            handle.output_mode,
            &proc,
            provider,
            &config,
        )
        .await?;

        let (status, exit_code) = if outcome.status == TaskStatus::Stuck {
            // Escalation leaves the process alive; the pipeline blocks here
            // until it exits on its own or someone kills it by hand.
            warn!(
                task_id = %handle.task_id,
                pid = outcome.pid,
                "task escalated, waiting for process exit"
            );
            let code = loop {
                if let Some(code) = handle.exit_code() {
                    break code;
                }
                sleep(self.settings.poll_interval).await;
            };
            let status = if code == 0 {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };
            self.db.complete_task(&handle.task_id, code, status)?;
            (status, Some(code))
        } else {
            (outcome.status, outcome.exit_code)
        };

        Ok(TaskResult {
            task_id: handle.task_id,
            status,
            exit_code,
            diagnosis: outcome.diagnosis,
            log_path: handle.log_path,
        })
    }
}

/// Aggregate outcome of a completed delivery loop.
#[derive(Debug, Clone)]
pub struct DeliveryMetrics {
    pub phases_completed: usize,
    pub phases_total: usize,
    pub elapsed: Duration,
}

/// Drives one plan, rooted in the pipeline's main worktree.
pub struct Orchestrator<'a> {
    pub runner: &'a dyn TaskRunner,
    pub git: &'a GitOps,
    /// The pipeline's exclusive worktree, where the progress file lives.
    pub workdir: PathBuf,
    pub base_branch: String,
}

impl Orchestrator<'_> {
    pub async fn run(&self, slug: &str) -> Result<DeliveryMetrics> {
        let started = Instant::now();
        let progress_file = self.workdir.join(progress_path(slug));

        let mut plan = load_progress(&progress_file)
            .with_context(|| format!("load plan for delivery {}", slug))?;
        let phases_total = plan.phases.len();
        plan.status = PlanStatus::InProgress;
        if plan.started_at.is_none() {
            plan.started_at = Some(Local::now());
        }
        save_progress(&progress_file, &plan)?;

        while let Some(phase) = plan.current_phase().cloned() {
            info!(slug, phase = phase.number, name = %phase.name, "starting phase");
            plan.set_phase_status(PlanStatus::InProgress)?;
            for idx in 0..phase.assignments.len() {
                plan.set_assignment_status(idx, PlanStatus::InProgress, None)?;
            }
            save_progress(&progress_file, &plan)?;

            let run_result = self
                .run_phase_assignments(&mut plan, &progress_file, slug, &phase)
                .await?;
            let conflicts = match run_result {
                PhaseWork::Failed(reason) => {
                    self.fail_plan(&mut plan, &progress_file)?;
                    bail!("phase {} failed: {}", phase.number, reason);
                }
                PhaseWork::Done { conflicts } => conflicts,
            };

            // Review gates the phase. Conflicts from the merge are handed to
            // the reviewer, not treated as a phase failure.
            let notes = read_notes(&self.workdir, slug);
            let review = self
                .runner
                .run(TaskRequest {
                    prompt: review_prompt(&plan, &phase, &conflicts, notes.as_deref()),
                    workdir: self.workdir.clone(),
                    command_label: format!("review-phase-{}", phase.number),
                })
                .await;
            match review {
                Ok(result) if result.succeeded() => {
                    plan.set_review_status(PlanStatus::Completed, Some(result.task_id))?;
                }
                Ok(result) => {
                    plan.set_review_status(PlanStatus::Failed, Some(result.task_id.clone()))?;
                    plan.set_phase_status(PlanStatus::Failed)?;
                    self.fail_plan(&mut plan, &progress_file)?;
                    bail!(
                        "phase {} review failed: {}",
                        phase.number,
                        result.failure_reason()
                    );
                }
                Err(e) => {
                    plan.set_review_status(PlanStatus::Failed, None)?;
                    plan.set_phase_status(PlanStatus::Failed)?;
                    self.fail_plan(&mut plan, &progress_file)?;
                    return Err(e.context(format!("phase {} review", phase.number)));
                }
            }

            plan.set_phase_status(PlanStatus::Completed)?;
            plan.advance_phase();
            save_progress(&progress_file, &plan)?;
            info!(slug, phase = phase.number, "phase completed");
        }

        Ok(DeliveryMetrics {
            phases_completed: phases_total,
            phases_total,
            elapsed: started.elapsed(),
        })
    }

    /// Run all assignments of one phase to the join barrier, then merge
    /// worker branches when there was more than one.
    async fn run_phase_assignments(
        &self,
        plan: &mut Plan,
        progress_file: &std::path::Path,
        slug: &str,
        phase: &crate::progress::Phase,
    ) -> Result<PhaseWork> {
        let workers = phase.assignments.len();

        // A git failure here is a phase failure like any other: the plan must
        // not be left in_progress when the run reports an error.
        let workspaces = if workers > 1 {
            match self
                .git
                .setup_phase_branches(slug, &self.base_branch, phase.number as usize, workers)
                .await
            {
                Ok(ws) => Some(ws),
                Err(e) => {
                    plan.set_phase_status(PlanStatus::Failed)?;
                    save_progress(progress_file, plan)?;
                    return Ok(PhaseWork::Failed(format!(
                        "setting up phase {} branches: {:#}",
                        phase.number, e
                    )));
                }
            }
        } else {
            None
        };

        let mut futures = Vec::with_capacity(workers);
        for (idx, _assignment) in phase.assignments.iter().enumerate() {
            let workdir = match &workspaces {
                Some(ws) => ws[idx].dir.clone(),
                None => self.workdir.clone(),
            };
            let notes = read_notes(&self.workdir, slug);
            let request = TaskRequest {
                prompt: phase_worker_prompt(plan, phase, idx, notes.as_deref()),
                workdir,
                command_label: format!("{}-phase-{}", phase.assignments[idx].role, phase.number),
            };
            futures.push(self.runner.run(request));
        }
        // Join barrier: every assignment reaches a terminal state before the
        // phase can advance, even when one of them already failed.
        let results = join_all(futures).await;

        let mut failure: Option<String> = None;
        for (idx, result) in results.iter().enumerate() {
            match result {
                Ok(r) if r.succeeded() => {
                    plan.set_assignment_status(
                        idx,
                        PlanStatus::Completed,
                        Some(r.task_id.clone()),
                    )?;
                }
                Ok(r) => {
                    plan.set_assignment_status(idx, PlanStatus::Failed, Some(r.task_id.clone()))?;
                    failure.get_or_insert_with(|| {
                        format!(
                            "assignment `{}` failed: {}",
                            phase.assignments[idx].role,
                            r.failure_reason()
                        )
                    });
                }
                Err(e) => {
                    plan.set_assignment_status(idx, PlanStatus::Failed, None)?;
                    failure.get_or_insert_with(|| {
                        format!("assignment `{}` failed: {:#}", phase.assignments[idx].role, e)
                    });
                }
            }
        }
        save_progress(progress_file, plan)?;

        if let Some(reason) = failure {
            if let Some(ws) = &workspaces {
                for w in ws {
                    self.git.cleanup_worktree(&w.dir).await;
                }
            }
            plan.set_phase_status(PlanStatus::Failed)?;
            return Ok(PhaseWork::Failed(reason));
        }

        let mut conflicts = Vec::new();
        if let Some(ws) = workspaces {
            let branches: Vec<String> = ws.iter().map(|w| w.branch.clone()).collect();
            let outcome = match self.git.merge_phase_branches(&self.workdir, &branches).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    for w in &ws {
                        self.git.cleanup_worktree(&w.dir).await;
                    }
                    plan.set_phase_status(PlanStatus::Failed)?;
                    save_progress(progress_file, plan)?;
                    return Ok(PhaseWork::Failed(format!(
                        "merging phase {} branches: {:#}",
                        phase.number, e
                    )));
                }
            };
            if !outcome.clean {
                warn!(
                    phase = phase.number,
                    files = outcome.conflicts.len(),
                    "phase merged with conflicts, deferring to review"
                );
            }
            conflicts = outcome.conflicts;
            for w in &ws {
                self.git.cleanup_worktree(&w.dir).await;
            }
        }
        Ok(PhaseWork::Done { conflicts })
    }

    fn fail_plan(&self, plan: &mut Plan, progress_file: &std::path::Path) -> Result<()> {
        plan.status = PlanStatus::Failed;
        save_progress(progress_file, plan)
    }
}

enum PhaseWork {
    Done { conflicts: Vec<String> },
    Failed(String),
}
