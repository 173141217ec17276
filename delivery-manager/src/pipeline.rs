//! The end-to-end delivery pipeline for one request.
//!
//! Stages: repository checks, feature branch + exclusive worktree, planning
//! (PRD), decomposition (phased plan), the phase orchestrator, a post-mortem,
//! then a pull request. Each agent stage is followed by a structural check on
//! the artifact it was asked to produce: an agent exiting successfully
//! without its artifact is a failure, diagnosed with a pointer to the task
//! log.
//!
//! On failure the worktree is deliberately left in place so a human can
//! inspect exactly what the agents did.

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::git_ops::{GitOps, MAX_PHASE_WORKERS};
use crate::orchestrator::{Orchestrator, TaskRequest, TaskRunner};
use crate::progress::load_progress;
use crate::prompts::{
    decomposition_prompt, postmortem_path, postmortem_prompt, prd_path, prd_prompt, progress_path,
};

/// What a finished pipeline run produced.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub slug: String,
    pub branch: String,
    /// `None` when no remote or no PR tooling was available.
    pub pr_url: Option<String>,
}

/// One delivery pipeline over one project checkout.
pub struct Pipeline<'a> {
    pub runner: &'a dyn TaskRunner,
    pub git: &'a GitOps,
    pub project_name: String,
    /// 1 for the single-engineer topology, 2 for dual.
    pub workers_per_phase: usize,
}

impl Pipeline<'_> {
    pub async fn deliver(&self, request: &str) -> Result<PipelineOutcome> {
        if self.workers_per_phase == 0 || self.workers_per_phase > MAX_PHASE_WORKERS {
            bail!(
                "workers_per_phase must be 1..={}, got {}",
                MAX_PHASE_WORKERS,
                self.workers_per_phase
            );
        }

        self.git.ensure_repo().await?;
        self.git.ensure_clean().await?;

        let slug = make_slug(request);
        let branch = self.git.create_feature_branch(&slug).await?;
        let workdir = self.git.setup_worktree(&slug, &branch).await?;
        info!(%slug, %branch, workdir = %workdir.display(), "pipeline started");

        // Planning: request -> PRD.
        let planning = self
            .runner
            .run(TaskRequest {
                prompt: prd_prompt(&self.project_name, request, &slug),
                workdir: workdir.clone(),
                command_label: "planning".to_string(),
            })
            .await
            .context("planning stage")?;
        if !planning.succeeded() {
            bail!("planning failed: {}", planning.failure_reason());
        }
        let prd_file = workdir.join(prd_path(&slug));
        if !prd_file.exists() {
            bail!(
                "planning agent exited successfully but produced no PRD at {} (log: {})",
                prd_file.display(),
                log_hint(&planning)
            );
        }

        // Decomposition: PRD -> phased plan.
        let decomposition = self
            .runner
            .run(TaskRequest {
                prompt: decomposition_prompt(&slug, self.workers_per_phase),
                workdir: workdir.clone(),
                command_label: "decomposition".to_string(),
            })
            .await
            .context("decomposition stage")?;
        if !decomposition.succeeded() {
            bail!("decomposition failed: {}", decomposition.failure_reason());
        }
        let progress_file = workdir.join(progress_path(&slug));
        if !progress_file.exists() {
            bail!(
                "decomposition agent exited successfully but produced no plan at {} (log: {})",
                progress_file.display(),
                log_hint(&decomposition)
            );
        }
        let plan = load_progress(&progress_file).with_context(|| {
            format!(
                "decomposition produced an unusable plan (log: {})",
                log_hint(&decomposition)
            )
        })?;
        if plan.phases.is_empty() {
            bail!(
                "decomposition produced a plan with no phases (log: {})",
                log_hint(&decomposition)
            );
        }
        for phase in &plan.phases {
            if phase.assignments.is_empty() || phase.assignments.len() > self.workers_per_phase {
                bail!(
                    "phase {} has {} assignments, expected 1..={} (log: {})",
                    phase.number,
                    phase.assignments.len(),
                    self.workers_per_phase,
                    log_hint(&decomposition)
                );
            }
        }
        self.git
            .commit_all(&workdir, &format!("Add delivery plan for {}", slug))
            .await?;

        // The delivery loop.
        let orchestrator = Orchestrator {
            runner: self.runner,
            git: self.git,
            workdir: workdir.clone(),
            base_branch: branch.clone(),
        };
        let metrics = orchestrator.run(&slug).await?;
        info!(
            %slug,
            phases = metrics.phases_completed,
            total = metrics.phases_total,
            elapsed_secs = metrics.elapsed.as_secs(),
            "delivery loop finished"
        );

        // Post-mortem: retrospective over the run's own artifacts. The work
        // is already delivered, so a failure here is logged and tolerated.
        let postmortem = self
            .runner
            .run(TaskRequest {
                prompt: postmortem_prompt(&self.project_name, &slug),
                workdir: workdir.clone(),
                command_label: "post-mortem".to_string(),
            })
            .await;
        match postmortem {
            Ok(result) if result.succeeded() => {
                if !workdir.join(postmortem_path(&slug)).exists() {
                    warn!(%slug, log = %log_hint(&result), "post-mortem agent wrote no document");
                }
            }
            Ok(result) => {
                warn!(%slug, "post-mortem failed: {}", result.failure_reason());
            }
            Err(e) => {
                warn!(%slug, "post-mortem stage errored: {:#}", e);
            }
        }

        if self
            .git
            .commit_all(&workdir, &format!("Record delivery progress for {}", slug))
            .await?
        {
            info!(%slug, "committed final progress state");
        }

        let title = format!("Delivery: {}", slug);
        let pr_url = self.git.create_pull_request(&workdir, &branch, &title).await?;
        match &pr_url {
            Some(url) => info!(%slug, %url, "pull request opened"),
            None => warn!(%slug, %branch, "no pull request created, branch is local or push-only"),
        }

        self.git.cleanup_worktree(&workdir).await;
        Ok(PipelineOutcome {
            slug,
            branch,
            pr_url,
        })
    }
}

fn log_hint(result: &crate::orchestrator::TaskResult) -> String {
    match &result.log_path {
        Some(p) => p.display().to_string(),
        None => format!("task {}", result.task_id),
    }
}

/// Derive a filesystem- and branch-safe slug from the request text, suffixed
/// with a timestamp so repeated runs of the same request stay distinct.
pub fn make_slug(request: &str) -> String {
    let mut words = String::new();
    for c in request.chars() {
        if words.len() >= 40 {
            break;
        }
        if c.is_ascii_alphanumeric() {
            words.push(c.to_ascii_lowercase());
        } else if !words.ends_with('-') && !words.is_empty() {
            words.push('-');
        }
    }
    let words = words.trim_matches('-');
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    if words.is_empty() {
        format!("delivery-{}", stamp)
    } else {
        format!("{}-{}", words, stamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskStatus;
    use crate::orchestrator::TaskResult;
    use crate::progress::{
        Assignment, Phase, Plan, PlanStatus, Review, Section, TodoItem,
    };
    use crate::prompts::delivery_dir;
    use async_trait::async_trait;
    use std::path::Path;
    use std::process::Command as StdCommand;
    use std::sync::Mutex;

    type Script = Box<dyn Fn(&TaskRequest) -> TaskResult + Send + Sync>;

    struct ScriptedRunner {
        script: Script,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn new(script: Script) -> Self {
            Self {
                script,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TaskRunner for ScriptedRunner {
        async fn run(&self, req: TaskRequest) -> Result<TaskResult> {
            self.seen.lock().unwrap().push(req.command_label.clone());
            Ok((self.script)(&req))
        }
    }

    fn ok_result(label: &str) -> TaskResult {
        TaskResult {
            task_id: format!("task-{}", label),
            status: TaskStatus::Completed,
            exit_code: Some(0),
            diagnosis: None,
            log_path: None,
        }
    }

    fn git_available() -> bool {
        StdCommand::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn sh(dir: &Path, args: &[&str]) {
        let out = StdCommand::new(args[0])
            .args(&args[1..])
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(
            out.status.success(),
            "{:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        );
    }

    fn init_repo(dir: &Path) {
        sh(dir, &["git", "init", "-q"]);
        sh(dir, &["git", "config", "user.email", "test@example.com"]);
        sh(dir, &["git", "config", "user.name", "Test"]);
        std::fs::write(dir.join("README.md"), "hello\n").unwrap();
        sh(dir, &["git", "add", "-A"]);
        sh(dir, &["git", "commit", "-q", "-m", "initial"]);
    }

    fn one_phase_plan(slug: &str) -> Plan {
        Plan {
            slug: slug.to_string(),
            status: PlanStatus::Pending,
            current_phase: 0,
            phases: vec![Phase {
                number: 1,
                name: "do it".to_string(),
                status: PlanStatus::Pending,
                assignments: vec![Assignment {
                    role: "engineer".to_string(),
                    status: PlanStatus::Pending,
                    task_id: None,
                    sections: vec![Section {
                        title: "all of it".to_string(),
                        todos: vec![TodoItem {
                            description: "everything".to_string(),
                            done: false,
                        }],
                    }],
                }],
                review: Review {
                    status: PlanStatus::Pending,
                    task_id: None,
                },
            }],
            started_at: None,
            completed_at: None,
        }
    }

    /// Script that plays a well-behaved agent for every stage: writes the PRD
    /// during planning and a valid plan during decomposition.
    fn well_behaved() -> Script {
        Box::new(|req| {
            let slug = req
                .workdir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap()
                .to_string();
            match req.command_label.as_str() {
                "planning" => {
                    std::fs::create_dir_all(req.workdir.join(delivery_dir(&slug))).unwrap();
                    std::fs::write(req.workdir.join(prd_path(&slug)), "# PRD\n").unwrap();
                }
                "decomposition" => {
                    crate::progress::save_progress(
                        &req.workdir.join(progress_path(&slug)),
                        &one_phase_plan(&slug),
                    )
                    .unwrap();
                }
                "post-mortem" => {
                    std::fs::write(req.workdir.join(postmortem_path(&slug)), "# Post-mortem\n")
                        .unwrap();
                }
                _ => {}
            }
            ok_result(&req.command_label)
        })
    }

    #[tokio::test]
    async fn test_full_pipeline_single_worker() {
        if !git_available() {
            return;
        }
        let repo = tempfile::tempdir().unwrap();
        init_repo(repo.path());

        let runner = ScriptedRunner::new(well_behaved());
        let git = GitOps::new(repo.path());
        let pipeline = Pipeline {
            runner: &runner,
            git: &git,
            project_name: "demo".to_string(),
            workers_per_phase: 1,
        };

        let outcome = pipeline.deliver("add request tracing").await.unwrap();
        assert!(outcome.slug.starts_with("add-request-tracing-"));
        assert_eq!(outcome.branch, format!("delivery/{}", outcome.slug));
        // No remote configured, so push-only degrades to no PR.
        assert_eq!(outcome.pr_url, None);

        let labels = runner.seen.lock().unwrap().clone();
        assert_eq!(
            labels,
            vec![
                "planning",
                "decomposition",
                "engineer-phase-1",
                "review-phase-1",
                "post-mortem"
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_postmortem_does_not_fail_the_delivery() {
        if !git_available() {
            return;
        }
        let repo = tempfile::tempdir().unwrap();
        init_repo(repo.path());

        let inner = well_behaved();
        let runner = ScriptedRunner::new(Box::new(move |req| {
            if req.command_label == "post-mortem" {
                TaskResult {
                    task_id: "task-post-mortem".to_string(),
                    status: TaskStatus::Failed,
                    exit_code: Some(1),
                    diagnosis: None,
                    log_path: None,
                }
            } else {
                (inner)(req)
            }
        }));
        let git = GitOps::new(repo.path());
        let pipeline = Pipeline {
            runner: &runner,
            git: &git,
            project_name: "demo".to_string(),
            workers_per_phase: 1,
        };

        // The retrospective is advisory; the delivery itself still succeeds.
        let outcome = pipeline.deliver("add request tracing").await.unwrap();
        assert!(outcome.slug.starts_with("add-request-tracing-"));
        let labels = runner.seen.lock().unwrap().clone();
        assert!(labels.contains(&"post-mortem".to_string()));
    }

    #[tokio::test]
    async fn test_missing_prd_is_a_structural_failure() {
        if !git_available() {
            return;
        }
        let repo = tempfile::tempdir().unwrap();
        init_repo(repo.path());

        // Planning "succeeds" without writing anything.
        let runner = ScriptedRunner::new(Box::new(|req| ok_result(&req.command_label)));
        let git = GitOps::new(repo.path());
        let pipeline = Pipeline {
            runner: &runner,
            git: &git,
            project_name: "demo".to_string(),
            workers_per_phase: 1,
        };

        let err = pipeline.deliver("do something").await.unwrap_err();
        assert!(err.to_string().contains("produced no PRD"));
    }

    #[tokio::test]
    async fn test_corrupt_plan_is_a_structural_failure() {
        if !git_available() {
            return;
        }
        let repo = tempfile::tempdir().unwrap();
        init_repo(repo.path());

        let runner = ScriptedRunner::new(Box::new(|req| {
            let slug = req
                .workdir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap()
                .to_string();
            match req.command_label.as_str() {
                "planning" => {
                    std::fs::create_dir_all(req.workdir.join(delivery_dir(&slug))).unwrap();
                    std::fs::write(req.workdir.join(prd_path(&slug)), "# PRD\n").unwrap();
                }
                "decomposition" => {
                    std::fs::write(req.workdir.join(progress_path(&slug)), "not json").unwrap();
                }
                _ => {}
            }
            ok_result(&req.command_label)
        }));
        let git = GitOps::new(repo.path());
        let pipeline = Pipeline {
            runner: &runner,
            git: &git,
            project_name: "demo".to_string(),
            workers_per_phase: 1,
        };

        let err = pipeline.deliver("do something").await.unwrap_err();
        assert!(format!("{:#}", err).contains("unusable plan"));
    }

    #[tokio::test]
    async fn test_rejects_wider_fan_out() {
        let repo = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new(Box::new(|req| ok_result(&req.command_label)));
        let git = GitOps::new(repo.path());
        let pipeline = Pipeline {
            runner: &runner,
            git: &git,
            project_name: "demo".to_string(),
            workers_per_phase: 3,
        };
        let err = pipeline.deliver("x").await.unwrap_err();
        assert!(err.to_string().contains("workers_per_phase"));
    }

    #[test]
    fn test_make_slug_is_safe_and_distinct() {
        let slug = make_slug("Add  OAuth2 login!!");
        assert!(slug.starts_with("add-oauth2-login-"));
        assert!(slug.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));

        let empty = make_slug("!!!");
        assert!(empty.starts_with("delivery-"));
    }
}
