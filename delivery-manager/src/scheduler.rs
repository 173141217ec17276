//! Cron-driven job scheduling over the registry.
//!
//! A single polling loop owns all scheduler state (the last-evaluated-minute
//! map and the pipeline lock), so ticks never overlap and schedule evaluation
//! never races run execution. One pipeline runs at a time process-wide;
//! everything else queues as pending runs.

use std::collections::HashMap;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, Timelike};
use cron::Schedule;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::database::{Database, Job, JobRun, Project};
use crate::git_ops::GitOps;
use crate::models::{AgentProfile, RunStatus};
use crate::orchestrator::AgentTaskRunner;
use crate::pipeline::{Pipeline, PipelineOutcome};

/// A pending run older than this at startup is assumed to come from an
/// offline period and is skipped rather than executed late.
pub const STALE_PENDING_MINUTES: i64 = 60;

/// All mutable scheduler state, owned by the polling loop.
pub struct SchedulerContext {
    db: Database,
    settings: Settings,
    workers_per_phase: usize,
    /// job id -> the wall-clock minute it was last evaluated for, preventing
    /// duplicate runs when ticks land twice in the same minute.
    last_evaluated: HashMap<String, String>,
    /// Global pipeline lock: at most one delivery runs at a time.
    pipeline_active: bool,
}

impl SchedulerContext {
    pub fn new(db: Database, settings: Settings, workers_per_phase: usize) -> Self {
        Self {
            db,
            settings,
            workers_per_phase,
            last_evaluated: HashMap::new(),
            pipeline_active: false,
        }
    }

    /// The scheduler's main loop. Never returns under normal operation.
    pub async fn run_loop(mut self) -> Result<()> {
        self.startup_recovery()?;
        info!(
            tick_secs = self.settings.scheduler_tick.as_secs(),
            "scheduler started"
        );

        let mut interval = tokio::time::interval(self.settings.scheduler_tick);
        loop {
            interval.tick().await;
            let now = Local::now();
            if let Err(e) = self.evaluate_schedules(now) {
                error!(err = %format!("{:#}", e), "schedule evaluation failed");
            }
            if let Err(e) = self.execute_pending().await {
                error!(err = %format!("{:#}", e), "run execution failed");
            }
        }
    }

    /// Reconcile runs left over from a prior process lifetime: old pending
    /// runs are skipped, orphaned running runs are failed. Terminal runs are
    /// never touched.
    pub fn startup_recovery(&self) -> Result<()> {
        for mut run in self.db.get_stale_pending_runs(STALE_PENDING_MINUTES)? {
            warn!(run_id = %run.id, job_id = %run.job_id, "skipping stale pending run");
            run.status = RunStatus::Skipped;
            run.error = Some(format!(
                "pending for more than {} minutes, scheduler was offline",
                STALE_PENDING_MINUTES
            ));
            run.completed_at = Some(Local::now());
            self.db.update_job_run(&run)?;
        }
        for mut run in self.db.get_stuck_running_runs()? {
            warn!(run_id = %run.id, job_id = %run.job_id, "failing orphaned running run");
            run.status = RunStatus::Failed;
            run.error = Some("scheduler restarted mid-pipeline".to_string());
            run.completed_at = Some(Local::now());
            self.db.update_job_run(&run)?;
        }
        Ok(())
    }

    /// Create pending runs for every enabled job whose schedule fires in the
    /// current wall-clock minute.
    pub fn evaluate_schedules(&mut self, now: DateTime<Local>) -> Result<()> {
        let minute_key = now.format("%Y-%m-%d %H:%M").to_string();
        for job in self.db.get_enabled_jobs()? {
            if self.last_evaluated.get(&job.id) == Some(&minute_key) {
                continue;
            }
            let schedule = match parse_schedule(&job.schedule) {
                Ok(s) => s,
                Err(e) => {
                    warn!(job_id = %job.id, schedule = %job.schedule, err = %e, "unparseable schedule, skipping job");
                    continue;
                }
            };
            if !schedule_matches(&schedule, now) {
                continue;
            }
            self.last_evaluated.insert(job.id.clone(), minute_key.clone());
            let run = self.db.create_job_run(&job.id)?;
            info!(job_id = %job.id, run_id = %run.id, "schedule fired, run queued");
        }
        Ok(())
    }

    /// Execute at most one pending run. Failures are recorded on the run,
    /// never propagated, so one bad run cannot halt the polling loop.
    pub async fn execute_pending(&mut self) -> Result<()> {
        if self.pipeline_active {
            return Ok(());
        }
        let Some(mut run) = self.db.get_pending_runs()?.into_iter().next() else {
            return Ok(());
        };

        let job = self
            .db
            .get_enabled_jobs()?
            .into_iter()
            .find(|j| j.id == run.job_id);
        let Some(job) = job else {
            run.status = RunStatus::Skipped;
            run.error = Some("job disabled or deleted".to_string());
            run.completed_at = Some(Local::now());
            self.db.update_job_run(&run)?;
            return Ok(());
        };

        // One in-flight run per job: an older run still working trumps this
        // one.
        if let Some(active) = self.db.get_active_run_for_job(&job.id)? {
            if active.id != run.id {
                debug!(run_id = %run.id, active = %active.id, "job busy, skipping queued run");
                run.status = RunStatus::Skipped;
                run.error = Some("job already has an active run".to_string());
                run.completed_at = Some(Local::now());
                self.db.update_job_run(&run)?;
                return Ok(());
            }
        }

        run.status = RunStatus::Running;
        run.started_at = Some(Local::now());
        self.db.update_job_run(&run)?;

        self.pipeline_active = true;
        let result = self.run_job(&job, &mut run).await;
        self.pipeline_active = false;

        match result {
            Ok(outcome) => {
                info!(run_id = %run.id, slug = %outcome.slug, "run completed");
                run.status = RunStatus::Completed;
                run.slug = Some(outcome.slug);
                run.branch = Some(outcome.branch);
                run.pr_url = outcome.pr_url;
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                error!(run_id = %run.id, err = %reason, "run failed");
                run.status = RunStatus::Failed;
                run.error = Some(reason);
            }
        }
        run.completed_at = Some(Local::now());
        self.db.update_job_run(&run)?;
        // The job's last-run timestamp moves regardless of the outcome.
        self.db.update_job_last_run(&job.id, Local::now())?;
        Ok(())
    }

    async fn run_job(&self, job: &Job, run: &mut JobRun) -> Result<PipelineOutcome> {
        let project = self
            .db
            .get_project(&job.project_id)?
            .ok_or_else(|| anyhow::anyhow!("project {} not found", job.project_id))?;
        if !project.root.is_dir() {
            bail!(
                "project root {} does not exist or is not a directory",
                project.root.display()
            );
        }
        debug!(run_id = %run.id, project = %project.name, "starting pipeline");
        self.run_pipeline(&project, &job.prompt).await
    }

    async fn run_pipeline(&self, project: &Project, prompt: &str) -> Result<PipelineOutcome> {
        // The family name selects the agent-specific stuck-pattern set.
        let family = std::path::Path::new(&project.agent_command)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("agent");
        let mut agent = AgentProfile::new(family, &project.agent_command);
        if let Some(model) = &project.agent_model {
            agent = agent.with_model(model);
        }
        let runner = AgentTaskRunner::new(
            self.db.clone(),
            self.settings.clone(),
            agent,
            project.name.clone(),
        );
        let git = GitOps::new(&project.root);
        let pipeline = Pipeline {
            runner: &runner,
            git: &git,
            project_name: project.name.clone(),
            workers_per_phase: self.workers_per_phase,
        };
        pipeline.deliver(prompt).await
    }
}

/// Parse a cron expression, accepting the common five-field form (minute
/// hour day-of-month month day-of-week) by pinning seconds to zero.
pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    let normalized = normalize_schedule(expr);
    Schedule::from_str(&normalized).with_context(|| format!("parse cron expression '{}'", expr))
}

fn normalize_schedule(expr: &str) -> String {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        format!("0 {}", expr.trim())
    } else {
        expr.trim().to_string()
    }
}

/// Whether the schedule fires in `now`'s wall-clock minute. Seconds are
/// truncated so any tick landing inside the minute matches.
pub fn schedule_matches(schedule: &Schedule, now: DateTime<Local>) -> bool {
    let minute = now
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    schedule.includes(minute)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn test_db() -> Database {
        let db = Database::new_in_memory().unwrap();
        db.initialize_schema().unwrap();
        db
    }

    fn test_settings() -> Settings {
        Settings {
            data_dir: std::env::temp_dir().join("delivery-manager-test"),
            model_api_url: None,
            model_api_key: None,
            model_name: "test".to_string(),
            poll_interval: std::time::Duration::from_millis(10),
            output_timeout: std::time::Duration::from_secs(120),
            scheduler_tick: std::time::Duration::from_secs(30),
        }
    }

    fn seed_job(db: &Database, schedule: &str, root: &std::path::Path) -> Job {
        let project = Project {
            id: Uuid::new_v4().to_string(),
            name: format!("proj-{}", Uuid::new_v4()),
            root: root.to_path_buf(),
            agent_command: "claude".to_string(),
            agent_model: None,
        };
        db.insert_project(&project).unwrap();
        let job = Job {
            id: Uuid::new_v4().to_string(),
            project_id: project.id,
            prompt: "nightly cleanup".to_string(),
            schedule: schedule.to_string(),
            enabled: true,
            last_run_at: None,
        };
        db.insert_job(&job).unwrap();
        job
    }

    #[test]
    fn test_five_field_schedules_are_accepted() {
        // Daily at 02:00.
        let s = parse_schedule("0 2 * * *").unwrap();
        let fires = Local.with_ymd_and_hms(2026, 3, 10, 2, 0, 59).unwrap();
        let quiet = Local.with_ymd_and_hms(2026, 3, 10, 2, 1, 0).unwrap();
        assert!(schedule_matches(&s, fires));
        assert!(!schedule_matches(&s, quiet));

        // Six-field form passes through untouched.
        parse_schedule("0 0 2 * * *").unwrap();
        assert!(parse_schedule("not a schedule").is_err());
    }

    #[test]
    fn test_schedule_fires_once_per_minute() {
        // Scenario D: "every day at 02:00", evaluated at 02:00:30 and again
        // within the same minute.
        let db = test_db();
        let job = seed_job(&db, "0 2 * * *", std::path::Path::new("/tmp"));
        let mut ctx = SchedulerContext::new(db.clone(), test_settings(), 1);

        let t1 = Local.with_ymd_and_hms(2026, 3, 10, 2, 0, 30).unwrap();
        ctx.evaluate_schedules(t1).unwrap();
        assert_eq!(db.get_pending_runs().unwrap().len(), 1);

        let t2 = Local.with_ymd_and_hms(2026, 3, 10, 2, 0, 45).unwrap();
        ctx.evaluate_schedules(t2).unwrap();
        assert_eq!(db.get_pending_runs().unwrap().len(), 1);

        // The next day it fires again.
        let t3 = Local.with_ymd_and_hms(2026, 3, 11, 2, 0, 10).unwrap();
        ctx.evaluate_schedules(t3).unwrap();
        assert!(db.get_active_run_for_job(&job.id).unwrap().is_some());
        assert_eq!(db.get_pending_runs().unwrap().len(), 2);
    }

    #[test]
    fn test_startup_recovery_reconciles_leftover_runs() {
        // Scenario E: a 90-minute-old pending run, an orphaned running run,
        // and a completed run from before the restart.
        let db = test_db();
        let job = seed_job(&db, "0 2 * * *", std::path::Path::new("/tmp"));

        let stale = db.create_job_run(&job.id).unwrap();
        backdate_run(&db, &stale.id, Local::now() - chrono::Duration::minutes(90));

        let mut orphan = db.create_job_run(&job.id).unwrap();
        orphan.status = RunStatus::Running;
        orphan.started_at = Some(Local::now());
        db.update_job_run(&orphan).unwrap();

        let mut done = db.create_job_run(&job.id).unwrap();
        done.status = RunStatus::Completed;
        done.completed_at = Some(Local::now());
        db.update_job_run(&done).unwrap();

        let ctx = SchedulerContext::new(db.clone(), test_settings(), 1);
        ctx.startup_recovery().unwrap();

        let recent = db.get_recent_runs(10).unwrap();
        let by_id = |id: &str| recent.iter().find(|r| r.id == id).unwrap();
        assert_eq!(by_id(&stale.id).status, RunStatus::Skipped);
        assert_eq!(by_id(&orphan.id).status, RunStatus::Failed);
        assert_eq!(by_id(&done.id).status, RunStatus::Completed);
    }

    fn backdate_run(db: &Database, run_id: &str, to: DateTime<Local>) {
        // Test-only: reach into the registry to age a run.
        db.execute_raw(
            "UPDATE job_runs SET created_at = ?1 WHERE id = ?2",
            &[&to.to_rfc3339(), &run_id.to_string()],
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_bad_run_is_isolated() {
        // A job whose project root vanished: the run fails, the loop goes on.
        let db = test_db();
        let job = seed_job(&db, "0 2 * * *", std::path::Path::new("/nonexistent/project"));
        let run = db.create_job_run(&job.id).unwrap();

        let mut ctx = SchedulerContext::new(db.clone(), test_settings(), 1);
        ctx.execute_pending().await.unwrap();

        let recent = db.get_recent_runs(10).unwrap();
        let failed = recent.iter().find(|r| r.id == run.id).unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert!(failed.error.as_ref().unwrap().contains("does not exist"));
        // The job's last-run timestamp moved despite the failure.
        let refreshed = db
            .get_enabled_jobs()
            .unwrap()
            .into_iter()
            .find(|j| j.id == job.id)
            .unwrap();
        assert!(refreshed.last_run_at.is_some());

        // A second tick with nothing pending is a no-op.
        ctx.execute_pending().await.unwrap();
    }

    #[tokio::test]
    async fn test_queued_run_skipped_while_job_busy() {
        let db = test_db();
        let job = seed_job(&db, "0 2 * * *", std::path::Path::new("/tmp"));

        // An older run still running, plus a freshly queued one.
        let mut busy = db.create_job_run(&job.id).unwrap();
        busy.status = RunStatus::Running;
        db.update_job_run(&busy).unwrap();
        let queued = db.create_job_run(&job.id).unwrap();

        let mut ctx = SchedulerContext::new(db.clone(), test_settings(), 1);
        ctx.execute_pending().await.unwrap();

        let recent = db.get_recent_runs(10).unwrap();
        let skipped = recent.iter().find(|r| r.id == queued.id).unwrap();
        assert_eq!(skipped.status, RunStatus::Skipped);
        let still_busy = recent.iter().find(|r| r.id == busy.id).unwrap();
        assert_eq!(still_busy.status, RunStatus::Running);
    }
}
