//! SQLite registry for tasks, projects, jobs, and job runs.
//!
//! The registry is an append-mostly store: tasks and job runs are inserted
//! when work starts and terminalized in place, never deleted by the core.
//! Status-reporting readers run concurrently with writers and must tolerate
//! eventually-consistent reads (a query may observe a task mid-flight).
//!
//! Two classes of writes exist and must not be conflated:
//!
//! - **Control-flow writes** (task registration, run transitions): failures
//!   propagate to the caller and halt the pipeline.
//! - **Telemetry writes** (output byte counts): callers treat failures as
//!   best-effort and retry on the next monitor tick.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::models::{RunStatus, TaskStatus};

/// Registry handle. Cheap to clone; the underlying connection is shared
/// behind a mutex so concurrent monitors can persist telemetry.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// One spawned agent process as persisted in the registry.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: String,
    pub project: String,
    pub agent: String,
    pub command_label: String,
    pub pid: Option<u32>,
    pub log_path: Option<PathBuf>,
    pub output_bytes: u64,
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub diagnosis: Option<String>,
    pub started_at: DateTime<Local>,
    pub completed_at: Option<DateTime<Local>>,
}

/// A project the scheduler can run pipelines against.
#[derive(Debug, Clone)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub root: PathBuf,
    pub agent_command: String,
    pub agent_model: Option<String>,
}

/// A recurring pipeline definition.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub project_id: String,
    pub prompt: String,
    /// Five-field cron expression (minute hour dom month dow).
    pub schedule: String,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Local>>,
}

/// One scheduled invocation of a job.
#[derive(Debug, Clone)]
pub struct JobRun {
    pub id: String,
    pub job_id: String,
    pub status: RunStatus,
    pub slug: Option<String>,
    pub branch: Option<String>,
    pub pr_url: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Local>,
    pub started_at: Option<DateTime<Local>>,
    pub completed_at: Option<DateTime<Local>>,
}

impl Database {
    /// Open (or create) the registry at the given path.
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create database directory {}", parent.display()))?;
        }
        let conn = Connection::open(&path)
            .with_context(|| format!("open database {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory registry for tests.
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                project TEXT NOT NULL,
                agent TEXT NOT NULL,
                command_label TEXT NOT NULL,
                pid INTEGER,
                log_path TEXT,
                output_bytes INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                exit_code INTEGER,
                diagnosis TEXT,
                started_at TEXT NOT NULL,
                completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                root TEXT NOT NULL,
                agent_command TEXT NOT NULL,
                agent_model TEXT
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL REFERENCES projects(id),
                prompt TEXT NOT NULL,
                schedule TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                last_run_at TEXT
            );

            CREATE TABLE IF NOT EXISTS job_runs (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(id),
                status TEXT NOT NULL,
                slug TEXT,
                branch TEXT,
                pr_url TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_job_runs_status ON job_runs(status);
            CREATE INDEX IF NOT EXISTS idx_job_runs_job ON job_runs(job_id);",
        )
        .context("initialize registry schema")?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    /// Register a newly dispatched task. Control-flow write.
    pub fn insert_task(&self, task: &TaskRecord) -> Result<()> {
        self.lock()
            .execute(
                "INSERT INTO tasks (id, project, agent, command_label, pid, log_path,
                                    output_bytes, status, exit_code, diagnosis,
                                    started_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    task.id,
                    task.project,
                    task.agent,
                    task.command_label,
                    task.pid,
                    task.log_path.as_ref().map(|p| p.display().to_string()),
                    task.output_bytes as i64,
                    task.status.as_str(),
                    task.exit_code,
                    task.diagnosis,
                    task.started_at.to_rfc3339(),
                    task.completed_at.map(|t| t.to_rfc3339()),
                ],
            )
            .with_context(|| format!("insert task {}", task.id))?;
        Ok(())
    }

    /// Persist the latest observed log size. Telemetry write: callers treat
    /// a failure as non-critical and retry next tick.
    pub fn update_output_bytes(&self, task_id: &str, bytes: u64) -> Result<()> {
        self.lock()
            .execute(
                "UPDATE tasks SET output_bytes = ?1 WHERE id = ?2",
                params![bytes as i64, task_id],
            )
            .with_context(|| format!("update output bytes for task {}", task_id))?;
        Ok(())
    }

    /// Terminalize a task after natural process exit.
    pub fn complete_task(&self, task_id: &str, exit_code: i32, status: TaskStatus) -> Result<()> {
        self.lock()
            .execute(
                "UPDATE tasks SET status = ?1, exit_code = ?2, completed_at = ?3 WHERE id = ?4",
                params![
                    status.as_str(),
                    exit_code,
                    Local::now().to_rfc3339(),
                    task_id
                ],
            )
            .with_context(|| format!("complete task {}", task_id))?;
        Ok(())
    }

    /// Mark a task stuck. The process is left running, so no exit code.
    pub fn mark_task_stuck(&self, task_id: &str, diagnosis: &str) -> Result<()> {
        self.lock()
            .execute(
                "UPDATE tasks SET status = 'stuck', diagnosis = ?1, completed_at = ?2 WHERE id = ?3",
                params![diagnosis, Local::now().to_rfc3339(), task_id],
            )
            .with_context(|| format!("mark task {} stuck", task_id))?;
        Ok(())
    }

    /// Mark a task killed by the monitor.
    pub fn mark_task_killed(&self, task_id: &str, diagnosis: &str) -> Result<()> {
        self.lock()
            .execute(
                "UPDATE tasks SET status = 'killed', diagnosis = ?1, completed_at = ?2 WHERE id = ?3",
                params![diagnosis, Local::now().to_rfc3339(), task_id],
            )
            .with_context(|| format!("mark task {} killed", task_id))?;
        Ok(())
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let conn = self.lock();
        let task = conn
            .query_row(
                "SELECT id, project, agent, command_label, pid, log_path, output_bytes,
                        status, exit_code, diagnosis, started_at, completed_at
                 FROM tasks WHERE id = ?1",
                params![task_id],
                map_task_row,
            )
            .optional()
            .with_context(|| format!("get task {}", task_id))?;
        Ok(task)
    }

    /// Tasks still marked running, newest first.
    pub fn get_running_tasks(&self) -> Result<Vec<TaskRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, project, agent, command_label, pid, log_path, output_bytes,
                    status, exit_code, diagnosis, started_at, completed_at
             FROM tasks WHERE status = 'running' ORDER BY started_at DESC",
        )?;
        let rows = stmt
            .query_map([], map_task_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list running tasks")?;
        Ok(rows)
    }

    // ========================================================================
    // Projects
    // ========================================================================

    pub fn insert_project(&self, project: &Project) -> Result<()> {
        self.lock()
            .execute(
                "INSERT INTO projects (id, name, root, agent_command, agent_model)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    project.id,
                    project.name,
                    project.root.display().to_string(),
                    project.agent_command,
                    project.agent_model,
                ],
            )
            .with_context(|| format!("insert project {}", project.name))?;
        Ok(())
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let conn = self.lock();
        let project = conn
            .query_row(
                "SELECT id, name, root, agent_command, agent_model FROM projects WHERE id = ?1",
                params![id],
                map_project_row,
            )
            .optional()
            .with_context(|| format!("get project {}", id))?;
        Ok(project)
    }

    pub fn get_project_by_name(&self, name: &str) -> Result<Option<Project>> {
        let conn = self.lock();
        let project = conn
            .query_row(
                "SELECT id, name, root, agent_command, agent_model FROM projects WHERE name = ?1",
                params![name],
                map_project_row,
            )
            .optional()
            .with_context(|| format!("get project '{}'", name))?;
        Ok(project)
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    pub fn insert_job(&self, job: &Job) -> Result<()> {
        self.lock()
            .execute(
                "INSERT INTO jobs (id, project_id, prompt, schedule, enabled, last_run_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    job.id,
                    job.project_id,
                    job.prompt,
                    job.schedule,
                    job.enabled as i64,
                    job.last_run_at.map(|t| t.to_rfc3339()),
                ],
            )
            .with_context(|| format!("insert job {}", job.id))?;
        Ok(())
    }

    pub fn get_enabled_jobs(&self) -> Result<Vec<Job>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, project_id, prompt, schedule, enabled, last_run_at
             FROM jobs WHERE enabled = 1",
        )?;
        let rows = stmt
            .query_map([], map_job_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list enabled jobs")?;
        Ok(rows)
    }

    /// Record when the job last ran, regardless of the run's outcome.
    pub fn update_job_last_run(&self, job_id: &str, at: DateTime<Local>) -> Result<()> {
        self.lock()
            .execute(
                "UPDATE jobs SET last_run_at = ?1 WHERE id = ?2",
                params![at.to_rfc3339(), job_id],
            )
            .with_context(|| format!("update last run for job {}", job_id))?;
        Ok(())
    }

    // ========================================================================
    // Job runs
    // ========================================================================

    /// Create a new pending run for a job when its schedule fires.
    pub fn create_job_run(&self, job_id: &str) -> Result<JobRun> {
        let run = JobRun {
            id: Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            status: RunStatus::Pending,
            slug: None,
            branch: None,
            pr_url: None,
            error: None,
            created_at: Local::now(),
            started_at: None,
            completed_at: None,
        };
        self.lock()
            .execute(
                "INSERT INTO job_runs (id, job_id, status, slug, branch, pr_url, error,
                                       created_at, started_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    run.id,
                    run.job_id,
                    run.status.as_str(),
                    run.slug,
                    run.branch,
                    run.pr_url,
                    run.error,
                    run.created_at.to_rfc3339(),
                    Option::<String>::None,
                    Option::<String>::None,
                ],
            )
            .with_context(|| format!("create run for job {}", job_id))?;
        Ok(run)
    }

    /// Pending runs, oldest first.
    pub fn get_pending_runs(&self) -> Result<Vec<JobRun>> {
        self.query_runs("SELECT id, job_id, status, slug, branch, pr_url, error,
                                created_at, started_at, completed_at
                         FROM job_runs WHERE status = 'pending' ORDER BY created_at ASC")
    }

    /// The job's current non-terminal run, if any. Used to enforce at most
    /// one in-flight run per job.
    pub fn get_active_run_for_job(&self, job_id: &str) -> Result<Option<JobRun>> {
        let conn = self.lock();
        let run = conn
            .query_row(
                "SELECT id, job_id, status, slug, branch, pr_url, error,
                        created_at, started_at, completed_at
                 FROM job_runs
                 WHERE job_id = ?1 AND status IN ('pending', 'running')
                 ORDER BY created_at ASC LIMIT 1",
                params![job_id],
                map_run_row,
            )
            .optional()
            .with_context(|| format!("get active run for job {}", job_id))?;
        Ok(run)
    }

    /// Pending runs older than `age_minutes`, candidates for `skipped` at
    /// startup recovery.
    pub fn get_stale_pending_runs(&self, age_minutes: i64) -> Result<Vec<JobRun>> {
        let cutoff = (Local::now() - chrono::Duration::minutes(age_minutes)).to_rfc3339();
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, job_id, status, slug, branch, pr_url, error,
                    created_at, started_at, completed_at
             FROM job_runs WHERE status = 'pending' AND created_at < ?1",
        )?;
        let rows = stmt
            .query_map(params![cutoff], map_run_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list stale pending runs")?;
        Ok(rows)
    }

    /// Runs still marked running. At startup these are orphans from a prior
    /// process lifetime.
    pub fn get_stuck_running_runs(&self) -> Result<Vec<JobRun>> {
        self.query_runs("SELECT id, job_id, status, slug, branch, pr_url, error,
                                created_at, started_at, completed_at
                         FROM job_runs WHERE status = 'running'")
    }

    /// Most recent runs across all jobs, newest first.
    pub fn get_recent_runs(&self, limit: usize) -> Result<Vec<JobRun>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, job_id, status, slug, branch, pr_url, error,
                    created_at, started_at, completed_at
             FROM job_runs ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], map_run_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list recent runs")?;
        Ok(rows)
    }

    /// Write back a run's current state (status, slug, branch, PR, error,
    /// timestamps).
    pub fn update_job_run(&self, run: &JobRun) -> Result<()> {
        self.lock()
            .execute(
                "UPDATE job_runs
                 SET status = ?1, slug = ?2, branch = ?3, pr_url = ?4, error = ?5,
                     started_at = ?6, completed_at = ?7
                 WHERE id = ?8",
                params![
                    run.status.as_str(),
                    run.slug,
                    run.branch,
                    run.pr_url,
                    run.error,
                    run.started_at.map(|t| t.to_rfc3339()),
                    run.completed_at.map(|t| t.to_rfc3339()),
                    run.id,
                ],
            )
            .with_context(|| format!("update run {}", run.id))?;
        Ok(())
    }

    /// Test-only escape hatch for adjusting rows directly.
    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<usize> {
        Ok(self.lock().execute(sql, params)?)
    }

    fn query_runs(&self, sql: &str) -> Result<Vec<JobRun>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map([], map_run_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("query job runs")?;
        Ok(rows)
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn parse_ts(s: String) -> rusqlite::Result<DateTime<Local>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Local))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_opt_ts(s: Option<String>) -> rusqlite::Result<Option<DateTime<Local>>> {
    s.map(parse_ts).transpose()
}

fn map_task_row(row: &Row) -> rusqlite::Result<TaskRecord> {
    let status: String = row.get(7)?;
    Ok(TaskRecord {
        id: row.get(0)?,
        project: row.get(1)?,
        agent: row.get(2)?,
        command_label: row.get(3)?,
        pid: row.get::<_, Option<i64>>(4)?.map(|p| p as u32),
        log_path: row.get::<_, Option<String>>(5)?.map(PathBuf::from),
        output_bytes: row.get::<_, i64>(6)? as u64,
        status: TaskStatus::parse(&status).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, e.into())
        })?,
        exit_code: row.get(8)?,
        diagnosis: row.get(9)?,
        started_at: parse_ts(row.get(10)?)?,
        completed_at: parse_opt_ts(row.get(11)?)?,
    })
}

fn map_project_row(row: &Row) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        root: PathBuf::from(row.get::<_, String>(2)?),
        agent_command: row.get(3)?,
        agent_model: row.get(4)?,
    })
}

fn map_job_row(row: &Row) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        project_id: row.get(1)?,
        prompt: row.get(2)?,
        schedule: row.get(3)?,
        enabled: row.get::<_, i64>(4)? != 0,
        last_run_at: parse_opt_ts(row.get(5)?)?,
    })
}

fn map_run_row(row: &Row) -> rusqlite::Result<JobRun> {
    let status: String = row.get(2)?;
    Ok(JobRun {
        id: row.get(0)?,
        job_id: row.get(1)?,
        status: RunStatus::parse(&status).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
        })?,
        slug: row.get(3)?,
        branch: row.get(4)?,
        pr_url: row.get(5)?,
        error: row.get(6)?,
        created_at: parse_ts(row.get(7)?)?,
        started_at: parse_opt_ts(row.get(8)?)?,
        completed_at: parse_opt_ts(row.get(9)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        let db = Database::new_in_memory().unwrap();
        db.initialize_schema().unwrap();
        db
    }

    fn test_task(id: &str) -> TaskRecord {
        TaskRecord {
            id: id.to_string(),
            project: "demo".to_string(),
            agent: "claude".to_string(),
            command_label: "engineering-phase-1".to_string(),
            pid: Some(4242),
            log_path: Some(PathBuf::from("/tmp/logs/t.log")),
            output_bytes: 0,
            status: TaskStatus::Running,
            exit_code: None,
            diagnosis: None,
            started_at: Local::now(),
            completed_at: None,
        }
    }

    fn test_project(db: &Database) -> Project {
        let project = Project {
            id: Uuid::new_v4().to_string(),
            name: "demo".to_string(),
            root: PathBuf::from("/tmp/demo"),
            agent_command: "claude".to_string(),
            agent_model: None,
        };
        db.insert_project(&project).unwrap();
        project
    }

    fn test_job(db: &Database, project_id: &str) -> Job {
        let job = Job {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            prompt: "fix the flaky tests".to_string(),
            schedule: "0 2 * * *".to_string(),
            enabled: true,
            last_run_at: None,
        };
        db.insert_job(&job).unwrap();
        job
    }

    #[test]
    fn test_insert_and_retrieve_task() {
        let db = test_db();
        db.insert_task(&test_task("t1")).unwrap();

        let task = db.get_task("t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.pid, Some(4242));
        assert_eq!(task.agent, "claude");
    }

    #[test]
    fn test_task_terminalization() {
        let db = test_db();
        db.insert_task(&test_task("t1")).unwrap();
        db.insert_task(&test_task("t2")).unwrap();

        db.complete_task("t1", 0, TaskStatus::Completed).unwrap();
        db.mark_task_killed("t2", "rate limited").unwrap();

        let t1 = db.get_task("t1").unwrap().unwrap();
        assert_eq!(t1.status, TaskStatus::Completed);
        assert_eq!(t1.exit_code, Some(0));
        assert!(t1.completed_at.is_some());

        let t2 = db.get_task("t2").unwrap().unwrap();
        assert_eq!(t2.status, TaskStatus::Killed);
        assert_eq!(t2.diagnosis.as_deref(), Some("rate limited"));

        assert!(db.get_running_tasks().unwrap().is_empty());
    }

    #[test]
    fn test_output_bytes_telemetry() {
        let db = test_db();
        db.insert_task(&test_task("t1")).unwrap();
        db.update_output_bytes("t1", 8192).unwrap();

        let task = db.get_task("t1").unwrap().unwrap();
        assert_eq!(task.output_bytes, 8192);
    }

    #[test]
    fn test_job_run_lifecycle() {
        let db = test_db();
        let project = test_project(&db);
        let job = test_job(&db, &project.id);

        let mut run = db.create_job_run(&job.id).unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(db.get_pending_runs().unwrap().len(), 1);
        assert!(db.get_active_run_for_job(&job.id).unwrap().is_some());

        run.status = RunStatus::Running;
        run.started_at = Some(Local::now());
        db.update_job_run(&run).unwrap();

        run.status = RunStatus::Completed;
        run.slug = Some("fix-flaky-tests".to_string());
        run.branch = Some("feature/fix-flaky-tests".to_string());
        run.completed_at = Some(Local::now());
        db.update_job_run(&run).unwrap();

        assert!(db.get_active_run_for_job(&job.id).unwrap().is_none());
        let recent = db.get_recent_runs(10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].status, RunStatus::Completed);
        assert_eq!(recent[0].branch.as_deref(), Some("feature/fix-flaky-tests"));
    }

    #[test]
    fn test_stale_and_stuck_run_queries() {
        let db = test_db();
        let project = test_project(&db);
        let job = test_job(&db, &project.id);

        // A run created 90 minutes ago, still pending.
        let stale = db.create_job_run(&job.id).unwrap();
        db.lock()
            .execute(
                "UPDATE job_runs SET created_at = ?1 WHERE id = ?2",
                params![
                    (Local::now() - chrono::Duration::minutes(90)).to_rfc3339(),
                    stale.id
                ],
            )
            .unwrap();

        // A run orphaned mid-pipeline.
        let mut orphan = db.create_job_run(&job.id).unwrap();
        orphan.status = RunStatus::Running;
        db.update_job_run(&orphan).unwrap();

        let stale_runs = db.get_stale_pending_runs(60).unwrap();
        assert_eq!(stale_runs.len(), 1);
        assert_eq!(stale_runs[0].id, stale.id);

        let stuck_runs = db.get_stuck_running_runs().unwrap();
        assert_eq!(stuck_runs.len(), 1);
        assert_eq!(stuck_runs[0].id, orphan.id);
    }

    #[test]
    fn test_enabled_jobs_and_last_run() {
        let db = test_db();
        let project = test_project(&db);
        let job = test_job(&db, &project.id);

        let disabled = Job {
            id: Uuid::new_v4().to_string(),
            project_id: project.id.clone(),
            prompt: "nightly dependency bump".to_string(),
            schedule: "0 3 * * *".to_string(),
            enabled: false,
            last_run_at: None,
        };
        db.insert_job(&disabled).unwrap();

        let enabled = db.get_enabled_jobs().unwrap();
        assert_eq!(enabled.iter().filter(|j| !j.enabled).count(), 0);

        db.update_job_last_run(&job.id, Local::now()).unwrap();
        let refreshed = db
            .get_enabled_jobs()
            .unwrap()
            .into_iter()
            .find(|j| j.id == job.id)
            .unwrap();
        assert!(refreshed.last_run_at.is_some());
    }
}
