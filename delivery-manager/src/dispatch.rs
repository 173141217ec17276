//! Agent process dispatch: spawn one subprocess per task, capture its output
//! to a durable log, and register the task in the registry.
//!
//! The prompt is written to a file and fed through stdin (argument-length
//! limits make passing it argv-style unreliable for large phase prompts).
//! A spawn failure resolves the handle's exit state with a synthetic nonzero
//! code instead of propagating: callers observe it as an immediately failed
//! task, never as a panic or error at the dispatch boundary.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::database::{Database, TaskRecord};
use crate::events::{parse_event, render_event};
use crate::models::{AgentProfile, OutputMode, TaskStatus};

/// Exit code reported when the process could not be spawned at all.
pub const SPAWN_FAILURE_EXIT: i32 = -1;

/// Shared slot the wait task fills with the process exit code.
pub type ExitState = Arc<Mutex<Option<i32>>>;

/// Everything needed to dispatch one agent task.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub agent: AgentProfile,
    pub prompt: String,
    pub workdir: PathBuf,
    pub output_mode: OutputMode,
    /// Command label persisted with the task ("planning",
    /// "engineering-phase-2", "review-phase-1").
    pub command_label: String,
    pub project: String,
}

/// Handle to a dispatched task.
#[derive(Debug)]
pub struct TaskHandle {
    pub task_id: String,
    pub pid: u32,
    /// `None` in terminal pass-through mode (there is no log to inspect).
    pub log_path: Option<PathBuf>,
    pub agent_name: String,
    pub command_label: String,
    pub output_mode: OutputMode,
    pub started_at: DateTime<Local>,
    exit_state: ExitState,
}

impl TaskHandle {
    /// Current exit code, if the process has exited.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn exit_state(&self) -> ExitState {
        self.exit_state.clone()
    }
}

/// Spawn an agent process for one task and register it.
///
/// The task row is inserted before this returns (a control-flow write: its
/// failure aborts the dispatch). The returned handle's exit state resolves
/// when the process exits, or immediately with [`SPAWN_FAILURE_EXIT`] when
/// spawning failed.
pub async fn dispatch_agent(
    db: &Database,
    settings: &Settings,
    req: &DispatchRequest,
) -> Result<TaskHandle> {
    let task_id = Uuid::new_v4().to_string();
    let started_at = Local::now();

    // Prompt goes through a file: durable for later inspection and immune to
    // argv length limits.
    let prompt_dir = settings.prompt_dir();
    tokio::fs::create_dir_all(&prompt_dir)
        .await
        .with_context(|| format!("create prompt directory {}", prompt_dir.display()))?;
    let prompt_path = prompt_dir.join(format!("{}.md", task_id));
    tokio::fs::write(&prompt_path, &req.prompt)
        .await
        .with_context(|| format!("write prompt file {}", prompt_path.display()))?;

    let log_path = match req.output_mode {
        OutputMode::Terminal => None,
        _ => {
            let log_dir = settings.log_dir();
            tokio::fs::create_dir_all(&log_dir)
                .await
                .with_context(|| format!("create log directory {}", log_dir.display()))?;
            Some(log_dir.join(format!("{}.log", task_id)))
        }
    };

    let mut cmd = Command::new(&req.agent.command);
    if let Some(model) = &req.agent.model {
        cmd.arg("--model").arg(model);
    }
    cmd.arg("-p").arg("--force");
    if req.output_mode == OutputMode::Stream {
        cmd.arg("--output-format").arg("stream-json");
    }
    cmd.current_dir(&req.workdir);

    let prompt_file = std::fs::File::open(&prompt_path)
        .with_context(|| format!("reopen prompt file {}", prompt_path.display()))?;
    cmd.stdin(Stdio::from(prompt_file));

    match req.output_mode {
        OutputMode::Terminal => {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }
        OutputMode::Capture | OutputMode::Stream => {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
    }

    let exit_state: ExitState = Arc::new(Mutex::new(None));

    debug!(task_id = %task_id, agent = %req.agent.name, label = %req.command_label, "spawning agent process");
    let pid = match cmd.spawn() {
        Ok(mut child) => {
            let pid = child.id().unwrap_or(0);

            if let Some(path) = &log_path {
                if let Some(stdout) = child.stdout.take() {
                    spawn_output_reader(stdout, path.clone(), req.output_mode);
                }
                if let Some(stderr) = child.stderr.take() {
                    spawn_output_reader(stderr, path.clone(), OutputMode::Capture);
                }
            }

            let state = exit_state.clone();
            tokio::spawn(async move {
                let code = match child.wait().await {
                    Ok(status) => status.code().unwrap_or(SPAWN_FAILURE_EXIT),
                    Err(e) => {
                        warn!(err = %e, "failed to wait on agent process");
                        SPAWN_FAILURE_EXIT
                    }
                };
                *state.lock().unwrap_or_else(|e| e.into_inner()) = Some(code);
            });
            pid
        }
        Err(e) => {
            warn!(agent = %req.agent.command, err = %e, "failed to spawn agent process");
            if let Some(path) = &log_path {
                let note = format!("failed to spawn '{}': {}\n", req.agent.command, e);
                if let Err(write_err) = tokio::fs::write(path, note).await {
                    warn!(err = %write_err, "could not record spawn failure in log");
                }
            }
            *exit_state.lock().unwrap_or_else(|e| e.into_inner()) = Some(SPAWN_FAILURE_EXIT);
            0
        }
    };

    let record = TaskRecord {
        id: task_id.clone(),
        project: req.project.clone(),
        agent: req.agent.name.clone(),
        command_label: req.command_label.clone(),
        pid: (pid != 0).then_some(pid),
        log_path: log_path.clone(),
        output_bytes: 0,
        status: TaskStatus::Running,
        exit_code: None,
        diagnosis: None,
        started_at,
        completed_at: None,
    };
    if let Err(e) = db.insert_task(&record) {
        // The process is already running but nothing would supervise it.
        if pid != 0 {
            warn!(task_id = %task_id, pid, "task registration failed, killing unsupervised agent process");
            let _ = std::process::Command::new("kill")
                .arg("-KILL")
                .arg(pid.to_string())
                .output();
        }
        return Err(e.context(format!("register task {}", task_id)));
    }

    Ok(TaskHandle {
        task_id,
        pid,
        log_path,
        agent_name: req.agent.name.clone(),
        command_label: req.command_label.clone(),
        output_mode: req.output_mode,
        started_at,
        exit_state,
    })
}

/// Drain one output pipe into the task log. In stream mode each line is also
/// decoded and rendered as a one-line progress indicator; the raw line is
/// appended verbatim regardless so stuck-pattern inspection sees everything.
fn spawn_output_reader(
    pipe: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    log_path: PathBuf,
    mode: OutputMode,
) {
    tokio::spawn(async move {
        let log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await;
        let mut log = match log {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %log_path.display(), err = %e, "could not open task log");
                return;
            }
        };

        let mut lines = BufReader::new(pipe).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Err(e) = log.write_all(line.as_bytes()).await {
                        warn!(err = %e, "task log write failed");
                        break;
                    }
                    let _ = log.write_all(b"\n").await;
                    let _ = log.flush().await;

                    if mode == OutputMode::Stream {
                        if let Some(event) = parse_event(&line) {
                            println!("  {}", render_event(&event));
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(err = %e, "task output read failed");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings(dir: &std::path::Path) -> Settings {
        Settings {
            data_dir: dir.to_path_buf(),
            model_api_url: None,
            model_api_key: None,
            model_name: "test".to_string(),
            poll_interval: std::time::Duration::from_millis(10),
            output_timeout: std::time::Duration::from_secs(120),
            scheduler_tick: std::time::Duration::from_secs(30),
        }
    }

    fn test_db() -> Database {
        let db = Database::new_in_memory().unwrap();
        db.initialize_schema().unwrap();
        db
    }

    #[tokio::test]
    async fn test_dispatch_captures_output_and_registers_task() {
        let temp = tempfile::tempdir().unwrap();
        let db = test_db();
        let settings = test_settings(temp.path());

        // No real agent CLI in tests; `cat` stands in (consumes the prompt
        // on stdin, treats the flags as file names, exits on its own).
        let req = DispatchRequest {
            agent: AgentProfile::new("cat", "cat"),
            prompt: String::new(),
            workdir: temp.path().to_path_buf(),
            output_mode: OutputMode::Capture,
            command_label: "test".to_string(),
            project: "demo".to_string(),
        };

        let handle = dispatch_agent(&db, &settings, &req).await.unwrap();
        assert!(handle.pid > 0);
        assert!(handle.log_path.is_some());

        // The registry saw the task before dispatch returned.
        let record = db.get_task(&handle.task_id).unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Running);
        assert_eq!(record.command_label, "test");

        for _ in 0..100 {
            if handle.exit_code().is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(handle.exit_code().is_some());
    }

    #[tokio::test]
    async fn test_spawn_failure_resolves_synthetic_exit() {
        let temp = tempfile::tempdir().unwrap();
        let db = test_db();
        let settings = test_settings(temp.path());

        let req = DispatchRequest {
            agent: AgentProfile::new("ghost", "/nonexistent/agent-binary"),
            prompt: "hello".to_string(),
            workdir: temp.path().to_path_buf(),
            output_mode: OutputMode::Capture,
            command_label: "planning".to_string(),
            project: "demo".to_string(),
        };

        let handle = dispatch_agent(&db, &settings, &req).await.unwrap();
        assert_eq!(handle.exit_code(), Some(SPAWN_FAILURE_EXIT));
        assert_eq!(handle.pid, 0);

        // The log records why.
        let log = std::fs::read_to_string(handle.log_path.as_ref().unwrap()).unwrap();
        assert!(log.contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_registration_failure_errors_and_reaps_spawned_process() {
        let temp = tempfile::tempdir().unwrap();
        let db = test_db();
        let settings = test_settings(temp.path());
        // Make every insert fail after the spawn has already happened.
        db.execute_raw("DROP TABLE tasks", &[]).unwrap();

        let req = DispatchRequest {
            agent: AgentProfile::new("cat", "cat"),
            prompt: "hello".to_string(),
            workdir: temp.path().to_path_buf(),
            output_mode: OutputMode::Capture,
            command_label: "planning".to_string(),
            project: "demo".to_string(),
        };

        let err = dispatch_agent(&db, &settings, &req).await.unwrap_err();
        assert!(format!("{:#}", err).contains("register task"));
    }

    #[tokio::test]
    async fn test_prompt_is_written_to_file() {
        let temp = tempfile::tempdir().unwrap();
        let db = test_db();
        let settings = test_settings(temp.path());

        let req = DispatchRequest {
            agent: AgentProfile::new("cat", "cat"),
            prompt: "implement the rate limiter".to_string(),
            workdir: temp.path().to_path_buf(),
            output_mode: OutputMode::Capture,
            command_label: "planning".to_string(),
            project: "demo".to_string(),
        };

        let handle = dispatch_agent(&db, &settings, &req).await.unwrap();
        let prompt_path = settings.prompt_dir().join(format!("{}.md", handle.task_id));
        let contents = std::fs::read_to_string(prompt_path).unwrap();
        assert_eq!(contents, "implement the rate limiter");
    }
}
