//! Heartbeat supervision of one dispatched agent task.
//!
//! The monitor polls process liveness and log growth on a fixed interval and
//! escalates silence through two tiers: the cheap pattern matcher first, then
//! (at most once per silence window) the model diagnosis. A `continue`
//! verdict extends the window; a hard ceiling of twice the output timeout
//! prevents indefinite extension. When the diagnosis fallback is unavailable
//! the monitor escalates on a conservative time heuristic instead.
//!
//! Terminal pass-through tasks have no log, so only liveness is polled.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::database::Database;
use crate::diagnosis::DiagnosisProvider;
use crate::dispatch::{ExitState, TaskHandle};
use crate::models::{OutputMode, StuckAction, TaskStatus, Verdict};
use crate::patterns::match_stuck_patterns;

/// Escalate on heuristic once total silence exceeds this, when no diagnosis
/// provider is reachable.
pub const HARD_SILENCE: Duration = Duration::from_secs(60);

/// After an AI `continue`, total silence beyond `output_timeout` times this
/// factor escalates regardless. The only bound on repeated extensions.
pub const CONTINUE_CEILING_FACTOR: u32 = 2;

/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// How much of the log tail the pattern matcher and diagnosis see.
const TAIL_BYTES: usize = 8192;

/// Monitor timing knobs.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    pub output_timeout: Duration,
}

/// Terminal outcome of monitoring one task.
#[derive(Debug, Clone)]
pub struct MonitorOutcome {
    pub task_id: String,
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub diagnosis: Option<String>,
    /// Set when the task was killed over a transient failure worth
    /// re-running. The monitor itself never resubmits.
    pub retry_suggested: bool,
    /// Surfaced for manual intervention on `stuck` outcomes.
    pub pid: u32,
}

impl MonitorOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

// ============================================================================
// Process control seam
// ============================================================================

/// Narrow interface over the ambient process side effects (liveness, signals,
/// log inspection) so the monitor can be tested against a fake.
pub trait ProcessController: Send + Sync {
    fn pid(&self) -> u32;
    /// Exit code once the process has exited, `None` while running.
    fn try_exit_code(&self) -> Option<i32>;
    /// Current size of the task log in bytes (0 when there is no log).
    fn log_size(&self) -> u64;
    /// Up to `max_bytes` from the end of the task log.
    fn log_tail(&self, max_bytes: usize) -> String;
    fn signal_terminate(&self);
    fn signal_kill(&self);
}

/// Real controller over a dispatched Unix process.
pub struct UnixProcess {
    pid: u32,
    log_path: Option<PathBuf>,
    exit_state: ExitState,
}

impl UnixProcess {
    pub fn from_handle(handle: &TaskHandle) -> Self {
        Self {
            pid: handle.pid,
            log_path: handle.log_path.clone(),
            exit_state: handle.exit_state(),
        }
    }

    fn signal(&self, sig: &str) {
        if self.pid == 0 {
            return;
        }
        let result = std::process::Command::new("kill")
            .arg(sig)
            .arg(self.pid.to_string())
            .output();
        if let Err(e) = result {
            warn!(pid = self.pid, sig, err = %e, "failed to signal process");
        }
    }
}

impl ProcessController for UnixProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_exit_code(&self) -> Option<i32> {
        *self.exit_state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn log_size(&self) -> u64 {
        self.log_path
            .as_ref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .unwrap_or(0)
    }

    fn log_tail(&self, max_bytes: usize) -> String {
        let Some(path) = &self.log_path else {
            return String::new();
        };
        match std::fs::read(path) {
            Ok(bytes) => {
                let start = bytes.len().saturating_sub(max_bytes);
                String::from_utf8_lossy(&bytes[start..]).into_owned()
            }
            Err(_) => String::new(),
        }
    }

    fn signal_terminate(&self) {
        self.signal("-TERM");
    }

    fn signal_kill(&self) {
        self.signal("-KILL");
    }
}

// ============================================================================
// Monitor loop
// ============================================================================

/// Supervise one task to a terminal outcome.
///
/// Registry writes are split per the telemetry/control distinction: byte
/// counts are best-effort, terminal status writes propagate failure.
pub async fn monitor_task(
    db: &Database,
    task_id: &str,
    agent: &str,
    output_mode: OutputMode,
    proc: &dyn ProcessController,
    diagnosis: Option<&dyn DiagnosisProvider>,
    config: &MonitorConfig,
) -> Result<MonitorOutcome> {
    let started = Instant::now();
    let mut last_output = started; // reset only when real output arrives
    let mut window_start = started; // additionally reset by an AI `continue`
    let mut last_bytes = proc.log_size();
    let mut ai_checked_this_window = false;
    let mut ai_unavailable = false;
    let mut ai_said_continue = false;

    loop {
        sleep(config.poll_interval).await;

        if let Some(code) = proc.try_exit_code() {
            let status = if code == 0 {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };
            db.complete_task(task_id, code, status)?;
            debug!(task_id, code, "task exited");
            return Ok(MonitorOutcome {
                task_id: task_id.to_string(),
                status,
                exit_code: Some(code),
                diagnosis: None,
                retry_suggested: false,
                pid: proc.pid(),
            });
        }

        // Pass-through tasks expose no log; only liveness applies.
        if output_mode == OutputMode::Terminal {
            continue;
        }

        let bytes = proc.log_size();
        if bytes > last_bytes {
            last_bytes = bytes;
            last_output = Instant::now();
            window_start = last_output;
            ai_checked_this_window = false;
            ai_unavailable = false;
            ai_said_continue = false;
            // Telemetry write: tolerate failure, retry next tick.
            if let Err(e) = db.update_output_bytes(task_id, bytes) {
                warn!(task_id, err = %e, "output byte update failed");
            }
            continue;
        }

        if window_start.elapsed() < config.output_timeout {
            continue;
        }
        let silence = last_output.elapsed();

        if ai_said_continue && silence >= config.output_timeout * CONTINUE_CEILING_FACTOR {
            let diag = format!(
                "still silent {}s after diagnosis extension (ceiling {}s)",
                silence.as_secs(),
                (config.output_timeout * CONTINUE_CEILING_FACTOR).as_secs()
            );
            return perform_action(db, task_id, proc, StuckAction::Escalate, diag, config).await;
        }

        let tail = proc.log_tail(TAIL_BYTES);
        if let Some(m) = match_stuck_patterns(agent, &tail, started.elapsed()) {
            info!(task_id, action = ?m.action, diagnosis = %m.diagnosis, "stuck pattern matched");
            return perform_action(db, task_id, proc, m.action, m.diagnosis, config).await;
        }

        if let (Some(provider), false) = (diagnosis, ai_checked_this_window) {
            ai_checked_this_window = true;
            match provider
                .diagnose(agent, started.elapsed(), silence, &tail)
                .await
            {
                Ok(d) => match d.verdict {
                    Verdict::Continue => {
                        debug!(task_id, confidence = d.confidence, "diagnosis says continue, extending window");
                        ai_said_continue = true;
                        ai_checked_this_window = false;
                        window_start = Instant::now();
                        continue;
                    }
                    verdict => {
                        let action = verdict.action().unwrap_or(StuckAction::Escalate);
                        info!(task_id, ?verdict, diagnosis = %d.diagnosis, "diagnosis verdict");
                        return perform_action(db, task_id, proc, action, d.diagnosis, config)
                            .await;
                    }
                },
                Err(e) => {
                    warn!(task_id, err = %e, "diagnosis call failed, falling back to time heuristic");
                    ai_unavailable = true;
                }
            }
        }

        if (diagnosis.is_none() || ai_unavailable) && silence > HARD_SILENCE {
            let diag = format!(
                "no output for {}s and no diagnosis available",
                silence.as_secs()
            );
            return perform_action(db, task_id, proc, StuckAction::Escalate, diag, config).await;
        }
    }
}

/// Carry out a stuck action and persist the terminal status.
async fn perform_action(
    db: &Database,
    task_id: &str,
    proc: &dyn ProcessController,
    action: StuckAction,
    diagnosis: String,
    config: &MonitorConfig,
) -> Result<MonitorOutcome> {
    match action {
        StuckAction::Kill | StuckAction::Retry => {
            terminate_process(proc, config).await;
            db.mark_task_killed(task_id, &diagnosis)?;
            Ok(MonitorOutcome {
                task_id: task_id.to_string(),
                status: TaskStatus::Killed,
                exit_code: proc.try_exit_code(),
                diagnosis: Some(diagnosis),
                retry_suggested: action == StuckAction::Retry,
                pid: proc.pid(),
            })
        }
        StuckAction::Escalate => {
            // The process is deliberately left running for manual inspection.
            db.mark_task_stuck(task_id, &diagnosis)?;
            warn!(task_id, pid = proc.pid(), %diagnosis, "task escalated, process left running");
            Ok(MonitorOutcome {
                task_id: task_id.to_string(),
                status: TaskStatus::Stuck,
                exit_code: None,
                diagnosis: Some(diagnosis),
                retry_suggested: false,
                pid: proc.pid(),
            })
        }
    }
}

/// Graceful termination: SIGTERM, a grace period, then SIGKILL if ignored.
async fn terminate_process(proc: &dyn ProcessController, config: &MonitorConfig) {
    proc.signal_terminate();
    let deadline = Instant::now() + KILL_GRACE;
    while Instant::now() < deadline {
        if proc.try_exit_code().is_some() {
            return;
        }
        sleep(config.poll_interval.min(Duration::from_millis(200))).await;
    }
    proc.signal_kill();
    // One more short wait so the exit code is usually observable.
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if proc.try_exit_code().is_some() {
            return;
        }
        sleep(config.poll_interval.min(Duration::from_millis(200))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::TaskRecord;
    use crate::diagnosis::StuckDiagnosis;
    use async_trait::async_trait;
    use chrono::Local;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Scripted process controller.
    struct FakeProcess {
        pid: u32,
        exit: Mutex<Option<i32>>,
        log: Mutex<String>,
        term_signaled: AtomicBool,
        kill_signaled: AtomicBool,
        /// Exit code installed when a terminate signal arrives.
        exit_on_term: Option<i32>,
    }

    impl FakeProcess {
        fn running(log: &str) -> Self {
            Self {
                pid: 1234,
                exit: Mutex::new(None),
                log: Mutex::new(log.to_string()),
                term_signaled: AtomicBool::new(false),
                kill_signaled: AtomicBool::new(false),
                exit_on_term: Some(143),
            }
        }

        fn exited(code: i32) -> Self {
            let p = Self::running("");
            *p.exit.lock().unwrap() = Some(code);
            p
        }
    }

    impl ProcessController for FakeProcess {
        fn pid(&self) -> u32 {
            self.pid
        }
        fn try_exit_code(&self) -> Option<i32> {
            *self.exit.lock().unwrap()
        }
        fn log_size(&self) -> u64 {
            self.log.lock().unwrap().len() as u64
        }
        fn log_tail(&self, max_bytes: usize) -> String {
            let log = self.log.lock().unwrap();
            let start = log.len().saturating_sub(max_bytes);
            log[start..].to_string()
        }
        fn signal_terminate(&self) {
            self.term_signaled.store(true, Ordering::SeqCst);
            if let Some(code) = self.exit_on_term {
                *self.exit.lock().unwrap() = Some(code);
            }
        }
        fn signal_kill(&self) {
            self.kill_signaled.store(true, Ordering::SeqCst);
            *self.exit.lock().unwrap() = Some(137);
        }
    }

    /// Diagnosis provider that always answers the same verdict.
    struct FixedDiagnosis(Verdict);

    #[async_trait]
    impl DiagnosisProvider for FixedDiagnosis {
        async fn diagnose(
            &self,
            _agent: &str,
            _elapsed: Duration,
            _silence: Duration,
            _tail: &str,
        ) -> Result<StuckDiagnosis> {
            Ok(StuckDiagnosis {
                verdict: self.0,
                diagnosis: "scripted".to_string(),
                confidence: 0.9,
            })
        }
    }

    struct UnavailableDiagnosis;

    #[async_trait]
    impl DiagnosisProvider for UnavailableDiagnosis {
        async fn diagnose(
            &self,
            _agent: &str,
            _elapsed: Duration,
            _silence: Duration,
            _tail: &str,
        ) -> Result<StuckDiagnosis> {
            anyhow::bail!("no model configured")
        }
    }

    fn test_db_with_task(task_id: &str) -> Database {
        let db = Database::new_in_memory().unwrap();
        db.initialize_schema().unwrap();
        db.insert_task(&TaskRecord {
            id: task_id.to_string(),
            project: "demo".to_string(),
            agent: "claude".to_string(),
            command_label: "test".to_string(),
            pid: Some(1234),
            log_path: None,
            output_bytes: 0,
            status: TaskStatus::Running,
            exit_code: None,
            diagnosis: None,
            started_at: Local::now(),
            completed_at: None,
        })
        .unwrap();
        db
    }

    fn config(timeout_secs: u64) -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_millis(500),
            output_timeout: Duration::from_secs(timeout_secs),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_natural_exit_completes_and_persists() {
        let db = test_db_with_task("t1");
        let proc = FakeProcess::exited(0);

        let outcome = monitor_task(
            &db,
            "t1",
            "claude",
            OutputMode::Capture,
            &proc,
            None,
            &config(10),
        )
        .await
        .unwrap();

        assert_eq!(outcome.status, TaskStatus::Completed);
        assert_eq!(outcome.exit_code, Some(0));
        let record = db.get_task("t1").unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nonzero_exit_fails() {
        let db = test_db_with_task("t1");
        let proc = FakeProcess::exited(2);

        let outcome = monitor_task(
            &db,
            "t1",
            "claude",
            OutputMode::Capture,
            &proc,
            None,
            &config(10),
        )
        .await
        .unwrap();

        assert_eq!(outcome.status, TaskStatus::Failed);
        assert_eq!(outcome.exit_code, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pattern_match_kills_process() {
        let db = test_db_with_task("t1");
        let proc = FakeProcess::running("Error: invalid API key provided. Exiting.");

        let outcome = monitor_task(
            &db,
            "t1",
            "claude",
            OutputMode::Capture,
            &proc,
            None,
            &config(5),
        )
        .await
        .unwrap();

        assert_eq!(outcome.status, TaskStatus::Killed);
        assert!(proc.term_signaled.load(Ordering::SeqCst));
        assert!(!outcome.retry_suggested);
        let record = db.get_task("t1").unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Killed);
        assert_eq!(record.diagnosis.as_deref(), Some("authentication failure"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_pattern_kills_with_retry_flag() {
        let db = test_db_with_task("t1");
        let proc = FakeProcess::running("upstream said: 503 Service Unavailable, backing off");

        let outcome = monitor_task(
            &db,
            "t1",
            "codex",
            OutputMode::Capture,
            &proc,
            None,
            &config(5),
        )
        .await
        .unwrap();

        assert_eq!(outcome.status, TaskStatus::Killed);
        assert!(outcome.retry_suggested);
    }

    #[tokio::test(start_paused = true)]
    async fn test_escalation_waits_for_hard_silence() {
        // Scenario B: silence past the output timeout, healthy-looking tail,
        // no diagnosis available. Escalation must not fire before total
        // silence exceeds 60s.
        let db = test_db_with_task("t1");
        let healthy = "building dependency graph, this can take a while. all good so far. \
                       resolving 2814 crates from the lockfile and verifying checksums now.";
        let proc = FakeProcess::running(healthy);

        let start = Instant::now();
        let outcome = monitor_task(
            &db,
            "t1",
            "claude",
            OutputMode::Capture,
            &proc,
            None,
            &config(10),
        )
        .await
        .unwrap();

        assert_eq!(outcome.status, TaskStatus::Stuck);
        assert_eq!(outcome.pid, 1234);
        // Fired after the 60s hard-silence bound, not at the 10s timeout.
        assert!(start.elapsed() > Duration::from_secs(60));
        assert!(start.elapsed() < Duration::from_secs(70));
        // Escalation leaves the process running.
        assert!(!proc.term_signaled.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_diagnosis_uses_same_heuristic() {
        let db = test_db_with_task("t1");
        let healthy = "long fetch in progress... still working through the mirror list \
                       without errors, nothing suspicious in this window of output text.";
        let proc = FakeProcess::running(healthy);
        let provider = UnavailableDiagnosis;

        let outcome = monitor_task(
            &db,
            "t1",
            "claude",
            OutputMode::Capture,
            &proc,
            Some(&provider),
            &config(10),
        )
        .await
        .unwrap();

        assert_eq!(outcome.status, TaskStatus::Stuck);
        assert!(outcome.diagnosis.unwrap().contains("no diagnosis available"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_continue_verdict_extends_then_ceiling_escalates() {
        let db = test_db_with_task("t1");
        let healthy = "checkpoint reached, compaction running in the background as expected; \
                       this stage is known to be quiet for several minutes at a time.";
        let proc = FakeProcess::running(healthy);
        let provider = FixedDiagnosis(Verdict::Continue);

        let start = Instant::now();
        let outcome = monitor_task(
            &db,
            "t1",
            "claude",
            OutputMode::Capture,
            &proc,
            Some(&provider),
            &config(30),
        )
        .await
        .unwrap();

        // 2x ceiling on a 30s timeout: escalation lands at ~60s of silence,
        // despite the model repeatedly voting continue.
        assert_eq!(outcome.status, TaskStatus::Stuck);
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert!(start.elapsed() < Duration::from_secs(75));
        assert!(outcome.diagnosis.unwrap().contains("ceiling"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_verdict_from_diagnosis() {
        let db = test_db_with_task("t1");
        let healthy = "nothing in this tail matches any fixed pattern but the model knows \
                       the session is beyond saving and votes for termination here.";
        let proc = FakeProcess::running(healthy);
        let provider = FixedDiagnosis(Verdict::Kill);

        let outcome = monitor_task(
            &db,
            "t1",
            "claude",
            OutputMode::Capture,
            &proc,
            Some(&provider),
            &config(10),
        )
        .await
        .unwrap();

        assert_eq!(outcome.status, TaskStatus::Killed);
        assert_eq!(outcome.diagnosis.as_deref(), Some("scripted"));
        assert!(proc.term_signaled.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_mode_only_polls_liveness() {
        let db = test_db_with_task("t1");
        // No log at all; in terminal mode the monitor must not escalate on
        // silence, only wait for exit.
        let proc = FakeProcess::running("");

        let cfg = config(10);
        let monitor = monitor_task(
            &db,
            "t1",
            "claude",
            OutputMode::Terminal,
            &proc,
            None,
            &cfg,
        );
        let timed = tokio::time::timeout(Duration::from_secs(200), monitor).await;
        // Still supervising after 200s of silence: no log-based escalation.
        assert!(timed.is_err());
    }
}
