//! Runtime settings loaded from the environment.

use std::path::PathBuf;
use std::time::Duration;

/// Process-wide settings. Loaded once at startup from environment variables
/// (`.env` is read first via dotenv in `main`).
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory for logs, prompt files, and the registry database.
    pub data_dir: PathBuf,
    /// Chat-completions endpoint for the diagnosis fallback. Absence means
    /// diagnosis is unavailable, which is a recoverable condition.
    pub model_api_url: Option<String>,
    /// API key for the inference endpoint.
    pub model_api_key: Option<String>,
    /// Model name sent with diagnosis requests.
    pub model_name: String,
    /// Heartbeat monitor poll period.
    pub poll_interval: Duration,
    /// Silence window before stuck detection engages.
    pub output_timeout: Duration,
    /// Job scheduler tick period.
    pub scheduler_tick: Duration,
}

impl Settings {
    /// Build settings from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("DELIVERY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".delivery-manager")
            });

        Self {
            data_dir,
            model_api_url: std::env::var("MODEL_API_URL").ok(),
            model_api_key: std::env::var("MODEL_API_KEY").ok(),
            model_name: std::env::var("MODEL_NAME")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            poll_interval: duration_from_env("MONITOR_POLL_SECS", 2),
            output_timeout: duration_from_env("OUTPUT_TIMEOUT_SECS", 120),
            scheduler_tick: duration_from_env("SCHEDULER_TICK_SECS", 30),
        }
    }

    /// Path of the SQLite registry database.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("registry.db")
    }

    /// Directory for task log files.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Directory for prompt files handed to agent processes.
    pub fn prompt_dir(&self) -> PathBuf {
        self.data_dir.join("prompts")
    }
}

fn duration_from_env(key: &str, default_secs: u64) -> Duration {
    let secs = std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default_secs);
    Duration::from_secs(secs)
}
