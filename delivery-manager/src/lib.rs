// Runtime settings
pub mod config;

// Shared status enums and agent descriptors
pub mod models;

// SQLite registry for tasks, projects, jobs, and runs
pub mod database;

// Durable phased-execution state (the plan file)
pub mod progress;

// Structured agent event stream decoding
pub mod events;

// Agent process dispatch
pub mod dispatch;

// Cheap stuck-pattern classification
pub mod patterns;

// Model-backed stuck diagnosis fallback
pub mod diagnosis;

// Heartbeat supervision of dispatched tasks
pub mod monitor;

// Git and worktree plumbing
pub mod git_ops;

// Prompt construction for pipeline agents
pub mod prompts;

// The phase-by-phase delivery loop
pub mod orchestrator;

// The end-to-end delivery pipeline
pub mod pipeline;

// Cron-driven job scheduling
pub mod scheduler;
