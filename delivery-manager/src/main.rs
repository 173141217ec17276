use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use delivery_manager::config::Settings;
use delivery_manager::database::Database;
use delivery_manager::git_ops::GitOps;
use delivery_manager::models::AgentProfile;
use delivery_manager::orchestrator::AgentTaskRunner;
use delivery_manager::pipeline::Pipeline;
use delivery_manager::scheduler::SchedulerContext;

#[derive(Parser)]
#[command(name = "delivery-manager", version, about = "Autonomous delivery pipelines over coding agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one delivery pipeline against a project checkout
    Run {
        /// Path to the project's git checkout
        #[arg(long)]
        project: PathBuf,
        /// What to deliver, in plain language
        #[arg(long)]
        prompt: String,
        /// Agent CLI to invoke
        #[arg(long, default_value = "claude")]
        agent: String,
        /// Model passed to the agent as --model
        #[arg(long)]
        model: Option<String>,
        /// Concurrent engineers per phase (1 or 2)
        #[arg(long, default_value_t = 1)]
        workers: usize,
    },
    /// Start the job scheduler loop
    Scheduler {
        /// Concurrent engineers per phase for scheduled runs (1 or 2)
        #[arg(long, default_value_t = 1)]
        workers: usize,
    },
    /// Show running tasks and recent job runs
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env();
    let db = Database::new(settings.db_path())?;
    db.initialize_schema()?;

    match cli.command {
        Commands::Run {
            project,
            prompt,
            agent,
            model,
            workers,
        } => run_once(db, settings, project, prompt, agent, model, workers).await,
        Commands::Scheduler { workers } => {
            SchedulerContext::new(db, settings, workers).run_loop().await
        }
        Commands::Status => show_status(&db),
    }
}

async fn run_once(
    db: Database,
    settings: Settings,
    project: PathBuf,
    prompt: String,
    agent: String,
    model: Option<String>,
    workers: usize,
) -> Result<()> {
    let project = project
        .canonicalize()
        .with_context(|| format!("resolve project path {}", project.display()))?;
    let project_name = project
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("project")
        .to_string();

    let family = std::path::Path::new(&agent)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("agent");
    let mut profile = AgentProfile::new(family, &agent);
    if let Some(model) = model {
        profile = profile.with_model(model);
    }

    let runner = AgentTaskRunner::new(db, settings, profile, project_name.clone());
    let git = GitOps::new(&project);
    let pipeline = Pipeline {
        runner: &runner,
        git: &git,
        project_name,
        workers_per_phase: workers,
    };

    let outcome = pipeline.deliver(&prompt).await?;
    println!("✅ Delivery complete");
    println!("   slug:   {}", outcome.slug);
    println!("   branch: {}", outcome.branch);
    match outcome.pr_url {
        Some(url) => println!("   pr:     {}", url),
        None => println!("   pr:     (none, branch is local or push-only)"),
    }
    Ok(())
}

fn show_status(db: &Database) -> Result<()> {
    let tasks = db.get_running_tasks()?;
    if tasks.is_empty() {
        println!("No running tasks");
    } else {
        println!("Running tasks:");
        for t in tasks {
            println!(
                "  {}  {}  {}  pid={}  since {}",
                t.id,
                t.agent,
                t.command_label,
                t.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                t.started_at.format("%Y-%m-%d %H:%M")
            );
        }
    }

    let runs = db.get_recent_runs(10)?;
    if runs.is_empty() {
        println!("No job runs yet");
    } else {
        println!("Recent job runs:");
        for r in runs {
            println!(
                "  {}  {:9}  {}  {}  {}",
                r.created_at.format("%Y-%m-%d %H:%M"),
                r.status.as_str(),
                r.slug.as_deref().unwrap_or("-"),
                r.branch.as_deref().unwrap_or("-"),
                r.error.as_deref().unwrap_or("")
            );
        }
    }
    Ok(())
}
