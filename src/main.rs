//! `ralph`: supervise an autonomous story backlog.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ralph_supervisor::backlog::parse_backlog;
use ralph_supervisor::lock::LockManager;
use ralph_supervisor::{Supervisor, SupervisorError, SupervisorSettings};

/// Exit code when another supervisor holds the backlog.
const EXIT_LOCKED: u8 = 2;
/// Exit code when the run ended with failed or blocked stories.
const EXIT_INCOMPLETE: u8 = 3;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(
    name = "ralph",
    version,
    about = "Execution supervisor for autonomous story backlogs"
)]
struct Cli {
    /// Settings file (default: ./ralph.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Supervise a backlog until it is exhausted or interrupted.
    Run {
        /// Backlog file (overrides the settings file)
        #[arg(long)]
        backlog: Option<PathBuf>,

        /// Maximum stories executed concurrently
        #[arg(long)]
        max_workers: Option<usize>,

        /// Apply split proposals without asking
        #[arg(long, conflicts_with = "manual_approve")]
        auto_approve: bool,

        /// Ask on the terminal before applying a split
        #[arg(long)]
        manual_approve: bool,
    },
    /// Print per-story status of a backlog.
    Status {
        /// Backlog file (overrides the settings file)
        #[arg(long)]
        backlog: Option<PathBuf>,

        /// Print the backlog state as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the default settings as TOML.
    InitConfig,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    let result = match cli.command {
        Command::InitConfig => init_config(),
        Command::Status { backlog, json } => status(cli.config, backlog, json),
        Command::Run {
            backlog,
            max_workers,
            auto_approve,
            manual_approve,
        } => run(cli.config, backlog, max_workers, auto_approve, manual_approve).await,
    };

    match result {
        Ok(code) => code,
        Err(err @ SupervisorError::LockConflict { .. }) => {
            error!(error = %err, "backlog is locked");
            eprintln!("error: {}", err);
            ExitCode::from(EXIT_LOCKED)
        }
        Err(err) => {
            error!(error = %err, kind = err.kind(), "supervisor stopped");
            eprintln!("error: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn init_config() -> Result<ExitCode, SupervisorError> {
    print!("{}", SupervisorSettings::default().to_toml()?);
    Ok(ExitCode::SUCCESS)
}

fn status(
    config: Option<PathBuf>,
    backlog: Option<PathBuf>,
    json: bool,
) -> Result<ExitCode, SupervisorError> {
    let settings = SupervisorSettings::load(config.as_deref())?;
    let path = backlog.unwrap_or(settings.backlog);
    let content = std::fs::read_to_string(&path)?;
    let backlog = parse_backlog(&content)?;

    if json {
        let rendered = serde_json::to_string_pretty(&backlog)
            .map_err(|e| SupervisorError::Config(e.to_string()))?;
        println!("{}", rendered);
        return Ok(ExitCode::SUCCESS);
    }

    println!("{} ({})", backlog.project, path.display());
    if let Ok(Some(holder)) = LockManager::new(&path).holder() {
        println!(
            "locked by pid {} since {}",
            holder.pid,
            holder.acquired_at.to_rfc3339()
        );
    }
    for story in &backlog.user_stories {
        let done = story.completed_criteria().count();
        println!(
            "{:<14} {:<12} {}/{} criteria  score {:>4.1}  gates {:>2}  {}",
            story.id,
            story.status.to_string(),
            done,
            story.acceptance_criteria.len(),
            story.complexity_score,
            story.gate_results.len(),
            story.title
        );
        if let Some(last_error) = &story.last_error {
            println!("{:<14} last error: {}", "", last_error);
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn run(
    config: Option<PathBuf>,
    backlog: Option<PathBuf>,
    max_workers: Option<usize>,
    auto_approve: bool,
    manual_approve: bool,
) -> Result<ExitCode, SupervisorError> {
    let mut settings = SupervisorSettings::load(config.as_deref())?;
    if let Some(workers) = max_workers {
        settings.workers.max_workers = workers.max(1);
    }
    if auto_approve {
        settings.split.auto_approve = true;
    }
    if manual_approve {
        settings.split.auto_approve = false;
    }

    let supervisor = Supervisor::new(
        settings.supervisor_config(backlog),
        Arc::new(settings.agent()),
    )
    .with_gates(settings.gates());

    let handle = supervisor.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, draining");
            handle.shutdown();
        }
    });

    let summary = supervisor.run().await?;
    println!("{}", summary);
    if summary.interrupted {
        Ok(ExitCode::from(EXIT_INTERRUPTED))
    } else if summary.failed > 0 || summary.blocked > 0 {
        Ok(ExitCode::from(EXIT_INCOMPLETE))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}
