use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "coderun")]
#[command(version, about = "Plan, generate, review and safely apply AI-written diffs")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory holding coderun.toml, the database, backups, locks and logs
    #[arg(long, global = true, env = "CODERUN_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Print results as JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the data directory with a default coderun.toml and database
    Init,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Register and manage target repositories
    Repo {
        #[command(subcommand)]
        command: RepoCommands,
    },
    /// Create runs and drive them through their phases
    Run {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Process queued jobs
    Worker {
        /// Seconds to keep claiming jobs (defaults to worker.budget_secs)
        #[arg(long, conflicts_with = "serve")]
        budget: Option<u64>,

        /// Keep polling the queue until Ctrl-C
        #[arg(long)]
        serve: bool,
    },
    /// Inspect and maintain the job queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[derive(Subcommand, Clone)]
pub enum RepoCommands {
    /// Register a directory as a target repository
    Add {
        /// Path to the repository root
        path: PathBuf,
        /// Display name (defaults to the directory name)
        #[arg(short, long)]
        name: Option<String>,
        /// Restrict writes to these path prefixes (repeatable)
        #[arg(long = "allow")]
        allow: Vec<String>,
    },
    /// List registered repositories
    List,
    /// Change a repository's write flags
    Set {
        id: i64,
        #[arg(long)]
        read_only: Option<bool>,
        #[arg(long)]
        maintenance_locked: Option<bool>,
    },
}

#[derive(Subcommand, Clone)]
pub enum RunCommands {
    /// Create a run for a change request
    Create {
        #[arg(long)]
        repo: i64,
        /// The change request
        request: String,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        thread: Option<String>,
    },
    /// Show a run with its steps
    Show { id: i64 },
    /// List recent runs
    List {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Run the plan phase
    Plan { id: i64 },
    /// Run the code phase
    Code { id: i64 },
    /// Run the review phase
    Review { id: i64 },
    /// Apply the reviewed diff
    Apply { id: i64 },
    /// Run whatever phase comes next
    Advance { id: i64 },
    /// Restore the repository to the run's pre-apply checkpoint
    Rollback { id: i64 },
    /// Cancel a run that has not started applying
    Cancel {
        id: i64,
        #[arg(long, default_value = "cancelled by user")]
        reason: String,
    },
    /// Queue the run's next phase for the worker
    Enqueue { id: i64 },
}

#[derive(Subcommand, Clone)]
pub enum QueueCommands {
    /// Job counts by status and type
    Stats,
    /// List recent jobs
    List {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Delete finished jobs older than N days
    Cleanup {
        #[arg(long)]
        days: Option<u64>,
    },
    /// Release jobs stuck in running
    ResetStuck {
        #[arg(long)]
        minutes: Option<u64>,
    },
    /// Queue the job and backup cleanup jobs
    EnqueueMaintenance,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let config = coderun::config::CoderunConfig::load(cli.data_dir.clone(), cli.verbose)?;
    let _log_guard = coderun::logging::init(&config.toml.logging, cli.verbose)?;

    match &cli.command {
        Commands::Init => cmd::cmd_init(&config)?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
        Commands::Repo { command } => cmd::cmd_repo(&cli, &config, command.clone()).await?,
        Commands::Run { command } => cmd::cmd_run(&cli, &config, command.clone()).await?,
        Commands::Worker { budget, serve } => {
            cmd::cmd_worker(&config, *budget, *serve).await?
        }
        Commands::Queue { command } => cmd::cmd_queue(&cli, &config, command.clone()).await?,
    }

    Ok(())
}
