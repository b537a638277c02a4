//! Keel operator tool.

use clap::{Parser, Subcommand};
use keel_config::{CoordinatorConfig, LogFormat, LoggingConfig};
use keel_core::JobId;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "keel")]
#[command(about = "Store-backed coordination for deployment workers", long_about = None)]
struct Cli {
    /// Path to the KDL configuration file
    #[arg(long, env = "KEEL_CONFIG", default_value = "keel.kdl")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply database migrations
    Migrate,
    /// Expire overdue approvals and reclaim abandoned leases
    Sweep {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },
    /// Show queue depth and pending approvals
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Put a dead-lettered job back in the queue
    Requeue {
        /// Job ID
        job_id: JobId,
    },
    /// List dead-lettered jobs
    DeadLetters {
        /// Maximum number of jobs to show
        #[arg(long, default_value = "20")]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = CoordinatorConfig::load(&cli.config)?;
    config.apply_env();
    config.validate()?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Migrate => commands::migrate(&config).await?,
        Commands::Sweep { once } => commands::sweep(config, once).await?,
        Commands::Status { json } => commands::status(config, json).await?,
        Commands::Requeue { job_id } => commands::requeue(config, job_id).await?,
        Commands::DeadLetters { limit } => commands::dead_letters(config, limit).await?,
    }

    Ok(())
}

/// `RUST_LOG` wins over the configured filter when set.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}
