use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use inkflow_core::config::{AppConfig, CheckpointBackend};
use inkflow_graph::{CheckpointStore, SqliteCheckpointStore};

#[derive(Parser)]
#[command(name = "inkflow", version, about = "Inspect and manage inkflow workflow runs")]
struct Cli {
    /// Path to config file
    #[arg(short, long, env = "INKFLOW_CONFIG", default_value = "inkflow.toml")]
    config: PathBuf,

    /// Checkpoint database (overrides `[checkpoint].path`)
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the resolved configuration
    Config,
    /// List runs that have checkpoints
    Runs,
    /// List the checkpoints of a run
    Checkpoints {
        run_id: String,
    },
    /// Print the latest state snapshot of a run
    State {
        run_id: String,
        /// Snapshot at this step instead of the latest
        #[arg(long)]
        step: Option<usize>,
    },
    /// Delete all checkpoints of a run
    Prune {
        run_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_or_default(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .with_target(false)
        .init();

    if let Commands::Config = cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    if cli.db.is_none() && config.checkpoint.backend == CheckpointBackend::Memory {
        warn!("Checkpoint backend is 'memory'; reading the sqlite path anyway");
    }
    let db_path = cli
        .db
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.checkpoint.path));
    let store = SqliteCheckpointStore::open(&db_path)?;

    match cli.command {
        Commands::Config => {}
        Commands::Runs => {
            let runs = store.list_runs()?;
            if runs.is_empty() {
                println!("No runs recorded in {}.", db_path.display());
            }
            for (run_id, last_step) in runs {
                println!("{:<40} {} steps", run_id, last_step);
            }
        }
        Commands::Checkpoints { run_id } => {
            let records = store.list(&run_id)?;
            if records.is_empty() {
                anyhow::bail!("no checkpoints for run '{}'", run_id);
            }
            println!("Run {}:", run_id);
            for record in &records {
                println!(
                    "  {:>4}  {:<24} {}",
                    record.step,
                    record.node,
                    record.timestamp.format("%Y-%m-%d %H:%M:%S%.3f")
                );
            }
        }
        Commands::State { run_id, step } => {
            let record = match step {
                Some(step) => store.list(&run_id)?.into_iter().find(|r| r.step == step),
                None => store.load_latest(&run_id)?,
            };
            let Some(record) = record else {
                anyhow::bail!("no matching checkpoint for run '{}'", run_id);
            };
            info!(run_id = %record.run_id, step = record.step, node = %record.node, "Loaded checkpoint");
            println!("{}", serde_json::to_string_pretty(&record.state)?);
        }
        Commands::Prune { run_id } => {
            let removed = store.delete_run(&run_id)?;
            println!("Removed {} checkpoints of run '{}'.", removed, run_id);
        }
    }

    Ok(())
}
