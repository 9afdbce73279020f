//! Checkpointed Iteration Runtime launcher
//!
//! This binary starts a group of worker processes, runs a single worker, or
//! inspects the checkpoints a job left behind.
//!
//! # Usage
//!
//! ```bash
//! # Run a four member job
//! cir launch --np 4
//!
//! # Crash rank 0 at iteration 15, then relaunch to resume from iteration 10
//! cir launch --np 4 --fault 15:0
//! cir launch --np 4
//!
//! # Show what each rank would recover from
//! cir inspect
//! ```

mod launch;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cir_core::{
    CheckpointStore, FaultTrigger, LocalStorage, RuntimeConfig, StorageBackend, TcpGroup,
    WorkerLoop,
};
use launch::LaunchPlan;

/// Checkpointed Iteration Runtime
#[derive(Parser, Debug)]
#[command(name = "cir")]
#[command(about = "Run groups of checkpointing workers and inspect their state")]
struct Args {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a group server and one worker process per rank
    Launch {
        /// Number of worker processes
        #[arg(short = 'n', long)]
        np: u32,

        /// Crash a rank at an iteration, as ITERATION:RANK (repeatable)
        #[arg(long = "fault")]
        faults: Vec<FaultTrigger>,

        /// Delete existing checkpoints before starting
        #[arg(long)]
        fresh: bool,
    },

    /// Run a single worker; normally started by `launch`
    Worker,

    /// Print the checkpoint each rank would recover from
    Inspect {
        /// Only inspect this rank
        #[arg(short, long)]
        rank: Option<u32>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<RuntimeConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::default(),
    }
    .with_env_overrides();

    config.validate()?;
    Ok(config)
}

async fn run_worker(config: RuntimeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let group = TcpGroup::new(config.group.clone());
    let mut worker = WorkerLoop::from_config(&config, group)?;

    let result = tokio::task::spawn_blocking(move || worker.run()).await?;
    match result {
        Ok(report) => {
            tracing::info!(
                "Rank {} done: {} checkpoints written",
                report.membership.rank,
                report.saved_iterations().len()
            );
            Ok(())
        }
        Err(e) if e.is_injected_fault() => {
            tracing::error!("{}; exiting abruptly", e);
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

fn inspect(config: &RuntimeConfig, rank: Option<u32>) -> Result<(), Box<dyn std::error::Error>> {
    let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(&config.storage)?);
    let store = CheckpointStore::new(storage, config.checkpoint.clone(), config.job.vector_len);

    let ranks = match rank {
        Some(rank) => vec![rank],
        None => store.ranks()?,
    };

    if ranks.is_empty() {
        println!("no checkpoints under {}", config.checkpoint.checkpoint_dir.display());
    }

    for rank in ranks {
        let path = store.path_for(rank);
        match store.try_load(rank) {
            Ok(Some(state)) => println!(
                "rank {:>3}  iteration {:>6}  sum {:>14.6}  {}",
                rank,
                state.iteration,
                state.sum(),
                path.display()
            ),
            Ok(None) => println!("rank {:>3}  no checkpoint  {}", rank, path.display()),
            Err(e) => println!("rank {:>3}  unusable: {}", rank, e),
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(args.config.as_ref())?;

    match args.command {
        Command::Launch { np, faults, fresh } => {
            let exits = launch::run(LaunchPlan {
                np,
                config,
                config_path: args.config,
                faults,
                fresh,
            })
            .await?;

            let failed: Vec<u32> = exits
                .iter()
                .filter(|e| !e.success())
                .map(|e| e.rank)
                .collect();
            if !failed.is_empty() {
                tracing::error!("Job failed; unsuccessful ranks: {:?}", failed);
                std::process::exit(1);
            }
            tracing::info!("All {} workers finished", np);
        }
        Command::Worker => run_worker(config).await?,
        Command::Inspect { rank } => inspect(&config, rank)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_launch() {
        let args =
            Args::try_parse_from(["cir", "launch", "--np", "4", "--fault", "15:0", "--fresh"])
                .unwrap();

        match args.command {
            Command::Launch { np, faults, fresh } => {
                assert_eq!(np, 4);
                assert_eq!(faults, vec![FaultTrigger::new(15, 0)]);
                assert!(fresh);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn test_parse_rejects_bad_fault() {
        assert!(Args::try_parse_from(["cir", "launch", "--np", "2", "--fault", "15"]).is_err());
    }

    #[test]
    fn test_parse_inspect_with_global_config() {
        let args = Args::try_parse_from(["cir", "inspect", "--rank", "2", "--config", "job.toml"])
            .unwrap();

        assert_eq!(args.config, Some(PathBuf::from("job.toml")));
        assert!(matches!(args.command, Command::Inspect { rank: Some(2) }));
    }

    #[test]
    fn test_inspect_empty_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = RuntimeConfig::default();
        config.storage.base_path = dir.path().to_path_buf();

        inspect(&config, None).unwrap();
        inspect(&config, Some(0)).unwrap();
    }
}
