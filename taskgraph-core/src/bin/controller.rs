//! Job controller binary
//!
//! Lays out, inspects, advances and tears down the coordination state of
//! one job. The job comes from `--job`/`JOB_NAME` and the store from
//! `--endpoints`/`ETCD_ENDPOINTS`.

use clap::{Parser, Subcommand};
use std::sync::Arc;
use taskgraph_core::store::{EtcdConfig, EtcdStore};
use taskgraph_core::JobController;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Task-graph job controller
#[derive(Parser, Debug)]
#[command(name = "taskgraph-controller")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Job whose keys are managed
    #[arg(long, env = "JOB_NAME", default_value = "default-job")]
    job: String,

    /// Comma-separated etcd client URLs, tried in order
    #[arg(
        long,
        env = "ETCD_ENDPOINTS",
        value_delimiter = ',',
        default_value = "http://127.0.0.1:2379"
    )]
    endpoints: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
enum Command {
    /// Create the slot layout for a job of `num_tasks` tasks
    Init {
        /// Number of task slots
        num_tasks: u64,
    },
    /// Print the current epoch
    Epoch,
    /// Bump the epoch by one
    Advance,
    /// Remove every key of the job
    Destroy,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Init { .. } => "init",
            Command::Epoch => "epoch",
            Command::Advance => "advance",
            Command::Destroy => "destroy",
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let endpoints: Vec<String> = cli
        .endpoints
        .iter()
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .collect();
    let config = if endpoints.is_empty() {
        EtcdConfig::default()
    } else {
        EtcdConfig {
            endpoints,
            ..EtcdConfig::default()
        }
    };
    let store = Arc::new(EtcdStore::new(config)?);

    let num_tasks = match cli.command {
        Command::Init { num_tasks } => num_tasks,
        _ => 0,
    };
    let job = cli.job;
    let controller = JobController::new(store, job.clone(), num_tasks);

    let outcome = match cli.command {
        Command::Init { .. } => controller.init_layout().await,
        Command::Epoch => controller.epoch().await.map(|epoch| println!("{}", epoch)),
        Command::Advance => controller
            .advance_epoch()
            .await
            .map(|epoch| info!("Job {} now at epoch {}", job, epoch)),
        Command::Destroy => controller.destroy_layout().await,
    };

    if let Err(e) = outcome {
        error!("Job {}: {} failed: {}", job, cli.command.name(), e);
        std::process::exit(1);
    }
    Ok(())
}
