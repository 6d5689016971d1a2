//! warren-ctl: run a Warren worker or submit jobs as a client.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use warren_core::config::WarrenConfig;

mod cmd;

use cmd::submit::{cmd_submit, SubmitArgs};
use cmd::worker::{cmd_worker, WorkerArgs};

#[derive(Parser)]
#[command(name = "warren-ctl", about = "Warren worker and client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve jobs for a broker.
    Worker {
        #[arg(long)]
        id: Option<String>,
        /// Broker address, host:port.
        #[arg(short, long)]
        broker: Option<String>,
        /// Cores to announce.
        #[arg(short, long)]
        cores: Option<u32>,
        /// Jobs allowed to run at once (0 = cores).
        #[arg(long)]
        max_jobs: Option<u32>,
    },

    /// Submit a job and wait for its result.
    Submit {
        /// Job name, e.g. simpleMath.
        func: String,
        /// Job input as JSON.
        #[arg(short, long)]
        data: Option<String>,
        /// Read the job input from a file.
        #[arg(short, long)]
        file: Option<PathBuf>,
        #[arg(short, long, default_value_t = 1)]
        cores: u32,
        /// Submit the same job this many times.
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
        #[arg(long)]
        id: Option<String>,
        #[arg(short, long)]
        broker: Option<String>,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = WarrenConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        WarrenConfig::default()
    });

    match cli.command {
        Command::Worker {
            id,
            broker,
            cores,
            max_jobs,
        } => {
            cmd_worker(
                config,
                WorkerArgs {
                    id,
                    broker,
                    cores,
                    max_jobs,
                },
            )
            .await
        }
        Command::Submit {
            func,
            data,
            file,
            cores,
            count,
            id,
            broker,
        } => {
            cmd_submit(
                config,
                SubmitArgs {
                    id,
                    broker,
                    func,
                    data,
                    file,
                    cores,
                    count,
                },
            )
            .await
        }
    }
}
