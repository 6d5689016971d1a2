//! `warren-ctl worker`: run a worker until Ctrl-C or broker loss.

use anyhow::{Context, Result};
use warren_core::config::WarrenConfig;
use warren_services::kernels::builtin_handlers;
use warren_services::Worker;

pub struct WorkerArgs {
    pub id: Option<String>,
    pub broker: Option<String>,
    pub cores: Option<u32>,
    pub max_jobs: Option<u32>,
}

pub async fn cmd_worker(mut config: WarrenConfig, args: WorkerArgs) -> Result<()> {
    if let Some(id) = args.id {
        config.worker.id = id;
    }
    if let Some(broker) = args.broker {
        config.worker.broker = broker;
    }
    if let Some(cores) = args.cores {
        config.worker.cores = cores;
    }
    if let Some(max_jobs) = args.max_jobs {
        config.worker.max_concurrent_jobs = max_jobs;
    }

    let worker = Worker::connect(&config.worker, config.transport.clone(), builtin_handlers())
        .await
        .with_context(|| format!("failed to reach broker at {}", config.worker.broker))?;

    println!("═══════════════════════════════════════");
    println!("  Worker {}", worker.id());
    println!("═══════════════════════════════════════");
    println!("  Broker : {}", config.worker.broker);
    println!("  Cores  : {}", worker.cores());
    println!();

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    worker.run(shutdown_rx).await.context("worker stopped")
}
