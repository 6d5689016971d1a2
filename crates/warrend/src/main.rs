//! warrend: Warren broker daemon.

use anyhow::Result;
use clap::Parser;

use warren_core::config::{ConfigError, WarrenConfig};
use warrend::Broker;

#[derive(Parser)]
#[command(name = "warrend", about = "Warren job broker")]
struct Args {
    /// Port to listen on (overrides config).
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind (overrides config).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    // Load config
    match WarrenConfig::write_default_if_missing() {
        Ok(path) => tracing::debug!(path = %path.display(), "config file"),
        Err(e) => tracing::warn!(error = %e, "failed to write default config"),
    }
    let mut config = match WarrenConfig::load() {
        Ok(config) => config,
        Err(e @ ConfigError::Invalid { .. }) => {
            return Err(anyhow::Error::new(e).context("invalid configuration"));
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            WarrenConfig::default()
        }
    };
    if let Some(port) = args.port {
        config.broker.port = port;
    }
    if let Some(bind) = args.bind {
        config.broker.bind_addr = bind;
    }

    tracing::info!(
        bind = %config.broker.bind_addr,
        port = config.broker.port,
        "warrend starting"
    );

    let broker = Broker::bind(&config.broker, config.transport.clone()).await?;

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    broker.run(shutdown_tx.subscribe()).await;
    Ok(())
}
