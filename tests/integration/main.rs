//! Warren integration test harness.
//!
//! Everything runs in-process over real UDP sockets on 127.0.0.1: a broker,
//! any number of workers and clients, and optionally a lossy relay between
//! two endpoints. Timeouts are shortened so failure paths finish quickly.
//!
//!   cargo test --test integration

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use warren_core::config::{BrokerConfig, ClientConfig, TransportConfig, WorkerConfig};
use warren_core::message::TaskResult;
use warren_services::{Client, HandlerTable, RuntimeError, Scheduler, Worker};
use warren_transport::Connection;
use warrend::Broker;

mod fault;
mod scenarios;
mod transport;

// ── Harness ───────────────────────────────────────────────────────────────────

/// How long any single await in a test may take before it counts as hung.
pub const STEP: Duration = Duration::from_secs(10);

pub fn fast_transport() -> TransportConfig {
    TransportConfig {
        retransmit_interval_ms: 40,
        max_retransmit_interval_ms: 320,
        max_retransmits: 10,
        handshake_timeout_ms: 2000,
        keepalive_interval_ms: 200,
        peer_timeout_ms: 1500,
        linger_ms: 1000,
        ..TransportConfig::default()
    }
}

/// A broker running on an ephemeral loopback port.
pub struct TestBroker {
    pub addr: SocketAddr,
    pub scheduler: Arc<Scheduler<Connection>>,
    shutdown: broadcast::Sender<()>,
}

impl TestBroker {
    pub async fn start() -> Result<Self> {
        let config = BrokerConfig {
            bind_addr: "127.0.0.1".into(),
            port: 0,
            snapshot_interval_secs: 1,
        };
        let broker = Broker::bind(&config, fast_transport()).await?;
        let addr = broker.local_addr();
        let scheduler = broker.scheduler();
        let (shutdown, rx) = broadcast::channel(1);
        tokio::spawn(broker.run(rx));
        Ok(Self {
            addr,
            scheduler,
            shutdown,
        })
    }

    /// Connect and run a worker. Dropping the handle stops it gracefully.
    pub async fn worker(&self, id: &str, cores: u32, handlers: HandlerTable) -> Result<TestWorker> {
        let config = WorkerConfig {
            id: id.into(),
            broker: self.addr.to_string(),
            cores,
            max_concurrent_jobs: 0,
        };
        let worker = Worker::connect(&config, fast_transport(), handlers)
            .await
            .with_context(|| format!("worker {id} failed to connect"))?;
        let (stop, rx) = broadcast::channel(1);
        let task = tokio::spawn(worker.run(rx));
        Ok(TestWorker { stop, task })
    }

    pub async fn client(&self, id: &str) -> Result<Client> {
        let config = ClientConfig {
            id: id.into(),
            broker: self.addr.to_string(),
        };
        Client::connect(&config, fast_transport())
            .await
            .with_context(|| format!("client {id} failed to connect"))
    }

    /// Poll until `check` holds or [`STEP`] runs out.
    pub async fn wait_until<F, Fut>(&self, what: &str, mut check: F) -> Result<()>
    where
        F: FnMut(Arc<Scheduler<Connection>>) -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + STEP;
        while !check(Arc::clone(&self.scheduler)).await {
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }
}

/// A running worker.
pub struct TestWorker {
    stop: broadcast::Sender<()>,
    task: JoinHandle<Result<(), RuntimeError>>,
}

impl TestWorker {
    /// Graceful shutdown: running jobs finish and report first.
    pub async fn stop(self) -> Result<()> {
        let _ = self.stop.send(());
        tokio::time::timeout(STEP, self.task)
            .await
            .context("worker did not stop in time")???;
        Ok(())
    }

    /// Crash: the worker vanishes without closing and the broker only
    /// notices through the peer timeout.
    pub fn kill(self) {
        self.task.abort();
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

pub async fn next_result(client: &Client) -> Result<TaskResult> {
    Ok(tokio::time::timeout(STEP, client.next_result())
        .await
        .context("no result in time")??)
}
