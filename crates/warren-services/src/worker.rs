//! Worker runtime.
//!
//! Registers with the broker announcing its cores, then serves task requests
//! until shutdown or disconnect. Each request runs as its own tokio task
//! through the [`JobExecutor`]; its result is sent back on the same
//! connection as soon as it is ready, in completion order.

use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinSet};
use warren_core::config::{TransportConfig, WorkerConfig};
use warren_core::message::{Message, TaskRequest, WorkerRegistration};
use warren_transport::{Connection, Endpoint, TransportError};

use crate::executor::JobExecutor;
use crate::handler::HandlerTable;
use crate::peer::{connect_and_register, send_message, RuntimeError};

pub struct Worker {
    id: String,
    cores: u32,
    endpoint: Endpoint,
    conn: Connection,
    executor: JobExecutor,
}

impl Worker {
    /// Connect to the configured broker and register.
    pub async fn connect(
        config: &WorkerConfig,
        transport: TransportConfig,
        handlers: HandlerTable,
    ) -> Result<Self, RuntimeError> {
        let cores = config.effective_cores();
        let max_jobs = match config.max_concurrent_jobs {
            0 => cores,
            n => n,
        };
        let registration = Message::RegisterWorker(WorkerRegistration {
            id: config.id.clone(),
            cores,
        });
        let (endpoint, conn) = connect_and_register(&config.broker, transport, &registration).await?;

        tracing::info!(
            worker = %config.id,
            cores,
            max_jobs,
            jobs = ?handlers.names(),
            "worker ready"
        );

        Ok(Self {
            id: config.id.clone(),
            cores,
            endpoint,
            conn,
            executor: JobExecutor::new(handlers, max_jobs as usize),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cores(&self) -> u32 {
        self.cores
    }

    /// Serve requests until `shutdown` fires or the broker goes away.
    ///
    /// On shutdown, jobs already running finish and their results are sent
    /// before the connection closes. On disconnect they are abandoned.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<(), RuntimeError> {
        let mut jobs = JoinSet::new();
        let outcome = loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(worker = %self.id, running = jobs.len(), "worker shutting down");
                    while let Some(joined) = jobs.join_next().await {
                        log_job_panic(joined);
                    }
                    self.conn.close().await;
                    break Ok(());
                }

                received = self.conn.receive() => {
                    match received {
                        Ok(payload) => self.handle(&payload, &mut jobs),
                        Err(e @ TransportError::Disconnected(_)) => {
                            tracing::warn!(worker = %self.id, abandoned = jobs.len(), "broker disconnected");
                            break Err(e.into());
                        }
                        Err(e) => break Err(e.into()),
                    }
                }

                Some(joined) = jobs.join_next(), if !jobs.is_empty() => log_job_panic(joined),
            }
        };
        jobs.shutdown().await;
        self.endpoint.shutdown().await;
        outcome
    }

    fn handle(&self, payload: &[u8], jobs: &mut JoinSet<()>) {
        match Message::decode(payload) {
            Ok(Message::TaskRequest(request)) => self.spawn_job(request, jobs),
            Ok(other) => {
                tracing::warn!(worker = %self.id, action = ?other.action(), "unexpected message from broker");
            }
            Err(e) => {
                tracing::warn!(worker = %self.id, error = %e, "malformed message dropped");
            }
        }
    }

    fn spawn_job(&self, request: TaskRequest, jobs: &mut JoinSet<()>) {
        tracing::info!(
            task_id = %request.id,
            job = %request.func,
            cores = request.cores,
            "task received"
        );
        let executor = self.executor.clone();
        let conn = self.conn.clone();
        jobs.spawn(async move {
            let result = executor.execute(request).await;
            let task_id = result.id.clone();
            if let Err(e) = send_message(&conn, &Message::TaskResult(result)).await {
                tracing::warn!(task_id = %task_id, error = %e, "failed to return result");
            }
        });
    }
}

fn log_job_panic(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            tracing::error!(error = %e, "job task panicked");
        }
    }
}
