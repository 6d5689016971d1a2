//! Broker: accept loop, peer classification and the two serve loops.
//!
//! Every accepted connection gets its own tokio task. The first message on
//! it decides the role:
//!
//! - `RegisterClient` → client loop: each `TaskRequest` is submitted to the
//!   scheduler and dispatched immediately when a worker has room.
//! - `RegisterWorker` → worker loop: each `TaskResult` completes its task,
//!   is forwarded to the owning client, and frees cores for pending work.
//!
//! Sends to workers and clients run in their own tasks so a slow peer never
//! stalls a serve loop. Each loop owns the sends it started. When a loop
//! ends, the peer leaves its registry and the loop waits for those sends.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinSet};
use warren_core::config::{BrokerConfig, TransportConfig};
use warren_core::message::{Message, TaskRequest, TaskResult};
use warren_services::peer::send_message;
use warren_services::scheduler::failure_payload;
use warren_services::{Delivery, Dispatch, Scheduler, SubmitOutcome};
use warren_transport::{Connection, Endpoint, TransportError};

pub type BrokerScheduler = Scheduler<Connection>;

/// What a peer declared itself to be.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Role {
    Client { id: String },
    Worker { id: String, cores: u32 },
}

pub struct Broker {
    endpoint: Endpoint,
    scheduler: Arc<BrokerScheduler>,
    registration_timeout: Duration,
    snapshot_interval: Option<Duration>,
}

impl Broker {
    /// Bind the broker endpoint. Failure here is fatal to the daemon.
    pub async fn bind(config: &BrokerConfig, transport: TransportConfig) -> Result<Self> {
        let ip: IpAddr = config
            .bind_addr
            .parse()
            .with_context(|| format!("invalid bind address {:?}", config.bind_addr))?;
        let addr = SocketAddr::new(ip, config.port);

        let registration_timeout = transport.peer_timeout();
        let endpoint = Endpoint::bind(addr, transport)
            .await
            .with_context(|| format!("failed to bind broker endpoint on {addr}"))?;

        Ok(Self {
            endpoint,
            scheduler: Arc::new(Scheduler::new()),
            registration_timeout,
            snapshot_interval: config.snapshot_interval(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn scheduler(&self) -> Arc<BrokerScheduler> {
        Arc::clone(&self.scheduler)
    }

    /// Accept and serve peers until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(addr = %self.local_addr(), "broker listening");

        let mut peers = JoinSet::new();
        let snapshots_enabled = self.snapshot_interval.is_some();
        let mut snapshot = tokio::time::interval(self.snapshot_interval.unwrap_or(Duration::from_secs(1)));
        snapshot.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("broker shutting down");
                    break;
                }

                _ = snapshot.tick(), if snapshots_enabled => log_snapshot(&self.scheduler).await,

                accepted = self.endpoint.accept() => match accepted {
                    Ok(conn) => {
                        tracing::info!(peer = %conn.peer_addr(), "peer accepted");
                        peers.spawn(serve_peer(
                            conn,
                            Arc::clone(&self.scheduler),
                            self.registration_timeout,
                        ));
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                        break;
                    }
                },

                Some(joined) = peers.join_next(), if !peers.is_empty() => {
                    if let Err(e) = joined {
                        tracing::warn!(error = %e, "peer task failed");
                    }
                }
            }
        }

        // Dropping every link ends the serve loops.
        self.endpoint.shutdown().await;
        while peers.join_next().await.is_some() {}
    }
}

async fn log_snapshot(scheduler: &BrokerScheduler) {
    let snap = scheduler.snapshot().await;
    tracing::info!(
        workers = snap.workers.len(),
        clients = snap.clients,
        pending = snap.pending,
        in_flight = snap.in_flight,
        ready = snap.ready,
        failed = snap.failed,
        "scheduler snapshot"
    );
    for w in &snap.workers {
        tracing::info!(
            worker = %w.id,
            free = w.total_cores - w.used_cores,
            total = w.total_cores,
            tasks = w.tasks,
            "  worker"
        );
    }
}

// ── Classification ────────────────────────────────────────────────────────────

async fn serve_peer(conn: Connection, scheduler: Arc<BrokerScheduler>, timeout: Duration) {
    let peer = conn.peer_addr();
    match read_registration(&conn, timeout).await {
        Ok(Role::Client { id }) => serve_client(conn, id, scheduler).await,
        Ok(Role::Worker { id, cores }) => serve_worker(conn, id, cores, scheduler).await,
        Err(e) => {
            tracing::warn!(%peer, error = %e, "peer never registered");
            conn.close().await;
        }
    }
}

/// Wait for the first registration message. Anything else before it is
/// logged and dropped.
async fn read_registration(conn: &Connection, timeout: Duration) -> Result<Role, TransportError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let left = deadline.saturating_duration_since(tokio::time::Instant::now());
        let payload = conn.receive_timeout(left).await?;
        match Message::decode(&payload) {
            Ok(Message::RegisterClient(reg)) => return Ok(Role::Client { id: reg.id }),
            Ok(Message::RegisterWorker(reg)) => {
                return Ok(Role::Worker {
                    id: reg.id,
                    cores: reg.cores,
                })
            }
            Ok(other) => {
                tracing::warn!(peer = %conn.peer_addr(), action = ?other.action(), "message before registration dropped");
            }
            Err(e) => {
                tracing::warn!(peer = %conn.peer_addr(), error = %e, "malformed message dropped");
            }
        }
    }
}

// ── Client loop ───────────────────────────────────────────────────────────────

/// Sends started on behalf of one peer: dispatches to workers and results
/// to clients. Reaped while the peer is served, drained when it leaves.
type Sends = JoinSet<()>;

async fn serve_client(conn: Connection, id: String, scheduler: Arc<BrokerScheduler>) {
    if let Err(e) = scheduler.register_client(&id, conn.clone()).await {
        tracing::warn!(client = %id, peer = %conn.peer_addr(), error = %e, "client rejected");
        conn.close().await;
        return;
    }

    let mut sends = Sends::new();
    loop {
        tokio::select! {
            received = conn.receive() => {
                let payload = match received {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::info!(client = %id, reason = %e, "client disconnected");
                        break;
                    }
                };
                match Message::decode(&payload) {
                    Ok(Message::TaskRequest(request)) => {
                        submit(&scheduler, &id, &conn, request, &mut sends).await
                    }
                    Ok(other) => {
                        tracing::warn!(client = %id, action = ?other.action(), "unexpected message from client");
                    }
                    Err(e) => tracing::warn!(client = %id, error = %e, "malformed message dropped"),
                }
            }

            Some(joined) = sends.join_next(), if !sends.is_empty() => log_send_panic(joined),
        }
    }

    scheduler.remove_client(&id).await;
    drain(sends).await;
}

async fn submit(
    scheduler: &Arc<BrokerScheduler>,
    client_id: &str,
    conn: &Connection,
    request: TaskRequest,
    sends: &mut Sends,
) {
    let task_id = request.id.clone();
    let cores = request.cores;
    match scheduler.submit(client_id, request).await {
        Ok(SubmitOutcome::Dispatched(dispatch)) => spawn_dispatches(scheduler, vec![dispatch], sends),
        Ok(SubmitOutcome::Queued) => {}
        Err(e) => {
            tracing::warn!(client = client_id, task_id = %task_id, error = %e, "submission rejected");
            let result = TaskResult {
                id: task_id,
                data: failure_payload(&e.to_string()),
                cores,
            };
            sends.spawn(deliver(Delivery {
                client_id: client_id.to_string(),
                link: Some(conn.clone()),
                result,
            }));
        }
    }
}

// ── Worker loop ───────────────────────────────────────────────────────────────

async fn serve_worker(conn: Connection, id: String, cores: u32, scheduler: Arc<BrokerScheduler>) {
    let mut sends = Sends::new();
    match scheduler.register_worker(&id, cores, conn.clone()).await {
        Ok(dispatches) => spawn_dispatches(&scheduler, dispatches, &mut sends),
        Err(e) => {
            tracing::warn!(worker = %id, peer = %conn.peer_addr(), error = %e, "worker rejected");
            conn.close().await;
            return;
        }
    }

    loop {
        tokio::select! {
            received = conn.receive() => {
                let payload = match received {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::info!(worker = %id, reason = %e, "worker disconnected");
                        break;
                    }
                };
                match Message::decode(&payload) {
                    Ok(Message::TaskResult(result)) => {
                        match scheduler.complete(&id, result).await {
                            Ok(delivery) => {
                                sends.spawn(deliver(delivery));
                            }
                            Err(e) => tracing::warn!(worker = %id, error = %e, "result ignored"),
                        }
                        let next = scheduler.drain_for_worker(&id).await;
                        spawn_dispatches(&scheduler, next, &mut sends);
                    }
                    Ok(other) => {
                        tracing::warn!(worker = %id, action = ?other.action(), "unexpected message from worker");
                    }
                    Err(e) => tracing::warn!(worker = %id, error = %e, "malformed message dropped"),
                }
            }

            Some(joined) = sends.join_next(), if !sends.is_empty() => log_send_panic(joined),
        }
    }

    for orphan in scheduler.remove_worker(&id).await {
        sends.spawn(deliver(orphan));
    }
    drain(sends).await;
}

// ── Sending ───────────────────────────────────────────────────────────────────

fn spawn_dispatches(scheduler: &Arc<BrokerScheduler>, dispatches: Vec<Dispatch<Connection>>, sends: &mut Sends) {
    for dispatch in dispatches {
        sends.spawn(send_dispatch(Arc::clone(scheduler), dispatch));
    }
}

async fn drain(mut sends: Sends) {
    while let Some(joined) = sends.join_next().await {
        log_send_panic(joined);
    }
}

fn log_send_panic(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            tracing::error!(error = %e, "send task panicked");
        }
    }
}

/// Send a task to its worker. On failure the task is failed with the send
/// error, its cores are released and the client is told.
async fn send_dispatch(scheduler: Arc<BrokerScheduler>, dispatch: Dispatch<Connection>) {
    let Dispatch {
        worker_id,
        link,
        request,
    } = dispatch;
    let task_id = request.id.clone();

    if let Err(e) = send_message(&link, &Message::TaskRequest(request)).await {
        tracing::warn!(task_id = %task_id, worker = %worker_id, error = %e, "dispatch send failed");
        if let Some(delivery) = scheduler.abort_dispatch(&task_id, &e.to_string()).await {
            deliver(delivery).await;
        }
    }
}

async fn deliver(delivery: Delivery<Connection>) {
    let Delivery {
        client_id,
        link,
        result,
    } = delivery;
    let Some(link) = link else {
        tracing::info!(client = %client_id, task_id = %result.id, "client gone, result dropped");
        return;
    };
    let task_id = result.id.clone();
    match send_message(&link, &Message::TaskResult(result)).await {
        Ok(()) => tracing::debug!(client = %client_id, task_id = %task_id, "result delivered"),
        Err(e) => {
            tracing::warn!(client = %client_id, task_id = %task_id, error = %e, "result delivery failed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warren_core::config::WarrenConfig;
    use warren_core::message::ClientRegistration;
    use warren_services::kernels::builtin_handlers;
    use warren_services::{Client, TaskStatus, Worker};

    fn fast_transport() -> TransportConfig {
        TransportConfig {
            retransmit_interval_ms: 50,
            max_retransmit_interval_ms: 200,
            handshake_timeout_ms: 1000,
            keepalive_interval_ms: 200,
            peer_timeout_ms: 1500,
            ..TransportConfig::default()
        }
    }

    async fn start_broker() -> (SocketAddr, Arc<BrokerScheduler>, broadcast::Sender<()>) {
        start_broker_with(fast_transport()).await
    }

    async fn start_broker_with(transport: TransportConfig) -> (SocketAddr, Arc<BrokerScheduler>, broadcast::Sender<()>) {
        let config = BrokerConfig {
            bind_addr: "127.0.0.1".into(),
            port: 0,
            snapshot_interval_secs: 0,
        };
        let broker = Broker::bind(&config, transport).await.unwrap();
        let addr = broker.local_addr();
        let scheduler = broker.scheduler();
        let (tx, rx) = broadcast::channel(1);
        tokio::spawn(broker.run(rx));
        (addr, scheduler, tx)
    }

    #[tokio::test]
    async fn invalid_bind_address_is_an_error() {
        let config = BrokerConfig {
            bind_addr: "not an ip".into(),
            ..BrokerConfig::default()
        };
        assert!(Broker::bind(&config, fast_transport()).await.is_err());
    }

    #[tokio::test]
    async fn zero_keepalive_is_rejected_at_bind() {
        let config = BrokerConfig {
            bind_addr: "127.0.0.1".into(),
            port: 0,
            ..BrokerConfig::default()
        };
        let transport = TransportConfig {
            keepalive_interval_ms: 0,
            ..fast_transport()
        };
        let err = Broker::bind(&config, transport).await.err().unwrap();
        assert!(format!("{err:#}").contains("keepalive_interval_ms"), "got {err:#}");
    }

    #[tokio::test]
    async fn simple_math_end_to_end() {
        let (addr, scheduler, shutdown) = start_broker().await;
        let mut config = WarrenConfig::default();
        config.worker.id = "w1".into();
        config.worker.broker = addr.to_string();
        config.worker.cores = 2;
        config.client.id = "c1".into();
        config.client.broker = addr.to_string();

        let worker = Worker::connect(&config.worker, fast_transport(), builtin_handlers())
            .await
            .unwrap();
        tokio::spawn(worker.run(shutdown.subscribe()));

        let client = Client::connect(&config.client, fast_transport()).await.unwrap();
        let task_id = client
            .submit("simpleMath", r#"{"a":2,"b":3}"#.into(), 1)
            .await
            .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), client.next_result())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.id, task_id);
        assert_eq!(result.data, r#"{"result":5}"#);

        let task = scheduler.task(&task_id).await.unwrap();
        assert_eq!(
            task.history,
            vec![
                TaskStatus::Created,
                TaskStatus::Queued,
                TaskStatus::SentToWorker,
                TaskStatus::Ready
            ]
        );

        client.close().await;
        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn zero_core_submission_gets_failure_result() {
        let (addr, _scheduler, shutdown) = start_broker().await;
        let client_config = warren_core::config::ClientConfig {
            id: "c0".into(),
            broker: addr.to_string(),
        };
        let client = Client::connect(&client_config, fast_transport()).await.unwrap();
        let id = client.submit("simpleMath", "{}".into(), 0).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), client.next_result())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.id, id);
        let body: serde_json::Value = serde_json::from_str(&result.data).unwrap();
        assert!(body["error"].as_str().unwrap().contains("zero cores"));

        client.close().await;
        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn duplicate_client_id_is_closed() {
        let (addr, scheduler, shutdown) = start_broker().await;
        let cfg = warren_core::config::ClientConfig {
            id: "same".into(),
            broker: addr.to_string(),
        };
        let first = Client::connect(&cfg, fast_transport()).await.unwrap();

        let endpoint = Endpoint::bind("127.0.0.1:0".parse().unwrap(), fast_transport())
            .await
            .unwrap();
        let second = endpoint.connect(addr).await.unwrap();
        let reg = Message::RegisterClient(ClientRegistration { id: "same".into() });
        send_message(&second, &reg).await.unwrap();

        let err = second.receive_timeout(Duration::from_secs(3)).await.unwrap_err();
        assert!(matches!(err, TransportError::Disconnected(_)));
        assert_eq!(scheduler.snapshot().await.clients, 1);

        first.close().await;
        endpoint.shutdown().await;
        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn failed_dispatch_reports_send_error() {
        let transport = TransportConfig {
            max_retransmits: 3,
            peer_timeout_ms: 10_000,
            ..fast_transport()
        };
        let (addr, scheduler, shutdown) = start_broker_with(transport).await;

        // A worker that registers and then vanishes without closing.
        let endpoint = Endpoint::bind("127.0.0.1:0".parse().unwrap(), fast_transport())
            .await
            .unwrap();
        let mute = endpoint.connect(addr).await.unwrap();
        let reg = Message::RegisterWorker(warren_core::message::WorkerRegistration {
            id: "mute".into(),
            cores: 1,
        });
        send_message(&mute, &reg).await.unwrap();
        while scheduler.worker("mute").await.is_none() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        drop(mute);
        drop(endpoint);

        let client_config = warren_core::config::ClientConfig {
            id: "c-lost".into(),
            broker: addr.to_string(),
        };
        let client = Client::connect(&client_config, fast_transport()).await.unwrap();
        let id = client.submit("simpleMath", r#"{"a":1,"b":1}"#.into(), 1).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), client.next_result())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.id, id);
        let body: serde_json::Value = serde_json::from_str(&result.data).unwrap();
        let error = body["error"].as_str().unwrap();
        assert!(error.contains("timed out waiting for acknowledgment"), "got {error}");
        assert_eq!(scheduler.task(&id).await.unwrap().status, TaskStatus::Failed);
        assert_eq!(scheduler.worker("mute").await.unwrap().used_cores, 0);

        client.close().await;
        let _ = shutdown.send(());
    }
}
