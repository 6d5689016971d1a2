//! Protocol endpoint: socket owner and receive loop.
//!
//! One [`Endpoint`] per UDP socket. Its receive loop decodes every datagram,
//! routes it to the matching session, answers handshake probes from new
//! peers and hands finished inbound messages to the owning [`Connection`].
//! The same loop runs the periodic sweep: keepalives, peer expiry and
//! removal of lingering inbound transfers.
//!
//! Peers are tracked in a link table keyed by socket address. A link exists
//! exactly while a `Connection` to that peer is usable; removing it closes
//! the connection's inbound channel and fails its sessions.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use warren_core::config::TransportConfig;
use warren_core::wire::MAX_DATAGRAM_SIZE;
use warren_core::{Command, Packet};

use crate::connection::Connection;
use crate::error::TransportError;
use crate::session::{InboundTransfer, Session, SessionKey, SessionRegistry, SessionState};

// ── Shared state ──────────────────────────────────────────────────────────────

/// Per-peer routing record.
#[derive(Debug)]
pub(crate) struct PeerLink {
    /// Distinguishes successive connections to the same address.
    pub generation: u64,
    pub inbound: mpsc::UnboundedSender<Bytes>,
    pub last_seen: Instant,
}

pub(crate) type LinkTable = DashMap<SocketAddr, PeerLink>;

/// State shared by the endpoint, its receive loop and every connection.
pub(crate) struct Shared {
    pub socket: Arc<UdpSocket>,
    pub sessions: Mutex<SessionRegistry>,
    pub links: LinkTable,
    pub config: TransportConfig,
    pub local_addr: SocketAddr,
    next_generation: AtomicU64,
    closed: AtomicBool,
}

impl Shared {
    pub async fn send_packet(&self, packet: &Packet, peer: SocketAddr) -> Result<(), TransportError> {
        let datagram = packet.encode()?;
        self.socket.send_to(&datagram, peer).await?;
        Ok(())
    }

    pub async fn send_all(&self, packets: &[Packet], peer: SocketAddr) -> Result<(), TransportError> {
        for packet in packets {
            self.send_packet(packet, peer).await?;
        }
        Ok(())
    }

    /// Register a link to `peer` and return the connection that owns it.
    fn open_link(self: &Arc<Self>, peer: SocketAddr) -> Connection {
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.links.insert(
            peer,
            PeerLink {
                generation,
                inbound: tx,
                last_seen: Instant::now(),
            },
        );
        Connection::new(peer, generation, Arc::clone(self), rx)
    }

    /// True while the link for `peer` is the one `generation` created.
    pub fn is_linked(&self, peer: SocketAddr, generation: u64) -> bool {
        self.links
            .get(&peer)
            .is_some_and(|link| link.generation == generation)
    }

    /// Remove the link to `peer` and fail its sessions. With
    /// `Some(generation)`, only that incarnation of the link is removed.
    pub async fn drop_peer(&self, peer: SocketAddr, generation: Option<u64>, reason: &str) {
        let removed = match generation {
            Some(g) => self.links.remove_if(&peer, |_, link| link.generation == g),
            None => self.links.remove(&peer),
        };
        if removed.is_none() {
            return;
        }
        let failed = self.sessions.lock().await.fail_peer(peer);
        tracing::info!(%peer, reason, failed_sessions = failed, "peer link removed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// ── Endpoint ──────────────────────────────────────────────────────────────────

pub struct Endpoint {
    shared: Arc<Shared>,
    accept_rx: Mutex<mpsc::Receiver<Connection>>,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Endpoint {
    /// Bind a UDP socket to `addr` and start the receive loop.
    pub async fn bind(addr: SocketAddr, config: TransportConfig) -> Result<Self, TransportError> {
        config.validate()?;
        let socket = Arc::new(UdpSocket::from_std(make_socket(addr, &config)?)?);
        let local_addr = socket.local_addr()?;

        let shared = Arc::new(Shared {
            socket,
            sessions: Mutex::new(SessionRegistry::new()),
            links: DashMap::new(),
            config,
            local_addr,
            next_generation: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });

        let (accept_tx, accept_rx) = mpsc::channel(shared.config.accept_backlog.max(1));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let receive_loop = ReceiveLoop {
            shared: Arc::clone(&shared),
            accept_tx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(receive_loop.run());

        tracing::info!(addr = %local_addr, "endpoint bound");

        Ok(Self {
            shared,
            accept_rx: Mutex::new(accept_rx),
            shutdown_tx,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Number of peers with a live link.
    pub fn peer_count(&self) -> usize {
        self.shared.links.len()
    }

    /// Handshake with `peer`: send Ping probes until PingAck arrives or
    /// `handshake_timeout` expires.
    pub async fn connect(&self, peer: SocketAddr) -> Result<Connection, TransportError> {
        if self.shared.is_closed() {
            return Err(TransportError::Shutdown);
        }
        if self.shared.links.contains_key(&peer) {
            return Err(TransportError::AlreadyConnected(peer));
        }

        let config = &self.shared.config;
        let (key, notify) = self.shared.sessions.lock().await.open_handshake(peer);
        let deadline = tokio::time::Instant::now() + config.handshake_timeout();
        tracing::debug!(%peer, session_id = key.id, "handshake started");

        let outcome = loop {
            let probe = {
                let mut sessions = self.shared.sessions.lock().await;
                match sessions.get_mut(&key) {
                    Some(Session::Handshake(hs)) => match hs.state() {
                        SessionState::Terminal => break Ok(()),
                        SessionState::Failed => break Err(TransportError::Disconnected(peer)),
                        _ => hs.probe(),
                    },
                    _ => break Err(TransportError::Disconnected(peer)),
                }
            };
            if let Err(e) = self.shared.send_packet(&probe, peer).await {
                break Err(e);
            }

            let wake = (tokio::time::Instant::now() + config.retransmit_interval()).min(deadline);
            let _ = tokio::time::timeout_at(wake, notify.notified()).await;
            if tokio::time::Instant::now() >= deadline {
                // One last look: the answer may have landed with the deadline.
                let answered = matches!(
                    self.shared.sessions.lock().await.get(&key),
                    Some(s) if s.state() == SessionState::Terminal
                );
                break if answered {
                    Ok(())
                } else {
                    Err(TransportError::TimedOut {
                        peer,
                        what: "handshake answer",
                    })
                };
            }
        };

        self.shared.sessions.lock().await.remove(&key);

        match outcome {
            Ok(()) => {
                tracing::info!(%peer, "connected");
                Ok(self.shared.open_link(peer))
            }
            Err(e) => {
                tracing::warn!(%peer, error = %e, "handshake failed");
                Err(e)
            }
        }
    }

    /// Resolve `host` (`name:port`) and connect to the first address.
    pub async fn connect_host(&self, host: &str) -> Result<Connection, TransportError> {
        let peer = resolve(host).await?;
        self.connect(peer).await
    }

    /// Wait for a handshake probe from a new peer.
    pub async fn accept(&self) -> Result<Connection, TransportError> {
        self.accept_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Shutdown)
    }

    /// Send Close to every peer, stop the receive loop and wait for it.
    pub async fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let peers: Vec<SocketAddr> = self.shared.links.iter().map(|e| *e.key()).collect();
        for peer in &peers {
            let _ = self
                .shared
                .send_packet(&Packet::new(Command::Close, 0), *peer)
                .await;
        }

        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "receive loop task failed");
            }
        }

        for peer in peers {
            self.shared.drop_peer(peer, None, "endpoint shutdown").await;
        }
        tracing::info!(addr = %self.shared.local_addr, "endpoint shut down");
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Resolve `host:port` to one socket address.
pub async fn resolve(host: &str) -> Result<SocketAddr, TransportError> {
    tokio::net::lookup_host(host)
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| TransportError::PeerUnreachable(host.to_string()))
}

fn make_socket(addr: SocketAddr, config: &TransportConfig) -> Result<std::net::UdpSocket, TransportError> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if config.recv_buffer_bytes > 0 {
        if let Err(e) = socket.set_recv_buffer_size(config.recv_buffer_bytes) {
            tracing::warn!(error = %e, requested = config.recv_buffer_bytes, "SO_RCVBUF not applied");
        }
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

// ── Receive loop ──────────────────────────────────────────────────────────────

struct ReceiveLoop {
    shared: Arc<Shared>,
    accept_tx: mpsc::Sender<Connection>,
    shutdown: broadcast::Receiver<()>,
}

impl ReceiveLoop {
    async fn run(mut self) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut sweep = tokio::time::interval(self.shared.config.keepalive_interval());
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::debug!(addr = %self.shared.local_addr, "receive loop shutting down");
                    return;
                }

                _ = sweep.tick() => {
                    self.sweep().await;
                }

                result = self.shared.socket.recv_from(&mut buf) => {
                    let (len, peer) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "recv_from failed");
                            continue;
                        }
                    };
                    match Packet::decode(&buf[..len]) {
                        Ok(packet) => self.handle_packet(peer, packet).await,
                        Err(e) => tracing::trace!(%peer, error = %e, "undecodable datagram dropped"),
                    }
                }
            }
        }
    }

    async fn handle_packet(&self, peer: SocketAddr, packet: Packet) {
        let now = Instant::now();
        if let Some(mut link) = self.shared.links.get_mut(&peer) {
            link.last_seen = now;
        }

        match packet.command {
            Command::Ping => self.on_ping(peer, &packet).await,
            Command::Keepalive => {}
            Command::Close => {
                self.shared.drop_peer(peer, None, "closed by peer").await;
            }
            Command::DataHeader => self.on_data_header(peer, &packet, now).await,
            Command::PingAck | Command::DataHeaderAck | Command::DataPart | Command::DataAck => {
                self.on_session_packet(peer, &packet, now).await
            }
        }
    }

    async fn on_ping(&self, peer: SocketAddr, packet: &Packet) {
        let ack = Packet::new(Command::PingAck, packet.session_id);

        if !self.shared.links.contains_key(&peer) {
            if self.shared.is_closed() {
                return;
            }
            let connection = self.shared.open_link(peer);
            match self.accept_tx.try_send(connection) {
                Ok(()) => tracing::info!(%peer, "accepted connection"),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.shared.links.remove(&peer);
                    tracing::warn!(%peer, "accept backlog full, probe dropped");
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.shared.links.remove(&peer);
                    return;
                }
            }
        } else {
            tracing::trace!(%peer, session_id = packet.session_id, "repeated probe answered");
        }

        if let Err(e) = self.shared.send_packet(&ack, peer).await {
            tracing::warn!(%peer, error = %e, "failed to send PingAck");
        }
    }

    async fn on_data_header(&self, peer: SocketAddr, packet: &Packet, now: Instant) {
        if !self.shared.links.contains_key(&peer) {
            tracing::trace!(%peer, "transfer from unconnected peer dropped");
            return;
        }
        let key = SessionKey::remote(peer, packet.session_id);

        let (replies, payload) = {
            let mut sessions = self.shared.sessions.lock().await;
            if sessions.contains(&key) {
                let replies = sessions
                    .dispatch(peer, packet, now)
                    .map(|r| r.replies)
                    .unwrap_or_default();
                (replies, None)
            } else {
                match InboundTransfer::from_header(
                    packet.session_id,
                    packet.total_size,
                    packet.part_index,
                    self.shared.config.ack_every,
                    now,
                ) {
                    Ok(transfer) => {
                        tracing::debug!(
                            %peer,
                            session_id = packet.session_id,
                            size = packet.total_size,
                            parts = packet.part_index,
                            "inbound transfer opened"
                        );
                        let replies = sessions.insert_inbound(key, transfer);
                        (replies, sessions.take_inbound_payload(&key))
                    }
                    Err(e) => {
                        tracing::warn!(%peer, error = %e, "transfer header refused");
                        return;
                    }
                }
            }
        };

        self.reply(peer, &replies).await;
        if let Some(payload) = payload {
            self.deliver(peer, payload);
        }
    }

    async fn on_session_packet(&self, peer: SocketAddr, packet: &Packet, now: Instant) {
        let key = SessionKey::for_incoming(peer, packet);
        let (reaction, payload) = {
            let mut sessions = self.shared.sessions.lock().await;
            let Some(reaction) = sessions.dispatch(peer, packet, now) else {
                tracing::trace!(
                    %peer,
                    session_id = packet.session_id,
                    command = ?packet.command,
                    "packet for unknown session dropped"
                );
                return;
            };
            let payload = if reaction.completed && packet.command == Command::DataPart {
                sessions.take_inbound_payload(&key)
            } else {
                None
            };
            (reaction, payload)
        };

        self.reply(peer, &reaction.replies).await;
        if let Some(payload) = payload {
            tracing::debug!(%peer, session_id = packet.session_id, bytes = payload.len(), "inbound transfer complete");
            self.deliver(peer, payload);
        }
    }

    async fn reply(&self, peer: SocketAddr, packets: &[Packet]) {
        if let Err(e) = self.shared.send_all(packets, peer).await {
            tracing::warn!(%peer, error = %e, "failed to send reply");
        }
    }

    fn deliver(&self, peer: SocketAddr, payload: Bytes) {
        match self.shared.links.get(&peer) {
            Some(link) => {
                if link.inbound.send(payload).is_err() {
                    tracing::trace!(%peer, "connection dropped, message discarded");
                }
            }
            None => tracing::trace!(%peer, "message for unlinked peer discarded"),
        }
    }

    async fn sweep(&self) {
        let now = Instant::now();
        let timeout = self.shared.config.peer_timeout();

        let mut expired = Vec::new();
        let mut alive = Vec::new();
        for entry in self.shared.links.iter() {
            if now.duration_since(entry.last_seen) >= timeout {
                expired.push((*entry.key(), entry.generation));
            } else {
                alive.push(*entry.key());
            }
        }

        for (peer, generation) in expired {
            self.shared.drop_peer(peer, Some(generation), "peer timed out").await;
        }

        let keepalive = Packet::new(Command::Keepalive, 0);
        for peer in alive {
            if let Err(e) = self.shared.send_packet(&keepalive, peer).await {
                tracing::trace!(%peer, error = %e, "keepalive not sent");
            }
        }

        let removed = self.shared.sessions.lock().await.sweep_inbound(
            now,
            self.shared.config.linger(),
            timeout,
        );
        if removed > 0 {
            tracing::trace!(removed, "inbound transfers swept");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fast_config() -> TransportConfig {
        TransportConfig {
            retransmit_interval_ms: 20,
            max_retransmit_interval_ms: 100,
            handshake_timeout_ms: 300,
            keepalive_interval_ms: 50,
            peer_timeout_ms: 400,
            ..TransportConfig::default()
        }
    }

    async fn loopback() -> Endpoint {
        Endpoint::bind("127.0.0.1:0".parse().unwrap(), fast_config())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn connect_and_accept() {
        let server = loopback().await;
        let client = loopback().await;

        let conn = client.connect(server.local_addr()).await.unwrap();
        let accepted = server.accept().await.unwrap();

        assert_eq!(conn.peer_addr(), server.local_addr());
        assert_eq!(accepted.peer_addr(), client.local_addr());
        assert_eq!(server.peer_count(), 1);

        assert!(matches!(
            client.connect(server.local_addr()).await,
            Err(TransportError::AlreadyConnected(_))
        ));
    }

    #[tokio::test]
    async fn connect_to_silent_port_times_out() {
        // Bound but never read: probes are never answered.
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let client = loopback().await;
        let err = client.connect(silent.local_addr().unwrap()).await.unwrap_err();
        assert!(matches!(err, TransportError::TimedOut { .. }), "got {err:?}");
        assert_eq!(client.peer_count(), 0);
    }

    #[tokio::test]
    async fn unresolvable_host_is_unreachable() {
        let client = loopback().await;
        let err = client.connect_host("no-such-host.invalid:1").await.unwrap_err();
        assert!(matches!(err, TransportError::PeerUnreachable(_)));
    }

    #[tokio::test]
    async fn close_disconnects_peer() {
        let server = loopback().await;
        let client = loopback().await;

        let conn = client.connect(server.local_addr()).await.unwrap();
        let accepted = server.accept().await.unwrap();

        conn.close().await;
        let err = tokio::time::timeout(Duration::from_secs(2), accepted.receive())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, TransportError::Disconnected(_)));
    }

    #[tokio::test]
    async fn silent_peer_expires() {
        let server = loopback().await;
        let client = loopback().await;

        let _conn = client.connect(server.local_addr()).await.unwrap();
        let accepted = server.accept().await.unwrap();

        // Stop the client's loop without sending Close: keepalives cease.
        let _ = client.shutdown_tx.send(());

        let err = tokio::time::timeout(Duration::from_secs(3), accepted.receive())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, TransportError::Disconnected(_)));
    }

    #[tokio::test]
    async fn bind_rejects_zero_keepalive() {
        let config = TransportConfig {
            keepalive_interval_ms: 0,
            ..fast_config()
        };
        let err = Endpoint::bind("127.0.0.1:0".parse().unwrap(), config).await.err();
        assert!(matches!(err, Some(TransportError::Config(_))), "got {err:?}");
    }

    #[tokio::test]
    async fn shutdown_ends_accept() {
        let server = loopback().await;
        server.shutdown().await;
        assert!(matches!(server.accept().await, Err(TransportError::Shutdown)));
        assert!(matches!(
            server.connect("127.0.0.1:9".parse().unwrap()).await,
            Err(TransportError::Shutdown)
        ));
    }
}
