//! One peer relationship on an endpoint.
//!
//! `send` drives an outbound transfer session to completion, retransmitting
//! with exponential backoff; `receive` waits for the receive loop to hand over
//! a completed inbound message. Both suspend the caller only. Connections are
//! cheap to clone; all clones share one inbound queue.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex, Notify};
use warren_core::{Command, Packet};

use crate::endpoint::Shared;
use crate::error::TransportError;
use crate::fragment::MAX_MESSAGE_SIZE;
use crate::session::{Session, SessionKey, SessionState};

#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    peer: SocketAddr,
    generation: u64,
    shared: Arc<Shared>,
    inbound: Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

/// Where an outbound transfer stands between retransmission rounds.
enum Round {
    Pending { packets: Vec<Packet>, progress: u64 },
    Done,
}

impl Connection {
    pub(crate) fn new(
        peer: SocketAddr,
        generation: u64,
        shared: Arc<Shared>,
        inbound: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                peer,
                generation,
                shared,
                inbound: Mutex::new(inbound),
            }),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.shared.local_addr
    }

    /// False once the peer closed, timed out, or this side closed.
    pub fn is_open(&self) -> bool {
        self.inner.shared.is_linked(self.inner.peer, self.inner.generation)
    }

    /// Reliably deliver one message. Returns once the peer acknowledged
    /// every part, or fails with `TimedOut` / `Disconnected`.
    pub async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::MessageTooLarge(payload.len()));
        }
        if !self.is_open() {
            return Err(TransportError::Disconnected(self.inner.peer));
        }

        let size = payload.len();
        let (key, notify) = self
            .inner
            .shared
            .sessions
            .lock()
            .await
            .open_outbound(self.inner.peer, payload);
        tracing::debug!(peer = %self.inner.peer, session_id = key.id, size, "outbound transfer opened");

        let result = self.drive(key, &notify).await;
        self.inner.shared.sessions.lock().await.remove(&key);

        match &result {
            Ok(()) => {
                tracing::debug!(peer = %self.inner.peer, session_id = key.id, "outbound transfer acknowledged")
            }
            Err(e) => {
                tracing::warn!(peer = %self.inner.peer, session_id = key.id, error = %e, "send failed")
            }
        }
        result
    }

    /// Snapshot what the next round must send, or report the outcome.
    async fn next_round(&self, key: &SessionKey) -> Result<Round, TransportError> {
        let mut sessions = self.inner.shared.sessions.lock().await;
        match sessions.get_mut(key) {
            Some(Session::Outbound(t)) => match t.state() {
                SessionState::Terminal => Ok(Round::Done),
                SessionState::Failed => Err(TransportError::Disconnected(self.inner.peer)),
                _ => Ok(Round::Pending {
                    packets: t.pending_packets(),
                    progress: t.progress(),
                }),
            },
            _ => Err(TransportError::Disconnected(self.inner.peer)),
        }
    }

    /// Outcome after a wake-up: `Some(true)` finished, `Some(false)` the
    /// header was just acknowledged, `None` keep waiting.
    async fn inspect(&self, key: &SessionKey, in_header_phase: bool) -> Result<Option<bool>, TransportError> {
        let sessions = self.inner.shared.sessions.lock().await;
        match sessions.get(key) {
            Some(Session::Outbound(t)) => match t.state() {
                SessionState::Terminal => Ok(Some(true)),
                SessionState::Failed => Err(TransportError::Disconnected(self.inner.peer)),
                _ if in_header_phase && t.header_acked() => Ok(Some(false)),
                _ => Ok(None),
            },
            _ => Err(TransportError::Disconnected(self.inner.peer)),
        }
    }

    async fn drive(&self, key: SessionKey, notify: &Notify) -> Result<(), TransportError> {
        let config = &self.inner.shared.config;
        let base_interval = config.retransmit_interval();
        let max_interval = config.max_retransmit_interval();

        let mut interval = base_interval;
        let mut silent_rounds = 0u32;
        let mut last_progress: Option<u64> = None;

        loop {
            let (packets, progress) = match self.next_round(&key).await? {
                Round::Done => return Ok(()),
                Round::Pending { packets, progress } => (packets, progress),
            };

            if let Some(previous) = last_progress {
                if progress == previous {
                    silent_rounds += 1;
                    if silent_rounds > config.max_retransmits {
                        return Err(TransportError::TimedOut {
                            peer: self.inner.peer,
                            what: "acknowledgment",
                        });
                    }
                    interval = (interval * 2).min(max_interval);
                    tracing::debug!(
                        peer = %self.inner.peer,
                        session_id = key.id,
                        round = silent_rounds,
                        resend = packets.len(),
                        "retransmitting"
                    );
                } else {
                    silent_rounds = 0;
                    interval = base_interval;
                }
            }
            last_progress = Some(progress);

            let in_header_phase = packets
                .first()
                .is_some_and(|p| p.command == Command::DataHeader);
            self.inner.shared.send_all(&packets, self.inner.peer).await?;

            let deadline = tokio::time::Instant::now() + interval;
            loop {
                if tokio::time::timeout_at(deadline, notify.notified()).await.is_err() {
                    break;
                }
                match self.inspect(&key, in_header_phase).await? {
                    Some(true) => return Ok(()),
                    // Header acknowledged: send the parts right away.
                    Some(false) => {
                        last_progress = None;
                        silent_rounds = 0;
                        interval = base_interval;
                        break;
                    }
                    None => {}
                }
            }
        }
    }

    /// Wait for the next complete message from the peer.
    pub async fn receive(&self) -> Result<Bytes, TransportError> {
        self.inner
            .inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Disconnected(self.inner.peer))
    }

    /// Like [`receive`](Self::receive) but gives up after `timeout`.
    pub async fn receive_timeout(&self, timeout: Duration) -> Result<Bytes, TransportError> {
        tokio::time::timeout(timeout, self.receive())
            .await
            .map_err(|_| TransportError::TimedOut {
                peer: self.inner.peer,
                what: "message",
            })?
    }

    /// Tell the peer we are leaving and tear down the link. Pending sends
    /// and receives on every clone fail with `Disconnected`.
    pub async fn close(&self) {
        let shared = &self.inner.shared;
        if !self.is_open() {
            return;
        }
        if let Err(e) = shared
            .send_packet(&Packet::new(Command::Close, 0), self.inner.peer)
            .await
        {
            tracing::trace!(peer = %self.inner.peer, error = %e, "close not sent");
        }
        shared
            .drop_peer(self.inner.peer, Some(self.inner.generation), "closed locally")
            .await;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.inner.peer)
            .field("local", &self.inner.shared.local_addr)
            .finish()
    }
}
