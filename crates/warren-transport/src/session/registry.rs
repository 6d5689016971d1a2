//! Table of live sessions on one endpoint.
//!
//! Shared between the receive loop and caller tasks behind one
//! `tokio::sync::Mutex`; the lock is held only for table operations and is
//! never held across a socket await.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;
use tokio::sync::Notify;
use warren_core::{Packet, MAX_PART_SIZE};

use super::{
    Handshake, InboundTransfer, Origin, OutboundTransfer, Reaction, Session, SessionKey,
};

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionKey, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Random id not used by any live locally-opened session.
    pub fn allocate_id(&self) -> u32 {
        let mut rng = rand::thread_rng();
        loop {
            let id: u32 = rng.gen();
            let taken = self
                .sessions
                .keys()
                .any(|k| k.origin == Origin::Local && k.id == id);
            if !taken {
                return id;
            }
        }
    }

    /// Register a handshake towards `peer`. Returns its key and wake handle.
    pub fn open_handshake(&mut self, peer: SocketAddr) -> (SessionKey, Arc<Notify>) {
        let id = self.allocate_id();
        let hs = Handshake::new(id);
        let notify = hs.notifier();
        let key = SessionKey::local(peer, id);
        self.sessions.insert(key, Session::Handshake(hs));
        (key, notify)
    }

    /// Register an outbound transfer of `payload` to `peer`.
    pub fn open_outbound(&mut self, peer: SocketAddr, payload: Bytes) -> (SessionKey, Arc<Notify>) {
        let id = self.allocate_id();
        let transfer = OutboundTransfer::new(id, payload, MAX_PART_SIZE);
        let notify = transfer.notifier();
        let key = SessionKey::local(peer, id);
        self.sessions.insert(key, Session::Outbound(transfer));
        (key, notify)
    }

    /// Register a remotely-opened inbound transfer. Returns the packets owed
    /// to the sender right away.
    pub fn insert_inbound(&mut self, key: SessionKey, mut transfer: InboundTransfer) -> Vec<Packet> {
        let replies = transfer.initial_replies();
        self.sessions.insert(key, Session::Inbound(transfer));
        replies
    }

    pub fn get(&self, key: &SessionKey) -> Option<&Session> {
        self.sessions.get(key)
    }

    pub fn get_mut(&mut self, key: &SessionKey) -> Option<&mut Session> {
        self.sessions.get_mut(key)
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.sessions.contains_key(key)
    }

    pub fn remove(&mut self, key: &SessionKey) -> Option<Session> {
        self.sessions.remove(key)
    }

    /// Route a packet to its session. `None` if no live session matches.
    pub fn dispatch(&mut self, peer: SocketAddr, packet: &Packet, now: Instant) -> Option<Reaction> {
        let key = SessionKey::for_incoming(peer, packet);
        self.sessions
            .get_mut(&key)
            .map(|s| s.process_incoming_packet(packet, now))
    }

    /// Take the payload of a completed inbound transfer.
    pub fn take_inbound_payload(&mut self, key: &SessionKey) -> Option<Bytes> {
        match self.sessions.get_mut(key) {
            Some(Session::Inbound(t)) => t.take_payload(),
            _ => None,
        }
    }

    /// Fail and drop every session with `peer`. Waiters are woken and see
    /// the session gone.
    pub fn fail_peer(&mut self, peer: SocketAddr) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|key, session| {
            if key.peer == peer {
                session.fail();
                false
            } else {
                true
            }
        });
        before - self.sessions.len()
    }

    /// Drop inbound transfers that finished more than `linger` ago, and
    /// incomplete ones idle for longer than `idle`.
    pub fn sweep_inbound(&mut self, now: Instant, linger: Duration, idle: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| match session {
            Session::Inbound(t) => match t.completed_at() {
                Some(done) => now.duration_since(done) < linger,
                None => now.duration_since(t.last_activity()) < idle,
            },
            _ => true,
        });
        before - self.sessions.len()
    }

    /// Session counts by kind, for status logging.
    pub fn census(&self) -> (usize, usize, usize) {
        self.sessions
            .values()
            .fold((0, 0, 0), |(h, o, i), s| match s {
                Session::Handshake(_) => (h + 1, o, i),
                Session::Outbound(_) => (h, o + 1, i),
                Session::Inbound(_) => (h, o, i + 1),
            })
    }
}
