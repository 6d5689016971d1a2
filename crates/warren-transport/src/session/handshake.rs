//! Connect-side handshake: a Ping probe waiting for its PingAck.

use std::sync::Arc;

use tokio::sync::Notify;
use warren_core::{Command, Packet};

use super::{Reaction, SessionState};

#[derive(Debug)]
pub struct Handshake {
    id: u32,
    state: SessionState,
    notify: Arc<Notify>,
}

impl Handshake {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            state: SessionState::Created,
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Woken when the handshake finishes.
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    /// The probe to (re)send. Marks the session Active.
    pub fn probe(&mut self) -> Packet {
        if self.state == SessionState::Created {
            self.state = SessionState::Active;
        }
        Packet::new(Command::Ping, self.id)
    }

    pub fn process_incoming_packet(&mut self, packet: &Packet) -> Reaction {
        if packet.command != Command::PingAck || self.state.is_finished() {
            return Reaction::none();
        }
        self.state = SessionState::Terminal;
        self.notify.notify_one();
        Reaction {
            replies: Vec::new(),
            completed: true,
        }
    }

    pub fn fail(&mut self) {
        if !self.state.is_finished() {
            self.state = SessionState::Failed;
            self.notify.notify_one();
        }
    }
}
