//! Sender side of a reliable transfer.
//!
//! The transfer is announced with a DataHeader (size + part count). Once the
//! receiver answers DataHeaderAck the parts are sent; DataAck packets carry a
//! cumulative base plus a selective bitmap and are merged into `acked`. The
//! transfer is Terminal when every part is acknowledged. Retransmission
//! timing lives in [`Connection::send`](crate::Connection::send); this type
//! only records what still needs sending and whether progress happened.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Notify;
use warren_core::{Command, Packet};

use super::{Reaction, SessionState};
use crate::fragment::{self, PartSet};

#[derive(Debug)]
pub struct OutboundTransfer {
    id: u32,
    size: u32,
    parts: Vec<Bytes>,
    acked: PartSet,
    header_acked: bool,
    state: SessionState,
    /// Bumped on every packet that moved the transfer forward.
    progress: u64,
    notify: Arc<Notify>,
}

impl OutboundTransfer {
    pub fn new(id: u32, payload: Bytes, part_size: usize) -> Self {
        let parts = fragment::split(&payload, part_size);
        Self {
            id,
            size: payload.len() as u32,
            acked: PartSet::new(parts.len()),
            parts,
            header_acked: false,
            state: SessionState::Created,
            progress: 0,
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    pub fn acked_count(&self) -> usize {
        self.acked.count()
    }

    pub fn progress(&self) -> u64 {
        self.progress
    }

    pub fn header_acked(&self) -> bool {
        self.header_acked
    }

    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    fn header(&self) -> Packet {
        Packet::new(Command::DataHeader, self.id).with_part(self.parts.len() as u32, self.size)
    }

    /// Packets for the next (re)transmission round: the header until it is
    /// acknowledged, then every part not yet acknowledged.
    pub fn pending_packets(&mut self) -> Vec<Packet> {
        if self.state.is_finished() {
            return Vec::new();
        }
        if self.state == SessionState::Created {
            self.state = SessionState::Active;
        }
        if !self.header_acked {
            return vec![self.header()];
        }
        self.acked
            .missing()
            .map(|i| {
                Packet::new(Command::DataPart, self.id)
                    .with_part(i as u32, self.size)
                    .with_payload(self.parts[i].clone())
            })
            .collect()
    }

    pub fn process_incoming_packet(&mut self, packet: &Packet) -> Reaction {
        if self.state.is_finished() {
            return Reaction::none();
        }
        match packet.command {
            Command::DataHeaderAck => {
                if self.header_acked {
                    return Reaction::none();
                }
                self.header_acked = true;
                self.progress += 1;
            }
            Command::DataAck => {
                // An ack implies the header arrived even if its ack was lost.
                let header_news = !self.header_acked;
                self.header_acked = true;
                let newly = self.acked.apply_ack(packet.part_index, &packet.payload);
                if newly == 0 && !header_news {
                    return Reaction::none();
                }
                self.progress += 1;
            }
            _ => return Reaction::none(),
        }

        let completed = self.acked.is_full();
        if completed {
            self.state = SessionState::Terminal;
        }
        self.notify.notify_one();
        Reaction {
            replies: Vec::new(),
            completed,
        }
    }

    pub fn fail(&mut self) {
        if !self.state.is_finished() {
            self.state = SessionState::Failed;
            self.notify.notify_one();
        }
    }
}
