//! Receiver side of a reliable transfer.
//!
//! Created from a DataHeader, which fixes the size and part count. Parts are
//! written into a [`ReassemblyBuffer`]; acknowledgments go out every
//! `ack_every` new parts, on completion, and for every duplicate (a duplicate
//! means the sender missed an earlier ack). After completion the payload is
//! taken once for delivery and the session lingers so late duplicates are
//! still answered.

use std::time::Instant;

use bytes::Bytes;
use warren_core::wire::part_count;
use warren_core::{Command, Packet, MAX_PART_SIZE};

use super::{Reaction, SessionState};
use crate::fragment::{FragmentError, PartWrite, ReassemblyBuffer};

#[derive(Debug)]
pub struct InboundTransfer {
    id: u32,
    size: u32,
    buffer: Option<ReassemblyBuffer>,
    /// Retained after the payload is taken, so acks stay accurate.
    complete_parts: Option<crate::fragment::PartSet>,
    state: SessionState,
    ack_every: u32,
    unacked: u32,
    last_activity: Instant,
    completed_at: Option<Instant>,
}

impl InboundTransfer {
    /// Start a transfer from its DataHeader fields. The announced part count
    /// must match the size, or the header is refused.
    pub fn from_header(
        id: u32,
        total_size: u32,
        announced_parts: u32,
        ack_every: u32,
        now: Instant,
    ) -> Result<Self, FragmentError> {
        let expected = part_count(total_size as usize, MAX_PART_SIZE);
        if announced_parts as usize != expected {
            return Err(FragmentError::IndexOutOfRange {
                index: announced_parts as usize,
                parts: expected,
            });
        }
        let buffer = ReassemblyBuffer::new(total_size as usize, MAX_PART_SIZE)?;
        let complete = buffer.is_complete();
        Ok(Self {
            id,
            size: total_size,
            buffer: Some(buffer),
            complete_parts: None,
            state: if complete {
                SessionState::Terminal
            } else {
                SessionState::Created
            },
            ack_every: ack_every.max(1),
            unacked: 0,
            last_activity: now,
            completed_at: complete.then_some(now),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn completed_at(&self) -> Option<Instant> {
        self.completed_at
    }

    fn header_ack(&self) -> Packet {
        Packet::new(Command::DataHeaderAck, self.id)
            .with_part(part_count(self.size as usize, MAX_PART_SIZE) as u32, self.size)
    }

    fn data_ack(&mut self) -> Packet {
        self.unacked = 0;
        let parts = match (&self.buffer, &self.complete_parts) {
            (Some(buf), _) => buf.parts(),
            (None, Some(parts)) => parts,
            (None, None) => return Packet::new(Command::DataAck, self.id),
        };
        let (base, bitmap) = parts.to_ack(MAX_PART_SIZE);
        Packet::new(Command::DataAck, self.id)
            .with_part(base, self.size)
            .with_payload(Bytes::from(bitmap))
    }

    /// The acknowledgments owed right after creation: the header ack, plus a
    /// data ack when the message has no parts at all.
    pub fn initial_replies(&mut self) -> Vec<Packet> {
        let mut replies = vec![self.header_ack()];
        if self.state == SessionState::Terminal {
            replies.push(self.data_ack());
        }
        replies
    }

    pub fn process_incoming_packet(&mut self, packet: &Packet, now: Instant) -> Reaction {
        self.last_activity = now;
        match packet.command {
            Command::DataHeader => Reaction::reply(self.header_ack()),
            Command::DataPart => self.on_part(packet, now),
            _ => Reaction::none(),
        }
    }

    fn on_part(&mut self, packet: &Packet, now: Instant) -> Reaction {
        let Some(buffer) = self.buffer.as_mut() else {
            // Already delivered: the final ack was lost.
            return Reaction::reply(self.data_ack());
        };
        if packet.total_size != self.size {
            tracing::trace!(session_id = self.id, "part with mismatched size dropped");
            return Reaction::none();
        }

        match buffer.write(packet.part_index as usize, &packet.payload) {
            Err(e) => {
                tracing::warn!(session_id = self.id, error = %e, "invalid fragment dropped");
                Reaction::none()
            }
            Ok(PartWrite::Duplicate) => {
                tracing::trace!(session_id = self.id, part = packet.part_index, "duplicate part");
                Reaction::reply(self.data_ack())
            }
            Ok(PartWrite::New) => {
                self.state = SessionState::Active;
                self.unacked += 1;
                if buffer.is_complete() {
                    self.state = SessionState::Terminal;
                    self.completed_at = Some(now);
                    Reaction {
                        replies: vec![self.data_ack()],
                        completed: true,
                    }
                } else if self.unacked >= self.ack_every {
                    Reaction::reply(self.data_ack())
                } else {
                    Reaction::none()
                }
            }
        }
    }

    /// The reassembled payload. Returns it once, and only after completion.
    pub fn take_payload(&mut self) -> Option<Bytes> {
        if self.state != SessionState::Terminal {
            return None;
        }
        let buffer = self.buffer.take()?;
        self.complete_parts = Some(buffer.parts().clone());
        buffer.into_payload()
    }

    pub fn fail(&mut self) {
        if !self.state.is_finished() {
            self.state = SessionState::Failed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::split;

    fn part(id: u32, size: u32, idx: usize, data: &Bytes) -> Packet {
        Packet::new(Command::DataPart, id)
            .with_part(idx as u32, size)
            .with_payload(data.clone())
    }

    #[test]
    fn header_mismatch_is_refused() {
        let now = Instant::now();
        assert!(InboundTransfer::from_header(1, 3000, 2, 32, now).is_err());
        assert!(InboundTransfer::from_header(1, 3000, 3, 32, now).is_ok());
    }

    #[test]
    fn completes_out_of_order_and_acks() {
        let now = Instant::now();
        let payload = Bytes::from((0..3000u32).map(|i| i as u8).collect::<Vec<_>>());
        let parts = split(&payload, MAX_PART_SIZE);
        let size = payload.len() as u32;
        let mut t = InboundTransfer::from_header(9, size, parts.len() as u32, 32, now).unwrap();

        let replies = t.initial_replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].command, Command::DataHeaderAck);

        assert!(t.take_payload().is_none());
        for idx in [2, 0] {
            let r = t.process_incoming_packet(&part(9, size, idx, &parts[idx]), now);
            assert!(!r.completed);
            assert!(r.replies.is_empty());
        }
        let r = t.process_incoming_packet(&part(9, size, 1, &parts[1]), now);
        assert!(r.completed);
        assert_eq!(r.replies[0].command, Command::DataAck);
        assert_eq!(r.replies[0].part_index, parts.len() as u32);

        assert_eq!(t.take_payload().unwrap(), payload);
        assert!(t.take_payload().is_none(), "payload is delivered once");

        // A late duplicate is still acknowledged in full.
        let r = t.process_incoming_packet(&part(9, size, 0, &parts[0]), now);
        assert_eq!(r.replies[0].part_index, parts.len() as u32);
        assert!(!r.completed);
    }

    #[test]
    fn acks_every_n_new_parts_and_on_duplicates() {
        let now = Instant::now();
        let payload = Bytes::from(vec![1u8; MAX_PART_SIZE * 5]);
        let parts = split(&payload, MAX_PART_SIZE);
        let size = payload.len() as u32;
        let mut t = InboundTransfer::from_header(4, size, 5, 2, now).unwrap();

        assert!(t.process_incoming_packet(&part(4, size, 0, &parts[0]), now).replies.is_empty());
        let r = t.process_incoming_packet(&part(4, size, 1, &parts[1]), now);
        assert_eq!(r.replies.len(), 1);
        assert_eq!(r.replies[0].part_index, 2);

        let r = t.process_incoming_packet(&part(4, size, 1, &parts[1]), now);
        assert_eq!(r.replies.len(), 1, "duplicates are re-acknowledged");
    }

    #[test]
    fn empty_message_is_terminal_on_header() {
        let now = Instant::now();
        let mut t = InboundTransfer::from_header(2, 0, 0, 32, now).unwrap();
        assert_eq!(t.state(), SessionState::Terminal);
        let replies = t.initial_replies();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[1].command, Command::DataAck);
        assert_eq!(t.take_payload().unwrap(), Bytes::new());
    }

    #[test]
    fn bad_fragment_is_dropped() {
        let now = Instant::now();
        let mut t = InboundTransfer::from_header(3, 100, 1, 32, now).unwrap();
        let bogus = Packet::new(Command::DataPart, 3)
            .with_part(5, 100)
            .with_payload(Bytes::from_static(b"x"));
        let r = t.process_incoming_packet(&bogus, now);
        assert!(r.replies.is_empty());
        assert!(!r.completed);
        assert_eq!(t.state(), SessionState::Created);
    }
}
