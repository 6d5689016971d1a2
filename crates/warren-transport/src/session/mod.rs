//! Per-conversation state machines.
//!
//! Every non-control datagram belongs to exactly one session. A session is a
//! handshake, an outbound transfer or an inbound transfer; all three share
//! the `Created → Active → Terminal` shape and one packet handler,
//! [`Session::process_incoming_packet`], which the receive loop calls with
//! the registry lock held. Handlers never touch the socket: they return a
//! [`Reaction`] and the loop sends its packets after releasing the lock.

pub mod handshake;
pub mod inbound;
pub mod outbound;
pub mod registry;

use std::net::SocketAddr;
use std::time::Instant;

use warren_core::{Command, Packet};

pub use handshake::Handshake;
pub use inbound::InboundTransfer;
pub use outbound::OutboundTransfer;
pub use registry::SessionRegistry;

/// Which side allocated the session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Opened by this endpoint (handshake probe or outbound transfer).
    Local,
    /// Opened by the peer (inbound transfer).
    Remote,
}

impl Origin {
    /// Where a packet with `command` is looked up on the receiving side.
    pub fn of_incoming(command: Command) -> Origin {
        if command.is_initiator_side() {
            Origin::Remote
        } else {
            Origin::Local
        }
    }
}

/// Session identity. Ids are only unique per (peer, origin), so both sides
/// can pick ids independently without colliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub peer: SocketAddr,
    pub id: u32,
    pub origin: Origin,
}

impl SessionKey {
    pub fn local(peer: SocketAddr, id: u32) -> Self {
        Self {
            peer,
            id,
            origin: Origin::Local,
        }
    }

    pub fn remote(peer: SocketAddr, id: u32) -> Self {
        Self {
            peer,
            id,
            origin: Origin::Remote,
        }
    }

    /// Key an incoming packet from `peer` resolves to.
    pub fn for_incoming(peer: SocketAddr, packet: &Packet) -> Self {
        Self {
            peer,
            id: packet.session_id,
            origin: Origin::of_incoming(packet.command),
        }
    }
}

/// Shared lifecycle of every session variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Active,
    Terminal,
    /// Terminal without success: timed out or the peer went away.
    Failed,
}

impl SessionState {
    pub fn is_finished(self) -> bool {
        matches!(self, SessionState::Terminal | SessionState::Failed)
    }
}

/// What the receive loop must do after a session handled a packet.
#[derive(Debug, Default)]
pub struct Reaction {
    /// Packets to send back to the peer.
    pub replies: Vec<Packet>,
    /// The session reached `Terminal` on this packet.
    pub completed: bool,
}

impl Reaction {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn reply(packet: Packet) -> Self {
        Self {
            replies: vec![packet],
            completed: false,
        }
    }
}

/// One live session.
#[derive(Debug)]
pub enum Session {
    Handshake(Handshake),
    Outbound(OutboundTransfer),
    Inbound(InboundTransfer),
}

impl Session {
    pub fn state(&self) -> SessionState {
        match self {
            Session::Handshake(s) => s.state(),
            Session::Outbound(s) => s.state(),
            Session::Inbound(s) => s.state(),
        }
    }

    /// Feed one packet addressed to this session.
    pub fn process_incoming_packet(&mut self, packet: &Packet, now: Instant) -> Reaction {
        match self {
            Session::Handshake(s) => s.process_incoming_packet(packet),
            Session::Outbound(s) => s.process_incoming_packet(packet),
            Session::Inbound(s) => s.process_incoming_packet(packet, now),
        }
    }

    /// Abort the session and wake whoever waits on it.
    pub fn fail(&mut self) {
        match self {
            Session::Handshake(s) => s.fail(),
            Session::Outbound(s) => s.fail(),
            Session::Inbound(s) => s.fail(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Session::Handshake(_) => "handshake",
            Session::Outbound(_) => "outbound",
            Session::Inbound(_) => "inbound",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incoming_commands_resolve_to_origin() {
        assert_eq!(Origin::of_incoming(Command::Ping), Origin::Remote);
        assert_eq!(Origin::of_incoming(Command::DataHeader), Origin::Remote);
        assert_eq!(Origin::of_incoming(Command::DataPart), Origin::Remote);
        assert_eq!(Origin::of_incoming(Command::PingAck), Origin::Local);
        assert_eq!(Origin::of_incoming(Command::DataHeaderAck), Origin::Local);
        assert_eq!(Origin::of_incoming(Command::DataAck), Origin::Local);
    }

    #[test]
    fn same_id_different_origin_are_distinct_keys() {
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert_ne!(SessionKey::local(peer, 7), SessionKey::remote(peer, 7));
    }
}
