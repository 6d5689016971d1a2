//! Warren wire format: the on-wire shape of every datagram.
//!
//! These types ARE the protocol. Every field, every size, every reserved byte
//! is part of the wire format. Both peers must agree on `MAX_PART_SIZE` and
//! `PROTOCOL_VERSION`; changing either is a breaking change.
//!
//! The fixed header is `#[repr(C)]` over unaligned little-endian integers and
//! uses zerocopy derives for allocation-free serialization. There is no
//! unsafe code in this module.

use bytes::Bytes;
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Packet Header ────────────────────────────────────────────────────────────

/// Fixed header preceding every datagram payload.
///
/// The meaning of `part_index` and `total_size` depends on `command`:
///
/// | command         | part_index                 | total_size        | payload            |
/// |-----------------|----------------------------|-------------------|--------------------|
/// | Ping / PingAck  | 0                          | 0                 | empty              |
/// | DataHeader      | part count                 | message size      | empty              |
/// | DataHeaderAck   | part count                 | message size      | empty              |
/// | DataPart        | part index                 | message size      | part bytes         |
/// | DataAck         | cumulative base            | message size      | bitmap from base   |
/// | Keepalive/Close | 0                          | 0                 | empty              |
///
/// Wire size: 16 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct PacketHeader {
    /// Wire format version. Currently 0x01.
    /// A receiver seeing an unknown version drops the datagram.
    pub version: u8,

    /// Command byte, see [`Command`].
    pub command: u8,

    /// Length of the payload following this header, in bytes.
    pub payload_len: U16<LittleEndian>,

    /// Session the datagram belongs to. Assigned by the side that opened the
    /// session (handshake initiator or transfer sender).
    pub session_id: U32<LittleEndian>,

    /// Part index, part count, or acknowledgment base (see table above).
    pub part_index: U32<LittleEndian>,

    /// Total size in bytes of the message being transferred.
    pub total_size: U32<LittleEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(PacketHeader, [u8; 16]);

// ── Commands ──────────────────────────────────────────────────────────────────

/// Control code carried in every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Handshake probe, sent by the connecting side.
    Ping = 0x01,
    /// Handshake answer, echoes the probe's session id.
    PingAck = 0x02,
    /// Announces a transfer: size and part count.
    DataHeader = 0x10,
    /// Receiver has allocated the inbound buffer for a transfer.
    DataHeaderAck = 0x11,
    /// One fragment of a transfer.
    DataPart = 0x12,
    /// Cumulative + selective acknowledgment of received fragments.
    DataAck = 0x13,
    /// Liveness signal on an idle connection.
    Keepalive = 0x20,
    /// The peer is closing the connection.
    Close = 0x21,
}

impl Command {
    /// True for commands sent by the side that owns the session id
    /// (the receiver looks them up among remotely-opened sessions).
    pub fn is_initiator_side(self) -> bool {
        matches!(self, Command::Ping | Command::DataHeader | Command::DataPart)
    }

    /// True for connection-level control packets that belong to no session.
    pub fn is_control(self) -> bool {
        matches!(self, Command::Keepalive | Command::Close)
    }
}

impl TryFrom<u8> for Command {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Ping),
            0x02 => Ok(Command::PingAck),
            0x10 => Ok(Command::DataHeader),
            0x11 => Ok(Command::DataHeaderAck),
            0x12 => Ok(Command::DataPart),
            0x13 => Ok(Command::DataAck),
            0x20 => Ok(Command::Keepalive),
            0x21 => Ok(Command::Close),
            other => Err(WireError::UnknownCommand(other)),
        }
    }
}

impl From<Command> for u8 {
    fn from(c: Command) -> u8 {
        c as u8
    }
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Current wire format version.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Maximum payload bytes carried by one datagram.
/// Kept well under a common 1500-byte Ethernet MTU including IP/UDP headers.
pub const MAX_PART_SIZE: usize = 1024;

/// Size of [`PacketHeader`] on the wire.
pub const HEADER_SIZE: usize = std::mem::size_of::<PacketHeader>();

/// Largest datagram this protocol ever produces.
pub const MAX_DATAGRAM_SIZE: usize = HEADER_SIZE + MAX_PART_SIZE;

/// Number of parts a payload of `size` bytes is split into.
/// An empty payload has zero parts.
pub fn part_count(size: usize, part_size: usize) -> usize {
    size.div_ceil(part_size)
}

// ── Packet ────────────────────────────────────────────────────────────────────

/// A decoded datagram: header fields plus an owned payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub command: Command,
    pub session_id: u32,
    pub part_index: u32,
    pub total_size: u32,
    pub payload: Bytes,
}

impl Packet {
    /// A packet with all numeric fields zeroed and no payload.
    pub fn new(command: Command, session_id: u32) -> Self {
        Self {
            command,
            session_id,
            part_index: 0,
            total_size: 0,
            payload: Bytes::new(),
        }
    }

    pub fn with_part(mut self, part_index: u32, total_size: u32) -> Self {
        self.part_index = part_index;
        self.total_size = total_size;
        self
    }

    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    /// Serialize header + payload into one datagram.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        if self.payload.len() > MAX_PART_SIZE {
            return Err(WireError::PayloadTooLarge(self.payload.len()));
        }

        let header = PacketHeader {
            version: PROTOCOL_VERSION,
            command: self.command.into(),
            payload_len: U16::new(self.payload.len() as u16),
            session_id: U32::new(self.session_id),
            part_index: U32::new(self.part_index),
            total_size: U32::new(self.total_size),
        };

        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Parse one datagram. Trailing bytes beyond `payload_len` are ignored.
    pub fn decode(datagram: &[u8]) -> Result<Self, WireError> {
        let header =
            PacketHeader::read_from_prefix(datagram).ok_or(WireError::Truncated(datagram.len()))?;

        if header.version != PROTOCOL_VERSION {
            return Err(WireError::UnknownVersion(header.version));
        }
        let command = Command::try_from(header.command)?;

        let payload_len = header.payload_len.get() as usize;
        if payload_len > MAX_PART_SIZE {
            return Err(WireError::PayloadTooLarge(payload_len));
        }
        let body = &datagram[HEADER_SIZE..];
        if body.len() < payload_len {
            return Err(WireError::Truncated(datagram.len()));
        }

        Ok(Self {
            command,
            session_id: header.session_id.get(),
            part_index: header.part_index.get(),
            total_size: header.total_size.get(),
            payload: Bytes::copy_from_slice(&body[..payload_len]),
        })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown command byte: 0x{0:02x}")]
    UnknownCommand(u8),

    #[error("unknown wire version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("payload length {0} exceeds maximum {}", MAX_PART_SIZE)]
    PayloadTooLarge(usize),

    #[error("datagram of {0} bytes is truncated")]
    Truncated(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
