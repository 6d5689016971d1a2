//! warren-core: shared types, wire format, application records and config.
//! All other Warren crates depend on this one.

pub mod config;
pub mod message;
pub mod wire;

pub use message::{Action, Envelope, MessageError};
pub use wire::{Command, Packet, WireError, MAX_PART_SIZE};
