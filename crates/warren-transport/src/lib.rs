//! warren-transport: reliable, session-oriented messaging over one UDP socket.
//!
//! An [`Endpoint`] owns the socket and runs the receive loop that demultiplexes
//! datagrams to sessions. A [`Connection`] is one peer relationship on top of
//! it, offering whole-message `send` / `receive` with fragmentation,
//! acknowledgment and retransmission handled underneath.

pub mod connection;
pub mod endpoint;
pub mod error;
pub mod fragment;
pub mod session;

pub use connection::Connection;
pub use endpoint::{resolve, Endpoint};
pub use error::TransportError;
pub use fragment::{FragmentError, PartSet, ReassemblyBuffer, MAX_MESSAGE_SIZE};
