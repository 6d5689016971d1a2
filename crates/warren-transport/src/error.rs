use std::net::SocketAddr;

use warren_core::config::ConfigError;
use warren_core::WireError;

use crate::fragment::FragmentError;

/// Failures surfaced to callers of [`Endpoint`](crate::Endpoint) and
/// [`Connection`](crate::Connection).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// A bounded wait (handshake answer, acknowledgment) expired.
    #[error("timed out waiting for {what} from {peer}")]
    TimedOut { peer: SocketAddr, what: &'static str },

    /// The peer closed the connection or stopped answering keepalives.
    #[error("peer {0} disconnected")]
    Disconnected(SocketAddr),

    /// The peer's host name could not be resolved.
    #[error("peer {0} is unreachable")]
    PeerUnreachable(String),

    /// A connection to this peer already exists on the endpoint.
    #[error("already connected to {0}")]
    AlreadyConnected(SocketAddr),

    #[error("message of {0} bytes exceeds the transfer limit")]
    MessageTooLarge(usize),

    #[error("endpoint is shut down")]
    Shutdown,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    InvalidFragment(#[from] FragmentError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}
