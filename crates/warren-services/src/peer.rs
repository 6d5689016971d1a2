//! Plumbing shared by the worker and client runtimes.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use warren_core::config::TransportConfig;
use warren_core::message::{Message, MessageError};
use warren_transport::{resolve, Connection, Endpoint, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Message(#[from] MessageError),
}

/// Bind a local endpoint suited to reach `broker`, connect, and send the
/// registration message. The endpoint must outlive the connection.
pub async fn connect_and_register(
    broker: &str,
    transport: TransportConfig,
    registration: &Message,
) -> Result<(Endpoint, Connection), RuntimeError> {
    let broker_addr = resolve(broker).await?;
    let local: SocketAddr = if broker_addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let endpoint = Endpoint::bind(local, transport).await?;
    let conn = match endpoint.connect(broker_addr).await {
        Ok(conn) => conn,
        Err(e) => {
            endpoint.shutdown().await;
            return Err(e.into());
        }
    };
    if let Err(e) = send_message(&conn, registration).await {
        endpoint.shutdown().await;
        return Err(e);
    }
    tracing::info!(broker = %broker_addr, action = ?registration.action(), "registered with broker");
    Ok((endpoint, conn))
}

pub async fn send_message(conn: &Connection, message: &Message) -> Result<(), RuntimeError> {
    conn.send(message.encode()?).await?;
    Ok(())
}
