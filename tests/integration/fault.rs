use crate::*;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use warren_transport::Endpoint;

// ── LossyRelay ───────────────────────────────────────────────────────────────

/// UDP relay that drops a fraction of datagrams in both directions.
///
/// Peers talk to `addr`; the relay forwards to `target` from its own
/// upstream socket, so `target` sees the relay as the peer. Stops on drop.
pub struct LossyRelay {
    pub addr: SocketAddr,
    task: JoinHandle<()>,
}

impl LossyRelay {
    pub async fn start(target: SocketAddr, loss: f64, seed: u64) -> Result<Self> {
        let front = UdpSocket::bind("127.0.0.1:0").await?;
        let back = UdpSocket::bind("127.0.0.1:0").await?;
        let addr = front.local_addr()?;

        let task = tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut client: Option<SocketAddr> = None;
            let mut up = vec![0u8; 65_536];
            let mut down = vec![0u8; 65_536];
            loop {
                tokio::select! {
                    Ok((n, from)) = front.recv_from(&mut up) => {
                        client = Some(from);
                        if !rng.gen_bool(loss) {
                            let _ = back.send_to(&up[..n], target).await;
                        }
                    }
                    Ok((n, _)) = back.recv_from(&mut down) => {
                        if let Some(client) = client {
                            if !rng.gen_bool(loss) {
                                let _ = front.send_to(&down[..n], client).await;
                            }
                        }
                    }
                    else => break,
                }
            }
        });
        Ok(Self { addr, task })
    }
}

impl Drop for LossyRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_transfer_survives_packet_loss() -> Result<()> {
    let server = Endpoint::bind("127.0.0.1:0".parse()?, fast_transport()).await?;
    let relay = LossyRelay::start(server.local_addr(), 0.15, 7).await?;
    let client = Endpoint::bind("127.0.0.1:0".parse()?, fast_transport()).await?;

    let (conn, accepted) = tokio::join!(client.connect(relay.addr), server.accept());
    let (conn, accepted) = (conn?, accepted?);

    let payload: Vec<u8> = (0..60_000u32).map(|i| (i * 7 % 256) as u8).collect();
    conn.send(Bytes::from(payload.clone())).await?;
    assert_eq!(accepted.receive_timeout(STEP).await?.as_ref(), payload.as_slice());

    let reply = Bytes::from_static(b"{\"ok\":true}");
    accepted.send(reply.clone()).await?;
    assert_eq!(conn.receive_timeout(STEP).await?, reply);

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_job_through_lossy_link() -> Result<()> {
    let broker = TestBroker::start().await?;
    let relay = LossyRelay::start(broker.addr, 0.10, 42).await?;
    let _worker = broker
        .worker("w", 2, warren_services::kernels::builtin_handlers())
        .await?;

    let config = ClientConfig {
        id: "lossy".into(),
        broker: relay.addr.to_string(),
    };
    let client = Client::connect(&config, fast_transport()).await?;
    let matrices = serde_json::json!([[[1, 2], [3, 4]], [[2, 0, 1], [1, 3, 2], [1, 1, 2]]]);
    let id = client.submit("determinant", matrices.to_string(), 2).await?;

    let result = next_result(&client).await?;
    assert_eq!(result.id, id);
    assert_eq!(result.data, "[-2,6]");

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_unreachable_broker_times_out() -> Result<()> {
    // A relay that drops everything behaves like a dead host.
    let sink = UdpSocket::bind("127.0.0.1:0").await?;
    let relay = LossyRelay::start(sink.local_addr()?, 1.0, 1).await?;

    let config = ClientConfig {
        id: "nobody".into(),
        broker: relay.addr.to_string(),
    };
    let err = Client::connect(&config, fast_transport()).await.err();
    assert!(err.is_some(), "connect through a black hole must fail");
    Ok(())
}
