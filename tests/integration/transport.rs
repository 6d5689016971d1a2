use crate::*;
use bytes::Bytes;
use warren_transport::{Endpoint, TransportError};

async fn pair() -> Result<(Endpoint, Endpoint, Connection, Connection)> {
    let a = Endpoint::bind("127.0.0.1:0".parse()?, fast_transport()).await?;
    let b = Endpoint::bind("127.0.0.1:0".parse()?, fast_transport()).await?;
    let (to_b, from_a) = tokio::join!(a.connect(b.local_addr()), b.accept());
    Ok((a, b, to_b?, from_a?))
}

#[tokio::test]
async fn test_handshake_yields_connections() -> Result<()> {
    let (a, b, to_b, from_a) = pair().await?;
    assert_eq!(to_b.peer_addr(), b.local_addr());
    assert_eq!(from_a.peer_addr(), a.local_addr());
    assert_eq!(a.peer_count(), 1);
    assert_eq!(b.peer_count(), 1);
    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_ten_kilobyte_transfer() -> Result<()> {
    let (a, b, to_b, from_a) = pair().await?;
    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

    to_b.send(Bytes::from(payload.clone())).await?;
    let got = from_a.receive_timeout(STEP).await?;
    assert_eq!(got.as_ref(), payload.as_slice());

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_both_directions_at_once() -> Result<()> {
    let (a, b, to_b, from_a) = pair().await?;
    let ping = Bytes::from(vec![1u8; 5_000]);
    let pong = Bytes::from(vec![2u8; 7_000]);

    let (sent_ab, sent_ba) = tokio::join!(to_b.send(ping.clone()), from_a.send(pong.clone()));
    sent_ab?;
    sent_ba?;
    assert_eq!(from_a.receive_timeout(STEP).await?, ping);
    assert_eq!(to_b.receive_timeout(STEP).await?, pong);

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_many_messages_arrive_complete() -> Result<()> {
    let (a, b, to_b, from_a) = pair().await?;

    let sends = (0..20u8).map(|i| {
        let conn = to_b.clone();
        tokio::spawn(async move { conn.send(Bytes::from(vec![i; 1500 + i as usize])).await })
    });
    for send in sends.collect::<Vec<_>>() {
        send.await??;
    }

    let mut seen = Vec::new();
    for _ in 0..20 {
        let msg = from_a.receive_timeout(STEP).await?;
        let tag = msg[0];
        assert!(msg.iter().all(|&x| x == tag));
        assert_eq!(msg.len(), 1500 + tag as usize);
        seen.push(tag);
    }
    seen.sort_unstable();
    assert_eq!(seen, (0..20).collect::<Vec<u8>>());

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_peer_shutdown_disconnects() -> Result<()> {
    let (a, b, _to_b, from_a) = pair().await?;
    a.shutdown().await;
    let err = from_a.receive_timeout(STEP).await.unwrap_err();
    assert!(matches!(err, TransportError::Disconnected(_)));
    b.shutdown().await;
    Ok(())
}
