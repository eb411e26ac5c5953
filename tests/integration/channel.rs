use crate::*;

use bytes::Bytes;
use tether_services::BufferedWriteChannel;
use tokio::sync::mpsc;

const MESSAGE: usize = 64 * 1024;

/// Far more than the socket buffers hold, so most of it is queued.
#[tokio::test]
async fn test_slow_reader_receives_everything_in_order() {
    let (client, mut server) = tcp_pair().await.unwrap();
    let channel = BufferedWriteChannel::new(client);
    let count = 200;

    let (tx, mut rx) = mpsc::unbounded_channel();
    for i in 0..count {
        channel.write(Bytes::from(vec![fill(i); MESSAGE]), tracked(&tx, i));
    }
    assert!(channel.pressure() > 0, "nothing was queued");

    let reader = tokio::spawn(async move {
        let mut received = vec![0u8; count * MESSAGE];
        for piece in received.chunks_mut(MESSAGE / 4) {
            server.read_exact(piece).await?;
            tokio::task::yield_now().await;
        }
        anyhow::Ok(received)
    });

    for expected in 0..count {
        let (i, result) = next_outcome(&mut rx).await.unwrap();
        assert_eq!(i, expected);
        assert_eq!(result, Ok(()));
    }
    assert_eq!(channel.pressure(), 0);

    let received = reader.await.unwrap().unwrap();
    for (i, message) in received.chunks(MESSAGE).enumerate() {
        assert!(message.iter().all(|b| *b == fill(i)), "message {i} corrupted");
    }
}

#[tokio::test]
async fn test_peer_reset_faults_the_channel() {
    let (client, server) = tcp_pair().await.unwrap();
    drop(server);

    let channel = BufferedWriteChannel::new(client);
    let (tx, mut rx) = mpsc::unbounded_channel();

    // The first writes may land in the kernel before the reset is seen.
    let mut fault = None;
    for i in 0..1000 {
        channel.write(Bytes::from(vec![fill(i); MESSAGE]), tracked(&tx, i));
        let (done, result) = next_outcome(&mut rx).await.unwrap();
        assert_eq!(done, i);
        if let Err(e) = result {
            fault = Some(e);
            break;
        }
    }
    let fault = fault.expect("peer close never surfaced");
    assert!(matches!(fault, TransportError::Fault { .. }));
    assert!(channel.is_faulted());

    // Later writes fail fast with the recorded fault.
    channel.write(Bytes::from_static(b"late"), tracked(&tx, 9999));
    let (i, result) = next_outcome(&mut rx).await.unwrap();
    assert_eq!(i, 9999);
    assert_eq!(result, Err(fault));
}

#[tokio::test]
async fn test_in_flight_writes_finish_after_handle_is_dropped() {
    let (client, mut server) = tcp_pair().await.unwrap();
    let channel = BufferedWriteChannel::new(client);
    let size = 8 * 1024 * 1024;

    let (tx, mut rx) = mpsc::unbounded_channel();
    channel.write(Bytes::from(vec![7u8; size]), tracked(&tx, 0));
    drop(channel);
    drop(tx);

    let mut received = vec![0u8; size];
    server.read_exact(&mut received).await.unwrap();
    assert!(received.iter().all(|b| *b == 7));

    assert_eq!(next_outcome(&mut rx).await.unwrap(), (0, Ok(())));
}
