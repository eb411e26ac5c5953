//! tether integration test harness.
//!
//! Everything runs over loopback sockets inside the test process, so no
//! privileges or network setup are required:
//!
//!   cargo test --test integration
//!
//! Each test owns the sockets it opens.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use tether_core::{decode_frame, Frame};
use tether_services::{Completion, TransportError};

mod channel;
mod gateway;
mod sessions;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Upper bound for any single wait in these tests.
pub const STEP: Duration = Duration::from_secs(10);

/// A connected loopback TCP pair: (client, server).
pub async fn tcp_pair() -> Result<(TcpStream, TcpStream)> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("failed to bind loopback listener")?;
    let addr = listener.local_addr()?;
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let client = client.context("connect failed")?;
    let (server, _) = accepted.context("accept failed")?;
    Ok((client, server))
}

pub type Outcome = (usize, Result<(), TransportError>);

/// Completion that reports `(index, result)` on `tx`.
pub fn tracked(tx: &mpsc::UnboundedSender<Outcome>, index: usize) -> Completion {
    let tx = tx.clone();
    Box::new(move |result| {
        let _ = tx.send((index, result));
    })
}

/// Next completion outcome, or an error after `STEP`.
pub async fn next_outcome(rx: &mut mpsc::UnboundedReceiver<Outcome>) -> Result<Outcome> {
    match tokio::time::timeout(STEP, rx.recv()).await {
        Ok(Some(outcome)) => Ok(outcome),
        Ok(None) => bail!("completion channel closed"),
        Err(_) => bail!("timed out waiting for a completion"),
    }
}

/// Read one frame, buffering partial reads in `buf`.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut BytesMut) -> Result<Frame> {
    loop {
        if let Some((frame, used)) = decode_frame(&buf[..])? {
            buf.advance(used);
            return Ok(frame);
        }
        let n = tokio::time::timeout(STEP, reader.read_buf(buf))
            .await
            .context("timed out waiting for a frame")??;
        if n == 0 {
            bail!("connection closed mid-frame ({} bytes buffered)", buf.len());
        }
    }
}

/// Payload byte for message `i`, so reordering shows up in the data.
pub fn fill(i: usize) -> u8 {
    (i % 251) as u8
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_loopback_pair_connects() {
    let (client, server) = tcp_pair().await.unwrap();
    assert_eq!(client.local_addr().unwrap(), server.peer_addr().unwrap());
}
