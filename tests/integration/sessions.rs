use crate::*;

use std::sync::Arc;

use bytes::Bytes;
use tether_core::ProtocolEvent;
use tether_services::{
    BufferedWriteChannel, EventDescriptor, PushStream, RpcSession, SessionError, SessionTable,
};

/// What an upstream sink was handed.
#[derive(Debug, PartialEq)]
enum Inbound {
    Chunk(Bytes),
    Error(i32, String),
    Close,
}

struct ForwardingSink(mpsc::UnboundedSender<Inbound>);

impl PushStream for ForwardingSink {
    fn write(&self, chunk: Bytes) -> Result<(), SessionError> {
        let _ = self.0.send(Inbound::Chunk(chunk));
        Ok(())
    }

    fn error(&self, code: i32, reason: &str) -> Result<(), SessionError> {
        let _ = self.0.send(Inbound::Error(code, reason.to_string()));
        Ok(())
    }

    fn close(&self) -> Result<(), SessionError> {
        let _ = self.0.send(Inbound::Close);
        Ok(())
    }
}

/// Sink for sessions whose inbound side the test does not look at.
struct Discard;

impl PushStream for Discard {
    fn write(&self, _: Bytes) -> Result<(), SessionError> {
        Ok(())
    }

    fn error(&self, _: i32, _: &str) -> Result<(), SessionError> {
        Ok(())
    }

    fn close(&self) -> Result<(), SessionError> {
        Ok(())
    }
}

/// Client invokes an echo; the server answers on the same session id and
/// the reply is routed back to the client's upstream through its table.
#[tokio::test]
async fn test_request_and_reply_over_tcp() {
    let (client, server) = tcp_pair().await.unwrap();
    let (mut client_rx, client_tx) = client.into_split();
    let (mut server_rx, server_tx) = server.into_split();

    let client_channel = Arc::new(BufferedWriteChannel::new(client_tx));
    let server_channel = Arc::new(BufferedWriteChannel::new(server_tx));

    let table = SessionTable::new();
    let (inbound_tx, mut inbound) = mpsc::unbounded_channel();
    let session = table.open(EventDescriptor::new("echo"), Arc::new(ForwardingSink(inbound_tx)));
    session.attach(client_channel.clone()).unwrap();

    let down = session.downstream();
    session.invoke().unwrap();
    down.write(Bytes::from_static(b"ping")).unwrap();
    down.close().unwrap();

    // Server side: read the exchange and echo the body back.
    let mut buf = BytesMut::new();
    let invoke = read_frame(&mut server_rx, &mut buf).await.unwrap();
    assert_eq!(invoke.event, ProtocolEvent::Invoke { event: "echo".into() });

    let reply = RpcSession::new(invoke.session_id, EventDescriptor::new("echo"), Arc::new(Discard));
    reply.attach(server_channel.clone()).unwrap();
    loop {
        let frame = read_frame(&mut server_rx, &mut buf).await.unwrap();
        assert_eq!(frame.session_id, session.id());
        match frame.event {
            ProtocolEvent::Chunk(data) => reply.downstream().write(data).unwrap(),
            ProtocolEvent::Choke => {
                reply.downstream().close().unwrap();
                break;
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    // Client side: route replies through the table.
    let mut buf = BytesMut::new();
    for _ in 0..2 {
        let frame = read_frame(&mut client_rx, &mut buf).await.unwrap();
        assert!(table.dispatch(frame));
    }

    assert_eq!(inbound.recv().await, Some(Inbound::Chunk(Bytes::from_static(b"ping"))));
    assert_eq!(inbound.recv().await, Some(Inbound::Close));
    assert!(table.is_empty(), "finished exchange still registered");
}

#[tokio::test]
async fn test_close_keeps_already_queued_frames() {
    let (client, mut server) = tcp_pair().await.unwrap();
    let session = RpcSession::new(1, EventDescriptor::new("upload"), Arc::new(Discard));
    session
        .attach(Arc::new(BufferedWriteChannel::new(client)))
        .unwrap();

    session.downstream().write(Bytes::from_static(b"part")).unwrap();
    session.close();
    assert_eq!(
        session.downstream().write(Bytes::from_static(b"more")),
        Err(SessionError::SessionClosed)
    );

    let mut buf = BytesMut::new();
    let frame = read_frame(&mut server, &mut buf).await.unwrap();
    assert_eq!(frame.event, ProtocolEvent::Chunk(Bytes::from_static(b"part")));
}

#[tokio::test]
async fn test_reattach_moves_traffic_to_new_connection() {
    let (first_client, mut first_server) = tcp_pair().await.unwrap();
    let (second_client, mut second_server) = tcp_pair().await.unwrap();

    let session = RpcSession::new(5, EventDescriptor::new("stream"), Arc::new(Discard));
    session
        .attach(Arc::new(BufferedWriteChannel::new(first_client)))
        .unwrap();
    session.downstream().write(Bytes::from_static(b"one")).unwrap();

    session.detach();
    assert_eq!(
        session.downstream().write(Bytes::from_static(b"lost")),
        Err(SessionError::TransportUnavailable)
    );

    session
        .attach(Arc::new(BufferedWriteChannel::new(second_client)))
        .unwrap();
    session.downstream().write(Bytes::from_static(b"two")).unwrap();

    let mut buf = BytesMut::new();
    let frame = read_frame(&mut first_server, &mut buf).await.unwrap();
    assert_eq!(frame.event, ProtocolEvent::Chunk(Bytes::from_static(b"one")));

    let mut buf = BytesMut::new();
    let frame = read_frame(&mut second_server, &mut buf).await.unwrap();
    assert_eq!(frame.event, ProtocolEvent::Chunk(Bytes::from_static(b"two")));
    assert!(buf.is_empty());
}
