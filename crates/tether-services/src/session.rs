//! RPC sessions: one per logical exchange, multiplexed over a transport.
//!
//! A session is `Open` until closed, and never reopens. While open it may be
//! attached to a transport, detached, and re-attached; bytes queued on a
//! previous transport stay there. Outbound events go through `send`, which
//! checks state and enqueues under one lock so a concurrent `close` or
//! `detach` can never interleave with an enqueue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;

use tether_core::{Encoder, Frame, FrameEncoder, ProtocolEvent, WireError};

use crate::channel::{Transport, TransportError};

/// How a session reacts to losing its transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionPolicy {
    pub close_on_detach: bool,
}

/// The event a session was opened for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDescriptor {
    pub name: String,
    pub policy: SessionPolicy,
}

impl EventDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            policy: SessionPolicy::default(),
        }
    }

    pub fn close_on_detach(mut self) -> Self {
        self.policy.close_on_detach = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("no transport attached")]
    TransportUnavailable,
    #[error("session is closed")]
    SessionClosed,
    #[error("cannot encode event: {0}")]
    Encode(WireError),
}

/// Push-style sink of an exchange: data, then an error or a close.
///
/// `Downstream` implements it toward the peer. The application hands the
/// session an implementation as its upstream, which receives what the peer
/// sends back.
pub trait PushStream: Send + Sync {
    fn write(&self, chunk: Bytes) -> Result<(), SessionError>;
    fn error(&self, code: i32, reason: &str) -> Result<(), SessionError>;
    fn close(&self) -> Result<(), SessionError>;
}

struct Inner {
    state: SessionState,
    transport: Option<Arc<dyn Transport>>,
}

pub struct RpcSession {
    id: u64,
    event: EventDescriptor,
    upstream: Arc<dyn PushStream>,
    encoder: Arc<dyn Encoder>,
    inner: Mutex<Inner>,
}

impl RpcSession {
    /// Create an open, unattached session using the default framing.
    pub fn new(id: u64, event: EventDescriptor, upstream: Arc<dyn PushStream>) -> Arc<Self> {
        Self::with_encoder(id, event, upstream, Arc::new(FrameEncoder))
    }

    pub fn with_encoder(
        id: u64,
        event: EventDescriptor,
        upstream: Arc<dyn PushStream>,
        encoder: Arc<dyn Encoder>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            event,
            upstream,
            encoder,
            inner: Mutex::new(Inner {
                state: SessionState::Open,
                transport: None,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn event(&self) -> &EventDescriptor {
        &self.event
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Bind to `transport`, replacing any previous one.
    pub fn attach(&self, transport: Arc<dyn Transport>) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Closed {
            return Err(SessionError::SessionClosed);
        }
        let rebound = inner.transport.replace(transport).is_some();
        tracing::debug!(session = self.id, rebound, "transport attached");
        Ok(())
    }

    /// Unbind the transport. Closes the session too if its policy says so.
    pub fn detach(&self) {
        let mut inner = self.inner.lock();
        self.unbind(&mut inner);
    }

    fn unbind(&self, inner: &mut Inner) {
        inner.transport = None;
        if self.event.policy.close_on_detach && inner.state == SessionState::Open {
            inner.state = SessionState::Closed;
            tracing::debug!(session = self.id, "closed on detach");
        }
    }

    /// Mark the session closed. Writes already handed to the transport are
    /// left alone.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Open {
            inner.state = SessionState::Closed;
            tracing::debug!(session = self.id, event = %self.event.name, "session closed");
        }
    }

    /// Encode `event` and enqueue it on the attached transport.
    ///
    /// A transport that has faulted is detached here, so the caller sees
    /// `TransportUnavailable` instead of writes vanishing into it.
    pub fn send(&self, event: ProtocolEvent) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Closed {
            return Err(SessionError::SessionClosed);
        }
        let faulted = match &inner.transport {
            Some(transport) => transport.is_faulted(),
            None => return Err(SessionError::TransportUnavailable),
        };
        if faulted {
            tracing::debug!(session = self.id, "dropping faulted transport");
            self.unbind(&mut inner);
            return Err(SessionError::TransportUnavailable);
        }

        let message = self
            .encoder
            .encode(self.id, &event)
            .map_err(SessionError::Encode)?;
        let Some(transport) = inner.transport.as_ref() else {
            return Err(SessionError::TransportUnavailable);
        };
        let id = self.id;
        // Transports never run completions inline, so holding the lock here
        // cannot re-enter it.
        transport.write(
            message,
            Box::new(move |result: Result<(), TransportError>| {
                if let Err(e) = result {
                    tracing::debug!(session = id, error = %e, "outbound write failed");
                }
            }),
        );
        Ok(())
    }

    /// Send the opening frame naming this session's event.
    pub fn invoke(&self) -> Result<(), SessionError> {
        self.send(ProtocolEvent::Invoke {
            event: self.event.name.clone(),
        })
    }

    /// Outstanding bytes on the attached transport, if there is a live one.
    pub fn pressure(&self) -> Option<usize> {
        self.inner
            .lock()
            .transport
            .as_ref()
            .filter(|t| !t.is_faulted())
            .map(|t| t.pressure())
    }

    /// Application-facing handle that pushes toward the peer.
    pub fn downstream(self: &Arc<Self>) -> Downstream {
        Downstream {
            session: Arc::clone(self),
        }
    }

    /// Hand an event received from the peer to the upstream sink.
    ///
    /// Returns true when the event ends the inbound side of the exchange.
    pub fn deliver(&self, event: ProtocolEvent) -> bool {
        let (result, terminal) = match event {
            ProtocolEvent::Chunk(data) => (self.upstream.write(data), false),
            ProtocolEvent::Error { code, reason } => (self.upstream.error(code, &reason), true),
            ProtocolEvent::Choke => (self.upstream.close(), true),
            ProtocolEvent::Invoke { event } => {
                tracing::debug!(session = self.id, event = %event, "ignoring invoke on open session");
                return false;
            }
        };
        if let Err(e) = result {
            tracing::debug!(session = self.id, error = %e, "upstream rejected event");
        }
        terminal
    }
}

impl std::fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcSession")
            .field("id", &self.id)
            .field("event", &self.event.name)
            .field("state", &self.state())
            .finish()
    }
}

/// The application's end of a session. Keeps the session alive.
#[derive(Debug, Clone)]
pub struct Downstream {
    session: Arc<RpcSession>,
}

impl Downstream {
    pub fn session(&self) -> &Arc<RpcSession> {
        &self.session
    }
}

impl PushStream for Downstream {
    fn write(&self, chunk: Bytes) -> Result<(), SessionError> {
        self.session.send(ProtocolEvent::Chunk(chunk))
    }

    fn error(&self, code: i32, reason: &str) -> Result<(), SessionError> {
        self.session.send(ProtocolEvent::Error {
            code,
            reason: reason.to_string(),
        })
    }

    fn close(&self) -> Result<(), SessionError> {
        self.session.send(ProtocolEvent::Choke)
    }
}

// ── Table ─────────────────────────────────────────────────────────────────────

/// Live sessions of one connection, keyed by id.
pub struct SessionTable {
    sessions: DashMap<u64, Arc<RpcSession>>,
    next_id: AtomicU64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate an id and register a new session under it.
    pub fn open(&self, event: EventDescriptor, upstream: Arc<dyn PushStream>) -> Arc<RpcSession> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = RpcSession::new(id, event, upstream);
        self.sessions.insert(id, Arc::clone(&session));
        session
    }

    pub fn get(&self, id: u64) -> Option<Arc<RpcSession>> {
        self.sessions.get(&id).map(|s| Arc::clone(s.value()))
    }

    pub fn remove(&self, id: u64) -> Option<Arc<RpcSession>> {
        self.sessions.remove(&id).map(|(_, s)| s)
    }

    /// Route an inbound frame to its session. Sessions whose inbound side
    /// ended are dropped from the table. Returns false for unknown ids.
    pub fn dispatch(&self, frame: Frame) -> bool {
        let Some(session) = self.get(frame.session_id) else {
            tracing::trace!(session = frame.session_id, "frame for unknown session");
            return false;
        };
        if session.deliver(frame.event) {
            self.sessions.remove(&frame.session_id);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}
