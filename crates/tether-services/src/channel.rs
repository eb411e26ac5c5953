//! Buffered write channel: ordered delivery of opaque messages over one
//! byte-stream connection.
//!
//! While the channel is idle a write is first attempted inline with a
//! non-blocking `try_write`. Whatever the socket does not take is queued,
//! and a single flush task drains the queue with vectored writes until it
//! is empty. Every message carries a completion that fires exactly once,
//! in submission order, and never inside the `write` call that queued it.
//!
//! The flush task owns an `Arc` of the channel state for exactly as long as
//! it runs, so dropping every `BufferedWriteChannel` handle mid-flight still
//! delivers every completion. `shutdown` aborts the task instead; queued
//! completions are then dropped without firing.

use std::collections::VecDeque;
use std::future::Future;
use std::io::{self, IoSlice};
use std::sync::Arc;

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Upper bound on buffers gathered into one vectored write.
const MAX_IOVECS: usize = 64;

/// Per-message completion handler.
pub type Completion = Box<dyn FnOnce(Result<(), TransportError>) + Send + 'static>;

// ── Seams ─────────────────────────────────────────────────────────────────────

/// Anything a session can push encoded messages into.
pub trait Transport: Send + Sync {
    /// Queue `message`; `on_complete` fires once the bytes are on the wire or
    /// the transport has failed.
    fn write(&self, message: Bytes, on_complete: Completion);

    /// Bytes accepted but not yet written.
    fn pressure(&self) -> usize;

    /// True once the transport can no longer deliver anything.
    fn is_faulted(&self) -> bool {
        false
    }
}

/// The non-blocking half of a connected byte stream.
pub trait ByteStream: Send + Sync + 'static {
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;

    fn try_write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;

    /// Resolves when the stream may accept more bytes.
    fn writable(&self) -> impl Future<Output = io::Result<()>> + Send + '_;
}

macro_rules! impl_byte_stream {
    ($ty:ty) => {
        impl ByteStream for $ty {
            fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
                <$ty>::try_write(self, buf)
            }

            fn try_write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
                <$ty>::try_write_vectored(self, bufs)
            }

            fn writable(&self) -> impl Future<Output = io::Result<()>> + Send + '_ {
                <$ty>::writable(self)
            }
        }
    };
}

impl_byte_stream!(tokio::net::TcpStream);
impl_byte_stream!(tokio::net::tcp::OwnedWriteHalf);
#[cfg(unix)]
impl_byte_stream!(tokio::net::UnixStream);

impl<T: ByteStream> ByteStream for Arc<T> {
    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        (**self).try_write(buf)
    }

    fn try_write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        (**self).try_write_vectored(bufs)
    }

    fn writable(&self) -> impl Future<Output = io::Result<()>> + Send + '_ {
        (**self).writable()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The connection failed. Terminal for this channel instance.
    #[error("transport fault ({kind:?}): {message}")]
    Fault { kind: io::ErrorKind, message: String },

    /// The channel was shut down locally.
    #[error("transport shut down")]
    Cancelled,
}

impl From<&io::Error> for TransportError {
    fn from(e: &io::Error) -> Self {
        TransportError::Fault {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

// ── State ─────────────────────────────────────────────────────────────────────

enum ChannelState {
    Idle,
    /// A flush task is running; the handle cancels it.
    Flushing(AbortHandle),
    /// Terminal. Holds the error every later write completes with.
    Faulted(TransportError),
}

struct PendingWrite {
    /// Unwritten tail of the message.
    remaining: Bytes,
    on_complete: Completion,
}

struct WriteQueue {
    state: ChannelState,
    /// Head is the message currently on the wire.
    pending: VecDeque<PendingWrite>,
}

type Posted = (Completion, Result<(), TransportError>);

struct Shared<S> {
    stream: S,
    queue: Mutex<WriteQueue>,
    /// Feeds the dispatcher task. Posting happens under the queue lock, so
    /// dispatch order is submission order.
    completions: mpsc::UnboundedSender<Posted>,
}

impl<S: ByteStream> Shared<S> {
    fn post(&self, on_complete: Completion, result: Result<(), TransportError>) {
        if self.completions.send((on_complete, result)).is_err() {
            tracing::debug!("completion dispatcher gone, dropping completion");
        }
    }

    /// Account for `written` bytes. Returns true if more remains to flush.
    fn consume(&self, mut written: usize) -> bool {
        let mut queue = self.queue.lock();
        if !matches!(queue.state, ChannelState::Flushing(_)) {
            return false;
        }

        while let Some(front) = queue.pending.front_mut() {
            if front.remaining.len() > written {
                front.remaining.advance(written);
                break;
            }
            written -= front.remaining.len();
            if let Some(done) = queue.pending.pop_front() {
                self.post(done.on_complete, Ok(()));
            }
        }

        if queue.pending.is_empty() {
            queue.state = ChannelState::Idle;
            false
        } else {
            true
        }
    }

    /// Fail every queued message with `error`, oldest first.
    fn fail(&self, error: &io::Error) {
        let fault = TransportError::from(error);
        let mut queue = self.queue.lock();
        if !matches!(queue.state, ChannelState::Flushing(_)) {
            return;
        }

        tracing::warn!(error = %error, pending = queue.pending.len(), "write channel faulted");

        for write in queue.pending.drain(..) {
            self.post(write.on_complete, Err(fault.clone()));
        }
        queue.state = ChannelState::Faulted(fault);
    }

    /// Snapshot of the buffers to hand to the next vectored write.
    fn head_buffers(&self) -> Vec<Bytes> {
        self.queue
            .lock()
            .pending
            .iter()
            .take(MAX_IOVECS)
            .map(|w| w.remaining.clone())
            .collect()
    }
}

async fn flush_loop<S: ByteStream>(shared: Arc<Shared<S>>) {
    loop {
        if let Err(e) = shared.stream.writable().await {
            shared.fail(&e);
            return;
        }

        // Only this task removes or trims queued buffers, so the snapshot
        // stays valid until `consume` runs.
        let buffers = shared.head_buffers();
        let total: usize = buffers.iter().map(Bytes::len).sum();
        let slices: Vec<IoSlice<'_>> = buffers.iter().map(|b| IoSlice::new(b)).collect();

        match shared.stream.try_write_vectored(&slices) {
            Ok(0) if total > 0 => {
                shared.fail(&io::Error::from(io::ErrorKind::WriteZero));
                return;
            }
            Ok(n) => {
                tracing::trace!(bytes = n, "flushed");
                if !shared.consume(n) {
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                shared.fail(&e);
                return;
            }
        }
    }
}

// ── Channel ───────────────────────────────────────────────────────────────────

/// Ordered, backpressure-aware writer over one connection.
///
/// Cheap to clone; clones share one queue. Must be created inside a tokio
/// runtime.
pub struct BufferedWriteChannel<S: ByteStream> {
    shared: Arc<Shared<S>>,
}

impl<S: ByteStream> Clone for BufferedWriteChannel<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: ByteStream> BufferedWriteChannel<S> {
    pub fn new(stream: S) -> Self {
        let (completions, mut posted) = mpsc::unbounded_channel::<Posted>();

        // Exits once the channel state, and with it the sender, is gone.
        tokio::spawn(async move {
            while let Some((on_complete, result)) = posted.recv().await {
                on_complete(result);
            }
        });

        Self {
            shared: Arc::new(Shared {
                stream,
                queue: Mutex::new(WriteQueue {
                    state: ChannelState::Idle,
                    pending: VecDeque::new(),
                }),
                completions,
            }),
        }
    }

    /// Queue `message` behind everything written before it.
    pub fn write(&self, mut message: Bytes, on_complete: Completion) {
        let shared = &self.shared;
        let mut queue = shared.queue.lock();

        if let ChannelState::Faulted(fault) = &queue.state {
            let fault = fault.clone();
            shared.post(on_complete, Err(fault));
            return;
        }

        if matches!(queue.state, ChannelState::Flushing(_)) {
            queue.pending.push_back(PendingWrite {
                remaining: message,
                on_complete,
            });
            return;
        }

        // Nothing pending: try to get some bytes out right away. A hard error
        // here is left for the flush task to report through the completion.
        let written = match shared.stream.try_write(&message) {
            Ok(n) => n,
            Err(e) => {
                if e.kind() != io::ErrorKind::WouldBlock {
                    tracing::debug!(error = %e, "inline write failed");
                }
                0
            }
        };

        if written == message.len() {
            shared.post(on_complete, Ok(()));
            return;
        }

        message.advance(written);
        queue.pending.push_back(PendingWrite {
            remaining: message,
            on_complete,
        });

        let task = tokio::spawn(flush_loop(Arc::clone(shared)));
        queue.state = ChannelState::Flushing(task.abort_handle());
    }

    /// Total bytes queued, including the unsent part of the head message.
    pub fn pressure(&self) -> usize {
        self.shared
            .queue
            .lock()
            .pending
            .iter()
            .map(|w| w.remaining.len())
            .sum()
    }

    /// True once the channel has failed or been shut down.
    pub fn is_faulted(&self) -> bool {
        matches!(self.shared.queue.lock().state, ChannelState::Faulted(_))
    }

    /// Stop flushing. Queued completions are dropped without firing and
    /// later writes complete with `TransportError::Cancelled`.
    pub fn shutdown(&self) {
        let mut queue = self.shared.queue.lock();
        match &queue.state {
            ChannelState::Faulted(_) => return,
            ChannelState::Flushing(task) => task.abort(),
            ChannelState::Idle => {}
        }

        let dropped = queue.pending.len();
        queue.pending.clear();
        queue.state = ChannelState::Faulted(TransportError::Cancelled);
        tracing::debug!(dropped, "write channel shut down");
    }
}

impl<S: ByteStream> Transport for BufferedWriteChannel<S> {
    fn write(&self, message: Bytes, on_complete: Completion) {
        BufferedWriteChannel::write(self, message, on_complete)
    }

    fn pressure(&self) -> usize {
        BufferedWriteChannel::pressure(self)
    }

    fn is_faulted(&self) -> bool {
        BufferedWriteChannel::is_faulted(self)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
