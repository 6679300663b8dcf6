//! Transport contract: a bidirectional byte stream with lifecycle
//! tracking and backpressured writes.
//!
//! One transport == one peer connection. A transport owns the write half
//! of its stream and a spawned read pump that forwards incoming chunks
//! to the owner over a flume channel (split-pump design). `write`
//! resolves only once the OS has accepted the bytes, which is what lets
//! callers bound their memory.

use bytes::Bytes;
use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use flume::{Receiver, Sender};
use tracing::trace;

use crate::error::{Error, Result};

/// Read size for pump buffers.
pub(crate) const READ_CHUNK: usize = 8 * 1024;

/// Lifecycle of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl TransportState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }

    /// Legal state transitions.
    #[must_use]
    pub const fn can_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Disconnected, Self::Connecting)
                | (Self::Connecting, Self::Connected)
                | (Self::Connecting, Self::Error)
                | (Self::Connecting, Self::Disconnected)
                | (Self::Connected, Self::Disconnected)
                | (Self::Connected, Self::Error)
                | (Self::Error, Self::Disconnected)
        )
    }
}

/// Tracks the state machine and rejects illegal transitions.
#[derive(Debug)]
pub struct StateGate {
    state: TransportState,
}

impl StateGate {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: TransportState::Disconnected,
        }
    }

    #[must_use]
    pub const fn get(&self) -> TransportState {
        self.state
    }

    /// Move to `to`, failing on an illegal edge.
    pub fn advance(&mut self, to: TransportState) -> Result<()> {
        if self.state == to {
            return Ok(());
        }
        if !self.state.can_transition(to) {
            return Err(Error::transport(format!(
                "invalid transport transition {} -> {}",
                self.state.as_str(),
                to.as_str()
            )));
        }
        trace!(from = self.state.as_str(), to = to.as_str(), "transport transition");
        self.state = to;
        Ok(())
    }
}

impl Default for StateGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Events emitted by a transport's read pump.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Bytes arrived from the peer
    Data(Bytes),
    /// The peer closed the stream (EOF)
    Closed,
    /// The stream failed
    Error(String),
}

/// A connected, message-unaware byte transport.
///
/// Implementations: [`StdioTransport`], the Unix-socket transports in
/// [`crate::uds`], and the Windows named-pipe transports in
/// [`crate::pipe`].
pub trait Transport: 'static {
    /// Establish the stream and start the read pump.
    fn connect(&mut self) -> impl std::future::Future<Output = Result<()>>;

    /// Write all of `bytes`, respecting OS backpressure.
    fn write(&mut self, bytes: Bytes) -> impl std::future::Future<Output = Result<()>>;

    /// Release the stream. Idempotent; never flushes.
    fn close(&mut self) -> impl std::future::Future<Output = Result<()>>;

    /// Current lifecycle state.
    fn state(&self) -> TransportState;

    /// The read pump's event stream.
    fn events(&self) -> Receiver<TransportEvent>;
}

/// Drive `reader` until EOF or error, forwarding chunks to `tx`.
///
/// Returns a task handle; dropping it cancels the pump.
pub(crate) fn spawn_read_pump<R>(
    mut reader: R,
    tx: Sender<TransportEvent>,
) -> compio::runtime::Task<()>
where
    R: AsyncRead + 'static,
{
    compio::runtime::spawn(async move {
        use compio::io::AsyncReadExt;

        loop {
            let buf = Vec::with_capacity(READ_CHUNK);
            let BufResult(res, buf) = reader.read(buf).await;
            match res {
                Ok(0) => {
                    let _ = tx.send(TransportEvent::Closed);
                    break;
                }
                Ok(n) => {
                    trace!(bytes = n, "transport read");
                    let _ = tx.send(TransportEvent::Data(Bytes::from(buf)));
                }
                Err(e) => {
                    let _ = tx.send(TransportEvent::Error(e.to_string()));
                    break;
                }
            }
        }
    })
}

/// Write the whole buffer through any compio writer.
pub(crate) async fn write_all<W>(writer: &mut W, bytes: Bytes) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    // compio's ownership-passing API wants an owned buffer.
    let BufResult(res, _) = writer.write_all(bytes.to_vec()).await;
    res?;
    Ok(())
}

/// Transport over a pre-existing reader/writer pair.
///
/// Covers both sides of the stdio control channel: the manager wraps the
/// child's stdout/stdin pipes, the worker wraps its own process
/// stdin/stdout.
pub struct StdioTransport<R, W> {
    reader: Option<R>,
    writer: Option<W>,
    gate: StateGate,
    event_tx: Sender<TransportEvent>,
    event_rx: Receiver<TransportEvent>,
    pump: Option<compio::runtime::Task<()>>,
}

impl<R, W> StdioTransport<R, W>
where
    R: AsyncRead + 'static,
    W: AsyncWrite + Unpin + 'static,
{
    pub fn new(reader: R, writer: W) -> Self {
        let (event_tx, event_rx) = flume::unbounded();
        Self {
            reader: Some(reader),
            writer: Some(writer),
            gate: StateGate::new(),
            event_tx,
            event_rx,
            pump: None,
        }
    }
}

impl<R, W> Transport for StdioTransport<R, W>
where
    R: AsyncRead + 'static,
    W: AsyncWrite + Unpin + 'static,
{
    async fn connect(&mut self) -> Result<()> {
        self.gate.advance(TransportState::Connecting)?;
        let reader = self.reader.take().ok_or_else(|| {
            Error::transport("stdio transport already consumed its reader")
        })?;
        self.pump = Some(spawn_read_pump(reader, self.event_tx.clone()));
        self.gate.advance(TransportState::Connected)
    }

    async fn write(&mut self, bytes: Bytes) -> Result<()> {
        if self.gate.get() != TransportState::Connected {
            return Err(Error::transport("write on a transport that is not connected"));
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::transport("stdio transport writer is gone"))?;
        write_all(writer, bytes).await
    }

    async fn close(&mut self) -> Result<()> {
        if self.gate.get() == TransportState::Disconnected {
            return Ok(());
        }
        self.gate.advance(TransportState::Disconnected)?;
        self.pump.take();
        self.writer.take();
        let _ = self.event_tx.send(TransportEvent::Closed);
        Ok(())
    }

    fn state(&self) -> TransportState {
        self.gate.get()
    }

    fn events(&self) -> Receiver<TransportEvent> {
        self.event_rx.clone()
    }
}
