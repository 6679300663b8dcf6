//! Data-channel transport via Unix domain sockets.
//!
//! The worker binds a filesystem socket and waits for the manager to
//! connect; the manager dials it once the worker has signalled that the
//! listener exists. Both ends split the accepted stream into
//! independently-owned read and write halves so the read pump and the
//! writer never contend.

#![cfg(unix)]

use std::path::{Path, PathBuf};

use bytes::Bytes;
use compio::net::{UnixListener, UnixStream};
use flume::{Receiver, Sender};
use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::{
    spawn_read_pump, write_all, StateGate, Transport, TransportEvent, TransportState,
};

/// Duplicate a connected stream into independently-owned halves.
///
/// The only unsafe in this crate: a `dup(2)` of the socket fd, wrapped
/// back into a compio stream. Both halves refer to the same socket; the
/// caller designates one for reads and one for writes.
mod split {
    #![allow(unsafe_code)]

    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd};

    use compio::net::UnixStream;

    pub fn split_stream(stream: UnixStream) -> io::Result<(UnixStream, UnixStream)> {
        let fd = stream.as_raw_fd();
        // SAFETY: `fd` is a valid open socket owned by `stream`; dup
        // yields a fresh descriptor we immediately hand to a new owner.
        let dup = unsafe { libc::dup(fd) };
        if dup < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `dup` is open, owned by nobody else, and refers to a
        // Unix stream socket.
        let second = unsafe { UnixStream::from_raw_fd(dup) };
        Ok((stream, second))
    }
}

pub(crate) use split::split_stream;

/// Shared plumbing for a split, pumped Unix stream.
struct StreamHalves {
    writer: UnixStream,
    _pump: compio::runtime::Task<()>,
}

fn start_halves(
    stream: UnixStream,
    event_tx: Sender<TransportEvent>,
) -> Result<StreamHalves> {
    let (reader, writer) = split_stream(stream)?;
    Ok(StreamHalves {
        writer,
        _pump: spawn_read_pump(reader, event_tx),
    })
}

/// Client side: connects to a socket path published by a worker.
pub struct UnixSocketTransport {
    path: PathBuf,
    gate: StateGate,
    halves: Option<StreamHalves>,
    event_tx: Sender<TransportEvent>,
    event_rx: Receiver<TransportEvent>,
}

impl UnixSocketTransport {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (event_tx, event_rx) = flume::unbounded();
        Self {
            path: path.into(),
            gate: StateGate::new(),
            halves: None,
            event_tx,
            event_rx,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Transport for UnixSocketTransport {
    async fn connect(&mut self) -> Result<()> {
        self.gate.advance(TransportState::Connecting)?;
        let stream = match UnixStream::connect(&self.path).await {
            Ok(stream) => stream,
            Err(e) => {
                self.gate.advance(TransportState::Error)?;
                self.gate.advance(TransportState::Disconnected)?;
                return Err(Error::transport(format!(
                    "connect to {} failed: {e}",
                    self.path.display()
                )));
            }
        };
        debug!(path = %self.path.display(), "data channel connected");
        self.halves = Some(start_halves(stream, self.event_tx.clone())?);
        self.gate.advance(TransportState::Connected)
    }

    async fn write(&mut self, bytes: Bytes) -> Result<()> {
        if self.gate.get() != TransportState::Connected {
            return Err(Error::transport("write on a transport that is not connected"));
        }
        let halves = self
            .halves
            .as_mut()
            .ok_or_else(|| Error::transport("socket transport has no stream"))?;
        write_all(&mut halves.writer, bytes).await
    }

    async fn close(&mut self) -> Result<()> {
        if self.gate.get() == TransportState::Disconnected {
            return Ok(());
        }
        self.gate.advance(TransportState::Disconnected)?;
        self.halves.take();
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

/// Server side: binds the socket path, accepts exactly one peer.
///
/// The socket file is unlinked again when the server closes.
pub struct UnixSocketServer {
    path: PathBuf,
    listener: Option<UnixListener>,
    gate: StateGate,
    halves: Option<StreamHalves>,
    event_tx: Sender<TransportEvent>,
    event_rx: Receiver<TransportEvent>,
}

impl UnixSocketServer {
    /// Bind the listener so the path exists before the peer is told to
    /// connect.
    pub async fn bind(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        // A previous run may have left its socket file behind.
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| Error::transport(format!("unlink stale socket: {e}")))?;
        }
        let listener = UnixListener::bind(&path)
            .await
            .map_err(|e| Error::transport(format!("bind {}: {e}", path.display())))?;
        debug!(path = %path.display(), "data channel listening");

        let (event_tx, event_rx) = flume::unbounded();
        Ok(Self {
            path,
            listener: Some(listener),
            gate: StateGate::new(),
            halves: None,
            event_tx,
            event_rx,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Transport for UnixSocketServer {
    async fn connect(&mut self) -> Result<()> {
        self.gate.advance(TransportState::Connecting)?;
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| Error::transport("socket server is not listening"))?;
        let (stream, _addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                self.gate.advance(TransportState::Error)?;
                self.gate.advance(TransportState::Disconnected)?;
                return Err(Error::transport(format!("accept failed: {e}")));
            }
        };
        debug!(path = %self.path.display(), "data channel peer accepted");
        self.halves = Some(start_halves(stream, self.event_tx.clone())?);
        self.gate.advance(TransportState::Connected)
    }

    async fn write(&mut self, bytes: Bytes) -> Result<()> {
        if self.gate.get() != TransportState::Connected {
            return Err(Error::transport("write on a transport that is not connected"));
        }
        let halves = self
            .halves
            .as_mut()
            .ok_or_else(|| Error::transport("socket server has no peer"))?;
        write_all(&mut halves.writer, bytes).await
    }

    async fn close(&mut self) -> Result<()> {
        if self.gate.get() == TransportState::Disconnected && self.listener.is_none() {
            return Ok(());
        }
        let _ = self.gate.advance(TransportState::Disconnected);
        self.halves.take();
        self.listener.take();
        let _ = std::fs::remove_file(&self.path);
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

#[cfg(test)]
mod tests {
    use super::*;
    use compio::io::{AsyncReadExt, AsyncWriteExt};

    #[compio::test]
    async fn split_halves_share_the_socket() {
        let path = std::env::temp_dir().join("tether-split-test.sock");
        let _ = std::fs::remove_file(&path);

        let listener = UnixListener::bind(&path).await.unwrap();
        let accept = compio::runtime::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            stream
        });

        let client = UnixStream::connect(&path).await.unwrap();
        let mut server = accept.await;

        let (_reader, mut writer) = split_stream(client).unwrap();
        let compio::buf::BufResult(res, _) = writer.write_all(b"ping".to_vec()).await;
        res.unwrap();

        let buf = vec![0u8; 4];
        let compio::buf::BufResult(res, buf) = server.read_exact(buf).await;
        res.unwrap();
        assert_eq!(&buf, b"ping");

        let _ = std::fs::remove_file(&path);
    }
}
