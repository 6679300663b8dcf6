//! Data-channel transport via Windows named pipes.
//!
//! Mirrors [`crate::uds`]: the worker creates `\\.\pipe\<ns>-<id>` and
//! waits for the manager to open it. Named pipe handles are full-duplex
//! but compio models them as single owners, so reads and writes share
//! the handle through the owning channel actor.

#![cfg(windows)]

use bytes::Bytes;
use compio::fs::named_pipe::{ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions};
use flume::{Receiver, Sender};
use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::{
    spawn_read_pump, write_all, StateGate, Transport, TransportEvent, TransportState,
};

/// Client side: opens a pipe path published by a worker.
pub struct NamedPipeTransport {
    path: String,
    gate: StateGate,
    writer: Option<NamedPipeClient>,
    pump: Option<compio::runtime::Task<()>>,
    event_tx: Sender<TransportEvent>,
    event_rx: Receiver<TransportEvent>,
}

impl NamedPipeTransport {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        let (event_tx, event_rx) = flume::unbounded();
        Self {
            path: path.into(),
            gate: StateGate::new(),
            writer: None,
            pump: None,
            event_tx,
            event_rx,
        }
    }
}

impl Transport for NamedPipeTransport {
    async fn connect(&mut self) -> Result<()> {
        self.gate.advance(TransportState::Connecting)?;
        let reader = ClientOptions::new()
            .open(&self.path)
            .map_err(|e| Error::transport(format!("open {}: {e}", self.path)))?;
        let writer = ClientOptions::new()
            .open(&self.path)
            .map_err(|e| Error::transport(format!("open {}: {e}", self.path)))?;
        debug!(path = %self.path, "data channel pipe opened");
        self.pump = Some(spawn_read_pump(reader, self.event_tx.clone()));
        self.writer = Some(writer);
        self.gate.advance(TransportState::Connected)
    }

    async fn write(&mut self, bytes: Bytes) -> Result<()> {
        if self.gate.get() != TransportState::Connected {
            return Err(Error::transport("write on a transport that is not connected"));
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::transport("pipe transport has no handle"))?;
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

/// Server side: creates the pipe and waits for one peer.
pub struct NamedPipeListener {
    path: String,
    gate: StateGate,
    reader: Option<NamedPipeServer>,
    writer: Option<NamedPipeServer>,
    pump: Option<compio::runtime::Task<()>>,
    event_tx: Sender<TransportEvent>,
    event_rx: Receiver<TransportEvent>,
}

impl NamedPipeListener {
    /// Create both pipe instances so the path exists before the peer is
    /// told to connect.
    pub fn bind(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let reader = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&path)
            .map_err(|e| Error::transport(format!("create {path}: {e}")))?;
        let writer = ServerOptions::new()
            .create(&path)
            .map_err(|e| Error::transport(format!("create {path}: {e}")))?;
        debug!(path = %path, "data channel pipe listening");

        let (event_tx, event_rx) = flume::unbounded();
        Ok(Self {
            path,
            gate: StateGate::new(),
            reader: Some(reader),
            writer: Some(writer),
            pump: None,
            event_tx,
            event_rx,
        })
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Transport for NamedPipeListener {
    async fn connect(&mut self) -> Result<()> {
        self.gate.advance(TransportState::Connecting)?;
        let reader = self
            .reader
            .take()
            .ok_or_else(|| Error::transport("pipe server is not listening"))?;
        reader
            .connect()
            .await
            .map_err(|e| Error::transport(format!("pipe connect: {e}")))?;
        if let Some(writer) = self.writer.as_ref() {
            writer
                .connect()
                .await
                .map_err(|e| Error::transport(format!("pipe connect: {e}")))?;
        }
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
            .ok_or_else(|| Error::transport("pipe server has no peer"))?;
        write_all(writer, bytes).await
    }

    async fn close(&mut self) -> Result<()> {
        if self.gate.get() == TransportState::Disconnected && self.writer.is_none() {
            return Ok(());
        }
        let _ = self.gate.advance(TransportState::Disconnected);
        self.pump.take();
        self.reader.take();
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
