//! The request channel: one transport, one framing, one codec, one
//! protocol style, plus the pending-request correlator and handler
//! dispatch.
//!
//! # Architecture
//!
//! A spawned channel actor owns the transport and the framer and is the
//! only task that writes to the stream. The public [`RequestChannel`]
//! talks to it over a flume command queue, which keeps writes in call
//! order without any locking around the stream. Inbound handler
//! invocations are spawned as their own tasks; their replies funnel
//! back through the same command queue.
//!
//! The pending table is shared between the handle (insert, cancel) and
//! the actor (resolve, expire); all mutation happens between await
//! points under a short-lived lock.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use futures::channel::oneshot;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use tether_core::cancel::CancelToken;
use tether_core::codec::Codec;
use tether_core::error::{Error, Result, TimeoutKind};
use tether_core::framing::Framing;
use tether_core::transport::{Transport, TransportEvent};
use tether_core::value::Value;

use crate::envelope::{codes, Envelope, WireError, WireStyle};
use crate::handlers::{HandlerRegistry, HandlerResult, RequestCtx};
use crate::pending::{deadline_after, Pending, PendingTable};
use crate::reserved::is_reserved;

/// Fallback actor wake interval when no deadline is pending.
const IDLE_TICK: Duration = Duration::from_secs(60);

/// Channel construction options.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Deadline applied when `request` is called without an override.
    pub default_timeout: Duration,
    /// Envelope layout written to the wire.
    pub style: WireStyle,
    /// Diagnostic label, e.g. `"control:worker-1"`.
    pub label: String,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            style: WireStyle::default(),
            label: "channel".to_string(),
        }
    }
}

/// Per-call overrides for [`RequestChannel::request_with`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    /// Caller-side cancellation; rejects the pending entry locally.
    pub cancel: Option<CancelToken>,
}

/// Lifecycle events observable via [`RequestChannel::events`].
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The channel is connected and serving.
    Up,
    /// The channel closed; pendings were rejected with this error.
    Down(Error),
}

enum Cmd {
    Request {
        id: u64,
        method: String,
        params: Value,
    },
    Notify {
        method: String,
        params: Value,
        ack: oneshot::Sender<Result<()>>,
    },
    Reply {
        id: u64,
        result: HandlerResult,
    },
    Close {
        ack: oneshot::Sender<()>,
    },
}

struct ChannelShared {
    pending: Mutex<PendingTable>,
    registry: HandlerRegistry,
    closed: AtomicBool,
    /// Live inbound request handlers, reported in heartbeat load and
    /// the shutdown ack.
    in_flight: AtomicUsize,
    /// Fires when the channel closes; handed to every handler ctx.
    close_token: CancelToken,
}

/// A message channel with request/response correlation.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct RequestChannel {
    cmd_tx: flume::Sender<Cmd>,
    shared: Arc<ChannelShared>,
    event_rx: flume::Receiver<ChannelEvent>,
    default_timeout: Duration,
    label: String,
    _actor: compio::runtime::Task<()>,
}

impl RequestChannel {
    /// Connect the transport and start the channel actor.
    pub async fn start<T: Transport>(
        mut transport: T,
        framing: Framing,
        codec: Arc<dyn Codec>,
        registry: HandlerRegistry,
        options: ChannelOptions,
    ) -> Result<Self> {
        transport.connect().await?;

        let (cmd_tx, cmd_rx) = flume::unbounded();
        let (event_tx, event_rx) = flume::unbounded();
        let shared = Arc::new(ChannelShared {
            pending: Mutex::new(PendingTable::new()),
            registry,
            closed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            close_token: CancelToken::new(),
        });

        let _ = event_tx.send(ChannelEvent::Up);
        let actor = ChannelActor {
            transport_events: transport.events(),
            transport,
            framing,
            codec,
            style: options.style,
            shared: Arc::clone(&shared),
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            event_tx,
            label: options.label.clone(),
        };
        let handle = compio::runtime::spawn(actor.run());

        Ok(Self {
            cmd_tx,
            shared,
            event_rx,
            default_timeout: options.default_timeout,
            label: options.label,
            _actor: handle,
        })
    }

    /// Issue a request with the default timeout.
    pub async fn request(&self, method: impl Into<String>, params: Value) -> Result<Value> {
        self.request_with(method, params, RequestOptions::default())
            .await
    }

    /// Issue a request with per-call options.
    ///
    /// Reserved method names are refused; framework components use
    /// [`RequestChannel::request_reserved`].
    pub async fn request_with(
        &self,
        method: impl Into<String>,
        params: Value,
        options: RequestOptions,
    ) -> Result<Value> {
        let method = method.into();
        if is_reserved(&method) {
            return Err(Error::protocol(
                codes::INVALID_REQUEST,
                format!("method {method:?} is reserved for the framework"),
            ));
        }
        self.request_inner(method, params, options).await
    }

    /// Framework entry point that may carry reserved methods.
    pub async fn request_reserved(
        &self,
        method: &str,
        params: Value,
        options: RequestOptions,
    ) -> Result<Value> {
        self.request_inner(method.to_string(), params, options).await
    }

    async fn request_inner(
        &self,
        method: String,
        params: Value,
        options: RequestOptions,
    ) -> Result<Value> {
        if self.is_closed() {
            return Err(Error::closed(format!("{} is closed", self.label)));
        }

        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut pending = self.shared.pending.lock();
            let id = pending.assign_id();
            pending.insert(Pending {
                id,
                method: method.clone(),
                deadline: deadline_after(timeout),
                timeout,
                resolver: tx,
                cancel: options.cancel.clone(),
            });
            id
        };
        trace!(channel = %self.label, id, method = %method, "request");

        if self
            .cmd_tx
            .send(Cmd::Request { id, method, params })
            .is_err()
        {
            self.shared.pending.lock().remove(id);
            return Err(Error::closed(format!("{} is closed", self.label)));
        }

        match options.cancel {
            None => rx
                .await
                .unwrap_or_else(|_| Err(Error::closed(format!("{} went away", self.label)))),
            Some(token) => {
                let cancelled = token.cancelled().fuse();
                futures::pin_mut!(cancelled);
                let mut rx = rx.fuse();
                futures::select! {
                    res = rx => res.unwrap_or_else(|_| {
                        Err(Error::closed(format!("{} went away", self.label)))
                    }),
                    _ = cancelled => {
                        self.shared.pending.lock().remove(id);
                        Err(Error::Cancelled)
                    }
                }
            }
        }
    }

    /// Send a notification; resolves once the bytes are accepted.
    pub async fn notify(&self, method: impl Into<String>, params: Value) -> Result<()> {
        let method = method.into();
        if is_reserved(&method) {
            return Err(Error::protocol(
                codes::INVALID_REQUEST,
                format!("method {method:?} is reserved for the framework"),
            ));
        }
        self.notify_inner(method, params).await
    }

    /// Framework entry point that may carry reserved methods.
    pub async fn notify_reserved(&self, method: &str, params: Value) -> Result<()> {
        self.notify_inner(method.to_string(), params).await
    }

    async fn notify_inner(&self, method: String, params: Value) -> Result<()> {
        if self.is_closed() {
            return Err(Error::closed(format!("{} is closed", self.label)));
        }
        let (ack, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Notify { method, params, ack })
            .map_err(|_| Error::closed(format!("{} is closed", self.label)))?;
        ack_rx
            .await
            .unwrap_or_else(|_| Err(Error::closed(format!("{} went away", self.label))))
    }

    /// Register a user request handler.
    pub fn on_request(
        &self,
        method: impl Into<String>,
        handler: crate::handlers::RequestHandler,
    ) -> Result<()> {
        self.shared.registry.on_request(method, handler)
    }

    /// Register a user notification handler.
    pub fn on_notification(
        &self,
        method: impl Into<String>,
        handler: crate::handlers::NotificationHandler,
    ) -> Result<()> {
        self.shared.registry.on_notification(method, handler)
    }

    /// The channel's handler registry (for framework responders).
    #[must_use]
    pub fn registry(&self) -> &HandlerRegistry {
        &self.shared.registry
    }

    /// Lifecycle event stream.
    #[must_use]
    pub fn events(&self) -> flume::Receiver<ChannelEvent> {
        self.event_rx.clone()
    }

    /// Live inbound handler invocations.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Outbound requests still awaiting responses.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.lock().len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Close the channel: rejects pendings, releases the transport.
    /// Idempotent.
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }
        let (ack, ack_rx) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Close { ack }).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

struct ChannelActor<T: Transport> {
    transport: T,
    transport_events: flume::Receiver<TransportEvent>,
    framing: Framing,
    codec: Arc<dyn Codec>,
    style: WireStyle,
    shared: Arc<ChannelShared>,
    cmd_rx: flume::Receiver<Cmd>,
    cmd_tx: flume::Sender<Cmd>,
    event_tx: flume::Sender<ChannelEvent>,
    label: String,
}

impl<T: Transport> ChannelActor<T> {
    async fn run(mut self) {
        // Locals so the select! borrows do not pin down `self`.
        let transport_events = self.transport_events.clone();
        let cmd_rx = self.cmd_rx.clone();

        let reason = loop {
            let tick = {
                let pending = self.shared.pending.lock();
                pending
                    .next_deadline()
                    .map_or(IDLE_TICK, |deadline| {
                        deadline.saturating_duration_since(Instant::now())
                    })
            };

            futures::select! {
                event = transport_events.recv_async().fuse() => match event {
                    Ok(TransportEvent::Data(bytes)) => {
                        if let Err(err) = self.on_data(bytes).await {
                            if err.is_fatal_to_channel() {
                                break err;
                            }
                            warn!(channel = %self.label, error = %err, "inbound dispatch error");
                        }
                    }
                    Ok(TransportEvent::Closed) | Err(_) => {
                        break Error::closed(format!("{} transport closed", self.label));
                    }
                    Ok(TransportEvent::Error(message)) => {
                        break Error::transport(message);
                    }
                },
                cmd = cmd_rx.recv_async().fuse() => match cmd {
                    Ok(Cmd::Request { id, method, params }) => {
                        if let Some(fatal) = self.on_outbound_request(id, method, params).await {
                            break fatal;
                        }
                    }
                    Ok(Cmd::Notify { method, params, ack }) => {
                        let res = self
                            .write_envelope(&Envelope::Notification { method, params })
                            .await;
                        let fatal = res
                            .as_ref()
                            .err()
                            .filter(|e| e.is_fatal_to_channel())
                            .cloned();
                        let _ = ack.send(res);
                        if let Some(err) = fatal {
                            break err;
                        }
                    }
                    Ok(Cmd::Reply { id, result }) => {
                        if let Some(fatal) = self.on_reply(id, result).await {
                            break fatal;
                        }
                    }
                    Ok(Cmd::Close { ack }) => {
                        self.teardown(Error::closed(format!("{} closed", self.label)))
                            .await;
                        let _ = ack.send(());
                        return;
                    }
                    Err(_) => {
                        break Error::closed(format!("{} handle dropped", self.label));
                    }
                },
                _ = compio::time::sleep(tick).fuse() => {
                    self.expire_pendings();
                }
            }
        };

        self.teardown(reason).await;
    }

    /// Expire overdue pendings; each resolver gets a timeout error.
    fn expire_pendings(&self) {
        let expired = self.shared.pending.lock().take_expired(Instant::now());
        for entry in expired {
            debug!(
                channel = %self.label,
                id = entry.id,
                method = %entry.method,
                "request timed out"
            );
            let _ = entry
                .resolver
                .send(Err(Error::Timeout(TimeoutKind::Request, entry.timeout)));
        }
    }

    async fn on_outbound_request(
        &mut self,
        id: u64,
        method: String,
        params: Value,
    ) -> Option<Error> {
        let envelope = Envelope::Request { id, method, params };
        match self.write_envelope(&envelope).await {
            Ok(()) => None,
            Err(err) => {
                // Resolve this request with the write error; a framing,
                // serialization, or transport failure additionally
                // poisons the stream and closes the channel.
                if let Some(entry) = self.shared.pending.lock().remove(id) {
                    let _ = entry.resolver.send(Err(err.clone()));
                }
                err.is_fatal_to_channel().then_some(err)
            }
        }
    }

    async fn on_reply(&mut self, id: u64, result: HandlerResult) -> Option<Error> {
        let envelope = Envelope::Response { id, result };
        match self.write_envelope(&envelope).await {
            Ok(()) => None,
            Err(err) => {
                // A reply that cannot be written means the stream can no
                // longer be trusted; the peer learns of it through its
                // own channel-closed rejection.
                warn!(channel = %self.label, id, error = %err, "reply write failed");
                err.is_fatal_to_channel().then_some(err)
            }
        }
    }

    async fn write_envelope(&mut self, envelope: &Envelope) -> Result<()> {
        let value = envelope.to_value(self.style);
        let payload = self.codec.serialize(&value)?;
        let mut wire = BytesMut::new();
        self.framing.encode(&payload, &mut wire)?;
        self.transport.write(wire.freeze()).await
    }

    async fn on_data(&mut self, bytes: bytes::Bytes) -> Result<()> {
        let frames = self.framing.push(bytes)?;
        for frame in frames {
            let value = self.codec.deserialize(&frame)?;
            match Envelope::from_value(value) {
                Ok(envelope) => self.dispatch(envelope).await?,
                Err(err) => {
                    // Malformed envelope: nothing to correlate it with,
                    // so log and keep the channel alive.
                    warn!(channel = %self.label, error = %err, "malformed envelope");
                }
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, envelope: Envelope) -> Result<()> {
        match envelope {
            Envelope::Response { id, result } => {
                match self.shared.pending.lock().remove(id) {
                    Some(entry) => {
                        let _ = entry
                            .resolver
                            .send(result.map_err(Error::from));
                    }
                    None => {
                        // Likely a response that lost the race against
                        // its own timeout; drop it silently.
                        trace!(channel = %self.label, id, "response without pending");
                    }
                }
                Ok(())
            }
            Envelope::Request { id, method, params } => {
                match self.shared.registry.request_handler_for(&method) {
                    Some(handler) => {
                        let ctx = RequestCtx {
                            method,
                            params,
                            cancel: self.shared.close_token.clone(),
                        };
                        let shared = Arc::clone(&self.shared);
                        let reply_tx = self.cmd_tx.clone();
                        shared.in_flight.fetch_add(1, Ordering::SeqCst);
                        compio::runtime::spawn(async move {
                            let result = handler(ctx).await;
                            shared.in_flight.fetch_sub(1, Ordering::SeqCst);
                            let _ = reply_tx.send(Cmd::Reply { id, result });
                        })
                        .detach();
                        Ok(())
                    }
                    None => {
                        if is_reserved(&method) {
                            warn!(channel = %self.label, method = %method, "unknown reserved method");
                        } else {
                            debug!(channel = %self.label, method = %method, "method not found");
                        }
                        let reply = Envelope::Response {
                            id,
                            result: Err(WireError::new(
                                codes::METHOD_NOT_FOUND,
                                format!("method {method:?} not found"),
                            )),
                        };
                        self.write_envelope(&reply).await
                    }
                }
            }
            Envelope::Notification { method, params } => {
                match self.shared.registry.notification_handler_for(&method) {
                    Some(handler) => {
                        let ctx = RequestCtx {
                            method,
                            params,
                            cancel: self.shared.close_token.clone(),
                        };
                        compio::runtime::spawn(handler(ctx)).detach();
                    }
                    None => {
                        debug!(channel = %self.label, method = %method, "unhandled notification");
                    }
                }
                Ok(())
            }
        }
    }

    /// Reject every pending, cancel handlers, release the transport.
    async fn teardown(&mut self, reason: Error) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.close_token.cancel();

        let pendings = self.shared.pending.lock().take_all();
        let reject_with = match &reason {
            err if err.is_fatal_to_channel() => reason.clone(),
            Error::ChannelClosed(_) => reason.clone(),
            other => Error::closed(other.to_string()),
        };
        for entry in pendings {
            let _ = entry.resolver.send(Err(reject_with.clone()));
        }

        let _ = self.transport.close().await;
        debug!(channel = %self.label, reason = %reason, "channel down");
        let _ = self.event_tx.send(ChannelEvent::Down(reason));
    }
}
