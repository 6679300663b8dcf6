//! Worker-side runtime.
//!
//! A [`Worker`] serves a registry of named handlers over the stdio
//! control channel, answers the framework's reserved methods
//! (handshake, heartbeat, shutdown), and optionally publishes a
//! socket-backed data channel when the manager offers one in the
//! handshake. `run` resolves with the exit code the binary should
//! return.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, warn};

use tether_core::codec::{default_registry, CodecRegistry};
use tether_core::error::{Error, Result};
use tether_core::framing::Framing;
use tether_core::transport::StdioTransport;
use tether_rpc::channel::{ChannelEvent, ChannelOptions, RequestChannel};
use tether_rpc::envelope::{codes, WireError};
use tether_rpc::handlers::{
    notification_handler, request_handler, HandlerRegistry, HandlerResult, RequestCtx,
};
use tether_rpc::reserved::{
    self, capabilities, DataChannelError, DataChannelReady, DataChannelSpec, HandshakeReply,
    HandshakeRequest, HeartbeatPing, HeartbeatPong, ShutdownAck, ShutdownComplete,
    ShutdownRequest, WorkerInfo, WorkerLoad, PROTOCOL_VERSION,
};

use crate::manager::DATA_CHANNEL_PATH_ENV;

const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Worker configuration.
#[derive(Clone)]
pub struct WorkerOptions {
    /// Name reported in the handshake.
    pub name: String,
    /// Runtime tag reported in the handshake.
    pub runtime_tag: String,
    /// Whether to publish a data channel when the manager offers one.
    pub serve_data_channel: bool,
    pub default_timeout: Duration,
    /// Codec registry used to resolve the negotiated serialization.
    pub registry: CodecRegistry,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            runtime_tag: "rust-compio".to_string(),
            serve_data_channel: true,
            default_timeout: Duration::from_secs(30),
            registry: default_registry(),
        }
    }
}

impl WorkerOptions {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

struct WorkerShared {
    data: Mutex<Option<Arc<RequestChannel>>>,
    closing: AtomicBool,
}

/// A worker process endpoint: handler registry plus serving loop.
pub struct Worker {
    options: WorkerOptions,
    registry: HandlerRegistry,
}

impl Worker {
    #[must_use]
    pub fn new(options: WorkerOptions) -> Self {
        Self {
            options,
            registry: HandlerRegistry::new(),
        }
    }

    /// Register a request handler. Reserved names are refused.
    pub fn on_request<F, Fut>(&self, method: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(RequestCtx) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.registry.on_request(method, request_handler(handler))
    }

    /// Register a notification handler. Reserved names are refused.
    pub fn on_notification<F, Fut>(&self, method: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(RequestCtx) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.registry
            .on_notification(method, notification_handler(handler))
    }

    /// Serve until the manager drives a shutdown or goes away.
    pub async fn run(self) -> Result<i32> {
        let options = self.options;
        let shared = Arc::new(WorkerShared {
            data: Mutex::new(None),
            closing: AtomicBool::new(false),
        });

        let json = options.registry.resolve("json")?;
        let control = RequestChannel::start(
            StdioTransport::new(compio::fs::stdin(), compio::fs::stdout()),
            Framing::line_delimited(),
            json,
            self.registry.clone(),
            ChannelOptions {
                default_timeout: options.default_timeout,
                label: format!("control:{}", options.name),
                ..ChannelOptions::default()
            },
        )
        .await?;
        let control = Arc::new(control);

        // Reserved responders. Registered before this task yields, so
        // nothing the manager sends can race them.
        let (data_spec_tx, data_spec_rx) = flume::bounded::<DataChannelSpec>(1);
        let (shutdown_tx, shutdown_rx) = flume::bounded::<ShutdownRequest>(1);
        register_reserved(
            &control,
            &shared,
            &options,
            &data_spec_tx,
            &shutdown_tx,
        );

        let control_events = control.events();
        let mut data_task = None;

        let shutdown_request = loop {
            futures::select! {
                spec = data_spec_rx.recv_async().fuse() => {
                    if let Ok(spec) = spec {
                        data_task = Some(compio::runtime::spawn(serve_data(
                            Arc::clone(&shared),
                            self.registry.clone(),
                            options.clone(),
                            Arc::downgrade(&control),
                            spec,
                        )));
                    }
                }
                request = shutdown_rx.recv_async().fuse() => {
                    if let Ok(request) = request {
                        break Some(request);
                    }
                }
                event = control_events.recv_async().fuse() => {
                    match event {
                        Ok(ChannelEvent::Down(reason)) => {
                            // Manager went away (stdin EOF); leave quietly.
                            debug!(reason = %reason, "control channel down, exiting");
                            break None;
                        }
                        Err(_) => break None,
                        Ok(ChannelEvent::Up) => {}
                    }
                }
            }
        };

        shared.closing.store(true, Ordering::SeqCst);
        let exit_code = 0i32;

        if let Some(request) = shutdown_request {
            // Drain: finish in-flight handlers within the offered
            // budget, then announce completion.
            let deadline = Instant::now() + Duration::from_millis(request.timeout_ms);
            while total_in_flight(&control, &shared) > 0 && Instant::now() < deadline {
                compio::time::sleep(DRAIN_POLL).await;
            }

            let data = shared.data.lock().take();
            if let Some(data) = data {
                data.close().await;
            }
            if let Ok(params) = reserved::encode(&ShutdownComplete { exit_code }) {
                let _ = control
                    .notify_reserved(reserved::SHUTDOWN_COMPLETE, params)
                    .await;
            }
        }

        drop(data_task);
        control.close().await;
        Ok(exit_code)
    }
}

/// Inbound handlers still running, across both channels.
fn total_in_flight(control: &Arc<RequestChannel>, shared: &Arc<WorkerShared>) -> usize {
    let data = shared
        .data
        .lock()
        .as_ref()
        .map_or(0, |channel| channel.in_flight());
    control.in_flight() + data
}

fn internal(err: Error) -> WireError {
    WireError::new(codes::INTERNAL_ERROR, err.to_string())
}

fn register_reserved(
    control: &Arc<RequestChannel>,
    shared: &Arc<WorkerShared>,
    options: &WorkerOptions,
    data_spec_tx: &flume::Sender<DataChannelSpec>,
    shutdown_tx: &flume::Sender<ShutdownRequest>,
) {
    let registry = control.registry();

    // __handshake__
    {
        let name = options.name.clone();
        let runtime_tag = options.runtime_tag.clone();
        let serve_data = options.serve_data_channel;
        let data_spec_tx = data_spec_tx.clone();
        registry.register_reserved_request(
            reserved::HANDSHAKE,
            request_handler(move |ctx: RequestCtx| {
                let name = name.clone();
                let runtime_tag = runtime_tag.clone();
                let data_spec_tx = data_spec_tx.clone();
                async move {
                    let request: HandshakeRequest =
                        reserved::decode(ctx.params).map_err(internal)?;
                    if request.version != PROTOCOL_VERSION {
                        return Err(WireError::new(
                            codes::INVALID_REQUEST,
                            format!(
                                "manager speaks protocol {:?}, worker speaks {PROTOCOL_VERSION:?}",
                                request.version
                            ),
                        ));
                    }

                    let mut caps = vec![capabilities::HEARTBEAT.to_string()];
                    let offered = request.data_channel.or_else(|| {
                        // Fall back to the well-known environment
                        // variable when the handshake omits the spec.
                        std::env::var(DATA_CHANNEL_PATH_ENV).ok().map(|path| {
                            DataChannelSpec {
                                path,
                                serialization: "json".to_string(),
                            }
                        })
                    });
                    if serve_data {
                        if let Some(spec) = offered {
                            caps.push(capabilities::DATA_CHANNEL.to_string());
                            let _ = data_spec_tx.try_send(spec);
                        }
                    }

                    let reply = HandshakeReply {
                        version: PROTOCOL_VERSION.to_string(),
                        capabilities: caps,
                        worker_info: WorkerInfo {
                            name,
                            runtime_tag,
                            pid: std::process::id(),
                        },
                    };
                    reserved::encode(&reply).map_err(internal)
                }
            }),
        );
    }

    // __heartbeat_ping__
    {
        let control = Arc::downgrade(control);
        let shared = Arc::clone(shared);
        registry.register_reserved_request(
            reserved::HEARTBEAT_PING,
            request_handler(move |ctx: RequestCtx| {
                let control = control.clone();
                let shared = Arc::clone(&shared);
                async move {
                    let ping: HeartbeatPing = reserved::decode(ctx.params).map_err(internal)?;
                    let pending = control.upgrade().map_or(0, |c| {
                        // Exclude this very handler from the count.
                        total_in_flight(&c, &shared).saturating_sub(1)
                    });
                    let pong = HeartbeatPong {
                        timestamp: ping.timestamp,
                        seq: ping.seq,
                        load: Some(WorkerLoad {
                            memory_mb: None,
                            pending_requests: pending,
                        }),
                    };
                    reserved::encode(&pong).map_err(internal)
                }
            }),
        );
    }

    // __shutdown__
    {
        let control = Arc::downgrade(control);
        let shared = Arc::clone(shared);
        let shutdown_tx = shutdown_tx.clone();
        registry.register_reserved_request(
            reserved::SHUTDOWN,
            request_handler(move |ctx: RequestCtx| {
                let control = control.clone();
                let shared = Arc::clone(&shared);
                let shutdown_tx = shutdown_tx.clone();
                async move {
                    let request: ShutdownRequest =
                        reserved::decode(ctx.params).map_err(internal)?;
                    debug!(reason = request.reason.as_str(), "shutdown requested");
                    let pending = control
                        .upgrade()
                        .map_or(0, |c| total_in_flight(&c, &shared).saturating_sub(1));
                    let _ = shutdown_tx.try_send(request);
                    reserved::encode(&ShutdownAck::new(pending)).map_err(internal)
                }
            }),
        );
    }
}

/// Serve the data channel: bind, announce readiness, accept the
/// manager, and re-listen after every disconnect until the worker
/// closes.
async fn serve_data(
    shared: Arc<WorkerShared>,
    registry: HandlerRegistry,
    options: WorkerOptions,
    control: Weak<RequestChannel>,
    spec: DataChannelSpec,
) {
    let codec = match options.registry.resolve(&spec.serialization) {
        Ok(codec) => codec,
        Err(err) => {
            report_data_error(&control, format!("unknown serialization: {err}")).await;
            return;
        }
    };

    let mut announced = false;
    loop {
        if shared.closing.load(Ordering::SeqCst) {
            break;
        }

        #[cfg(unix)]
        let server = tether_core::uds::UnixSocketServer::bind(&spec.path).await;
        #[cfg(windows)]
        let server = tether_core::pipe::NamedPipeListener::bind(spec.path.clone());

        let server = match server {
            Ok(server) => server,
            Err(err) => {
                report_data_error(&control, format!("bind {}: {err}", spec.path)).await;
                return;
            }
        };

        // The listener exists; only now is it safe to tell the manager
        // to connect. Reconnects dial the same path directly.
        if !announced {
            announced = true;
            let Some(channel) = control.upgrade() else { return };
            let ready = DataChannelReady {
                path: spec.path.clone(),
                serialization: spec.serialization.clone(),
            };
            match reserved::encode(&ready) {
                Ok(params) => {
                    if channel
                        .notify_reserved(reserved::DATA_CHANNEL_READY, params)
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(_) => return,
            }
        }

        let channel = match RequestChannel::start(
            server,
            Framing::length_prefixed(),
            Arc::clone(&codec),
            registry.clone(),
            ChannelOptions {
                default_timeout: options.default_timeout,
                label: format!("data:{}", options.name),
                ..ChannelOptions::default()
            },
        )
        .await
        {
            Ok(channel) => Arc::new(channel),
            Err(err) => {
                warn!(error = %err, "data channel accept failed");
                continue;
            }
        };
        *shared.data.lock() = Some(Arc::clone(&channel));

        // Park until the manager disconnects, then listen again.
        let events = channel.events();
        while let Ok(event) = events.recv_async().await {
            if matches!(event, ChannelEvent::Down(_)) {
                break;
            }
        }
        *shared.data.lock() = None;
    }
}

async fn report_data_error(control: &Weak<RequestChannel>, message: String) {
    warn!(message = %message, "data channel error");
    if let Some(channel) = control.upgrade() {
        if let Ok(params) = reserved::encode(&DataChannelError { message }) {
            let _ = channel
                .notify_reserved(reserved::DATA_CHANNEL_ERROR, params)
                .await;
        }
    }
}
