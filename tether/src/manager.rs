//! The process manager: spawn, handshake, heartbeat, restart, exits.
//!
//! One supervisor task per logical worker owns the spawn → run → exit →
//! respawn cycle. The OS child is held by a small exit-watcher task so
//! the supervisor can select over "process exited" and "heartbeat
//! budget exhausted" without contending for the `Child`.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use futures::FutureExt;
use tracing::{debug, warn};

use tether_core::error::{Error, Result, SupervisorKind};
use tether_core::framing::Framing;
use tether_core::socket_path;
use tether_core::transport::StdioTransport;
use tether_rpc::channel::{ChannelOptions, RequestChannel, RequestOptions};
use tether_rpc::handlers::{notification_handler, HandlerRegistry, RequestCtx};
use tether_rpc::reserved::{
    self, capabilities, DataChannelReady, DataChannelSpec, HandshakeReply, HandshakeRequest,
    HeartbeatPing, ShutdownComplete, ShutdownReason, PROTOCOL_VERSION,
};

use crate::config::{HeartbeatOptions, ManagerConfig, RestartPolicy, SpawnOptions};
use crate::events::{ExitInfo, ManagerEvent, ManagerMonitor};
use crate::handle::{HandleState, ProcessHandle};
use crate::reconnect::ReconnectManager;
use crate::shutdown::ShutdownOutcome;

/// Environment variable naming the data-channel endpoint for a worker.
pub const DATA_CHANNEL_PATH_ENV: &str = "TETHER_DATA_CHANNEL_PATH";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DATA_READY_TIMEOUT: Duration = Duration::from_secs(10);
const ORPHAN_REAP_TIMEOUT: Duration = Duration::from_secs(10);

struct ManagerInner {
    config: ManagerConfig,
    handles: DashMap<String, ProcessHandle>,
    events_tx: flume::Sender<ManagerEvent>,
    events_rx: flume::Receiver<ManagerEvent>,
    next_worker: AtomicU64,
    closed: AtomicBool,
}

/// Spawns and supervises worker processes.
#[derive(Clone)]
pub struct ProcessManager {
    inner: Arc<ManagerInner>,
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

impl ProcessManager {
    #[must_use]
    pub fn new(config: ManagerConfig) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        Self {
            inner: Arc::new(ManagerInner {
                config,
                handles: DashMap::new(),
                events_tx,
                events_rx,
                next_worker: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Lifecycle event stream.
    #[must_use]
    pub fn monitor(&self) -> ManagerMonitor {
        self.inner.events_rx.clone()
    }

    /// Look up a live handle by logical id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<ProcessHandle> {
        self.inner.handles.get(id).map(|entry| entry.value().clone())
    }

    /// Every handle currently in the directory.
    #[must_use]
    pub fn handles(&self) -> Vec<ProcessHandle> {
        self.inner
            .handles
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Spawn a worker, complete its handshake, and start supervision.
    ///
    /// Returns once the worker is `Ready`. An initial spawn or
    /// handshake failure is returned to the caller; the restart policy
    /// governs crashes after that.
    pub async fn spawn(&self, options: SpawnOptions) -> Result<ProcessHandle> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::supervisor(
                SupervisorKind::Spawn,
                "manager is shut down",
            ));
        }

        let id = options.id.clone().unwrap_or_else(|| {
            let n = self.inner.next_worker.fetch_add(1, Ordering::SeqCst) + 1;
            format!("worker-{n}")
        });
        if self.inner.handles.contains_key(&id) {
            return Err(Error::supervisor(
                SupervisorKind::Spawn,
                format!("worker id {id:?} is already in use"),
            ));
        }

        let handle = ProcessHandle::new(
            id.clone(),
            self.inner.config.shutdown.clone(),
            self.inner.events_tx.clone(),
        );
        self.inner.handles.insert(id.clone(), handle.clone());

        match spawn_attempt(&self.inner, &handle, &options).await {
            Ok(running) => {
                handle.set_state(HandleState::Ready);
                let inner = Arc::clone(&self.inner);
                let supervised = handle.clone();
                compio::runtime::spawn(supervise(inner, supervised, options, running)).detach();
                Ok(handle)
            }
            Err(err) => {
                self.inner.handles.remove(&id);
                handle.set_state(HandleState::Stopped);
                let _ = self.inner.events_tx.send(ManagerEvent::Stopped { id });
                Err(err)
            }
        }
    }

    /// Shut down every live worker concurrently.
    ///
    /// Each run is internally bounded by the shutdown options, so
    /// stragglers are force-killed rather than awaited forever.
    pub async fn shutdown_all(&self) -> Vec<(String, Result<ShutdownOutcome>)> {
        self.inner.closed.store(true, Ordering::SeqCst);
        let handles = self.handles();
        let runs = handles.into_iter().map(|handle| async move {
            let id = handle.id().to_string();
            let outcome = handle.shutdown(ShutdownReason::ManagerShutdown).await;
            (id, outcome)
        });
        futures::future::join_all(runs).await
    }
}

/// Everything the supervisor needs about one running incarnation.
struct RunningWorker {
    exit_rx: flume::Receiver<std::io::Result<std::process::ExitStatus>>,
    hb_dead_rx: flume::Receiver<()>,
    _exit_task: compio::runtime::Task<()>,
    _hb_task: Option<compio::runtime::Task<()>>,
}

/// Fork the child, bring up channels, handshake, start heartbeats.
async fn spawn_attempt(
    inner: &Arc<ManagerInner>,
    handle: &ProcessHandle,
    options: &SpawnOptions,
) -> Result<RunningWorker> {
    let id = handle.id().to_string();
    let config = &inner.config;

    let data_path = options
        .data_channel
        .as_ref()
        .map(|_| socket_path::data_channel_path(&config.namespace, &id));

    let mut command = compio::process::Command::new(&options.program);
    command.args(&options.args);
    if let Some(cwd) = &options.cwd {
        command.current_dir(cwd);
    }
    for (key, value) in &options.env {
        command.env(key, value);
    }
    if let Some(path) = &data_path {
        command.env(DATA_CHANNEL_PATH_ENV, path);
    }
    command.stdin(Stdio::piped());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::inherit());

    let mut child = command.spawn().map_err(|e| {
        Error::supervisor(
            SupervisorKind::Spawn,
            format!("failed to spawn {}: {e}", options.program.display()),
        )
    })?;
    let stdin = child.stdin.take().ok_or_else(|| {
        Error::supervisor(SupervisorKind::Spawn, "child has no stdin pipe")
    })?;
    let stdout = child.stdout.take().ok_or_else(|| {
        Error::supervisor(SupervisorKind::Spawn, "child has no stdout pipe")
    })?;
    debug!(worker = %id, program = %options.program.display(), "worker spawned");
    let _ = inner
        .events_tx
        .send(ManagerEvent::Spawned { id: id.clone() });

    // Control channel and its reserved-notification handlers.
    let registry = HandlerRegistry::new();
    let (ready_tx, ready_rx) = flume::bounded(1);
    registry.register_reserved_notification(reserved::DATA_CHANNEL_READY, {
        notification_handler(move |ctx: RequestCtx| {
            let ready_tx = ready_tx.clone();
            async move {
                if let Ok(ready) = reserved::decode::<DataChannelReady>(ctx.params) {
                    let _ = ready_tx.try_send(ready);
                }
            }
        })
    });
    registry.register_reserved_notification(reserved::DATA_CHANNEL_ERROR, {
        let events = inner.events_tx.clone();
        let id = id.clone();
        notification_handler(move |ctx: RequestCtx| {
            let events = events.clone();
            let id = id.clone();
            async move {
                let message = ctx
                    .params
                    .get("message")
                    .and_then(tether_core::value::Value::as_str)
                    .unwrap_or("unknown data channel error")
                    .to_string();
                let _ = events.send(ManagerEvent::DataChannelError { id, message });
            }
        })
    });
    registry.register_reserved_notification(reserved::SHUTDOWN_COMPLETE, {
        let weak = Arc::downgrade(&handle.inner);
        notification_handler(move |ctx: RequestCtx| {
            let weak = weak.clone();
            async move {
                if let (Some(inner), Ok(complete)) =
                    (weak.upgrade(), reserved::decode::<ShutdownComplete>(ctx.params))
                {
                    inner.note_reported_exit(complete.exit_code);
                }
            }
        })
    });

    let json = config.registry.resolve("json")?;
    let control = RequestChannel::start(
        StdioTransport::new(stdout, stdin),
        Framing::line_delimited(),
        json,
        registry,
        ChannelOptions {
            default_timeout: config.default_timeout,
            label: format!("control:{id}"),
            ..ChannelOptions::default()
        },
    )
    .await?;
    let control = Arc::new(control);
    handle.inner.set_control(Arc::clone(&control));

    // Handshake.
    handle.set_state(HandleState::Handshaking);
    let hello = HandshakeRequest {
        version: PROTOCOL_VERSION.to_string(),
        capabilities: vec![capabilities::HEARTBEAT.to_string()],
        data_channel: match (&data_path, &options.data_channel) {
            (Some(path), Some(dc)) => Some(DataChannelSpec {
                path: path.clone(),
                serialization: dc.serialization.clone(),
            }),
            _ => None,
        },
    };
    let reply = control
        .request_reserved(
            reserved::HANDSHAKE,
            reserved::encode(&hello)?,
            RequestOptions {
                timeout: Some(HANDSHAKE_TIMEOUT),
                cancel: None,
            },
        )
        .await?;
    let reply: HandshakeReply = reserved::decode(reply).map_err(|e| {
        Error::supervisor(SupervisorKind::Handshake, format!("bad handshake reply: {e}"))
    })?;
    if reply.version != PROTOCOL_VERSION {
        return Err(Error::supervisor(
            SupervisorKind::Handshake,
            format!(
                "worker speaks protocol {:?}, manager speaks {PROTOCOL_VERSION:?}",
                reply.version
            ),
        ));
    }
    handle.inner.set_pid(reply.worker_info.pid);
    handle.inner.set_worker_info(reply.worker_info.clone());
    let _ = inner.events_tx.send(ManagerEvent::HandshakeCompleted {
        id: id.clone(),
        worker: reply.worker_info.clone(),
    });

    // Data channel: wait for the worker's listener before dialing.
    let wants_data = options.data_channel.is_some()
        && reply
            .capabilities
            .iter()
            .any(|c| c == capabilities::DATA_CHANNEL);
    if wants_data {
        let dc = options.data_channel.as_ref().expect("checked above");
        match compio::time::timeout(DATA_READY_TIMEOUT, ready_rx.recv_async()).await {
            Ok(Ok(ready)) => {
                let codec = config.registry.resolve(&ready.serialization)?;
                let link = {
                    let weak = Arc::downgrade(&handle.inner);
                    Arc::new(move |up: bool| {
                        if let Some(inner) = weak.upgrade() {
                            let handle = ProcessHandle { inner };
                            let current = handle.state();
                            if up && current == HandleState::Disconnected {
                                handle.set_state(HandleState::Ready);
                            } else if !up && current == HandleState::Ready {
                                handle.set_state(HandleState::Disconnected);
                            }
                        }
                    }) as crate::reconnect::LinkHook
                };
                let data = ReconnectManager::new(
                    id.clone(),
                    ready.path,
                    codec,
                    dc.reconnect.clone(),
                    config.default_timeout,
                    inner.events_tx.clone(),
                    link,
                );
                handle.inner.set_data(data.clone());
                if let Err(err) = data.connect().await {
                    let _ = inner.events_tx.send(ManagerEvent::DataChannelError {
                        id: id.clone(),
                        message: err.to_string(),
                    });
                }
            }
            _ => {
                let _ = inner.events_tx.send(ManagerEvent::DataChannelError {
                    id: id.clone(),
                    message: "worker never signalled data_channel_ready".to_string(),
                });
            }
        }
    }

    // Exit watcher owns the child from here on.
    let (exit_tx, exit_rx) = flume::bounded(1);
    let exit_task = compio::runtime::spawn(async move {
        let mut child = child;
        let status = child.wait().await;
        let _ = exit_tx.send(status);
    });

    // Heartbeat pinger.
    let (hb_dead_tx, hb_dead_rx) = flume::bounded(1);
    let hb_task = if config.heartbeat.enabled {
        Some(compio::runtime::spawn(heartbeat_loop(
            id,
            Arc::clone(&control),
            config.heartbeat.clone(),
            inner.events_tx.clone(),
            hb_dead_tx,
        )))
    } else {
        None
    };

    Ok(RunningWorker {
        exit_rx,
        hb_dead_rx,
        _exit_task: exit_task,
        _hb_task: hb_task,
    })
}

/// Periodic `__heartbeat_ping__` until the miss budget runs out.
async fn heartbeat_loop(
    id: String,
    control: Arc<RequestChannel>,
    options: HeartbeatOptions,
    events: flume::Sender<ManagerEvent>,
    hb_dead_tx: flume::Sender<()>,
) {
    let mut seq = 0u64;
    let mut misses = 0u32;
    loop {
        compio::time::sleep(options.interval).await;
        if control.is_closed() {
            break;
        }
        seq += 1;
        let Ok(params) = reserved::encode(&HeartbeatPing {
            timestamp: now_millis(),
            seq,
        }) else {
            break;
        };
        match control
            .request_reserved(
                reserved::HEARTBEAT_PING,
                params,
                RequestOptions {
                    timeout: Some(options.interval),
                    cancel: None,
                },
            )
            .await
        {
            Ok(_pong) => {
                misses = 0;
            }
            Err(Error::ChannelClosed(_)) => break,
            Err(err) => {
                misses += 1;
                debug!(worker = %id, misses, error = %err, "heartbeat miss");
                let _ = events.send(ManagerEvent::HeartbeatMissed {
                    id: id.clone(),
                    misses,
                });
                if misses >= options.misses {
                    let _ = events.send(ManagerEvent::HeartbeatDead { id: id.clone() });
                    let _ = hb_dead_tx.try_send(());
                    break;
                }
            }
        }
    }
}

/// Restart bookkeeping within a rolling window.
#[derive(Default)]
struct RestartLedger {
    attempts: u32,
    window_start: Option<Instant>,
}

impl RestartLedger {
    fn record(&mut self, now: Instant, window: Duration) -> u32 {
        match self.window_start {
            Some(start) if now.duration_since(start) <= window => {}
            _ => {
                self.window_start = Some(now);
                self.attempts = 0;
            }
        }
        self.attempts += 1;
        self.attempts
    }
}

enum WorkerDown {
    Exited(ExitInfo),
    HeartbeatDead,
}

/// Per-worker supervision: reap exits, enforce the restart policy.
async fn supervise(
    inner: Arc<ManagerInner>,
    handle: ProcessHandle,
    options: SpawnOptions,
    mut running: RunningWorker,
) {
    let policy: RestartPolicy = options
        .restart
        .clone()
        .unwrap_or_else(|| inner.config.restart.clone());
    let mut ledger = RestartLedger::default();
    let id = handle.id().to_string();

    'supervise: loop {
        let down = futures::select! {
            status = running.exit_rx.recv_async().fuse() => {
                let status = status.unwrap_or_else(|_| {
                    Err(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "exit watcher went away",
                    ))
                });
                WorkerDown::Exited(attribute(&handle, status))
            }
            _ = running.hb_dead_rx.recv_async().fuse() => WorkerDown::HeartbeatDead,
        };

        let exit = match down {
            WorkerDown::Exited(mut exit) => {
                // The pipe may still hold bytes the worker wrote right
                // before dying (final responses, shutdown_complete).
                // Let the control channel drain to EOF before judging.
                if let Some(control) = handle.inner.control_channel() {
                    let waited = Instant::now();
                    while !control.is_closed()
                        && waited.elapsed() < Duration::from_millis(500)
                    {
                        compio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
                if !exit.graceful {
                    if let Some(code) = handle.inner.reported_exit() {
                        exit = ExitInfo {
                            graceful: true,
                            code: Some(code),
                            signal: None,
                        };
                    }
                }
                exit
            }
            WorkerDown::HeartbeatDead => {
                handle.set_state(HandleState::Disconnected);
                if !policy.enabled && inner.config.shutdown.enabled {
                    // No restart budget to spend; try the polite path
                    // first, it force-kills on its own timeout.
                    let _ = handle.shutdown(ShutdownReason::HeartbeatDead).await;
                } else {
                    handle.inner.mark_kill_sent();
                    if let Some(pid) = handle.pid() {
                        let _ = crate::os::force_kill(pid);
                    }
                }
                let status = compio::time::timeout(ORPHAN_REAP_TIMEOUT, async {
                    running.exit_rx.recv_async().await
                })
                .await;
                match status {
                    Ok(Ok(status)) => attribute(&handle, status),
                    _ => ExitInfo {
                        graceful: false,
                        code: None,
                        signal: None,
                    },
                }
            }
        };

        debug!(worker = %id, %exit, "worker down");
        handle.inner.announce_exit(exit);
        let _ = inner.events_tx.send(ManagerEvent::Exited {
            id: id.clone(),
            exit,
        });
        // In-flight requests against the lost process fail; they are
        // never replayed against a replacement.
        handle.close_channels().await;

        let clean = exit.graceful || exit.code == Some(0);
        if handle.inner.is_closing() || clean || !policy.enabled {
            break 'supervise;
        }

        // Respawn, burning restart budget on every failed attempt.
        let next = loop {
            if handle.inner.is_closing() {
                break None;
            }
            let attempt = ledger.record(Instant::now(), policy.window);
            if attempt > policy.max_restarts {
                warn!(worker = %id, "restart budget exhausted");
                let _ = inner
                    .events_tx
                    .send(ManagerEvent::RestartBudgetExhausted { id: id.clone() });
                break None;
            }
            let delay = policy.backoff.delay(attempt);
            let _ = inner.events_tx.send(ManagerEvent::Restarting {
                id: id.clone(),
                attempt,
                delay,
            });
            compio::time::sleep(delay).await;

            handle.inner.reset_for_restart();
            handle.set_state(HandleState::Starting);
            match spawn_attempt(&inner, &handle, &options).await {
                Ok(running) => {
                    handle.set_state(HandleState::Ready);
                    break Some(running);
                }
                Err(err) => {
                    warn!(worker = %id, error = %err, "respawn attempt failed");
                    if matches!(err, Error::Supervisor(SupervisorKind::Handshake, _)) {
                        // Logical failure; retrying cannot help.
                        break None;
                    }
                }
            }
        };

        match next {
            Some(next) => running = next,
            None => break 'supervise,
        }
    }

    handle.set_state(HandleState::Stopped);
    inner.handles.remove(&id);
    let _ = inner.events_tx.send(ManagerEvent::Stopped { id });
}

/// Classify an observed OS exit.
fn attribute(handle: &ProcessHandle, status: std::io::Result<std::process::ExitStatus>) -> ExitInfo {
    if let Some(code) = handle.inner.reported_exit() {
        return ExitInfo {
            graceful: true,
            code: Some(code),
            signal: None,
        };
    }
    if handle.inner.kill_sent() {
        return ExitInfo {
            graceful: false,
            code: None,
            signal: Some(9),
        };
    }
    match status {
        Ok(status) => ExitInfo {
            graceful: false,
            code: status.code(),
            signal: exit_signal(&status),
        },
        Err(_) => ExitInfo {
            graceful: false,
            code: None,
            signal: None,
        },
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_resets_outside_window() {
        let mut ledger = RestartLedger::default();
        let t0 = Instant::now();
        let window = Duration::from_secs(60);

        assert_eq!(ledger.record(t0, window), 1);
        assert_eq!(ledger.record(t0 + Duration::from_secs(1), window), 2);
        // Past the window: the count starts over.
        assert_eq!(ledger.record(t0 + Duration::from_secs(120), window), 1);
    }
}
