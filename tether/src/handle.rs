//! Per-process handle.
//!
//! A [`ProcessHandle`] is the manager's stable object for one logical
//! worker. It owns the control channel (always) and the data channel's
//! reconnect manager (at most one), survives restarts of the underlying
//! OS process, and gates user traffic on its lifecycle state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;
use parking_lot::Mutex;
use tracing::trace;

use tether_core::error::{Error, Result};
use tether_core::value::Value;
use tether_rpc::channel::{RequestChannel, RequestOptions};
use tether_rpc::reserved::{ShutdownReason, WorkerInfo};

use crate::config::ShutdownOptions;
use crate::events::{ExitInfo, ManagerEvent, ManagerEventSender};
use crate::reconnect::ReconnectManager;
use crate::shutdown::{self, ShutdownOutcome, ShutdownSlot};

/// Lifecycle of a worker handle.
///
/// Transitions are monotonic except that `Ready` and `Disconnected`
/// oscillate while the data channel reconnects or heartbeats recover.
/// `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Starting,
    Handshaking,
    Ready,
    Draining,
    Disconnected,
    Stopped,
}

impl HandleState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Disconnected => "disconnected",
            Self::Stopped => "stopped",
        }
    }
}

pub(crate) struct HandleInner {
    pub(crate) id: String,
    pub(crate) shutdown_options: ShutdownOptions,
    pub(crate) events: ManagerEventSender,
    state: Mutex<HandleState>,
    pid: Mutex<Option<u32>>,
    worker: Mutex<Option<WorkerInfo>>,
    control: Mutex<Option<Arc<RequestChannel>>>,
    data: Mutex<Option<ReconnectManager>>,
    pub(crate) shutdown_slot: Mutex<ShutdownSlot>,
    /// Set once a shutdown run owns this handle; blocks restarts.
    closing: AtomicBool,
    /// Set when the shutdown driver delivered SIGKILL.
    kill_sent: AtomicBool,
    /// Exit code announced via `__shutdown_complete__`.
    reported_exit: Mutex<Option<i32>>,
    /// Exit of the current OS process, once reaped.
    exited: Mutex<Option<ExitInfo>>,
    exit_waiters: Mutex<Vec<oneshot::Sender<ExitInfo>>>,
}

impl HandleInner {
    pub(crate) fn control_channel(&self) -> Option<Arc<RequestChannel>> {
        self.control.lock().clone()
    }

    pub(crate) fn data_manager(&self) -> Option<ReconnectManager> {
        self.data.lock().clone()
    }

    pub(crate) fn set_control(&self, channel: Arc<RequestChannel>) {
        *self.control.lock() = Some(channel);
    }

    pub(crate) fn set_data(&self, manager: ReconnectManager) {
        *self.data.lock() = Some(manager);
    }

    pub(crate) fn set_pid(&self, pid: u32) {
        *self.pid.lock() = Some(pid);
    }

    pub(crate) fn set_worker_info(&self, info: WorkerInfo) {
        *self.worker.lock() = Some(info);
    }

    pub(crate) fn mark_closing(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_kill_sent(&self) {
        self.kill_sent.store(true, Ordering::SeqCst);
    }

    pub(crate) fn kill_sent(&self) -> bool {
        self.kill_sent.load(Ordering::SeqCst)
    }

    pub(crate) fn note_reported_exit(&self, code: i32) {
        *self.reported_exit.lock() = Some(code);
    }

    pub(crate) fn reported_exit(&self) -> Option<i32> {
        *self.reported_exit.lock()
    }

    /// Reset per-incarnation state before a respawn.
    pub(crate) fn reset_for_restart(&self) {
        *self.pid.lock() = None;
        *self.worker.lock() = None;
        *self.reported_exit.lock() = None;
        *self.exited.lock() = None;
        self.kill_sent.store(false, Ordering::SeqCst);
    }

    /// Announce the OS exit of the current incarnation.
    pub(crate) fn announce_exit(&self, exit: ExitInfo) {
        *self.exited.lock() = Some(exit);
        let waiters = std::mem::take(&mut *self.exit_waiters.lock());
        for waiter in waiters {
            let _ = waiter.send(exit);
        }
    }
}

/// The manager's per-process object. Clones share the same worker.
#[derive(Clone)]
pub struct ProcessHandle {
    pub(crate) inner: Arc<HandleInner>,
}

impl ProcessHandle {
    pub(crate) fn new(
        id: String,
        shutdown_options: ShutdownOptions,
        events: ManagerEventSender,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                shutdown_options,
                events,
                state: Mutex::new(HandleState::Starting),
                pid: Mutex::new(None),
                worker: Mutex::new(None),
                control: Mutex::new(None),
                data: Mutex::new(None),
                shutdown_slot: Mutex::new(ShutdownSlot::Idle),
                closing: AtomicBool::new(false),
                kill_sent: AtomicBool::new(false),
                reported_exit: Mutex::new(None),
                exited: Mutex::new(None),
                exit_waiters: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Manager-scoped logical id; stable across restarts.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    #[must_use]
    pub fn state(&self) -> HandleState {
        *self.inner.state.lock()
    }

    /// OS pid of the current incarnation, when known.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        *self.inner.pid.lock()
    }

    /// Identity the worker reported in its handshake.
    #[must_use]
    pub fn worker_info(&self) -> Option<WorkerInfo> {
        self.inner.worker.lock().clone()
    }

    /// Move to `state`, emitting a `StateChanged` event.
    ///
    /// `Stopped` is terminal; later transitions are ignored.
    pub(crate) fn set_state(&self, state: HandleState) -> bool {
        {
            let mut current = self.inner.state.lock();
            if *current == state || *current == HandleState::Stopped {
                return false;
            }
            trace!(
                worker = %self.inner.id,
                from = current.as_str(),
                to = state.as_str(),
                "handle state"
            );
            *current = state;
        }
        let _ = self.inner.events.send(ManagerEvent::StateChanged {
            id: self.inner.id.clone(),
            state,
        });
        true
    }

    fn gate_user_traffic(&self) -> Result<Arc<RequestChannel>> {
        match self.state() {
            HandleState::Ready | HandleState::Disconnected => self
                .inner
                .control_channel()
                .ok_or_else(|| Error::closed(format!("worker {} has no control channel", self.id()))),
            state => Err(Error::closed(format!(
                "worker {} is {}",
                self.id(),
                state.as_str()
            ))),
        }
    }

    /// Request over the control channel with the default timeout.
    pub async fn request(&self, method: impl Into<String>, params: Value) -> Result<Value> {
        let channel = self.gate_user_traffic()?;
        channel.request(method, params).await
    }

    /// Request over the control channel with per-call options.
    pub async fn request_with(
        &self,
        method: impl Into<String>,
        params: Value,
        options: RequestOptions,
    ) -> Result<Value> {
        let channel = self.gate_user_traffic()?;
        channel.request_with(method, params, options).await
    }

    /// Notify over the control channel.
    pub async fn notify(&self, method: impl Into<String>, params: Value) -> Result<()> {
        let channel = self.gate_user_traffic()?;
        channel.notify(method, params).await
    }

    /// Request over the data channel; fails when none was negotiated.
    ///
    /// While the data link is reconnecting the request queues or fails
    /// according to the worker's [`crate::config::ReconnectOptions`].
    pub async fn request_via_data(
        &self,
        method: impl Into<String>,
        params: Value,
    ) -> Result<Value> {
        self.request_via_data_with(method, params, None).await
    }

    /// Data-channel request with an explicit timeout.
    pub async fn request_via_data_with(
        &self,
        method: impl Into<String>,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        match self.state() {
            HandleState::Ready | HandleState::Disconnected => {}
            state => {
                return Err(Error::closed(format!(
                    "worker {} is {}",
                    self.id(),
                    state.as_str()
                )))
            }
        }
        let data = self.inner.data_manager().ok_or_else(|| {
            Error::closed(format!("worker {} has no data channel", self.id()))
        })?;
        data.request(method, params, timeout).await
    }

    /// Whether the data channel is currently reconnecting.
    #[must_use]
    pub fn data_channel_reconnecting(&self) -> bool {
        self.inner
            .data_manager()
            .is_some_and(|data| data.is_reconnecting())
    }

    /// Drive the cooperative shutdown protocol. Idempotent; concurrent
    /// callers observe the same outcome.
    pub async fn shutdown(&self, reason: ShutdownReason) -> Result<ShutdownOutcome> {
        shutdown::shutdown(self, reason, self.inner.shutdown_options.clone()).await
    }

    /// Close both channels without touching the OS process.
    pub async fn close(&self) {
        self.inner.mark_closing();
        self.close_channels().await;
    }

    pub(crate) async fn close_channels(&self) {
        let data = self.inner.data.lock().take();
        if let Some(data) = data {
            data.close().await;
        }
        let control = self.inner.control.lock().take();
        if let Some(control) = control {
            control.close().await;
        }
    }

    /// Wait up to `timeout` for the current incarnation's OS exit.
    pub(crate) async fn wait_exit(&self, timeout: Duration) -> Option<ExitInfo> {
        let rx = {
            let exited = self.inner.exited.lock();
            if let Some(info) = *exited {
                return Some(info);
            }
            let (tx, rx) = oneshot::channel();
            self.inner.exit_waiters.lock().push(tx);
            rx
        };
        if timeout.is_zero() {
            return None;
        }
        match compio::time::timeout(timeout, rx).await {
            Ok(Ok(info)) => Some(info),
            _ => None,
        }
    }
}
