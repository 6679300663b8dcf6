//! Cooperative shutdown driver.
//!
//! Per-process state machine:
//!
//! ```text
//! sending → awaitingAck → draining → awaitingComplete → completed
//!                 │            │             │
//!                 └─ timeout ──┴── timeout ──┴── forceKilling → completed
//! ```
//!
//! The ack / drain / complete phases share one `graceful_timeout`
//! budget. Any timeout collapses to a force kill: SIGKILL, then up to
//! `exit_wait` for the OS exit. A second `shutdown` call while one is
//! in progress joins the first run and observes the same outcome;
//! `__shutdown__` is never re-sent.

use std::time::Duration;

use futures::channel::oneshot;
use tracing::{debug, warn};

use tether_core::error::{Error, Result};
use tether_rpc::channel::RequestOptions;
use tether_rpc::reserved::{self, ShutdownAck, ShutdownReason, ShutdownRequest};

use crate::config::ShutdownOptions;
use crate::handle::{HandleState, ProcessHandle};

/// Terminal result of a shutdown run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownOutcome {
    /// `true` when the worker completed the protocol on its own.
    pub graceful: bool,
    /// Exit code, when the worker reported or produced one.
    pub exit_code: Option<i32>,
}

/// Concurrency guard: first caller drives, later callers wait.
pub(crate) enum ShutdownSlot {
    Idle,
    Running(Vec<oneshot::Sender<ShutdownOutcome>>),
    Done(ShutdownOutcome),
}

enum Role {
    Drive,
    Wait(oneshot::Receiver<ShutdownOutcome>),
    Done(ShutdownOutcome),
}

/// Entry point used by [`ProcessHandle::shutdown`]. Idempotent.
pub(crate) async fn shutdown(
    handle: &ProcessHandle,
    reason: ShutdownReason,
    options: ShutdownOptions,
) -> Result<ShutdownOutcome> {
    let role = {
        let mut slot = handle.inner.shutdown_slot.lock();
        match &mut *slot {
            ShutdownSlot::Done(outcome) => Role::Done(*outcome),
            ShutdownSlot::Running(waiters) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Role::Wait(rx)
            }
            ShutdownSlot::Idle => {
                *slot = ShutdownSlot::Running(Vec::new());
                Role::Drive
            }
        }
    };

    match role {
        Role::Done(outcome) => Ok(outcome),
        Role::Wait(rx) => rx
            .await
            .map_err(|_| Error::closed("shutdown driver went away".to_string())),
        Role::Drive => {
            let outcome = drive(handle, reason, options).await;
            let waiters = {
                let mut slot = handle.inner.shutdown_slot.lock();
                let waiters = match &mut *slot {
                    ShutdownSlot::Running(waiters) => std::mem::take(waiters),
                    _ => Vec::new(),
                };
                *slot = ShutdownSlot::Done(outcome);
                waiters
            };
            for waiter in waiters {
                let _ = waiter.send(outcome);
            }
            Ok(outcome)
        }
    }
}

async fn drive(
    handle: &ProcessHandle,
    reason: ShutdownReason,
    options: ShutdownOptions,
) -> ShutdownOutcome {
    let id = handle.id().to_string();
    debug!(worker = %id, reason = reason.as_str(), "shutdown starting");

    handle.inner.mark_closing();
    handle.set_state(HandleState::Draining);

    // sending + awaitingAck
    let ack = request_shutdown(handle, reason, options.graceful_timeout).await;
    match ack {
        Ok(ack) => {
            debug!(
                worker = %id,
                pending = ack.pending_requests,
                "worker acknowledged shutdown, draining"
            );
            // draining + awaitingComplete: responses keep flowing into
            // the pending map; we only wait for the process to leave.
            match handle.wait_exit(options.graceful_timeout).await {
                Some(exit) => {
                    finish(handle).await;
                    ShutdownOutcome {
                        graceful: exit.graceful,
                        exit_code: exit.code,
                    }
                }
                None => force_kill(handle, &options).await,
            }
        }
        Err(err) => {
            // No ack inside the budget; the worker may also have died
            // already, in which case the exit is attributed as-is.
            if let Some(exit) = handle.wait_exit(Duration::ZERO).await {
                finish(handle).await;
                return ShutdownOutcome {
                    graceful: exit.graceful,
                    exit_code: exit.code,
                };
            }
            warn!(worker = %id, error = %err, "shutdown not acknowledged, force killing");
            force_kill(handle, &options).await
        }
    }
}

async fn request_shutdown(
    handle: &ProcessHandle,
    reason: ShutdownReason,
    budget: Duration,
) -> Result<ShutdownAck> {
    let control = handle
        .inner
        .control_channel()
        .ok_or_else(|| Error::closed("no control channel".to_string()))?;
    let params = reserved::encode(&ShutdownRequest {
        timeout_ms: budget.as_millis() as u64,
        reason,
    })?;
    let reply = control
        .request_reserved(
            reserved::SHUTDOWN,
            params,
            RequestOptions {
                timeout: Some(budget),
                cancel: None,
            },
        )
        .await?;
    reserved::decode(reply)
}

async fn force_kill(handle: &ProcessHandle, options: &ShutdownOptions) -> ShutdownOutcome {
    handle.inner.mark_kill_sent();
    if let Some(pid) = handle.pid() {
        if let Err(err) = crate::os::force_kill(pid) {
            warn!(worker = %handle.id(), pid, error = %err, "force kill failed");
        }
    }

    let exit = handle.wait_exit(options.exit_wait).await;
    finish(handle).await;
    ShutdownOutcome {
        graceful: false,
        exit_code: exit.and_then(|e| e.code),
    }
}

/// Close both channels; the supervisor marks the handle stopped once it
/// reaps the exit.
async fn finish(handle: &ProcessHandle) {
    handle.close_channels().await;
}
