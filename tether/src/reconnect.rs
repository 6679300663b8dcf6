//! Data-channel reconnection.
//!
//! Only the data channel reconnects; a dead control channel means the
//! worker itself is gone. While the link is down, new data-channel
//! requests queue (bounded, each with its own expiry) or fail fast per
//! policy, and a background loop redials with jittered exponential
//! backoff. Requests that were in flight when the link dropped are
//! failed, never replayed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use tether_core::backoff::BackoffState;
use tether_core::codec::Codec;
use tether_core::error::{Error, Result, TimeoutKind};
use tether_core::framing::Framing;
use tether_core::value::Value;
use tether_rpc::channel::{ChannelEvent, ChannelOptions, RequestChannel, RequestOptions};
use tether_rpc::handlers::HandlerRegistry;

use crate::config::ReconnectOptions;
use crate::events::{ManagerEvent, ManagerEventSender};

/// Callback fired when the data link goes down (`false`) or comes back
/// (`true`); the supervisor uses it to oscillate the handle state.
pub type LinkHook = Arc<dyn Fn(bool) + Send + Sync>;

struct QueuedRequest {
    seq: u64,
    method: String,
    params: Value,
    timeout: Option<Duration>,
    resolver: oneshot::Sender<Result<Value>>,
}

struct ReconnectInner {
    worker_id: String,
    path: String,
    codec: Arc<dyn Codec>,
    options: ReconnectOptions,
    default_timeout: Duration,
    events: ManagerEventSender,
    link: LinkHook,
    channel: Mutex<Option<Arc<RequestChannel>>>,
    queue: Mutex<VecDeque<QueuedRequest>>,
    queue_seq: AtomicU64,
    reconnecting: AtomicBool,
    loop_running: AtomicBool,
    gave_up: AtomicBool,
    closed: AtomicBool,
}

/// Owns one worker's data channel and its reconnection lifecycle.
#[derive(Clone)]
pub struct ReconnectManager {
    inner: Arc<ReconnectInner>,
}

impl ReconnectManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: impl Into<String>,
        path: impl Into<String>,
        codec: Arc<dyn Codec>,
        options: ReconnectOptions,
        default_timeout: Duration,
        events: ManagerEventSender,
        link: LinkHook,
    ) -> Self {
        Self {
            inner: Arc::new(ReconnectInner {
                worker_id: worker_id.into(),
                path: path.into(),
                codec,
                options,
                default_timeout,
                events,
                link,
                channel: Mutex::new(None),
                queue: Mutex::new(VecDeque::new()),
                queue_seq: AtomicU64::new(0),
                reconnecting: AtomicBool::new(false),
                loop_running: AtomicBool::new(false),
                gave_up: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// First dial, attempted directly without backoff.
    ///
    /// On failure the backoff loop takes over (when reconnection is
    /// enabled) and the error is returned so the caller can report it.
    pub async fn connect(&self) -> Result<()> {
        match dial(&self.inner).await {
            Ok(()) => Ok(()),
            Err(err) => {
                start_loop(Arc::clone(&self.inner));
                Err(err)
            }
        }
    }

    /// Issue a request over the data channel, queueing per policy while
    /// the link is down.
    pub async fn request(
        &self,
        method: impl Into<String>,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let method = method.into();
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(Error::closed(format!(
                "data channel for {} is closed",
                inner.worker_id
            )));
        }

        let live = {
            let channel = inner.channel.lock();
            channel.as_ref().filter(|c| !c.is_closed()).cloned()
        };
        if let Some(channel) = live {
            return channel
                .request_with(
                    method,
                    params,
                    RequestOptions {
                        timeout,
                        cancel: None,
                    },
                )
                .await;
        }

        // Link is down.
        if inner.gave_up.load(Ordering::SeqCst) {
            return Err(Error::closed(format!(
                "data channel for {} gave up reconnecting",
                inner.worker_id
            )));
        }
        if !inner.options.queue_requests {
            return Err(Error::closed(format!(
                "data channel for {} is disconnected",
                inner.worker_id
            )));
        }

        let (resolver, rx) = oneshot::channel();
        {
            let mut queue = inner.queue.lock();
            if queue.len() >= inner.options.max_queue {
                return Err(Error::QueueFull {
                    capacity: inner.options.max_queue,
                });
            }
            let seq = inner.queue_seq.fetch_add(1, Ordering::SeqCst);
            queue.push_back(QueuedRequest {
                seq,
                method: method.clone(),
                params,
                timeout,
                resolver,
            });
            spawn_queue_expiry(Arc::clone(inner), seq, method);
        }

        rx.await.unwrap_or_else(|_| {
            Err(Error::closed(format!(
                "data channel for {} went away",
                inner.worker_id
            )))
        })
    }

    #[must_use]
    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnecting.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Stop reconnecting, reject the queue, release the channel.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        reject_queue(
            &self.inner,
            &Error::closed("data channel closed".to_string()),
        );
        let channel = self.inner.channel.lock().take();
        if let Some(channel) = channel {
            channel.close().await;
        }
    }
}

/// Dial once and install the channel on success.
async fn dial(inner: &Arc<ReconnectInner>) -> Result<()> {
    #[cfg(unix)]
    let transport = tether_core::uds::UnixSocketTransport::new(&inner.path);
    #[cfg(windows)]
    let transport = tether_core::pipe::NamedPipeTransport::new(inner.path.clone());

    let channel = RequestChannel::start(
        transport,
        Framing::length_prefixed(),
        Arc::clone(&inner.codec),
        HandlerRegistry::new(),
        ChannelOptions {
            default_timeout: inner.default_timeout,
            label: format!("data:{}", inner.worker_id),
            ..ChannelOptions::default()
        },
    )
    .await?;
    let channel = Arc::new(channel);

    *inner.channel.lock() = Some(Arc::clone(&channel));
    inner.reconnecting.store(false, Ordering::SeqCst);
    (inner.link)(true);
    spawn_down_watcher(Arc::clone(inner), channel);
    Ok(())
}

/// Watch one installed channel; a `Down` event starts the redial loop.
fn spawn_down_watcher(inner: Arc<ReconnectInner>, channel: Arc<RequestChannel>) {
    let events = channel.events();
    compio::runtime::spawn(async move {
        while let Ok(event) = events.recv_async().await {
            if let ChannelEvent::Down(reason) = event {
                if inner.closed.load(Ordering::SeqCst) {
                    return;
                }
                debug!(
                    worker = %inner.worker_id,
                    reason = %reason,
                    "data channel down"
                );
                (inner.link)(false);
                start_loop(inner);
                return;
            }
        }
    })
    .detach();
}

/// Kick the backoff loop if it is not already running.
fn start_loop(inner: Arc<ReconnectInner>) {
    if inner.closed.load(Ordering::SeqCst) || !inner.options.enabled {
        reject_queue(&inner, &Error::closed("data channel is gone".to_string()));
        return;
    }
    if inner.loop_running.swap(true, Ordering::SeqCst) {
        return;
    }
    inner.reconnecting.store(true, Ordering::SeqCst);

    compio::runtime::spawn(async move {
        let mut backoff = BackoffState::new(inner.options.backoff());
        loop {
            if inner.closed.load(Ordering::SeqCst) {
                break;
            }
            let attempt = backoff.attempt() + 1;
            if let Some(max) = inner.options.max_attempts {
                if attempt > max {
                    give_up(&inner);
                    break;
                }
            }
            let delay = backoff.next_delay();
            let _ = inner.events.send(ManagerEvent::ReconnectAttempt {
                id: inner.worker_id.clone(),
                attempt,
                delay,
            });
            compio::time::sleep(delay).await;
            if inner.closed.load(Ordering::SeqCst) {
                break;
            }

            match dial(&inner).await {
                Ok(()) => {
                    let _ = inner.events.send(ManagerEvent::Reconnected {
                        id: inner.worker_id.clone(),
                        attempt,
                    });
                    inner.loop_running.store(false, Ordering::SeqCst);
                    flush_queue(&inner).await;
                    return;
                }
                Err(err) => {
                    trace!(
                        worker = %inner.worker_id,
                        attempt,
                        error = %err,
                        "reconnect attempt failed"
                    );
                }
            }
        }
        inner.loop_running.store(false, Ordering::SeqCst);
    })
    .detach();
}

/// Replay queued requests in FIFO order on the fresh channel.
async fn flush_queue(inner: &Arc<ReconnectInner>) {
    loop {
        let entry = inner.queue.lock().pop_front();
        let Some(entry) = entry else { break };
        let channel = {
            let channel = inner.channel.lock();
            channel.as_ref().cloned()
        };
        let Some(channel) = channel else {
            let _ = entry
                .resolver
                .send(Err(Error::closed("data channel lost again".to_string())));
            continue;
        };
        trace!(
            worker = %inner.worker_id,
            method = %entry.method,
            "flushing queued request"
        );
        let result = channel
            .request_with(
                entry.method,
                entry.params,
                RequestOptions {
                    timeout: entry.timeout,
                    cancel: None,
                },
            )
            .await;
        let _ = entry.resolver.send(result);
    }
}

/// Expire one queued entry after `queue_timeout`.
fn spawn_queue_expiry(inner: Arc<ReconnectInner>, seq: u64, method: String) {
    let timeout = inner.options.queue_timeout;
    compio::runtime::spawn(async move {
        compio::time::sleep(timeout).await;
        let expired = {
            let mut queue = inner.queue.lock();
            queue
                .iter()
                .position(|entry| entry.seq == seq)
                .and_then(|idx| queue.remove(idx))
        };
        if let Some(entry) = expired {
            let _ = inner.events.send(ManagerEvent::QueuedRequestExpired {
                id: inner.worker_id.clone(),
                method,
            });
            let _ = entry
                .resolver
                .send(Err(Error::Timeout(TimeoutKind::Queue, timeout)));
        }
    })
    .detach();
}

fn give_up(inner: &Arc<ReconnectInner>) {
    warn!(worker = %inner.worker_id, "giving up on data channel reconnect");
    inner.gave_up.store(true, Ordering::SeqCst);
    inner.reconnecting.store(false, Ordering::SeqCst);
    reject_queue(
        inner,
        &Error::Timeout(TimeoutKind::Reconnect, inner.options.max_delay),
    );
    let _ = inner.events.send(ManagerEvent::ReconnectFailed {
        id: inner.worker_id.clone(),
    });
}

fn reject_queue(inner: &Arc<ReconnectInner>, error: &Error) {
    let drained: Vec<QueuedRequest> = inner.queue.lock().drain(..).collect();
    for entry in drained {
        let _ = entry.resolver.send(Err(error.clone()));
    }
}
