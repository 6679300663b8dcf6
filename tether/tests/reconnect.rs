//! Data-channel reconnect behavior against an in-test socket server.

#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tether::events::ManagerEvent;
use tether::reconnect::{LinkHook, ReconnectManager};
use tether::ReconnectOptions;
use tether_core::codec::JsonCodec;
use tether_core::framing::Framing;
use tether_core::uds::UnixSocketServer;
use tether_core::value::Value;
use tether_rpc::channel::{ChannelEvent, ChannelOptions, RequestChannel};
use tether_rpc::handlers::{request_handler, HandlerRegistry, RequestCtx};

struct TestServer {
    path: String,
    current: Arc<Mutex<Option<Arc<RequestChannel>>>>,
    rebind_tx: flume::Sender<()>,
    /// Params seen by the echo handler, in arrival order.
    seen: flume::Receiver<Value>,
    _task: compio::runtime::Task<()>,
}

impl TestServer {
    /// Bind, serve echo, and park; every `rebind` signal re-binds after
    /// a disconnect.
    async fn start(test: &str) -> Self {
        let path = format!(
            "{}/tether-reconnect-{}-{test}.sock",
            std::env::temp_dir().display(),
            std::process::id()
        );
        let _ = std::fs::remove_file(&path);

        let (seen_tx, seen_rx) = flume::unbounded();
        let registry = HandlerRegistry::new();
        registry
            .on_request(
                "echo",
                request_handler(move |ctx: RequestCtx| {
                    let seen_tx = seen_tx.clone();
                    async move {
                        let _ = seen_tx.send(ctx.params.clone());
                        Ok(ctx.params)
                    }
                }),
            )
            .unwrap();

        let (rebind_tx, rebind_rx) = flume::unbounded::<()>();
        let current: Arc<Mutex<Option<Arc<RequestChannel>>>> = Arc::new(Mutex::new(None));
        let (started_tx, started_rx) = flume::bounded::<()>(1);

        let task = {
            let path = path.clone();
            let current = Arc::clone(&current);
            compio::runtime::spawn(async move {
                loop {
                    let server = match UnixSocketServer::bind(&path).await {
                        Ok(server) => server,
                        Err(_) => return,
                    };
                    let _ = started_tx.try_send(());
                    let channel = match RequestChannel::start(
                        server,
                        Framing::length_prefixed(),
                        Arc::new(JsonCodec),
                        registry.clone(),
                        ChannelOptions {
                            label: "test-server".to_string(),
                            ..ChannelOptions::default()
                        },
                    )
                    .await
                    {
                        Ok(channel) => Arc::new(channel),
                        Err(_) => return,
                    };
                    *current.lock() = Some(Arc::clone(&channel));

                    let events = channel.events();
                    while let Ok(event) = events.recv_async().await {
                        if matches!(event, ChannelEvent::Down(_)) {
                            break;
                        }
                    }
                    *current.lock() = None;

                    if rebind_rx.recv_async().await.is_err() {
                        return;
                    }
                }
            })
        };

        // Listener exists before anyone dials.
        let _ = started_rx.recv_async().await;

        Self {
            path,
            current,
            rebind_tx,
            seen: seen_rx,
            _task: task,
        }
    }

    /// Drop the current connection without re-binding.
    async fn kill_connection(&self) {
        let channel = self.current.lock().clone();
        if let Some(channel) = channel {
            channel.close().await;
        }
    }

    fn rebind(&self) {
        let _ = self.rebind_tx.send(());
    }
}

fn no_jitter(options: ReconnectOptions) -> ReconnectOptions {
    ReconnectOptions {
        jitter: 0.0,
        ..options
    }
}

fn noop_link() -> LinkHook {
    Arc::new(|_| {})
}

fn make_manager(
    server: &TestServer,
    options: ReconnectOptions,
) -> (ReconnectManager, flume::Receiver<ManagerEvent>) {
    let (events_tx, events_rx) = flume::unbounded();
    let manager = ReconnectManager::new(
        "test-worker",
        server.path.clone(),
        Arc::new(JsonCodec),
        options,
        Duration::from_secs(5),
        events_tx,
        noop_link(),
    );
    (manager, events_rx)
}

#[compio::test]
async fn queued_requests_flush_fifo_after_backoff() {
    let server = TestServer::start("fifo").await;
    let (manager, events) = make_manager(
        &server,
        no_jitter(ReconnectOptions {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_queue: 10,
            ..ReconnectOptions::default()
        }),
    );

    manager.connect().await.unwrap();
    assert_eq!(
        manager.request("echo", Value::Int(0), None).await.unwrap(),
        Value::Int(0)
    );
    // Drain the probe from the recorder.
    let _ = server.seen.recv_async().await;

    // Drop the link and keep the listener down through two attempts.
    server.kill_connection().await;
    compio::time::sleep(Duration::from_millis(50)).await;
    let down_at = Instant::now();
    assert!(manager.is_reconnecting());

    // Five requests queue while disconnected. The stagger pins their
    // enqueue order.
    let mut callers = Vec::new();
    for n in 1..=5 {
        let manager = manager.clone();
        callers.push(compio::runtime::spawn(async move {
            manager.request("echo", Value::Int(n), None).await
        }));
        compio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(manager.queue_len(), 5);

    // Attempts 1 (100 ms) and 2 (200 ms) fail; the listener returns in
    // time for attempt 3 (400 ms).
    compio::time::sleep(Duration::from_millis(380)).await;
    server.rebind();

    for (expected, caller) in (1..=5).zip(callers) {
        assert_eq!(caller.await.unwrap(), Value::Int(expected));
    }
    let elapsed = down_at.elapsed();
    assert!(
        elapsed >= Duration::from_millis(650),
        "reconnected too early: {elapsed:?}"
    );

    // The server saw the queued requests in FIFO order.
    for expected in 1..=5 {
        let seen = server.seen.recv_async().await.unwrap();
        assert_eq!(seen, Value::Int(expected));
    }

    // The monitor reported the third attempt as the winner.
    let mut reconnected_attempt = None;
    while let Ok(event) = events.try_recv() {
        if let ManagerEvent::Reconnected { attempt, .. } = event {
            reconnected_attempt = Some(attempt);
        }
    }
    assert_eq!(reconnected_attempt, Some(3));

    manager.close().await;
}

#[compio::test]
async fn queueing_disabled_fails_fast() {
    let server = TestServer::start("noqueue").await;
    let (manager, _events) = make_manager(
        &server,
        no_jitter(ReconnectOptions {
            queue_requests: false,
            ..ReconnectOptions::default()
        }),
    );

    manager.connect().await.unwrap();
    server.kill_connection().await;
    compio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let err = manager
        .request("echo", Value::Int(1), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "channel_closed");
    assert!(started.elapsed() < Duration::from_millis(50));

    manager.close().await;
}

#[compio::test]
async fn full_queue_rejects_immediately() {
    let server = TestServer::start("full").await;
    let (manager, _events) = make_manager(
        &server,
        no_jitter(ReconnectOptions {
            max_queue: 2,
            // Keep the loop slow so the queue stays put.
            initial_delay: Duration::from_secs(5),
            ..ReconnectOptions::default()
        }),
    );

    manager.connect().await.unwrap();
    server.kill_connection().await;
    compio::time::sleep(Duration::from_millis(50)).await;

    let mut queued = Vec::new();
    for n in 0..2 {
        let manager = manager.clone();
        queued.push(compio::runtime::spawn(async move {
            manager.request("echo", Value::Int(n), None).await
        }));
    }
    compio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(manager.queue_len(), 2);

    let err = manager
        .request("echo", Value::Int(9), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "queue_full");

    // Closing rejects whatever is still queued.
    manager.close().await;
    for caller in queued {
        assert!(caller.await.is_err());
    }
}

#[compio::test]
async fn bounded_attempts_give_up_and_reject_queue() {
    let server = TestServer::start("giveup").await;
    let (manager, events) = make_manager(
        &server,
        no_jitter(ReconnectOptions {
            initial_delay: Duration::from_millis(50),
            max_attempts: Some(2),
            ..ReconnectOptions::default()
        }),
    );

    manager.connect().await.unwrap();
    server.kill_connection().await;
    compio::time::sleep(Duration::from_millis(50)).await;

    let queued = {
        let manager = manager.clone();
        compio::runtime::spawn(async move {
            manager.request("echo", Value::Int(1), None).await
        })
    };

    // 50 + 100 ms attempts, then surrender.
    let err = queued.await.unwrap_err();
    assert_eq!(err.code(), "timeout");

    let mut failed = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ManagerEvent::ReconnectFailed { .. }) {
            failed = true;
        }
    }
    assert!(failed, "expected a reconnect-failed event");

    // Later requests fail fast instead of queueing forever.
    let err = manager
        .request("echo", Value::Int(2), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "channel_closed");

    manager.close().await;
}
