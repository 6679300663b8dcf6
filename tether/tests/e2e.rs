//! End-to-end scenarios against the `echo-worker` demo binary.

#![cfg(unix)]

use std::time::{Duration, Instant};

use tether::prelude::*;
use tether::{DataChannelOptions, HeartbeatOptions, RestartBackoff, RestartPolicy, ShutdownOptions};
use tether_core::value::Value;

fn worker_bin() -> &'static str {
    env!("CARGO_BIN_EXE_echo-worker")
}

fn quick_config() -> ManagerConfig {
    ManagerConfig::default().with_default_timeout(Duration::from_secs(5))
}

async fn wait_for<F: Fn() -> bool>(what: &str, deadline: Duration, check: F) {
    let started = Instant::now();
    while !check() {
        assert!(
            started.elapsed() < deadline,
            "timed out waiting for {what}"
        );
        compio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn map(entries: &[(&str, i64)]) -> Value {
    entries
        .iter()
        .map(|(k, v)| ((*k).to_string(), Value::Int(*v)))
        .collect()
}

#[compio::test]
async fn echo_happy_path() {
    let manager = ProcessManager::new(quick_config());
    let worker = manager
        .spawn(SpawnOptions::new(worker_bin()).with_id("echo-e2e"))
        .await
        .unwrap();

    assert_eq!(worker.state(), HandleState::Ready);
    assert!(worker.pid().is_some());
    assert_eq!(
        worker.worker_info().map(|info| info.name),
        Some("echo-worker".to_string())
    );

    let params = map(&[("a", 1)]);
    assert_eq!(worker.request("echo", params.clone()).await.unwrap(), params);

    let sum = worker.request("add", map(&[("a", 2), ("b", 3)])).await.unwrap();
    assert_eq!(sum.get("sum").and_then(Value::as_i64), Some(5));

    manager.shutdown_all().await;
}

#[compio::test]
async fn handler_error_propagates() {
    let manager = ProcessManager::new(quick_config());
    let worker = manager
        .spawn(SpawnOptions::new(worker_bin()).with_id("fail-e2e"))
        .await
        .unwrap();

    let err = worker.request("fail", Value::empty_map()).await.unwrap_err();
    assert_eq!(err.code(), "protocol");
    assert!(err.to_string().contains("Sync error"));

    // The channel survives the handler failure.
    assert_eq!(
        worker.request("echo", Value::Int(5)).await.unwrap(),
        Value::Int(5)
    );

    manager.shutdown_all().await;
}

#[compio::test]
async fn request_timeout_then_fast_request() {
    let manager = ProcessManager::new(quick_config());
    let worker = manager
        .spawn(SpawnOptions::new(worker_bin()).with_id("slow-e2e"))
        .await
        .unwrap();

    let err = worker
        .request_with(
            "slow",
            Value::empty_map(),
            tether_rpc::channel::RequestOptions {
                timeout: Some(Duration::from_millis(100)),
                cancel: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "timeout");

    let started = Instant::now();
    assert_eq!(
        worker.request("echo", Value::Int(1)).await.unwrap(),
        Value::Int(1)
    );
    assert!(started.elapsed() < Duration::from_millis(250));

    manager.shutdown_all().await;
}

#[compio::test]
async fn graceful_shutdown_drains_in_flight() {
    let manager = ProcessManager::new(quick_config());
    let worker = manager
        .spawn(SpawnOptions::new(worker_bin()).with_id("drain-e2e"))
        .await
        .unwrap();

    // Three 200 ms tasks in flight when shutdown starts.
    let mut tasks = Vec::new();
    for n in 0..3 {
        let handle = worker.clone();
        tasks.push(compio::runtime::spawn(async move {
            handle.request("task", map(&[("n", n)])).await
        }));
    }
    compio::time::sleep(Duration::from_millis(50)).await;

    let outcome = worker.shutdown(ShutdownReason::UserRequested).await.unwrap();
    assert!(outcome.graceful, "expected graceful outcome, got {outcome:?}");
    assert_eq!(outcome.exit_code, Some(0));

    for task in tasks {
        let reply = task.await.unwrap();
        assert_eq!(reply.get("done").and_then(Value::as_bool), Some(true));
    }

    wait_for("handle to leave the directory", Duration::from_secs(2), || {
        manager.get("drain-e2e").is_none()
    })
    .await;
    assert_eq!(worker.state(), HandleState::Stopped);

    // New requests are refused after shutdown.
    let err = worker.request("echo", Value::Null).await.unwrap_err();
    assert_eq!(err.code(), "channel_closed");
}

#[compio::test]
async fn hung_worker_is_force_killed() {
    let config = quick_config().with_shutdown(ShutdownOptions {
        enabled: true,
        graceful_timeout: Duration::from_millis(500),
        exit_wait: Duration::from_secs(2),
    });
    let manager = ProcessManager::new(config);
    let worker = manager
        .spawn(SpawnOptions::new(worker_bin()).with_id("hang-e2e"))
        .await
        .unwrap();

    // Wedge the worker's event loop; it will never ack the shutdown.
    worker.notify("block", Value::Null).await.unwrap();
    compio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let outcome = worker.shutdown(ShutdownReason::UserRequested).await.unwrap();
    assert!(!outcome.graceful);
    assert!(
        started.elapsed() < Duration::from_secs(4),
        "force kill took {:?}",
        started.elapsed()
    );

    wait_for("handle to leave the directory", Duration::from_secs(2), || {
        manager.get("hang-e2e").is_none()
    })
    .await;
    assert_eq!(worker.state(), HandleState::Stopped);
}

#[compio::test]
async fn crashed_worker_restarts_with_same_id() {
    let config = quick_config().with_restart(RestartPolicy {
        enabled: true,
        max_restarts: 3,
        window: Duration::from_secs(60),
        backoff: RestartBackoff::Fixed(Duration::from_millis(50)),
    });
    let manager = ProcessManager::new(config);
    let worker = manager
        .spawn(SpawnOptions::new(worker_bin()).with_id("crash-e2e"))
        .await
        .unwrap();
    let first_pid = worker.pid().unwrap();

    // The worker dies mid-request; the in-flight request fails and is
    // not replayed.
    let err = worker.request("crash", Value::empty_map()).await.unwrap_err();
    assert_eq!(err.code(), "channel_closed");

    wait_for("worker to come back ready", Duration::from_secs(5), || {
        worker.state() == HandleState::Ready
    })
    .await;

    let second_pid = worker.pid().unwrap();
    assert_ne!(first_pid, second_pid, "restart must fork a fresh process");
    assert_eq!(
        worker.request("echo", Value::Int(42)).await.unwrap(),
        Value::Int(42)
    );
    // Same logical handle, same directory entry.
    assert!(manager.get("crash-e2e").is_some());

    manager.shutdown_all().await;
}

#[compio::test]
async fn heartbeat_death_triggers_restart() {
    let config = quick_config()
        .with_heartbeat(HeartbeatOptions {
            enabled: true,
            interval: Duration::from_millis(100),
            misses: 2,
        })
        .with_restart(RestartPolicy {
            enabled: true,
            max_restarts: 3,
            window: Duration::from_secs(60),
            backoff: RestartBackoff::Fixed(Duration::from_millis(50)),
        });
    let manager = ProcessManager::new(config);
    let worker = manager
        .spawn(SpawnOptions::new(worker_bin()).with_id("hb-e2e"))
        .await
        .unwrap();
    let first_pid = worker.pid().unwrap();

    worker.notify("block", Value::Null).await.unwrap();

    wait_for("heartbeat-dead restart", Duration::from_secs(10), || {
        worker.state() == HandleState::Ready && worker.pid() != Some(first_pid)
    })
    .await;

    assert_eq!(
        worker.request("echo", Value::from("alive")).await.unwrap(),
        Value::from("alive")
    );

    manager.shutdown_all().await;
}

#[compio::test]
async fn shutdown_is_idempotent() {
    let manager = ProcessManager::new(quick_config());
    let worker = manager
        .spawn(SpawnOptions::new(worker_bin()).with_id("idem-e2e"))
        .await
        .unwrap();

    let first = worker.clone();
    let second = worker.clone();
    let a = compio::runtime::spawn(async move {
        first.shutdown(ShutdownReason::UserRequested).await
    });
    let b = compio::runtime::spawn(async move {
        second.shutdown(ShutdownReason::ManagerShutdown).await
    });

    let a = a.await.unwrap();
    let b = b.await.unwrap();
    assert_eq!(a, b, "concurrent shutdowns must observe one outcome");

    // After completion, another call returns the recorded outcome.
    let c = worker.shutdown(ShutdownReason::UserRequested).await.unwrap();
    assert_eq!(a, c);
}

#[compio::test]
async fn spawn_failure_surfaces_and_leaves_no_handle() {
    let manager = ProcessManager::new(quick_config());
    let err = manager
        .spawn(SpawnOptions::new("/nonexistent/tether-test-binary").with_id("ghost"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "supervisor");
    assert!(manager.get("ghost").is_none());
}

#[compio::test]
async fn duplicate_id_is_rejected() {
    let manager = ProcessManager::new(quick_config());
    let _worker = manager
        .spawn(SpawnOptions::new(worker_bin()).with_id("dup-e2e"))
        .await
        .unwrap();

    let err = manager
        .spawn(SpawnOptions::new(worker_bin()).with_id("dup-e2e"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "supervisor");

    manager.shutdown_all().await;
}

#[compio::test]
async fn data_channel_round_trip() {
    let manager = ProcessManager::new(quick_config());
    let worker = manager
        .spawn(
            SpawnOptions::new(worker_bin())
                .with_id("data-e2e")
                .with_data_channel(DataChannelOptions::default()),
        )
        .await
        .unwrap();

    // Both channels answer; the worker serves one handler registry.
    let via_data = worker
        .request_via_data("echo", Value::from("bulk"))
        .await
        .unwrap();
    assert_eq!(via_data, Value::from("bulk"));

    let via_control = worker.request("echo", Value::from("small")).await.unwrap();
    assert_eq!(via_control, Value::from("small"));

    manager.shutdown_all().await;
}
