//! Request-channel behavior over a loopback Unix socket pair.

#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use tether_core::codec::JsonCodec;
use tether_core::framing::Framing;
use tether_core::uds::{UnixSocketServer, UnixSocketTransport};
use tether_core::value::Value;
use tether_rpc::channel::{ChannelOptions, RequestChannel, RequestOptions};
use tether_rpc::envelope::{codes, WireError};
use tether_rpc::handlers::{notification_handler, request_handler, HandlerRegistry, RequestCtx};

fn options(label: &str) -> ChannelOptions {
    ChannelOptions {
        default_timeout: Duration::from_secs(5),
        label: label.to_string(),
        ..ChannelOptions::default()
    }
}

/// Bind a socket pair and bring up a channel on each end.
async fn channel_pair(
    test: &str,
    server_registry: HandlerRegistry,
    client_registry: HandlerRegistry,
) -> (RequestChannel, RequestChannel) {
    let path = std::env::temp_dir().join(format!(
        "tether-rpc-{}-{test}.sock",
        std::process::id()
    ));
    let _ = std::fs::remove_file(&path);

    let server_transport = UnixSocketServer::bind(&path).await.unwrap();
    let server_options = options(&format!("server:{test}"));
    let server_task = compio::runtime::spawn(async move {
        RequestChannel::start(
            server_transport,
            Framing::length_prefixed(),
            Arc::new(JsonCodec),
            server_registry,
            server_options,
        )
        .await
        .unwrap()
    });

    let client = RequestChannel::start(
        UnixSocketTransport::new(&path),
        Framing::length_prefixed(),
        Arc::new(JsonCodec),
        client_registry,
        options(&format!("client:{test}")),
    )
    .await
    .unwrap();

    let server = server_task.await;
    (server, client)
}

fn echo_registry() -> HandlerRegistry {
    let registry = HandlerRegistry::new();
    registry
        .on_request(
            "echo",
            request_handler(|ctx: RequestCtx| async move { Ok(ctx.params) }),
        )
        .unwrap();
    registry
}

#[compio::test]
async fn echo_round_trip_both_directions() {
    let (server, client) = channel_pair("echo", echo_registry(), echo_registry()).await;

    let params: Value = [("a".to_string(), Value::Int(1))].into_iter().collect();
    let reply = client.request("echo", params.clone()).await.unwrap();
    assert_eq!(reply, params);

    // The server side can call handlers registered on the client too.
    let reply = server.request("echo", Value::from("back")).await.unwrap();
    assert_eq!(reply, Value::from("back"));

    client.close().await;
    server.close().await;
}

#[compio::test]
async fn handler_error_propagates_and_channel_survives() {
    let registry = echo_registry();
    registry
        .on_request(
            "explode",
            request_handler(|_ctx: RequestCtx| async move {
                Err(WireError::new(codes::HANDLER_ERROR, "Sync error"))
            }),
        )
        .unwrap();
    let (server, client) = channel_pair("handler-error", registry, HandlerRegistry::new()).await;

    let err = client
        .request("explode", Value::empty_map())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "protocol");
    assert!(err.to_string().contains("Sync error"));

    // The failure was per-request; the channel still serves.
    let reply = client.request("echo", Value::Int(2)).await.unwrap();
    assert_eq!(reply, Value::Int(2));

    client.close().await;
    server.close().await;
}

#[compio::test]
async fn unknown_method_is_rejected_not_fatal() {
    let (server, client) =
        channel_pair("unknown-method", echo_registry(), HandlerRegistry::new()).await;

    let err = client
        .request("missing", Value::empty_map())
        .await
        .unwrap_err();
    match err {
        tether_core::error::Error::Protocol { code, .. } => {
            assert_eq!(code, codes::METHOD_NOT_FOUND);
        }
        other => panic!("expected protocol error, got {other}"),
    }

    assert_eq!(
        client.request("echo", Value::Int(1)).await.unwrap(),
        Value::Int(1)
    );

    client.close().await;
    server.close().await;
}

#[compio::test]
async fn request_timeout_then_reuse() {
    let registry = echo_registry();
    registry
        .on_request(
            "slow",
            request_handler(|_ctx: RequestCtx| async move {
                compio::time::sleep(Duration::from_millis(500)).await;
                Ok(Value::Null)
            }),
        )
        .unwrap();
    let (server, client) = channel_pair("timeout", registry, HandlerRegistry::new()).await;

    let started = Instant::now();
    let err = client
        .request_with(
            "slow",
            Value::empty_map(),
            RequestOptions {
                timeout: Some(Duration::from_millis(100)),
                cancel: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "timeout");
    assert!(started.elapsed() < Duration::from_millis(450));

    // The late response is dropped silently and the channel keeps going.
    let reply = client.request("echo", Value::from("after")).await.unwrap();
    assert_eq!(reply, Value::from("after"));

    client.close().await;
    server.close().await;
}

#[compio::test]
async fn close_rejects_pending_and_is_idempotent() {
    let registry = HandlerRegistry::new();
    registry
        .on_request(
            "hang",
            request_handler(|_ctx: RequestCtx| async move {
                compio::time::sleep(Duration::from_secs(30)).await;
                Ok(Value::Null)
            }),
        )
        .unwrap();
    let (server, client) = channel_pair("close-pending", registry, HandlerRegistry::new()).await;

    let client = Arc::new(client);
    let caller = Arc::clone(&client);
    let pending = compio::runtime::spawn(async move {
        caller.request("hang", Value::empty_map()).await
    });

    // Give the request a chance to be written before closing.
    compio::time::sleep(Duration::from_millis(50)).await;
    client.close().await;
    client.close().await; // second close is a no-op

    let err = pending.await.unwrap_err();
    assert_eq!(err.code(), "channel_closed");
    assert!(client.is_closed());

    // Operations after close fail immediately.
    let err = client.request("echo", Value::Null).await.unwrap_err();
    assert_eq!(err.code(), "channel_closed");
    let err = client.notify("tick", Value::Null).await.unwrap_err();
    assert_eq!(err.code(), "channel_closed");

    server.close().await;
}

#[compio::test]
async fn oversized_outbound_frame_closes_the_channel() {
    let path = std::env::temp_dir().join(format!(
        "tether-rpc-{}-oversize.sock",
        std::process::id()
    ));
    let _ = std::fs::remove_file(&path);

    let registry = HandlerRegistry::new();
    registry
        .on_request(
            "hang",
            request_handler(|_ctx: RequestCtx| async move {
                compio::time::sleep(Duration::from_secs(30)).await;
                Ok(Value::Null)
            }),
        )
        .unwrap();
    let server_transport = UnixSocketServer::bind(&path).await.unwrap();
    let server_options = options("server:oversize");
    let server_task = compio::runtime::spawn(async move {
        RequestChannel::start(
            server_transport,
            Framing::length_prefixed(),
            Arc::new(JsonCodec),
            registry,
            server_options,
        )
        .await
        .unwrap()
    });

    // The client caps outbound frames well below what "echo" with a
    // 200-byte string encodes to.
    let client = RequestChannel::start(
        UnixSocketTransport::new(&path),
        Framing::length_prefixed_with_max(64),
        Arc::new(JsonCodec),
        HandlerRegistry::new(),
        options("client:oversize"),
    )
    .await
    .unwrap();
    let server = server_task.await;

    let client = Arc::new(client);
    let caller = Arc::clone(&client);
    let parked = compio::runtime::spawn(async move {
        caller
            .request_with(
                "hang",
                Value::empty_map(),
                RequestOptions {
                    timeout: Some(Duration::from_secs(10)),
                    cancel: None,
                },
            )
            .await
    });
    compio::time::sleep(Duration::from_millis(50)).await;

    let err = client
        .request("echo", Value::from("x".repeat(200)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "framing");

    // The framing violation poisons the stream: the parked request is
    // rejected with the same error and the channel is done.
    let err = parked.await.unwrap_err();
    assert_eq!(err.code(), "framing");
    assert!(client.is_closed());

    let err = client.request("echo", Value::Null).await.unwrap_err();
    assert_eq!(err.code(), "channel_closed");

    server.close().await;
}

#[compio::test]
async fn notifications_are_delivered() {
    let (tx, rx) = flume::unbounded();
    let registry = HandlerRegistry::new();
    registry
        .on_notification(
            "tick",
            notification_handler(move |ctx: RequestCtx| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(ctx.params);
                }
            }),
        )
        .unwrap();
    let (server, client) = channel_pair("notify", registry, HandlerRegistry::new()).await;

    client.notify("tick", Value::Int(9)).await.unwrap();
    let seen = rx.recv_async().await.unwrap();
    assert_eq!(seen, Value::Int(9));

    client.close().await;
    server.close().await;
}

#[compio::test]
async fn reserved_names_are_fenced() {
    let (server, client) =
        channel_pair("reserved", HandlerRegistry::new(), HandlerRegistry::new()).await;

    let err = client
        .on_request(
            "__handshake__",
            request_handler(|_ctx: RequestCtx| async move { Ok(Value::Null) }),
        )
        .unwrap_err();
    assert_eq!(err.code(), "protocol");

    let err = client
        .request("__shutdown__", Value::empty_map())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "protocol");

    let err = client.notify("__shutdown_complete__", Value::Null).await.unwrap_err();
    assert_eq!(err.code(), "protocol");

    client.close().await;
    server.close().await;
}

#[compio::test]
async fn peer_disappearing_fails_pending() {
    let registry = HandlerRegistry::new();
    registry
        .on_request(
            "hang",
            request_handler(|_ctx: RequestCtx| async move {
                compio::time::sleep(Duration::from_secs(30)).await;
                Ok(Value::Null)
            }),
        )
        .unwrap();
    let (server, client) = channel_pair("peer-gone", registry, HandlerRegistry::new()).await;

    let client = Arc::new(client);
    let caller = Arc::clone(&client);
    let pending = compio::runtime::spawn(async move {
        caller
            .request_with(
                "hang",
                Value::empty_map(),
                RequestOptions {
                    timeout: Some(Duration::from_secs(10)),
                    cancel: None,
                },
            )
            .await
    });

    compio::time::sleep(Duration::from_millis(50)).await;
    server.close().await;

    let err = pending.await.unwrap_err();
    assert_eq!(err.code(), "channel_closed");
}

#[compio::test]
async fn caller_cancellation_rejects_locally() {
    let (server, client) = channel_pair("cancel", HandlerRegistry::new(), HandlerRegistry::new()).await;

    let token = tether_core::cancel::CancelToken::new();
    let cancel = token.clone();
    compio::runtime::spawn(async move {
        compio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    })
    .detach();

    let err = client
        .request_with(
            "never-answered",
            Value::empty_map(),
            RequestOptions {
                timeout: Some(Duration::from_secs(10)),
                cancel: Some(token),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "cancelled");
    assert_eq!(client.pending_requests(), 0);

    client.close().await;
    server.close().await;
}
