//! Demo worker used by the end-to-end tests.
//!
//! Exposes a handful of handlers with distinct behaviors: `echo` and
//! `add` answer immediately, `slow` and `task` take their time, `fail`
//! always errors, `crash` exits without ceremony, and `block` wedges
//! the whole runtime to simulate a hung worker.

use std::time::Duration;

use tether::worker::{Worker, WorkerOptions};
use tether_core::value::Value;
use tether_rpc::envelope::{codes, WireError};

#[compio::main]
async fn main() {
    tether::dev_tracing::init_tracing();

    let worker = Worker::new(WorkerOptions::named("echo-worker"));

    worker
        .on_request("echo", |ctx| async move { Ok(ctx.params) })
        .unwrap();

    worker
        .on_request("add", |ctx| async move {
            let a = ctx.params.get("a").and_then(Value::as_i64);
            let b = ctx.params.get("b").and_then(Value::as_i64);
            match (a, b) {
                (Some(a), Some(b)) => Ok([("sum".to_string(), Value::Int(a + b))]
                    .into_iter()
                    .collect()),
                _ => Err(WireError::new(
                    codes::INVALID_PARAMS,
                    "add wants integer params a and b",
                )),
            }
        })
        .unwrap();

    worker
        .on_request("slow", |_ctx| async move {
            compio::time::sleep(Duration::from_millis(500)).await;
            Ok(Value::from("finally"))
        })
        .unwrap();

    worker
        .on_request("task", |ctx| async move {
            compio::time::sleep(Duration::from_millis(200)).await;
            Ok([
                ("done".to_string(), Value::Bool(true)),
                ("task".to_string(), ctx.params.get("n").cloned().unwrap_or(Value::Null)),
            ]
            .into_iter()
            .collect())
        })
        .unwrap();

    worker
        .on_request("fail", |_ctx| async move {
            Err(WireError::new(codes::HANDLER_ERROR, "Sync error"))
        })
        .unwrap();

    worker
        .on_request("crash", |_ctx| async move {
            // Simulates a worker falling over mid-request.
            std::process::exit(7)
        })
        .unwrap();

    worker
        .on_notification("block", |_ctx| async move {
            // Wedge the single-threaded runtime: no heartbeats, no
            // shutdown acks, nothing, until the manager gives up on us.
            std::thread::sleep(Duration::from_secs(600));
        })
        .unwrap();

    match worker.run().await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("echo-worker failed: {err}");
            std::process::exit(1);
        }
    }
}
