//! Tether: supervised worker-process IPC.
//!
//! A manager process spawns workers, exchanges request/response and
//! notification traffic with them over framed byte channels, supervises
//! their liveness with heartbeats, restarts them on crash, and drives a
//! cooperative shutdown protocol. Workers expose a registry of named
//! handlers.
//!
//! Channels are layered transport → framing → codec → envelope →
//! correlator (see `tether-core` and `tether-rpc`); this crate adds the
//! process supervisor, the shutdown state machine, the data-channel
//! reconnect manager, and the worker-side runtime.
//!
//! # Manager
//!
//! ```rust,no_run
//! use tether::{ManagerConfig, ProcessManager, SpawnOptions};
//! use tether_core::value::Value;
//!
//! #[compio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = ProcessManager::new(ManagerConfig::default());
//!     let worker = manager
//!         .spawn(SpawnOptions::new("./my-worker").with_id("calc"))
//!         .await?;
//!
//!     let reply = worker.request("echo", Value::from("hi")).await?;
//!     println!("worker said {reply}");
//!
//!     manager.shutdown_all().await;
//!     Ok(())
//! }
//! ```
//!
//! # Worker
//!
//! ```rust,no_run
//! use tether::worker::{Worker, WorkerOptions};
//!
//! #[compio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let worker = Worker::new(WorkerOptions::named("calc"));
//!     worker.on_request("echo", |ctx| async move { Ok(ctx.params) })?;
//!
//!     let code = worker.run().await?;
//!     std::process::exit(code);
//! }
//! ```

#![deny(unsafe_code)]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod dev_tracing;
pub mod events;
pub mod handle;
pub mod manager;
pub mod reconnect;
pub mod shutdown;
pub mod worker;

mod os;

pub use config::{
    DataChannelOptions, HeartbeatOptions, ManagerConfig, ReconnectOptions, RestartBackoff,
    RestartPolicy, ShutdownOptions, SpawnOptions,
};
pub use events::{ExitInfo, ManagerEvent, ManagerMonitor};
pub use handle::{HandleState, ProcessHandle};
pub use manager::{ProcessManager, DATA_CHANNEL_PATH_ENV};
pub use shutdown::ShutdownOutcome;

// Re-export the layers workers and managers are built from.
pub use tether_core;
pub use tether_rpc;

/// Convenient imports for embedding tether.
pub mod prelude {
    pub use crate::config::{ManagerConfig, SpawnOptions};
    pub use crate::events::{ManagerEvent, ManagerMonitor};
    pub use crate::handle::{HandleState, ProcessHandle};
    pub use crate::manager::ProcessManager;
    pub use crate::shutdown::ShutdownOutcome;
    pub use crate::worker::{Worker, WorkerOptions};
    pub use tether_core::error::{Error, Result};
    pub use tether_core::value::Value;
    pub use tether_rpc::reserved::ShutdownReason;
}
