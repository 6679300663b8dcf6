//! Framework-reserved methods.
//!
//! Any method whose name both begins and ends with a double underscore
//! belongs to the framework: handshake, heartbeat, data-channel
//! signaling, and cooperative shutdown. User registrations and user
//! sends of such names are rejected at the API boundary.

use serde::{Deserialize, Serialize};

use tether_core::error::Result;
use tether_core::value::{from_value, to_value, Value};

/// Wire protocol version exchanged in the handshake.
pub const PROTOCOL_VERSION: &str = "1";

pub const HANDSHAKE: &str = "__handshake__";
pub const HEARTBEAT_PING: &str = "__heartbeat_ping__";
pub const DATA_CHANNEL_READY: &str = "__data_channel_ready__";
pub const DATA_CHANNEL_ERROR: &str = "__data_channel_error__";
pub const SHUTDOWN: &str = "__shutdown__";
pub const SHUTDOWN_COMPLETE: &str = "__shutdown_complete__";

/// Capability strings a worker may advertise.
pub mod capabilities {
    pub const HEARTBEAT: &str = "heartbeat";
    pub const DATA_CHANNEL: &str = "data_channel";
}

/// Whether `method` is owned by the framework.
#[must_use]
pub fn is_reserved(method: &str) -> bool {
    method.len() >= 5 && method.starts_with("__") && method.ends_with("__")
}

/// Why a worker is being asked to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownReason {
    UserRequested,
    ManagerShutdown,
    IdleTimeout,
    ErrorThreshold,
    Restart,
    HeartbeatDead,
}

impl ShutdownReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UserRequested => "user_requested",
            Self::ManagerShutdown => "manager_shutdown",
            Self::IdleTimeout => "idle_timeout",
            Self::ErrorThreshold => "error_threshold",
            Self::Restart => "restart",
            Self::HeartbeatDead => "heartbeat_dead",
        }
    }
}

/// `__handshake__` request params (manager → worker).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub version: String,
    pub capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_channel: Option<DataChannelSpec>,
}

/// Data-channel parameters offered in the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataChannelSpec {
    pub path: String,
    pub serialization: String,
}

/// `__handshake__` reply (worker → manager).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeReply {
    pub version: String,
    pub capabilities: Vec<String>,
    pub worker_info: WorkerInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub name: String,
    pub runtime_tag: String,
    pub pid: u32,
}

/// `__heartbeat_ping__` request params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPing {
    pub timestamp: u64,
    pub seq: u64,
}

/// `__heartbeat_ping__` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPong {
    pub timestamp: u64,
    pub seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load: Option<WorkerLoad>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerLoad {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    pub pending_requests: usize,
}

/// `__data_channel_ready__` notification params (worker → manager).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataChannelReady {
    pub path: String,
    pub serialization: String,
}

/// `__data_channel_error__` notification params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataChannelError {
    pub message: String,
}

/// `__shutdown__` request params (manager → worker).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownRequest {
    pub timeout_ms: u64,
    pub reason: ShutdownReason,
}

/// `__shutdown__` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownAck {
    /// Always `"shutting_down"`.
    pub status: String,
    pub pending_requests: usize,
}

impl ShutdownAck {
    pub const STATUS: &'static str = "shutting_down";

    #[must_use]
    pub fn new(pending_requests: usize) -> Self {
        Self {
            status: Self::STATUS.to_string(),
            pending_requests,
        }
    }
}

/// `__shutdown_complete__` notification params (worker → manager).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownComplete {
    pub exit_code: i32,
}

/// Encode a reserved payload for the wire.
pub fn encode<T: Serialize>(payload: &T) -> Result<Value> {
    to_value(payload)
}

/// Decode a reserved payload received from the wire.
pub fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T> {
    from_value(value)
}
