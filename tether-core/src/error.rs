/// Tether Error Types
///
/// Comprehensive error handling for every layer of the channel pipeline
/// and the process supervisor.

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::value::Value;

/// Which deadline was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// An outbound request missed its response deadline
    Request,
    /// The initial handshake did not complete in time
    Handshake,
    /// The cooperative shutdown exchange stalled
    Shutdown,
    /// A queued data-channel request expired before reconnect
    Queue,
    /// The reconnect loop exceeded its overall deadline
    Reconnect,
}

impl TimeoutKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Handshake => "handshake",
            Self::Shutdown => "shutdown",
            Self::Queue => "queue",
            Self::Reconnect => "reconnect",
        }
    }
}

/// Supervisor-level failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorKind {
    /// The child process could not be spawned
    Spawn,
    /// The restart budget for the window is exhausted
    RestartBudget,
    /// Too many consecutive heartbeats went unanswered
    HeartbeatDead,
    /// The handshake failed for a logical reason (bad version, bad reply)
    Handshake,
}

impl SupervisorKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Spawn => "spawn",
            Self::RestartBudget => "restart_budget",
            Self::HeartbeatDead => "heartbeat_dead",
            Self::Handshake => "handshake",
        }
    }
}

/// Main error type for tether operations.
///
/// Every variant maps to a stable string code (see [`Error::code`]) so
/// callers can match on failures without string-scraping messages.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Transport-level failure: connect, write, close, or an invalid
    /// state transition
    #[error("Transport error: {0}")]
    Transport(String),

    /// Framing violation: oversized frame, malformed prefix, forbidden
    /// embedded separator
    #[error("Framing error: {0}")]
    Framing(String),

    /// Codec failed to encode or decode a payload
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Wire-level error response or malformed envelope
    #[error("Protocol error {code}: {message}")]
    Protocol {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// A deadline elapsed
    #[error("{} timeout after {:?}", .0.as_str(), .1)]
    Timeout(TimeoutKind, Duration),

    /// The channel closed while a request was pending, or an operation
    /// was attempted on a closed channel
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Process supervision failure
    #[error("Supervisor error ({}): {}", .0.as_str(), .1)]
    Supervisor(SupervisorKind, String),

    /// The reconnect queue is at capacity
    #[error("Reconnect queue full ({capacity} requests)")]
    QueueFull { capacity: usize },

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type alias for tether operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a transport error with a message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a framing error with a message.
    pub fn framing(msg: impl Into<String>) -> Self {
        Self::Framing(msg.into())
    }

    /// Create a serialization error with a message.
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a protocol error from a wire error object.
    pub fn protocol(code: i64, message: impl Into<String>) -> Self {
        Self::Protocol {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Create a channel-closed error with a reason.
    pub fn closed(msg: impl Into<String>) -> Self {
        Self::ChannelClosed(msg.into())
    }

    /// Create a supervisor error.
    pub fn supervisor(kind: SupervisorKind, msg: impl Into<String>) -> Self {
        Self::Supervisor(kind, msg.into())
    }

    /// Stable machine-readable code for this error class.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Framing(_) => "framing",
            Self::Serialization(_) => "serialization",
            Self::Protocol { .. } => "protocol",
            Self::Timeout(..) => "timeout",
            Self::ChannelClosed(_) => "channel_closed",
            Self::Supervisor(..) => "supervisor",
            Self::QueueFull { .. } => "queue_full",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether this error poisons the channel it occurred on.
    ///
    /// Framing, serialization and transport failures corrupt the byte
    /// stream; the channel must close. Protocol errors and timeouts are
    /// per-request and the channel survives them.
    #[must_use]
    pub const fn is_fatal_to_channel(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Framing(_) | Self::Serialization(_)
        )
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_codes() {
        assert_eq!(Error::transport("x").code(), "transport");
        assert_eq!(Error::framing("x").code(), "framing");
        assert_eq!(Error::protocol(-32601, "nope").code(), "protocol");
        assert_eq!(
            Error::Timeout(TimeoutKind::Queue, Duration::from_secs(1)).code(),
            "timeout"
        );
        assert_eq!(Error::QueueFull { capacity: 8 }.code(), "queue_full");
        assert_eq!(Error::Cancelled.code(), "cancelled");
    }

    #[test]
    fn fatality() {
        assert!(Error::framing("too big").is_fatal_to_channel());
        assert!(Error::transport("broken pipe").is_fatal_to_channel());
        assert!(!Error::protocol(-1, "app error").is_fatal_to_channel());
        assert!(!Error::Cancelled.is_fatal_to_channel());
    }

    #[test]
    fn io_conversion() {
        let err: Error = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(err, Error::Transport(_)));
    }
}
