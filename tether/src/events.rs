//! Manager lifecycle events.
//!
//! An event stream for tracking worker lifecycles: spawns, handshakes,
//! heartbeat misses, exits, restarts, and reconnect progress. Purely
//! observational; supervision logic never depends on anyone draining
//! the monitor.

use std::fmt;
use std::time::Duration;

use tether_rpc::reserved::WorkerInfo;

use crate::handle::HandleState;

/// How a worker process left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// `true` only when the worker completed the shutdown protocol.
    pub graceful: bool,
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.graceful, self.code, self.signal) {
            (true, code, _) => write!(f, "graceful exit (code {:?})", code),
            (false, _, Some(sig)) => write!(f, "killed by signal {sig}"),
            (false, code, None) => write!(f, "non-graceful exit (code {:?})", code),
        }
    }
}

/// Worker lifecycle events.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// A child process was forked.
    Spawned { id: String },

    /// The handshake completed and the worker identified itself.
    HandshakeCompleted { id: String, worker: WorkerInfo },

    /// A handle moved to a new state.
    StateChanged { id: String, state: HandleState },

    /// A heartbeat ping went unanswered.
    HeartbeatMissed { id: String, misses: u32 },

    /// The miss budget was exhausted.
    HeartbeatDead { id: String },

    /// The worker's data channel reported an error.
    DataChannelError { id: String, message: String },

    /// A reconnect attempt is about to sleep then dial.
    ReconnectAttempt {
        id: String,
        attempt: u32,
        delay: Duration,
    },

    /// The data channel came back.
    Reconnected { id: String, attempt: u32 },

    /// Reconnection was abandoned; queued requests were rejected.
    ReconnectFailed { id: String },

    /// A queued data-channel request expired before reconnect.
    QueuedRequestExpired { id: String, method: String },

    /// The OS process exited.
    Exited { id: String, exit: ExitInfo },

    /// A restart attempt is scheduled.
    Restarting {
        id: String,
        attempt: u32,
        delay: Duration,
    },

    /// The restart budget for the window is spent.
    RestartBudgetExhausted { id: String },

    /// The handle reached its terminal state and left the directory.
    Stopped { id: String },
}

impl ManagerEvent {
    /// Logical worker id the event concerns.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        match self {
            Self::Spawned { id }
            | Self::HandshakeCompleted { id, .. }
            | Self::StateChanged { id, .. }
            | Self::HeartbeatMissed { id, .. }
            | Self::HeartbeatDead { id }
            | Self::DataChannelError { id, .. }
            | Self::ReconnectAttempt { id, .. }
            | Self::Reconnected { id, .. }
            | Self::ReconnectFailed { id }
            | Self::QueuedRequestExpired { id, .. }
            | Self::Exited { id, .. }
            | Self::Restarting { id, .. }
            | Self::RestartBudgetExhausted { id }
            | Self::Stopped { id } => id,
        }
    }
}

/// Handle for receiving manager events.
pub type ManagerMonitor = flume::Receiver<ManagerEvent>;

/// Internal sender side of the monitor.
pub(crate) type ManagerEventSender = flume::Sender<ManagerEvent>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_id_extraction() {
        let event = ManagerEvent::HeartbeatDead {
            id: "w1".to_string(),
        };
        assert_eq!(event.worker_id(), "w1");
    }

    #[test]
    fn exit_info_display() {
        let exit = ExitInfo {
            graceful: false,
            code: None,
            signal: Some(9),
        };
        assert_eq!(exit.to_string(), "killed by signal 9");
    }
}
