//! Manager, spawn, and policy configuration.
//!
//! Every knob carries a default chosen for local worker processes:
//! heartbeats every second with three tolerated misses, a 30 second
//! request timeout, graceful shutdown bounded by five seconds, and
//! reconnect backoff from 100 ms up to 30 s with 10% jitter.

use std::path::PathBuf;
use std::time::Duration;

use tether_core::backoff::Backoff;
use tether_core::codec::{default_registry, CodecRegistry};

/// Top-level configuration for a [`crate::ProcessManager`].
#[derive(Clone)]
pub struct ManagerConfig {
    /// Namespace component of data-channel socket paths.
    pub namespace: String,
    /// Timeout applied to requests without an explicit override.
    pub default_timeout: Duration,
    /// Restart policy applied to workers that do not override it.
    pub restart: RestartPolicy,
    pub shutdown: ShutdownOptions,
    pub heartbeat: HeartbeatOptions,
    /// Codec registry used to resolve negotiated serializations.
    pub registry: CodecRegistry,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            namespace: "tether".to_string(),
            default_timeout: Duration::from_secs(30),
            restart: RestartPolicy::default(),
            shutdown: ShutdownOptions::default(),
            heartbeat: HeartbeatOptions::default(),
            registry: default_registry(),
        }
    }
}

impl ManagerConfig {
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    #[must_use]
    pub fn with_shutdown(mut self, shutdown: ShutdownOptions) -> Self {
        self.shutdown = shutdown;
        self
    }

    #[must_use]
    pub fn with_heartbeat(mut self, heartbeat: HeartbeatOptions) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    #[must_use]
    pub fn with_registry(mut self, registry: CodecRegistry) -> Self {
        self.registry = registry;
        self
    }
}

/// Restart-on-crash policy.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub enabled: bool,
    /// Restarts tolerated inside one `window` before giving up.
    pub max_restarts: u32,
    pub window: Duration,
    pub backoff: RestartBackoff,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_restarts: 3,
            window: Duration::from_secs(60),
            backoff: RestartBackoff::default(),
        }
    }
}

impl RestartPolicy {
    /// An enabled policy with the default budget.
    #[must_use]
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }
}

/// Delay schedule between restart attempts.
#[derive(Debug, Clone)]
pub enum RestartBackoff {
    Fixed(Duration),
    Exponential {
        base: Duration,
        max: Duration,
        multiplier: f64,
    },
}

impl Default for RestartBackoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RestartBackoff {
    /// Delay before 1-based restart `attempt`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Exponential {
                base,
                max,
                multiplier,
            } => {
                let policy = Backoff {
                    initial: *base,
                    max: *max,
                    multiplier: *multiplier,
                    jitter: 0.0,
                };
                policy.base_delay(attempt)
            }
        }
    }
}

/// Cooperative shutdown bounds.
#[derive(Debug, Clone)]
pub struct ShutdownOptions {
    pub enabled: bool,
    /// Budget for the ack / drain / complete exchange.
    pub graceful_timeout: Duration,
    /// How long to wait for the OS exit after a force kill.
    pub exit_wait: Duration,
}

impl Default for ShutdownOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            graceful_timeout: Duration::from_secs(5),
            exit_wait: Duration::from_secs(2),
        }
    }
}

/// Heartbeat liveness probing.
#[derive(Debug, Clone)]
pub struct HeartbeatOptions {
    pub enabled: bool,
    pub interval: Duration,
    /// Consecutive unanswered pings before the worker is declared dead.
    pub misses: u32,
}

impl Default for HeartbeatOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(1),
            misses: 3,
        }
    }
}

/// Data-channel reconnection policy.
#[derive(Debug, Clone)]
pub struct ReconnectOptions {
    pub enabled: bool,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
    /// `None` keeps retrying forever.
    pub max_attempts: Option<u32>,
    /// Queue requests while disconnected instead of failing them.
    pub queue_requests: bool,
    pub max_queue: usize,
    pub queue_timeout: Duration,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
            max_attempts: None,
            queue_requests: true,
            max_queue: 64,
            queue_timeout: Duration::from_secs(60),
        }
    }
}

impl ReconnectOptions {
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff {
            initial: self.initial_delay,
            max: self.max_delay,
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }
}

/// Data-channel request for one spawned worker.
#[derive(Debug, Clone)]
pub struct DataChannelOptions {
    /// Serialization name resolved through the manager's codec registry.
    pub serialization: String,
    pub reconnect: ReconnectOptions,
}

impl Default for DataChannelOptions {
    fn default() -> Self {
        Self {
            serialization: "json".to_string(),
            reconnect: ReconnectOptions::default(),
        }
    }
}

/// How to spawn one worker.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Logical id; auto-generated when `None`.
    pub id: Option<String>,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Extra environment on top of the inherited one.
    pub env: Vec<(String, String)>,
    pub data_channel: Option<DataChannelOptions>,
    /// Overrides the manager-wide restart policy when set.
    pub restart: Option<RestartPolicy>,
}

impl SpawnOptions {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            id: None,
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            data_channel: None,
            restart: None,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn with_data_channel(mut self, data_channel: DataChannelOptions) -> Self {
        self.data_channel = Some(data_channel);
        self
    }

    #[must_use]
    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = Some(restart);
        self
    }
}
