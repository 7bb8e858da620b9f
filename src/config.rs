//! Runtime Configuration
//!
//! Plain structs with defaults; `main.rs` fills them from command-line flags.

use std::time::Duration;

/// How long the portal gives its message bus to accept a connection.
pub const DEFAULT_BUS_READY_TIMEOUT: Duration = Duration::from_secs(1);
/// Default deadline for `Portal::wait`.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(600);
/// Per-attempt timeout of a registration/upgrade RPC.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_RPC_ATTEMPTS: usize = 3;
/// Upper bound on one node's participation in one task.
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_CONCURRENT_UNITS: usize = 8;
/// How long the portal keeps watching for a task's done marker after `wait`
/// returned without it. Outlasts a dispatcher's `DEFAULT_DISPATCH_TIMEOUT`.
pub const DEFAULT_MARKER_LINGER: Duration = Duration::from_secs(360);

/// Which node the portal names as dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ElectionPolicy {
    /// The first node that ever registered, for every task.
    #[default]
    FirstRegistered,
    /// A node picked by hashing the task id over the registered nodes.
    TaskHash,
}

/// When `Portal::wait` gives up on the remaining replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum WaitPolicy {
    /// Collect every expected reply; failures are logged along the way.
    #[default]
    AllReplies,
    /// Return as soon as one node reports failure.
    FirstFailure,
}

#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub host: String,
    /// Port of the HTTP RPC server. `0` picks a free port.
    pub rpc_port: u16,
    /// Port of the message bus. `0` picks a free port.
    pub bus_port: u16,
    pub bus_ready_timeout: Duration,
    /// Deadline applied by `Portal::wait`; `None` waits indefinitely.
    pub wait_timeout: Option<Duration>,
    pub wait_policy: WaitPolicy,
    pub election: ElectionPolicy,
    /// After this long a missing done marker is given up on and the task id
    /// becomes reusable.
    pub marker_linger: Duration,
}

impl PortalConfig {
    pub fn rpc_bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.rpc_port)
    }

    pub fn bus_bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.bus_port)
    }
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            rpc_port: 7000,
            bus_port: 7010,
            bus_ready_timeout: DEFAULT_BUS_READY_TIMEOUT,
            wait_timeout: Some(DEFAULT_WAIT_TIMEOUT),
            wait_policy: WaitPolicy::default(),
            election: ElectionPolicy::default(),
            marker_linger: DEFAULT_MARKER_LINGER,
        }
    }
}

/// Limits applied by a node's `JobRunner`.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub dispatch_timeout: Duration,
    pub max_concurrent_units: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
            max_concurrent_units: DEFAULT_MAX_CONCURRENT_UNITS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Stable node identity; a random one is generated when absent.
    pub node_id: Option<String>,
    /// Address this node advertises to the portal.
    pub advertise_addr: String,
    /// `host:port` of the portal's RPC server.
    pub portal_addr: String,
    pub rpc_timeout: Duration,
    pub rpc_attempts: usize,
    pub runner: RunnerConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            advertise_addr: "127.0.0.1".to_string(),
            portal_addr: "127.0.0.1:7000".to_string(),
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            rpc_attempts: DEFAULT_RPC_ATTEMPTS,
            runner: RunnerConfig::default(),
        }
    }
}
