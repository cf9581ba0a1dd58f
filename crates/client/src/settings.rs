//! Start settings for the OpAMP client.

use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use opamp_protocol::messages::{AgentDescription, InstanceUid, RemoteConfigStatus};

use crate::callbacks::Callbacks;
use crate::state::PackagesStateProvider;

/// Transform applied to a clone of the base headers before every connection
/// attempt.
pub type HeaderFunc = Arc<dyn Fn(HeaderMap) -> HeaderMap + Send + Sync>;

/// Heartbeat interval used when [`StartSettings::heartbeat_interval`] is
/// not set.
pub(crate) const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Parameters for starting the client.
#[derive(Clone)]
pub struct StartSettings {
    /// OpAMP server URL. Required.
    pub server_url: String,

    /// Additional HTTP headers sent with every connection attempt.
    pub headers: Option<HeaderMap>,

    /// Optional transform applied over a clone of `headers` per attempt.
    pub header_func: Option<HeaderFunc>,

    /// TLS configuration. When set, the URL scheme is forced to `wss`.
    pub tls_config: Option<Arc<rustls::ClientConfig>>,

    /// Callbacks invoked after `start` returns.
    pub callbacks: Arc<dyn Callbacks>,

    /// Hash of the last connection settings the agent accepted, reported in
    /// the first status message of every connection.
    pub last_connection_settings_hash: Vec<u8>,

    /// Agents managed by this client. At least one.
    pub agents: Vec<AgentSettings>,

    /// Enable compression in both directions. Only effective when the peer
    /// supports it.
    pub enable_compression: bool,

    /// Heartbeat interval. `None` selects the 30 s default; a zero duration
    /// disables heartbeats. Heartbeats also require the `ReportsHeartbeat`
    /// capability.
    pub heartbeat_interval: Option<Duration>,
}

impl StartSettings {
    pub fn new(server_url: impl Into<String>, callbacks: Arc<dyn Callbacks>) -> Self {
        Self {
            server_url: server_url.into(),
            headers: None,
            header_func: None,
            tls_config: None,
            callbacks,
            last_connection_settings_hash: Vec::new(),
            agents: Vec::new(),
            enable_compression: false,
            heartbeat_interval: None,
        }
    }
}

/// Per-agent settings and previously saved state, reported to the server
/// right after the connection is established.
#[derive(Clone)]
pub struct AgentSettings {
    pub instance_uid: InstanceUid,

    /// Capability bits of this agent. `ReportsStatus` is implied and set by
    /// the client.
    pub capabilities: u64,

    /// Last known remote-config status. `None` makes the server send the
    /// remote config again.
    pub remote_config_status: Option<RemoteConfigStatus>,

    /// Access to local package state. `None` disables package syncing for
    /// this agent.
    pub packages_state_provider: Option<Arc<dyn PackagesStateProvider>>,

    pub agent_description: Option<AgentDescription>,
}

impl AgentSettings {
    pub fn new(instance_uid: InstanceUid, capabilities: u64) -> Self {
        Self {
            instance_uid,
            capabilities,
            remote_config_status: None,
            packages_state_provider: None,
            agent_description: None,
        }
    }
}
