//! Agent configuration

use std::path::PathBuf;
use std::time::Duration;

/// Default gateway endpoint.
pub const DEFAULT_SERVER_URL: &str = "wss://gateway.iploop.io:9443/ws";

/// Configuration for the agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Gateway WebSocket URL (`ws://` or `wss://`).
    pub server_url: String,

    /// Stable node identifier. When unset, one is loaded from the secret
    /// store or generated and persisted on first run.
    pub node_id: Option<String>,

    /// Informational device description sent in `hello`. Defaults to
    /// `"<os> <arch>"`.
    pub device_model: Option<String>,

    /// Directory for persisted state. Defaults to `~/.loopnode`.
    pub state_dir: Option<PathBuf>,

    /// Skip gateway certificate verification (insecure, development only).
    pub insecure_skip_verify: bool,

    /// Session TCP + TLS + upgrade deadline.
    pub connect_timeout: Duration,

    /// Default deadline for outbound tunnel connects.
    pub tunnel_connect_timeout: Duration,

    /// Interval between `keepalive` messages while connected.
    pub keepalive_interval: Duration,

    /// First reconnect delay; doubles per attempt.
    pub reconnect_base: Duration,

    /// Cap on the exponential delay during the fast phase.
    pub reconnect_max: Duration,

    /// Number of fast (exponential) attempts before dropping to the slow
    /// cadence.
    pub reconnect_fast_attempts: u32,

    /// Delay between attempts after the fast phase. The agent never
    /// gives up.
    pub reconnect_slow: Duration,

    /// Minimum interval between public-IP re-checks.
    pub ip_check_cooldown: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            node_id: None,
            device_model: None,
            state_dir: None,
            insecure_skip_verify: false,
            connect_timeout: Duration::from_secs(15),
            tunnel_connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(55),
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            reconnect_fast_attempts: 15,
            reconnect_slow: Duration::from_secs(600),
            ip_check_cooldown: Duration::from_secs(3600),
        }
    }
}

impl AgentConfig {
    pub fn with_server_url(mut self, url: &str) -> Self {
        self.server_url = url.to_string();
        self
    }

    pub fn with_node_id(mut self, node_id: &str) -> Self {
        self.node_id = Some(node_id.to_string());
        self
    }

    pub fn with_device_model(mut self, model: &str) -> Self {
        self.device_model = Some(model.to_string());
        self
    }

    pub fn with_state_dir(mut self, dir: PathBuf) -> Self {
        self.state_dir = Some(dir);
        self
    }

    pub fn with_insecure_skip_verify(mut self, insecure: bool) -> Self {
        self.insecure_skip_verify = insecure;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }
}
