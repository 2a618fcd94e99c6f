//! Edge node agent
//!
//! Holds a persistent WebSocket session to the gateway, opens outbound
//! TCP tunnels and performs HTTP requests on its behalf, and reports
//! cached public-IP geolocation. The [`Agent`] owns everything; spawned
//! tasks get cloneable handles, never globals.

pub mod agent;
mod clock;
pub mod config;
pub mod ipinfo;
pub mod outbound;
pub mod proxy;
pub mod router;
pub mod stats;
pub mod store;
pub mod tunnel;

pub use agent::{Agent, AgentError, SessionStatus};
pub use config::AgentConfig;
pub use ipinfo::{HttpFetcher, IpInfoError, IpInfoReporter, PageFetcher};
pub use stats::{NoopStats, SharedStats, StatsEvent, StatsSink};
pub use store::{FileStore, MemoryStore, SecretStore, StoreError};
pub use tunnel::TunnelManager;
