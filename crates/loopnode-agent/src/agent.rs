//! Session supervisor
//!
//! Runs the connection state machine: connect → hello → route events →
//! reconnect with backoff, honoring server cooldowns, forever — only
//! `stop()` ends it. One supervisor task and one keepalive task live for
//! the agent's lifetime; everything session-scoped (tunnel manager,
//! proxy worker, outbound pump) is rebuilt per connection.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use loopnode_proto::NodeMessage;
use loopnode_ws::{WsEvent, WsSession};

use crate::clock::now_ms;
use crate::config::AgentConfig;
use crate::ipinfo::{HttpFetcher, IpInfoReporter, PageFetcher};
use crate::outbound::{outbound_channel, send_message, OutboundFrame, OutboundTx};
use crate::proxy::ProxyWorker;
use crate::router::Router;
use crate::stats::{NoopStats, SharedStats, StatsEvent};
use crate::store::{resolve_node_id, FileStore, SecretStore, StoreError};
use crate::tunnel::TunnelManager;

/// Errors that can occur in the agent
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    FatalInit(String),

    #[error("Agent already running")]
    AlreadyRunning,

    #[error("State store error: {0}")]
    Store(#[from] StoreError),
}

/// Supervisor state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionStatus {
    Idle = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
    Stopping = 4,
    Stopped = 5,
}

impl SessionStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Reconnecting,
            4 => Self::Stopping,
            5 => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

/// Counters and deadlines shared between the supervisor, the router, and
/// the keepalive task. Plain atomics; no lock is ever held across I/O.
#[derive(Default)]
pub struct SessionShared {
    status: AtomicU8,
    pub connected: AtomicBool,
    pub connected_since_ms: AtomicI64,
    pub cooldown_until_ms: AtomicI64,
    pub reconnect_attempt: AtomicU32,
    pub total_connections: AtomicU64,
    pub total_disconnections: AtomicU64,
}

impl SessionShared {
    pub fn set_status(&self, status: SessionStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::SeqCst))
    }
}

/// Handles into the currently connected session, for the keepalive task
/// and `stop()`.
#[derive(Clone)]
struct ActiveHandles {
    outbound: OutboundTx,
    tunnels: TunnelManager,
}

struct AgentInner {
    config: AgentConfig,
    node_id: String,
    device_model: String,
    store: Arc<dyn SecretStore>,
    stats: SharedStats,
    fetcher: Arc<dyn PageFetcher>,
    shared: Arc<SessionShared>,
    active: Mutex<Option<ActiveHandles>>,
    running_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// The edge node agent. Owns every component; `start()` spawns the
/// supervisor and keepalive tasks, `stop()` winds everything down.
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    /// Create an agent with the default file store, stats sink, and HTTP
    /// fetcher.
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let store: Arc<dyn SecretStore> = match &config.state_dir {
            Some(dir) => Arc::new(FileStore::open(dir)?),
            None => Arc::new(FileStore::open_default()?),
        };
        Self::with_parts(config, store, Arc::new(NoopStats), Arc::new(HttpFetcher))
    }

    /// Create an agent with explicit collaborators (tests inject memory
    /// stores and scripted fetchers here).
    pub fn with_parts(
        config: AgentConfig,
        store: Arc<dyn SecretStore>,
        stats: SharedStats,
        fetcher: Arc<dyn PageFetcher>,
    ) -> Result<Self, AgentError> {
        let node_id = match &config.node_id {
            Some(id) if id.trim().is_empty() => {
                return Err(AgentError::FatalInit("node id is empty".to_string()))
            }
            Some(id) => id.clone(),
            None => resolve_node_id(store.as_ref()),
        };

        let device_model = config.device_model.clone().unwrap_or_else(|| {
            format!("{} {}", std::env::consts::OS, std::env::consts::ARCH)
        });

        let (running_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(AgentInner {
                config,
                node_id,
                device_model,
                store,
                stats,
                fetcher,
                shared: Arc::new(SessionShared::default()),
                active: Mutex::new(None),
                running_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Start the supervisor. Returns immediately; the agent reconnects
    /// forever in the background until `stop()`.
    pub async fn start(&self) -> Result<(), AgentError> {
        if *self.inner.running_tx.borrow() {
            return Err(AgentError::AlreadyRunning);
        }
        self.inner.running_tx.send_replace(true);

        info!(
            node_id = %self.inner.node_id,
            server_url = %self.inner.config.server_url,
            "Starting agent"
        );

        let mut tasks = self.inner.tasks.lock().await;

        let supervisor = {
            let inner = self.inner.clone();
            let running_rx = self.inner.running_tx.subscribe();
            tokio::spawn(async move { connection_loop(inner, running_rx).await })
        };
        let keepalive = {
            let inner = self.inner.clone();
            let running_rx = self.inner.running_tx.subscribe();
            tokio::spawn(async move { keepalive_loop(inner, running_rx).await })
        };
        tasks.push(supervisor);
        tasks.push(keepalive);

        Ok(())
    }

    /// Stop cooperatively: flag, close tunnels, disconnect, join tasks.
    pub async fn stop(&self) {
        if !*self.inner.running_tx.borrow() {
            return;
        }

        info!(node_id = %self.inner.node_id, "Stopping agent");
        self.inner.shared.set_status(SessionStatus::Stopping);
        self.inner.running_tx.send_replace(false);

        let handles = self.inner.active.lock().await.clone();
        if let Some(handles) = handles {
            handles.tunnels.close_all().await;
        }

        let mut tasks = self.inner.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }

        self.inner.shared.set_status(SessionStatus::Stopped);
        let (connections, disconnections) = self.connection_stats();
        info!(connections, disconnections, "Agent stopped");
    }

    pub fn is_running(&self) -> bool {
        *self.inner.running_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.shared.connected.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.shared.status()
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    /// Total successful connections and disconnections since creation.
    pub fn connection_stats(&self) -> (u64, u64) {
        (
            self.inner.shared.total_connections.load(Ordering::SeqCst),
            self.inner.shared.total_disconnections.load(Ordering::SeqCst),
        )
    }

    pub async fn active_tunnel_count(&self) -> usize {
        let handles = self.inner.active.lock().await.clone();
        match handles {
            Some(handles) => handles.tunnels.active_count().await,
            None => 0,
        }
    }
}

/// Delay before reconnect attempt `attempt` (0-based): exponential from
/// the base, capped, for the fast attempts; then the slow cadence
/// forever. Cooldowns bypass this entirely.
pub(crate) fn reconnect_delay(attempt: u32, config: &AgentConfig) -> Duration {
    if attempt <= config.reconnect_fast_attempts {
        let base = config.reconnect_base.as_millis() as u64;
        let ms = base.saturating_mul(1u64 << attempt.min(10));
        Duration::from_millis(ms.min(config.reconnect_max.as_millis() as u64))
    } else {
        config.reconnect_slow
    }
}

async fn connection_loop(inner: Arc<AgentInner>, mut running_rx: watch::Receiver<bool>) {
    while *running_rx.borrow() {
        inner.shared.set_status(SessionStatus::Connecting);
        debug!(url = %inner.config.server_url, "Connecting to gateway");

        match WsSession::connect(
            &inner.config.server_url,
            inner.config.connect_timeout,
            inner.config.insecure_skip_verify,
        )
        .await
        {
            Ok(session) => run_session(&inner, session, &mut running_rx).await,
            Err(e) => warn!(error = %e, "Gateway connect failed"),
        }

        if !*running_rx.borrow() {
            break;
        }

        let attempt = inner.shared.reconnect_attempt.fetch_add(1, Ordering::SeqCst);
        inner.shared.set_status(SessionStatus::Reconnecting);

        let cooldown_remaining = inner.shared.cooldown_until_ms.load(Ordering::SeqCst) - now_ms();
        let delay = if cooldown_remaining > 0 {
            info!(
                remaining_sec = cooldown_remaining / 1000,
                "Honoring server cooldown before reconnect"
            );
            inner.shared.cooldown_until_ms.store(0, Ordering::SeqCst);
            Duration::from_millis(cooldown_remaining as u64)
        } else {
            let delay = reconnect_delay(attempt, &inner.config);
            info!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting after delay"
            );
            delay
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = running_rx.changed() => {}
        }
    }

    inner.shared.set_status(SessionStatus::Stopped);
    debug!("Connection loop ended");
}

/// Drive one connected session until it drops or `stop()` is called.
async fn run_session(
    inner: &Arc<AgentInner>,
    mut session: WsSession,
    running_rx: &mut watch::Receiver<bool>,
) {
    let shared = &inner.shared;
    shared.set_status(SessionStatus::Connected);
    shared.connected.store(true, Ordering::SeqCst);
    shared.connected_since_ms.store(now_ms(), Ordering::SeqCst);
    shared.reconnect_attempt.store(0, Ordering::SeqCst);
    let connection = shared.total_connections.fetch_add(1, Ordering::SeqCst) + 1;
    inner.stats.record(StatsEvent::Connected);
    info!(connection, "Connected to gateway");

    let writer = session.writer();

    // Everything the session-scoped components emit funnels through one
    // channel into the session's send mutex.
    let (outbound_tx, mut outbound_rx) = outbound_channel();
    let mut pump = {
        let writer = writer.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let result = match frame {
                    OutboundFrame::Text(text) => writer.send_text(&text).await,
                    OutboundFrame::Binary(data) => writer.send_binary(&data).await,
                };
                if let Err(e) = result {
                    debug!(error = %e, "Outbound pump stopping");
                    break;
                }
            }
        })
    };

    let tunnels = TunnelManager::new(outbound_tx.clone(), inner.stats.clone());
    let proxy = ProxyWorker::new(outbound_tx.clone(), inner.stats.clone());
    let router = Router::new(
        tunnels.clone(),
        proxy,
        shared.clone(),
        inner.config.tunnel_connect_timeout,
    );

    *inner.active.lock().await = Some(ActiveHandles {
        outbound: outbound_tx.clone(),
        tunnels: tunnels.clone(),
    });

    if let Err(e) = writer
        .send_text(&NodeMessage::hello(&inner.node_id, &inner.device_model).encode())
        .await
    {
        warn!(error = %e, "Failed to send hello");
    }

    // IP info runs detached; its lifetime is bounded by its fetch
    // timeouts, not by the session.
    {
        let reporter = IpInfoReporter::new(
            inner.store.clone(),
            inner.fetcher.clone(),
            inner.config.ip_check_cooldown,
        );
        let outbound = outbound_tx.clone();
        let node_id = inner.node_id.clone();
        let device_model = inner.device_model.clone();
        let stats = inner.stats.clone();
        tokio::spawn(async move {
            reporter.report(&outbound, &node_id, &device_model, &stats).await;
        });
    }

    let reason: String = loop {
        tokio::select! {
            event = session.next_event() => match event {
                Some(WsEvent::Text(text)) => {
                    if let Some(reason) = router.handle_text(&text).await {
                        break reason;
                    }
                }
                Some(WsEvent::Binary(data)) => router.handle_binary(&data).await,
                Some(WsEvent::Closed { reason }) => break reason.to_string(),
                None => break loopnode_ws::session::REASON_READ_ERROR.to_string(),
            },
            // The pump only exits mid-session when a send failed.
            _ = &mut pump => break "write_error".to_string(),
            _ = running_rx.changed() => {
                if !*running_rx.borrow() {
                    break "stop_called".to_string();
                }
            }
        }
    };

    session.shutdown(&reason).await;
    pump.abort();
    *inner.active.lock().await = None;
    tunnels.close_all().await;

    shared.connected.store(false, Ordering::SeqCst);
    shared.total_disconnections.fetch_add(1, Ordering::SeqCst);
    inner.stats.record(StatsEvent::Disconnected);

    let connected_sec =
        now_ms().saturating_sub(shared.connected_since_ms.load(Ordering::SeqCst)) / 1000;
    info!(reason = %reason, connected_sec, "Disconnected from gateway");
}

async fn keepalive_loop(inner: Arc<AgentInner>, mut running_rx: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(inner.config.keepalive_interval);
    interval.tick().await; // first tick completes immediately

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if !*running_rx.borrow() {
                    break;
                }
                let handles = inner.active.lock().await.clone();
                if let Some(handles) = handles {
                    let uptime_sec = (now_ms()
                        .saturating_sub(inner.shared.connected_since_ms.load(Ordering::SeqCst))
                        / 1000)
                        .max(0) as u64;
                    let active_tunnels = handles.tunnels.active_count().await;
                    send_message(
                        &handles.outbound,
                        NodeMessage::Keepalive {
                            uptime_sec,
                            active_tunnels,
                        },
                    )
                    .await;
                    debug!(uptime_sec, active_tunnels, "Keepalive sent");
                }
            }
            _ = running_rx.changed() => {
                if !*running_rx.borrow() {
                    break;
                }
            }
        }
    }

    debug!("Keepalive loop ended");
}
