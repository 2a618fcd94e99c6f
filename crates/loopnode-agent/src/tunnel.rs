//! Tunnel manager
//!
//! Registry of outbound TCP connections keyed by tunnel id. Each open
//! tunnel gets one reader task that relays target bytes to the gateway
//! as binary frames; writes from the gateway go through a per-tunnel
//! mutex so chunk order is preserved. Closed ids linger in a
//! recently-closed set so in-flight data racing a close is dropped
//! silently instead of logged as unknown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use loopnode_proto::{encode_tunnel_frame, NodeMessage};

use crate::outbound::{send_binary, send_message, OutboundTx};
use crate::stats::{SharedStats, StatsEvent};

/// Read buffer per tunnel.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// How long a closed id stays in the recently-closed set.
const RECENTLY_CLOSED_TTL: Duration = Duration::from_secs(10);

struct TunnelEntry {
    tunnel_id: String,
    target: String,
    /// Per-tunnel write mutex: one outstanding send, order preserved.
    writer: Mutex<OwnedWriteHalf>,
    /// Signals the reader task to stop.
    shutdown: mpsc::Sender<()>,
    closing: AtomicBool,
    /// Set by whichever path emits the tunnel's one EOF frame.
    eof_sent: AtomicBool,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

impl TunnelEntry {
    async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let _ = self.shutdown.try_send(());
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

#[derive(Default)]
struct Registry {
    active: HashMap<String, Arc<TunnelEntry>>,
    recently_closed: HashMap<String, Instant>,
}

struct Inner {
    registry: Mutex<Registry>,
    outbound: OutboundTx,
    stats: SharedStats,
}

/// Pool of active tunnels for one gateway session.
#[derive(Clone)]
pub struct TunnelManager {
    inner: Arc<Inner>,
}

impl TunnelManager {
    pub fn new(outbound: OutboundTx, stats: SharedStats) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::default()),
                outbound,
                stats,
            }),
        }
    }

    /// Open a tunnel asynchronously. The spawned task connects, reports
    /// the outcome as a `tunnel_response`, and on success becomes the
    /// tunnel's reader.
    pub fn open_tunnel(&self, tunnel_id: String, host: String, port: u16, timeout: Duration) {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.open_and_relay(tunnel_id, host, port, timeout).await;
        });
    }

    async fn open_and_relay(&self, tunnel_id: String, host: String, port: u16, timeout: Duration) {
        let target = format!("{host}:{port}");
        debug!(tunnel_id = %short(&tunnel_id), target = %target, "Opening tunnel");

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(tunnel_id = %short(&tunnel_id), target = %target, error = %e, "Tunnel connect failed");
                self.report_open_failure(&tunnel_id, &target).await;
                return;
            }
            Err(_) => {
                warn!(tunnel_id = %short(&tunnel_id), target = %target, "Tunnel connect timed out");
                self.report_open_failure(&tunnel_id, &target).await;
                return;
            }
        };

        let _ = stream.set_nodelay(true);
        let _ = SockRef::from(&stream).set_keepalive(true);

        let (read_half, write_half) = stream.into_split();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let entry = Arc::new(TunnelEntry {
            tunnel_id: tunnel_id.clone(),
            target: target.clone(),
            writer: Mutex::new(write_half),
            shutdown: shutdown_tx,
            closing: AtomicBool::new(false),
            eof_sent: AtomicBool::new(false),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
        });

        // Register before acking so data racing our response finds the
        // entry. A stale entry under the same id is replaced and closed.
        let displaced = {
            let mut registry = self.inner.registry.lock().await;
            registry.recently_closed.remove(&tunnel_id);
            registry.active.insert(tunnel_id.clone(), entry.clone())
        };
        if let Some(old) = displaced {
            warn!(tunnel_id = %short(&tunnel_id), "Replacing existing tunnel with same id");
            old.close().await;
        }

        self.inner.stats.record(StatsEvent::TunnelOpened);
        info!(tunnel_id = %short(&tunnel_id), target = %target, "Tunnel connected");

        send_message(
            &self.inner.outbound,
            NodeMessage::tunnel_response(&tunnel_id, true, None),
        )
        .await;

        self.relay_loop(entry, read_half, shutdown_rx).await;
    }

    async fn report_open_failure(&self, tunnel_id: &str, target: &str) {
        send_message(
            &self.inner.outbound,
            NodeMessage::tunnel_response(
                tunnel_id,
                false,
                Some(format!("Failed to connect to {target}")),
            ),
        )
        .await;
    }

    /// Per-tunnel reader: relays every chunk from the target to the
    /// gateway. On EOF it emits exactly one EOF frame and schedules the
    /// close on a fresh task, never from inside itself.
    async fn relay_loop(
        &self,
        entry: Arc<TunnelEntry>,
        mut read_half: OwnedReadHalf,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        let tunnel_id = entry.tunnel_id.clone();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(tunnel_id = %short(&tunnel_id), "Tunnel reader stopping");
                    return;
                }
                result = read_half.read(&mut buf) => match result {
                    Ok(0) => {
                        info!(tunnel_id = %short(&tunnel_id), "Target EOF");
                        if !entry.eof_sent.swap(true, Ordering::SeqCst) {
                            send_binary(
                                &self.inner.outbound,
                                encode_tunnel_frame(&tunnel_id, &[], true),
                            )
                            .await;
                        }
                        self.schedule_close(&tunnel_id);
                        return;
                    }
                    Ok(n) => {
                        entry.bytes_up.fetch_add(n as u64, Ordering::Relaxed);
                        self.inner.stats.record(StatsEvent::TunnelBytesUp(n as u64));
                        if !send_binary(
                            &self.inner.outbound,
                            encode_tunnel_frame(&tunnel_id, &buf[..n], false),
                        )
                        .await
                        {
                            debug!(
                                tunnel_id = %short(&tunnel_id),
                                bytes = n,
                                "Relay dropped, session closed"
                            );
                        }
                    }
                    Err(e) => {
                        if !entry.closing.load(Ordering::SeqCst) {
                            error!(tunnel_id = %short(&tunnel_id), error = %e, "Tunnel read error");
                        }
                        self.schedule_close(&tunnel_id);
                        return;
                    }
                },
            }
        }
    }

    /// Close initiated from a tunnel's own reader runs on a separate
    /// task so the reader never waits on its own teardown.
    fn schedule_close(&self, tunnel_id: &str) {
        let manager = self.clone();
        let tunnel_id = tunnel_id.to_string();
        tokio::spawn(async move {
            manager.close_tunnel(&tunnel_id).await;
        });
    }

    /// Write gateway bytes into a tunnel. Returns false only for ids
    /// that are neither open nor recently closed.
    pub async fn write_tunnel_data(&self, tunnel_id: &str, data: &[u8]) -> bool {
        let entry = {
            let registry = self.inner.registry.lock().await;
            match registry.active.get(tunnel_id) {
                Some(entry) => entry.clone(),
                None => {
                    if registry.recently_closed.contains_key(tunnel_id) {
                        // Close/data race; drop silently.
                        return true;
                    }
                    debug!(tunnel_id = %short(tunnel_id), "Data for unknown tunnel");
                    return false;
                }
            }
        };

        let mut writer = entry.writer.lock().await;
        match writer.write_all(data).await {
            Ok(()) => {
                drop(writer);
                entry.bytes_down.fetch_add(data.len() as u64, Ordering::Relaxed);
                self.inner
                    .stats
                    .record(StatsEvent::TunnelBytesDown(data.len() as u64));
                true
            }
            Err(e) => {
                drop(writer);
                error!(tunnel_id = %short(tunnel_id), error = %e, "Tunnel write error");
                self.schedule_close(tunnel_id);
                false
            }
        }
    }

    /// Idempotent close. Safe from any task, including a tunnel's reader
    /// (which goes through `schedule_close`).
    pub async fn close_tunnel(&self, tunnel_id: &str) {
        let entry = {
            let mut registry = self.inner.registry.lock().await;
            let entry = registry.active.remove(tunnel_id);
            if entry.is_some() {
                registry
                    .recently_closed
                    .insert(tunnel_id.to_string(), Instant::now());
            }
            registry
                .recently_closed
                .retain(|_, closed_at| closed_at.elapsed() < RECENTLY_CLOSED_TTL);
            entry
        };

        if let Some(entry) = entry {
            entry.close().await;
            // Acknowledge the close toward the gateway unless the reader
            // already announced EOF for this tunnel.
            if !entry.eof_sent.swap(true, Ordering::SeqCst) {
                send_binary(
                    &self.inner.outbound,
                    encode_tunnel_frame(tunnel_id, &[], true),
                )
                .await;
            }
            self.inner.stats.record(StatsEvent::TunnelClosed);
            let active = self.inner.registry.lock().await.active.len();
            info!(
                tunnel_id = %short(tunnel_id),
                target = %entry.target,
                bytes_up = entry.bytes_up.load(Ordering::Relaxed),
                bytes_down = entry.bytes_down.load(Ordering::Relaxed),
                active,
                "Tunnel closed"
            );
        }
    }

    /// Close every tunnel: snapshot under the lock, close outside it.
    pub async fn close_all(&self) {
        let entries: Vec<Arc<TunnelEntry>> = {
            let mut registry = self.inner.registry.lock().await;
            let now = Instant::now();
            let ids: Vec<String> = registry.active.keys().cloned().collect();
            for id in ids {
                registry.recently_closed.insert(id, now);
            }
            registry.active.drain().map(|(_, entry)| entry).collect()
        };

        if !entries.is_empty() {
            info!(count = entries.len(), "Closing all tunnels");
        }
        for entry in entries {
            entry.close().await;
            self.inner.stats.record(StatsEvent::TunnelClosed);
        }
    }

    pub async fn active_count(&self) -> usize {
        self.inner.registry.lock().await.active.len()
    }
}

/// First eight characters of a tunnel id, for log lines.
fn short(tunnel_id: &str) -> &str {
    tunnel_id.get(..8).unwrap_or(tunnel_id)
}
