//! Message router
//!
//! Classifies inbound frames from the session and dispatches them to the
//! tunnel manager and proxy worker. Per-message failures are logged and
//! dropped here; nothing a single message does can take the session
//! down. The one exception is `cooldown`, which asks the supervisor to
//! disconnect — that request travels back as a return value, keeping
//! ownership one-directional.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tracing::{debug, info, warn};

use loopnode_proto::{decode_tunnel_frame, parse_gateway_message, GatewayMessage, Inbound};

use crate::agent::SessionShared;
use crate::clock::now_ms;
use crate::proxy::{ProxyRequestParams, ProxyWorker};
use crate::tunnel::TunnelManager;

/// Dispatches inbound frames for one connected session.
pub struct Router {
    tunnels: TunnelManager,
    proxy: ProxyWorker,
    shared: Arc<SessionShared>,
    tunnel_connect_timeout: Duration,
}

impl Router {
    pub fn new(
        tunnels: TunnelManager,
        proxy: ProxyWorker,
        shared: Arc<SessionShared>,
        tunnel_connect_timeout: Duration,
    ) -> Self {
        Self {
            tunnels,
            proxy,
            shared,
            tunnel_connect_timeout,
        }
    }

    /// Handle one text frame. Returns a disconnect reason when the
    /// gateway asked for one (cooldown).
    pub async fn handle_text(&self, text: &str) -> Option<String> {
        let message = match parse_gateway_message(text) {
            Ok(Inbound::Message(message)) => message,
            Ok(Inbound::Unknown) => {
                let preview: String = text.chars().take(100).collect();
                debug!(preview = %preview, "Unhandled gateway message");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "Dropping malformed gateway message");
                return None;
            }
        };

        match message {
            GatewayMessage::Welcome => {
                info!("Welcome received");
                None
            }
            GatewayMessage::KeepaliveAck => {
                let uptime_sec =
                    now_ms().saturating_sub(self.shared.connected_since_ms.load(Ordering::SeqCst))
                        / 1000;
                debug!(uptime_sec, "Keepalive ACK");
                None
            }
            GatewayMessage::Cooldown { retry_after_sec } => {
                let until = now_ms() + (retry_after_sec as i64) * 1000;
                self.shared.cooldown_until_ms.store(until, Ordering::SeqCst);
                info!(retry_after_sec, "Server cooldown requested");
                Some(format!("server_cooldown_{retry_after_sec}s"))
            }
            GatewayMessage::TunnelOpen {
                tunnel_id,
                host,
                port,
            } => {
                self.tunnels
                    .open_tunnel(tunnel_id, host, port, self.tunnel_connect_timeout);
                None
            }
            GatewayMessage::TunnelData {
                tunnel_id,
                eof,
                data,
            } => {
                if eof {
                    info!(tunnel_id = %tunnel_id, "Tunnel EOF from gateway");
                    self.tunnels.close_tunnel(&tunnel_id).await;
                    return None;
                }
                let Some(data) = data else {
                    debug!(tunnel_id = %tunnel_id, "tunnel_data without payload");
                    return None;
                };
                match BASE64.decode(&data) {
                    Ok(bytes) if !bytes.is_empty() => {
                        self.tunnels.write_tunnel_data(&tunnel_id, &bytes).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(tunnel_id = %tunnel_id, error = %e, "Undecodable tunnel_data payload");
                    }
                }
                None
            }
            GatewayMessage::ProxyRequest {
                request_id,
                url,
                method,
                headers,
                body,
                timeout_ms,
            } => {
                self.proxy.spawn_request(ProxyRequestParams {
                    request_id,
                    url,
                    method,
                    headers,
                    body_base64: body,
                    timeout: Duration::from_millis(timeout_ms),
                });
                None
            }
        }
    }

    /// Handle one binary frame: the 37-byte-header tunnel relay format.
    pub async fn handle_binary(&self, data: &[u8]) {
        let Some(frame) = decode_tunnel_frame(data) else {
            debug!(len = data.len(), "Ignoring short binary frame");
            return;
        };

        if frame.eof {
            info!(tunnel_id = %frame.tunnel_id, "Binary EOF from gateway");
            self.tunnels.close_tunnel(&frame.tunnel_id).await;
        } else if !frame.payload.is_empty() {
            self.tunnels
                .write_tunnel_data(&frame.tunnel_id, &frame.payload)
                .await;
        }
    }
}
