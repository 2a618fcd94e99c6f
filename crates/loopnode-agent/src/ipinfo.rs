//! IP-info reporter
//!
//! After every connect the node reports its public IP and geolocation.
//! Lookups are expensive (two external fetches), so results persist in
//! the secret store and are reused for an hour, or indefinitely while
//! the IP does not change. A failed fetch abandons the report for this
//! session without poisoning the cache.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use loopnode_proto::NodeMessage;

use crate::clock::now_ms;
use crate::outbound::{send_message, OutboundTx};
use crate::stats::{SharedStats, StatsEvent};
use crate::store::{SecretStore, KEY_CACHED_IP, KEY_CACHED_IP_INFO, KEY_LAST_IP_CHECK};

const IP_URL: &str = "https://ip2location.io/ip";
const INFO_URL_BASE: &str = "https://www.ip2location.com/";
const IP_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const INFO_FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Longest plausible textual IP (IPv6).
const MAX_IP_LEN: usize = 45;

/// IP-info errors
#[derive(Debug, Error)]
pub enum IpInfoError {
    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("empty or oversized IP in response")]
    BadIp,

    #[error("geolocation JSON block not found in page")]
    MissingBlock,
}

/// HTTP fetch seam; tests substitute a scripted implementation.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn get_text(&self, url: &str, timeout: Duration) -> Result<String, IpInfoError>;
}

/// Production fetcher backed by reqwest.
pub struct HttpFetcher;

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn get_text(&self, url: &str, timeout: Duration) -> Result<String, IpInfoError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| IpInfoError::Fetch(e.to_string()))?;

        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| IpInfoError::Fetch(e.to_string()))?;

        response
            .text()
            .await
            .map_err(|e| IpInfoError::Fetch(e.to_string()))
    }
}

/// Looks up, caches, and reports public-IP geolocation.
pub struct IpInfoReporter {
    store: Arc<dyn SecretStore>,
    fetcher: Arc<dyn PageFetcher>,
    cooldown: Duration,
}

impl IpInfoReporter {
    pub fn new(
        store: Arc<dyn SecretStore>,
        fetcher: Arc<dyn PageFetcher>,
        cooldown: Duration,
    ) -> Self {
        Self {
            store,
            fetcher,
            cooldown,
        }
    }

    /// Run one report cycle. Called in its own task after `hello`.
    pub async fn report(
        &self,
        outbound: &OutboundTx,
        node_id: &str,
        device_model: &str,
        stats: &SharedStats,
    ) {
        let cached_ip = self.store.get_string(KEY_CACHED_IP);
        let cached_info = self.store.get_string(KEY_CACHED_IP_INFO);
        let last_check = self.store.get_i64(KEY_LAST_IP_CHECK).unwrap_or(0);

        let now = now_ms();
        if let Some(info) = &cached_info {
            if now.saturating_sub(last_check) < self.cooldown.as_millis() as i64 {
                info!("IP check cooldown active, sending cached info");
                self.emit(
                    outbound,
                    node_id,
                    device_model,
                    cached_ip.as_deref().unwrap_or(""),
                    info,
                    0,
                    0,
                    stats,
                )
                .await;
                return;
            }
        }

        let ip_started = Instant::now();
        let ip = match self.fetcher.get_text(IP_URL, IP_FETCH_TIMEOUT).await {
            Ok(body) => body.trim().to_string(),
            Err(e) => {
                warn!(error = %e, "Public IP fetch failed");
                return;
            }
        };
        let ip_fetch_ms = ip_started.elapsed().as_millis() as u64;

        if ip.is_empty() || ip.len() > MAX_IP_LEN {
            warn!(len = ip.len(), "Public IP response rejected");
            return;
        }

        info!(ip = %ip, ip_fetch_ms, "Got public IP");
        if let Err(e) = self.store.put_i64(KEY_LAST_IP_CHECK, now) {
            warn!(error = %e, "Failed to persist IP check time");
        }

        if cached_ip.as_deref() == Some(ip.as_str()) {
            if let Some(info) = &cached_info {
                info!(ip = %ip, "IP unchanged, using cached info");
                self.emit(outbound, node_id, device_model, &ip, info, ip_fetch_ms, 0, stats)
                    .await;
                return;
            }
        }

        info!("IP changed or first fetch, querying geolocation");
        let info_started = Instant::now();
        let page = match self
            .fetcher
            .get_text(&format!("{INFO_URL_BASE}{ip}"), INFO_FETCH_TIMEOUT)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                warn!(error = %e, "Geolocation page fetch failed");
                return;
            }
        };
        let info_fetch_ms = info_started.elapsed().as_millis() as u64;

        let Some(info_json) = extract_info_json(&page) else {
            warn!("Geolocation JSON block not found in page");
            return;
        };

        if let Err(e) = self.store.put_string(KEY_CACHED_IP, &ip) {
            warn!(error = %e, "Failed to persist cached IP");
        }
        if let Err(e) = self.store.put_string(KEY_CACHED_IP_INFO, &info_json) {
            warn!(error = %e, "Failed to persist cached IP info");
        }

        self.emit(
            outbound,
            node_id,
            device_model,
            &ip,
            &info_json,
            ip_fetch_ms,
            info_fetch_ms,
            stats,
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn emit(
        &self,
        outbound: &OutboundTx,
        node_id: &str,
        device_model: &str,
        ip: &str,
        info_json: &str,
        ip_fetch_ms: u64,
        info_fetch_ms: u64,
        stats: &SharedStats,
    ) {
        let message = match NodeMessage::ip_info(
            node_id,
            device_model,
            ip,
            info_json,
            ip_fetch_ms,
            info_fetch_ms,
        ) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Cached IP info is not valid JSON, not sending");
                return;
            }
        };

        if send_message(outbound, message).await {
            stats.record(StatsEvent::IpInfoSent);
            info!("Sent IP info to gateway");
        }
    }
}

/// Pull the geolocation JSON out of the ip2location HTML page: the block
/// between `language-json">` and `</code>`, HTML-unescaped and trimmed.
fn extract_info_json(page: &str) -> Option<String> {
    const START_MARKER: &str = "language-json\">";
    const END_MARKER: &str = "</code>";

    let start = page.find(START_MARKER)? + START_MARKER.len();
    let end = page[start..].find(END_MARKER)? + start;

    let unescaped = html_unescape(&page[start..end]);
    let trimmed = unescaped.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Undo the five entities the page uses. `&quot;` before `&amp;` so a
/// literal `&amp;quot;` does not double-decode.
fn html_unescape(s: &str) -> String {
    s.replace("&quot;", "\"")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&#39;", "'")
}
