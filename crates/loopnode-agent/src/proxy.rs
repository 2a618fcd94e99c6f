//! Proxy-request worker
//!
//! One short-lived task per `proxy_request`: perform the HTTP(S) request,
//! cap the body at 1 MiB, and answer with a base64-encoded
//! `proxy_response` on the session. Failures become
//! `{success:false, error}` — they never touch the session state.

use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use thiserror::Error;
use tracing::{debug, info, warn};

use loopnode_proto::{NodeMessage, ProxyResponseData};

use crate::outbound::{send_message, OutboundTx};
use crate::stats::{SharedStats, StatsEvent};

/// Response bodies are truncated to this size.
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// User agent on outbound proxied requests.
const USER_AGENT: &str = concat!("loopnode/", env!("CARGO_PKG_VERSION"));

/// Proxy request errors (reported to the gateway, never propagated)
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid method '{0}'")]
    InvalidMethod(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("{0}")]
    Request(#[from] reqwest::Error),
}

/// Parameters extracted from a `proxy_request` message.
#[derive(Debug, Clone)]
pub struct ProxyRequestParams {
    pub request_id: String,
    pub url: String,
    pub method: String,
    pub headers: Option<serde_json::Value>,
    pub body_base64: Option<String>,
    pub timeout: Duration,
}

/// Spawns one worker task per request.
#[derive(Clone)]
pub struct ProxyWorker {
    outbound: OutboundTx,
    stats: SharedStats,
}

impl ProxyWorker {
    pub fn new(outbound: OutboundTx, stats: SharedStats) -> Self {
        Self { outbound, stats }
    }

    pub fn spawn_request(&self, params: ProxyRequestParams) {
        let worker = self.clone();
        tokio::spawn(async move {
            let request_id = params.request_id.clone();
            let started = Instant::now();

            let data = match perform_request(params).await {
                Ok((status, body)) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    info!(
                        request_id = %request_id,
                        status,
                        bytes = body.len(),
                        latency_ms,
                        "Proxy request completed"
                    );
                    ProxyResponseData {
                        request_id: request_id.clone(),
                        success: true,
                        latency_ms,
                        status_code: Some(status),
                        bytes_read: Some(body.len()),
                        body: Some(BASE64.encode(&body)),
                        error: None,
                    }
                }
                Err(e) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    warn!(request_id = %request_id, error = %e, "Proxy request failed");
                    ProxyResponseData {
                        request_id: request_id.clone(),
                        success: false,
                        latency_ms,
                        status_code: None,
                        bytes_read: None,
                        body: None,
                        error: Some(e.to_string()),
                    }
                }
            };

            let ok = data.success;
            send_message(&worker.outbound, NodeMessage::ProxyResponse { data }).await;
            worker.stats.record(StatsEvent::ProxyCompleted { ok });
        });
    }
}

/// Issue the request and return `(status, body)` with the body capped.
async fn perform_request(params: ProxyRequestParams) -> Result<(u16, Vec<u8>), ProxyError> {
    let method = reqwest::Method::from_bytes(params.method.as_bytes())
        .map_err(|_| ProxyError::InvalidMethod(params.method.clone()))?;
    let url = params
        .url
        .parse::<reqwest::Url>()
        .map_err(|e| ProxyError::InvalidUrl(e.to_string()))?;

    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(params.timeout)
        .timeout(params.timeout)
        .build()?;

    let mut request = client.request(method, url);

    let mut has_content_type = false;
    if let Some(serde_json::Value::Object(headers)) = &params.headers {
        for (name, value) in headers {
            let Some(value) = value.as_str() else {
                debug!(header = %name, "Skipping non-string proxy header");
                continue;
            };
            let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_bytes()),
                reqwest::header::HeaderValue::from_str(value),
            ) else {
                debug!(header = %name, "Skipping invalid proxy header");
                continue;
            };
            if name == reqwest::header::CONTENT_TYPE {
                has_content_type = true;
            }
            request = request.header(name, value);
        }
    } else if params.headers.is_some() {
        debug!("Ignoring proxy headers of unexpected shape");
    }

    if let Some(body_base64) = &params.body_base64 {
        match BASE64.decode(body_base64) {
            Ok(body) if !body.is_empty() => {
                if !has_content_type {
                    request = request.header("Content-Type", "application/octet-stream");
                }
                request = request.body(body);
            }
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "Ignoring undecodable proxy request body");
            }
        }
    }

    let mut response = request.send().await?;
    let status = response.status().as_u16();

    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        body.extend_from_slice(&chunk);
        if body.len() >= MAX_BODY_SIZE {
            body.truncate(MAX_BODY_SIZE);
            break;
        }
    }

    Ok((status, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::{outbound_channel, OutboundFrame, OutboundRx};
    use crate::stats::NoopStats;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn recv_response(rx: &mut OutboundRx) -> serde_json::Value {
        match tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("timed out waiting for proxy_response")
            .expect("channel closed")
        {
            OutboundFrame::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text, got {:?}", other),
        }
    }

    /// One-shot HTTP server returning a fixed response.
    async fn spawn_http_stub(response: &'static [u8]) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = sock.read(&mut buf).await;
                let _ = sock.write_all(response).await;
            }
        });
        addr
    }

    fn params(url: String) -> ProxyRequestParams {
        ProxyRequestParams {
            request_id: "r1".to_string(),
            url,
            method: "GET".to_string(),
            headers: None,
            body_base64: None,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_get_returns_status_and_base64_body() {
        let addr = spawn_http_stub(
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nhi",
        )
        .await;
        let (tx, mut rx) = outbound_channel();
        let worker = ProxyWorker::new(tx, Arc::new(NoopStats));

        worker.spawn_request(params(format!("http://127.0.0.1:{}/hello", addr.port())));

        let v = recv_response(&mut rx).await;
        assert_eq!(v["type"], "proxy_response");
        assert_eq!(v["data"]["request_id"], "r1");
        assert_eq!(v["data"]["success"], true);
        assert_eq!(v["data"]["status_code"], 200);
        assert_eq!(v["data"]["body"], "aGk=");
        assert_eq!(v["data"]["bytes_read"], 2);
        assert!(v["data"]["latency_ms"].is_u64());
    }

    #[tokio::test]
    async fn test_non_2xx_status_is_still_success() {
        let addr = spawn_http_stub(
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let (tx, mut rx) = outbound_channel();
        let worker = ProxyWorker::new(tx, Arc::new(NoopStats));

        worker.spawn_request(params(format!("http://127.0.0.1:{}/", addr.port())));

        let v = recv_response(&mut rx).await;
        assert_eq!(v["data"]["success"], true);
        assert_eq!(v["data"]["status_code"], 404);
        assert_eq!(v["data"]["bytes_read"], 0);
    }

    #[tokio::test]
    async fn test_connect_failure_reports_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (tx, mut rx) = outbound_channel();
        let worker = ProxyWorker::new(tx, Arc::new(NoopStats));
        worker.spawn_request(params(format!("http://127.0.0.1:{port}/")));

        let v = recv_response(&mut rx).await;
        assert_eq!(v["data"]["success"], false);
        assert!(v["data"]["error"].is_string());
        assert!(v["data"].get("status_code").is_none());
    }

    #[tokio::test]
    async fn test_invalid_method_reports_error() {
        let (tx, mut rx) = outbound_channel();
        let worker = ProxyWorker::new(tx, Arc::new(NoopStats));
        let mut bad = params("http://127.0.0.1:1/".to_string());
        bad.method = "NOT A METHOD".to_string();
        worker.spawn_request(bad);

        let v = recv_response(&mut rx).await;
        assert_eq!(v["data"]["success"], false);
    }

    #[tokio::test]
    async fn test_body_capped_at_one_mebibyte() {
        // 2 MiB body; worker must truncate to 1 MiB.
        use std::sync::OnceLock;
        static BODY: OnceLock<Vec<u8>> = OnceLock::new();
        let body = BODY.get_or_init(|| {
            let payload = vec![b'x'; 2 * MAX_BODY_SIZE];
            let mut out = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                payload.len()
            )
            .into_bytes();
            out.extend_from_slice(&payload);
            out
        });
        let addr = spawn_http_stub(body.as_slice()).await;

        let (tx, mut rx) = outbound_channel();
        let worker = ProxyWorker::new(tx, Arc::new(NoopStats));
        worker.spawn_request(params(format!("http://127.0.0.1:{}/", addr.port())));

        let v = recv_response(&mut rx).await;
        assert_eq!(v["data"]["success"], true);
        assert_eq!(v["data"]["bytes_read"], MAX_BODY_SIZE);
    }
}
