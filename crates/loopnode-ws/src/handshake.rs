//! WebSocket upgrade handshake
//!
//! Sends the HTTP/1.1 upgrade request and validates the 101 response.
//! Acceptance requires status 101 and an `Upgrade: websocket` header,
//! case-insensitive. Bytes that arrive after the response headers belong
//! to the frame stream and are handed back to the caller.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use url::Url;

use crate::WsError;

/// Maximum bytes of response headers we will buffer.
const MAX_RESPONSE_HEADER: usize = 8 * 1024;

/// A parsed `ws://` / `wss://` URL.
#[derive(Debug, Clone, PartialEq)]
pub struct WsUrl {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub tls: bool,
}

impl WsUrl {
    pub fn parse(raw: &str) -> Result<Self, WsError> {
        let url = Url::parse(raw).map_err(|e| WsError::InvalidUrl {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;

        let tls = match url.scheme() {
            "ws" => false,
            "wss" => true,
            other => {
                return Err(WsError::InvalidUrl {
                    url: raw.to_string(),
                    reason: format!("unsupported scheme '{other}'"),
                })
            }
        };

        let host = url
            .host_str()
            .ok_or_else(|| WsError::InvalidUrl {
                url: raw.to_string(),
                reason: "missing host".to_string(),
            })?
            .to_string();

        let port = url
            .port()
            .unwrap_or(if tls { 443 } else { 80 });

        let mut path = url.path().to_string();
        if path.is_empty() {
            path = "/".to_string();
        }
        if let Some(query) = url.query() {
            path = format!("{path}?{query}");
        }

        Ok(Self {
            host,
            port,
            path,
            tls,
        })
    }
}

/// Build the upgrade request bytes for the given target.
pub fn build_upgrade_request(url: &WsUrl, key: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}:{port}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n",
        path = url.path,
        host = url.host,
        port = url.port,
    )
}

/// Generate a `Sec-WebSocket-Key`: base64 of 16 random bytes.
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64.encode(nonce)
}

/// Validate a complete response-header block. Returns `Ok(())` on a 101
/// with a websocket upgrade header.
pub fn check_upgrade_response(header: &[u8]) -> Result<(), WsError> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);

    match response.parse(header) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(WsError::HandshakeRejected(
                "incomplete response headers".to_string(),
            ))
        }
        Err(e) => return Err(WsError::HandshakeRejected(format!("bad response: {e}"))),
    }

    if response.code != Some(101) {
        return Err(WsError::HandshakeRejected(format!(
            "expected 101, got {:?}",
            response.code
        )));
    }

    let upgraded = response.headers.iter().any(|h| {
        h.name.eq_ignore_ascii_case("upgrade")
            && String::from_utf8_lossy(h.value)
                .to_ascii_lowercase()
                .contains("websocket")
    });
    if !upgraded {
        return Err(WsError::HandshakeRejected(
            "missing Upgrade: websocket header".to_string(),
        ));
    }

    Ok(())
}

/// Run the upgrade exchange over an established stream. On success
/// returns any bytes read past the end of the response headers; they are
/// the start of the frame stream.
pub async fn upgrade<S>(stream: &mut S, url: &WsUrl) -> Result<BytesMut, WsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = build_upgrade_request(url, &generate_key());
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut buf = BytesMut::with_capacity(1024);
    loop {
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(WsError::HandshakeRejected(
                "connection closed before handshake response".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_header_end(&buf) {
            check_upgrade_response(&buf[..end])?;
            let leftover = buf.split_off(end);
            return Ok(leftover);
        }

        if buf.len() > MAX_RESPONSE_HEADER {
            return Err(WsError::HandshakeRejected(
                "response headers too large".to_string(),
            ));
        }
    }
}

/// Byte offset just past the `\r\n\r\n` terminator, if present.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_defaults() {
        let url = WsUrl::parse("wss://gateway.iploop.io:9443/ws").unwrap();
        assert_eq!(url.host, "gateway.iploop.io");
        assert_eq!(url.port, 9443);
        assert_eq!(url.path, "/ws");
        assert!(url.tls);

        let url = WsUrl::parse("ws://example.com").unwrap();
        assert_eq!(url.port, 80);
        assert_eq!(url.path, "/");
        assert!(!url.tls);

        let url = WsUrl::parse("wss://example.com").unwrap();
        assert_eq!(url.port, 443);
    }

    #[test]
    fn test_url_query_preserved() {
        let url = WsUrl::parse("ws://example.com/ws?node=1").unwrap();
        assert_eq!(url.path, "/ws?node=1");
    }

    #[test]
    fn test_url_rejects_http_scheme() {
        assert!(matches!(
            WsUrl::parse("http://example.com/"),
            Err(WsError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_request_shape() {
        let url = WsUrl::parse("ws://example.com:8080/ws").unwrap();
        let request = build_upgrade_request(&url, "c2VjcmV0a2V5MTIzNDU2");
        assert!(request.starts_with("GET /ws HTTP/1.1\r\n"));
        assert!(request.contains("Host: example.com:8080\r\n"));
        assert!(request.contains("Upgrade: websocket\r\n"));
        assert!(request.contains("Connection: Upgrade\r\n"));
        assert!(request.contains("Sec-WebSocket-Key: c2VjcmV0a2V5MTIzNDU2\r\n"));
        assert!(request.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_generated_key_is_16_bytes() {
        let key = generate_key();
        let decoded = BASE64.decode(key).unwrap();
        assert_eq!(decoded.len(), 16);
    }

    #[test]
    fn test_accepts_101_with_upgrade() {
        let response = b"HTTP/1.1 101 Switching Protocols\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\r\n";
        assert!(check_upgrade_response(response).is_ok());
    }

    #[test]
    fn test_accepts_case_insensitive_upgrade() {
        let response = b"HTTP/1.1 101 Switching Protocols\r\n\
            upgrade: WebSocket\r\n\r\n";
        assert!(check_upgrade_response(response).is_ok());
    }

    #[test]
    fn test_rejects_non_101() {
        let response = b"HTTP/1.1 403 Forbidden\r\n\r\n";
        assert!(matches!(
            check_upgrade_response(response),
            Err(WsError::HandshakeRejected(_))
        ));
    }

    #[test]
    fn test_rejects_missing_upgrade_header() {
        let response = b"HTTP/1.1 101 Switching Protocols\r\n\
            Connection: keep-alive\r\n\r\n";
        assert!(check_upgrade_response(response).is_err());
    }

    #[test]
    fn test_find_header_end() {
        assert_eq!(find_header_end(b"HTTP/1.1 101 X\r\n\r\nframes"), Some(18));
        assert_eq!(find_header_end(b"HTTP/1.1 101 X\r\n"), None);
    }
}
