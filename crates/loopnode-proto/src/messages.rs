//! Gateway protocol message types
//!
//! Inbound messages are parsed strictly with serde; a substring scan over
//! the raw text is only a cheap pre-filter. A message whose payload merely
//! *contains* a discriminator string (say a proxied body with
//! `"tunnel_open"` in it) is routed by its real `type` field, never by the
//! substring hit.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;

/// Protocol version reported in `hello`.
pub const SDK_VERSION: &str = "2.0";

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("invalid gateway message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("ip_info payload is not valid JSON: {0}")]
    IpInfoNotJson(serde_json::Error),
}

/// Result of classifying one inbound text frame.
#[derive(Debug)]
pub enum Inbound {
    Message(GatewayMessage),
    /// Valid JSON but not a type this node handles.
    Unknown,
}

/// Messages the gateway sends to the node.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayMessage {
    Welcome,
    KeepaliveAck,
    Cooldown {
        #[serde(default = "default_retry_after_sec")]
        retry_after_sec: u64,
    },
    TunnelOpen {
        tunnel_id: String,
        host: String,
        #[serde(deserialize_with = "port_from_any")]
        port: u16,
    },
    TunnelData {
        tunnel_id: String,
        #[serde(default)]
        eof: bool,
        /// Base64 payload; absent on EOF frames.
        #[serde(default)]
        data: Option<String>,
    },
    ProxyRequest {
        request_id: String,
        url: String,
        #[serde(default = "default_method")]
        method: String,
        /// Header map; gateways send either an object or nothing.
        #[serde(default)]
        headers: Option<serde_json::Value>,
        /// Base64 request body.
        #[serde(default)]
        body: Option<String>,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
}

fn default_retry_after_sec() -> u64 {
    600
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// Some gateway builds send the port as a JSON string.
fn port_from_any<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortRepr {
        Num(u16),
        Str(String),
    }

    match PortRepr::deserialize(deserializer)? {
        PortRepr::Num(p) => Ok(p),
        PortRepr::Str(s) => s
            .parse::<u16>()
            .map_err(|_| D::Error::custom(format!("invalid port: {s}"))),
    }
}

/// Discriminator substrings used as a pre-filter before the strict parse.
const TYPE_MARKERS: &[&str] = &[
    "\"welcome\"",
    "\"keepalive_ack\"",
    "\"cooldown\"",
    "\"tunnel_open\"",
    "\"tunnel_data\"",
    "\"proxy_request\"",
];

/// Classify one inbound text frame.
///
/// Returns `Ok(Inbound::Unknown)` for messages this node does not handle
/// and `Err` only when a frame that claims a recognized type fails strict
/// parsing.
pub fn parse_gateway_message(text: &str) -> Result<Inbound, ProtoError> {
    if !TYPE_MARKERS.iter().any(|m| text.contains(m)) {
        return Ok(Inbound::Unknown);
    }

    // The pre-filter can hit on payload content, so read the actual
    // discriminator before committing to a variant.
    #[derive(Deserialize)]
    struct TypeProbe {
        #[serde(rename = "type")]
        kind: String,
    }

    let probe: TypeProbe = serde_json::from_str(text)?;
    if !TYPE_MARKERS.contains(&format!("\"{}\"", probe.kind).as_str()) {
        return Ok(Inbound::Unknown);
    }

    Ok(Inbound::Message(serde_json::from_str(text)?))
}

/// Messages the node sends to the gateway. All go out as text frames.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeMessage {
    Hello {
        node_id: String,
        device_model: String,
        sdk_version: &'static str,
    },
    Keepalive {
        uptime_sec: u64,
        active_tunnels: usize,
    },
    TunnelResponse {
        data: TunnelResponseData,
    },
    ProxyResponse {
        data: ProxyResponseData,
    },
    IpInfo {
        node_id: String,
        device_id: String,
        device_model: String,
        ip: String,
        ip_fetch_ms: u64,
        info_fetch_ms: u64,
        /// Raw geolocation JSON, embedded unquoted.
        ip_info: Box<RawValue>,
    },
}

#[derive(Debug, Serialize)]
pub struct TunnelResponseData {
    pub tunnel_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ProxyResponseData {
    pub request_id: String,
    pub success: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Base64 of the response body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_read: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeMessage {
    pub fn hello(node_id: &str, device_model: &str) -> Self {
        Self::Hello {
            node_id: node_id.to_string(),
            device_model: device_model.to_string(),
            sdk_version: SDK_VERSION,
        }
    }

    pub fn tunnel_response(tunnel_id: &str, success: bool, error: Option<String>) -> Self {
        Self::TunnelResponse {
            data: TunnelResponseData {
                tunnel_id: tunnel_id.to_string(),
                success,
                error,
            },
        }
    }

    /// Build an `ip_info` report. Fails if the geolocation blob is not
    /// itself valid JSON (it is embedded without quoting).
    pub fn ip_info(
        node_id: &str,
        device_model: &str,
        ip: &str,
        info_json: &str,
        ip_fetch_ms: u64,
        info_fetch_ms: u64,
    ) -> Result<Self, ProtoError> {
        let raw = RawValue::from_string(info_json.to_string()).map_err(ProtoError::IpInfoNotJson)?;
        Ok(Self::IpInfo {
            node_id: node_id.to_string(),
            device_id: node_id.to_string(),
            device_model: device_model.to_string(),
            ip: ip.to_string(),
            ip_fetch_ms,
            info_fetch_ms,
            ip_info: raw,
        })
    }

    /// Serialize to the JSON text that goes on the wire.
    pub fn encode(&self) -> String {
        // Serialization of these shapes cannot fail: no maps with
        // non-string keys, and ip_info is pre-validated RawValue.
        serde_json::to_string(self).unwrap_or_default()
    }
}
