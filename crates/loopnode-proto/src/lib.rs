//! Wire protocol between an edge node and the gateway.
//!
//! The gateway speaks two formats over one WebSocket session:
//! - text frames carrying JSON objects discriminated by a `type` field,
//! - binary frames carrying tunnel payloads with a fixed 37-byte header
//!   (no base64 overhead on the hot path).

pub mod frame;
pub mod messages;

pub use frame::{
    decode_tunnel_frame, encode_tunnel_frame, TunnelFrame, FLAG_DATA, FLAG_EOF, FRAME_HEADER_LEN,
    TUNNEL_ID_LEN,
};
pub use messages::{
    parse_gateway_message, GatewayMessage, Inbound, NodeMessage, ProtoError, ProxyResponseData,
    TunnelResponseData,
};
