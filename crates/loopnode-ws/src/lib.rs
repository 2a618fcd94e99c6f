//! Minimal RFC 6455 WebSocket client
//!
//! Client-side only, and only what the gateway session needs: the upgrade
//! handshake, masked data/control frames, ping→pong, and close handling.
//! Fragmented frames are reassembled on receive but never generated.

pub mod frame;
pub mod handshake;
pub mod session;

pub use frame::{encode_frame, read_frame, Frame, OpCode, MAX_FRAME_PAYLOAD};
pub use handshake::WsUrl;
pub use session::{WsEvent, WsSession, WsWriter};

use thiserror::Error;

/// WebSocket errors
#[derive(Debug, Error)]
pub enum WsError {
    #[error("Invalid WebSocket URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(#[from] loopnode_transport::TransportError),

    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("Timed out during WebSocket handshake")]
    HandshakeTimeout,

    #[error("Frame payload of {0} bytes exceeds limit")]
    FrameTooLarge(u64),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
