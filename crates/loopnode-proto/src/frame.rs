//! Binary tunnel frame codec
//!
//! Tunnel payloads are relayed as raw WebSocket binary frames to avoid
//! base64 overhead:
//!
//! Frame format:
//! - 36 bytes: tunnel id (ASCII, right-padded)
//! - 1 byte:   flags (0x00 = data, 0x01 = eof)
//! - Rest:     payload
//!
//! Gateways disagree on the padding character, so ingress strips NUL,
//! space, and tab; egress always pads with NUL.

use bytes::{BufMut, Bytes, BytesMut};

/// Fixed width of the tunnel id field.
pub const TUNNEL_ID_LEN: usize = 36;

/// Header bytes before the payload.
pub const FRAME_HEADER_LEN: usize = TUNNEL_ID_LEN + 1;

pub const FLAG_DATA: u8 = 0x00;
pub const FLAG_EOF: u8 = 0x01;

/// A decoded binary tunnel frame.
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelFrame {
    pub tunnel_id: String,
    pub eof: bool,
    pub payload: Bytes,
}

/// Encode a tunnel frame. Ids longer than 36 bytes are truncated.
pub fn encode_tunnel_frame(tunnel_id: &str, payload: &[u8], eof: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());

    let id = tunnel_id.as_bytes();
    let copy = id.len().min(TUNNEL_ID_LEN);
    buf.put_slice(&id[..copy]);
    buf.put_bytes(0, TUNNEL_ID_LEN - copy);

    buf.put_u8(if eof { FLAG_EOF } else { FLAG_DATA });
    buf.put_slice(payload);

    buf.freeze()
}

/// Decode a tunnel frame. Frames shorter than the header are ignored.
/// EOF frames carry no payload; any trailing bytes on one are dropped.
pub fn decode_tunnel_frame(data: &[u8]) -> Option<TunnelFrame> {
    if data.len() < FRAME_HEADER_LEN {
        return None;
    }

    let id_raw = &data[..TUNNEL_ID_LEN];
    let id_end = id_raw
        .iter()
        .rposition(|b| !matches!(b, 0 | b' ' | b'\t'))
        .map(|p| p + 1)
        .unwrap_or(0);
    let tunnel_id = String::from_utf8_lossy(&id_raw[..id_end]).into_owned();

    let eof = data[TUNNEL_ID_LEN] & FLAG_EOF != 0;
    let payload = if eof {
        Bytes::new()
    } else {
        Bytes::copy_from_slice(&data[FRAME_HEADER_LEN..])
    };

    Some(TunnelFrame {
        tunnel_id,
        eof,
        payload,
    })
}
