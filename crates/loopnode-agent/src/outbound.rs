//! Outbound message funnel
//!
//! Tunnels, proxy workers, and the IP-info reporter never touch the
//! WebSocket directly: they push frames into one bounded channel that the
//! supervisor pumps into the session's send mutex. Ownership stays
//! one-directional and a dead session just makes sends fail cheaply.

use bytes::Bytes;
use loopnode_proto::NodeMessage;
use tokio::sync::mpsc;
use tracing::debug;

/// One frame queued for the gateway.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Text(String),
    Binary(Bytes),
}

pub type OutboundTx = mpsc::Sender<OutboundFrame>;
pub type OutboundRx = mpsc::Receiver<OutboundFrame>;

/// Depth of the outbound queue. Tunnel readers block here when the
/// session is slower than the targets, which is the back-pressure we
/// want.
pub const OUTBOUND_QUEUE_DEPTH: usize = 256;

pub fn outbound_channel() -> (OutboundTx, OutboundRx) {
    mpsc::channel(OUTBOUND_QUEUE_DEPTH)
}

/// Queue a JSON message. Returns false when the session is gone; callers
/// treat that as a dropped frame, never as an error to propagate.
pub async fn send_message(tx: &OutboundTx, message: NodeMessage) -> bool {
    let text = message.encode();
    if tx.send(OutboundFrame::Text(text)).await.is_err() {
        debug!("Outbound message dropped, session closed");
        return false;
    }
    true
}

/// Queue a binary frame.
pub async fn send_binary(tx: &OutboundTx, frame: Bytes) -> bool {
    if tx.send(OutboundFrame::Binary(frame)).await.is_err() {
        debug!("Outbound frame dropped, session closed");
        return false;
    }
    true
}
