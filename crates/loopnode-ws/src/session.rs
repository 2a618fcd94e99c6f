//! Gateway-facing WebSocket session
//!
//! One session = one connected socket, one background reader task, and a
//! cloneable writer handle. A single mutex around the write half
//! serializes every outbound frame, data and control alike, so frames
//! never interleave on the wire no matter how many tasks send.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use loopnode_transport::MaybeTlsStream;

use crate::frame::{encode_frame, read_message, OpCode};
use crate::handshake::{upgrade, WsUrl};
use crate::WsError;

/// Disconnect reason reported when the server sends a close frame.
pub const REASON_SERVER_CLOSE: &str = "server_close";
/// Disconnect reason reported when the read loop hits an error.
pub const REASON_READ_ERROR: &str = "read_error";

/// Events surfaced to the session owner.
#[derive(Debug)]
pub enum WsEvent {
    Text(String),
    Binary(Bytes),
    /// The reader terminated; no further events follow.
    Closed { reason: &'static str },
}

/// Cloneable handle for sending frames.
#[derive(Clone)]
pub struct WsWriter {
    sink: Arc<Mutex<WriteHalf<MaybeTlsStream>>>,
    connected: Arc<AtomicBool>,
}

impl WsWriter {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn send_text(&self, text: &str) -> Result<(), WsError> {
        self.send_frame(OpCode::Text, text.as_bytes()).await
    }

    pub async fn send_binary(&self, payload: &[u8]) -> Result<(), WsError> {
        self.send_frame(OpCode::Binary, payload).await
    }

    async fn send_pong(&self, payload: &[u8]) -> Result<(), WsError> {
        self.send_frame(OpCode::Pong, payload).await
    }

    async fn send_frame(&self, opcode: OpCode, payload: &[u8]) -> Result<(), WsError> {
        if !self.is_connected() {
            return Err(WsError::ConnectionClosed);
        }

        let frame = encode_frame(opcode, payload, true);
        let mut sink = self.sink.lock().await;
        let result = async {
            sink.write_all(&frame).await?;
            sink.flush().await
        }
        .await;

        if let Err(e) = result {
            self.connected.store(false, Ordering::SeqCst);
            return Err(WsError::Io(e));
        }
        Ok(())
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// A connected WebSocket session.
pub struct WsSession {
    writer: WsWriter,
    events: mpsc::Receiver<WsEvent>,
    reader_task: JoinHandle<()>,
}

impl WsSession {
    /// Dial, upgrade, and start the background reader. The entire
    /// connect sequence (TCP, TLS, upgrade exchange) is bounded by
    /// `connect_timeout`.
    pub async fn connect(
        url: &str,
        connect_timeout: Duration,
        insecure_skip_verify: bool,
    ) -> Result<Self, WsError> {
        let ws_url = WsUrl::parse(url)?;

        let mut stream = loopnode_transport::connect(
            &ws_url.host,
            ws_url.port,
            ws_url.tls,
            insecure_skip_verify,
            connect_timeout,
        )
        .await?;

        let leftover = tokio::time::timeout(connect_timeout, upgrade(&mut stream, &ws_url))
            .await
            .map_err(|_| WsError::HandshakeTimeout)??;

        info!(url = %url, "WebSocket connected");

        let (read_half, write_half) = tokio::io::split(stream);
        let connected = Arc::new(AtomicBool::new(true));
        let writer = WsWriter {
            sink: Arc::new(Mutex::new(write_half)),
            connected,
        };

        let (event_tx, event_rx) = mpsc::channel(64);
        let reader_writer = writer.clone();
        let reader_task = tokio::spawn(async move {
            // Bytes past the handshake response are the first frames.
            let mut reader = tokio::io::AsyncReadExt::chain(Cursor::new(leftover.to_vec()), read_half);
            read_loop(&mut reader, reader_writer, event_tx).await;
        });

        Ok(Self {
            writer,
            events: event_rx,
            reader_task,
        })
    }

    /// Handle for sending frames from any task.
    pub fn writer(&self) -> WsWriter {
        self.writer.clone()
    }

    /// Next inbound event. `None` after `Closed` has been delivered and
    /// the channel drained.
    pub async fn next_event(&mut self) -> Option<WsEvent> {
        self.events.recv().await
    }

    /// Tear the session down: stop the reader and close the socket.
    pub async fn shutdown(self, reason: &str) {
        debug!(reason = %reason, "Shutting down WebSocket session");
        self.writer.mark_disconnected();
        self.reader_task.abort();
        let mut sink = self.writer.sink.lock().await;
        let _ = sink.shutdown().await;
    }
}

/// Reader loop: decodes messages and dispatches control frames. Runs
/// until close or error, then emits exactly one `Closed` event. Cleanup
/// of the session itself is the owner's job; the reader never waits on
/// its own task.
async fn read_loop<R>(reader: &mut R, writer: WsWriter, events: mpsc::Sender<WsEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let reason = loop {
        let frame = match read_message(reader).await {
            Ok(frame) => frame,
            Err(e) => {
                if writer.is_connected() {
                    error!(error = %e, "WebSocket read failed");
                }
                break REASON_READ_ERROR;
            }
        };

        match frame.opcode {
            OpCode::Text => {
                let text = String::from_utf8_lossy(&frame.payload).into_owned();
                if events.send(WsEvent::Text(text)).await.is_err() {
                    break REASON_READ_ERROR;
                }
            }
            OpCode::Binary => {
                if events.send(WsEvent::Binary(frame.payload)).await.is_err() {
                    break REASON_READ_ERROR;
                }
            }
            OpCode::Ping => {
                debug!(bytes = frame.payload.len(), "Ping received, sending pong");
                if let Err(e) = writer.send_pong(&frame.payload).await {
                    error!(error = %e, "Failed to send pong");
                }
            }
            OpCode::Pong => {}
            OpCode::Close => {
                info!("Close frame received from server");
                break REASON_SERVER_CLOSE;
            }
            other => {
                warn!(opcode = ?other, "Ignoring frame with unhandled opcode");
            }
        }
    };

    writer.mark_disconnected();
    let _ = events.send(WsEvent::Closed { reason }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::read_frame;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Minimal server side of the upgrade for tests.
    async fn accept_ws(listener: &TcpListener) -> tokio::net::TcpStream {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        loop {
            let mut chunk = [0u8; 512];
            let n = sock.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        sock.write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
            .await
            .unwrap();
        sock
    }

    #[tokio::test]
    async fn test_connect_and_receive_text() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let mut sock = accept_ws(&listener).await;
            sock.write_all(&encode_frame(OpCode::Text, b"{\"type\":\"welcome\"}", false))
                .await
                .unwrap();
        });

        let mut session = WsSession::connect(
            &format!("ws://127.0.0.1:{port}/ws"),
            Duration::from_secs(5),
            false,
        )
        .await
        .unwrap();

        match tokio::time::timeout(Duration::from_secs(2), session.next_event())
            .await
            .unwrap()
        {
            Some(WsEvent::Text(text)) => assert_eq!(text, "{\"type\":\"welcome\"}"),
            other => panic!("unexpected event: {:?}", other),
        }

        server.await.unwrap();
        session.shutdown("test_done").await;
    }

    #[tokio::test]
    async fn test_ping_answered_with_identical_pong() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let mut sock = accept_ws(&listener).await;
            sock.write_all(&encode_frame(OpCode::Ping, b"abc", false))
                .await
                .unwrap();
            // Client pongs are masked; read_frame unmasks.
            let frame = tokio::time::timeout(Duration::from_millis(200), read_frame(&mut sock))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(frame.opcode, OpCode::Pong);
            assert_eq!(frame.payload.as_ref(), b"abc");
        });

        let mut session = WsSession::connect(
            &format!("ws://127.0.0.1:{port}/"),
            Duration::from_secs(5),
            false,
        )
        .await
        .unwrap();

        server.await.unwrap();
        session.shutdown("test_done").await;
    }

    #[tokio::test]
    async fn test_server_close_emits_event() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let mut sock = accept_ws(&listener).await;
            sock.write_all(&encode_frame(OpCode::Close, &[], false))
                .await
                .unwrap();
        });

        let mut session = WsSession::connect(
            &format!("ws://127.0.0.1:{port}/"),
            Duration::from_secs(5),
            false,
        )
        .await
        .unwrap();

        match tokio::time::timeout(Duration::from_secs(2), session.next_event())
            .await
            .unwrap()
        {
            Some(WsEvent::Closed { reason }) => assert_eq!(reason, REASON_SERVER_CLOSE),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handshake_rejected_on_non_101() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut chunk = [0u8; 1024];
            let _ = sock.read(&mut chunk).await.unwrap();
            sock.write_all(b"HTTP/1.1 503 Service Unavailable\r\n\r\n")
                .await
                .unwrap();
        });

        let result = WsSession::connect(
            &format!("ws://127.0.0.1:{port}/"),
            Duration::from_secs(5),
            false,
        )
        .await;
        assert!(matches!(result, Err(WsError::HandshakeRejected(_))));
    }

    #[tokio::test]
    async fn test_frames_arriving_with_handshake_are_not_lost() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            loop {
                let mut chunk = [0u8; 512];
                let n = sock.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            // Response and first frame in a single write.
            let mut out = Vec::new();
            out.extend_from_slice(
                b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n",
            );
            out.extend_from_slice(&encode_frame(OpCode::Text, b"early", false));
            sock.write_all(&out).await.unwrap();
        });

        let mut session = WsSession::connect(
            &format!("ws://127.0.0.1:{port}/"),
            Duration::from_secs(5),
            false,
        )
        .await
        .unwrap();

        match tokio::time::timeout(Duration::from_secs(2), session.next_event())
            .await
            .unwrap()
        {
            Some(WsEvent::Text(text)) => assert_eq!(text, "early"),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
