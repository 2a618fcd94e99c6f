//! Scripted gateway stub for integration tests
//!
//! Speaks the server side of the WebSocket upgrade and unmasked server
//! frames over a plain TCP listener, plus helpers for building agents
//! wired to memory stores and a fetcher that never touches the network.

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use loopnode_agent::{
    Agent, AgentConfig, IpInfoError, MemoryStore, NoopStats, PageFetcher, SecretStore,
};
use loopnode_proto::encode_tunnel_frame;
use loopnode_ws::frame::{encode_frame, read_frame, Frame, OpCode};

pub struct GatewayStub {
    listener: TcpListener,
    pub url: String,
}

impl GatewayStub {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        Self {
            listener,
            url: format!("ws://127.0.0.1:{port}/ws"),
        }
    }

    /// Accept one agent connection and complete the upgrade.
    pub async fn accept(&self) -> GatewayConn {
        let (mut sock, _) = self.listener.accept().await.unwrap();

        let mut request = Vec::new();
        loop {
            let mut chunk = [0u8; 1024];
            let n = sock.read(&mut chunk).await.unwrap();
            assert!(n > 0, "agent closed during handshake");
            request.extend_from_slice(&chunk[..n]);
            if request.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }

        let request = String::from_utf8_lossy(&request);
        assert!(request.starts_with("GET /ws HTTP/1.1\r\n"), "{request}");
        assert!(request.contains("Upgrade: websocket"));
        assert!(request.contains("Sec-WebSocket-Version: 13"));

        sock.write_all(
            b"HTTP/1.1 101 Switching Protocols\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\r\n",
        )
        .await
        .unwrap();

        GatewayConn { sock }
    }

    /// Refuse the next TCP connection outright.
    pub async fn refuse_one(&self) {
        let (sock, _) = self.listener.accept().await.unwrap();
        drop(sock);
    }
}

pub struct GatewayConn {
    sock: TcpStream,
}

impl GatewayConn {
    pub async fn send_text(&mut self, text: &str) {
        self.sock
            .write_all(&encode_frame(OpCode::Text, text.as_bytes(), false))
            .await
            .unwrap();
    }

    pub async fn send_tunnel_frame(&mut self, tunnel_id: &str, payload: &[u8], eof: bool) {
        let frame = encode_tunnel_frame(tunnel_id, payload, eof);
        self.sock
            .write_all(&encode_frame(OpCode::Binary, &frame, false))
            .await
            .unwrap();
    }

    pub async fn send_ping(&mut self, payload: &[u8]) {
        self.sock
            .write_all(&encode_frame(OpCode::Ping, payload, false))
            .await
            .unwrap();
    }

    pub async fn send_close(&mut self) {
        self.sock
            .write_all(&encode_frame(OpCode::Close, &[], false))
            .await
            .unwrap();
    }

    pub async fn next_frame(&mut self) -> Frame {
        tokio::time::timeout(Duration::from_secs(5), read_frame(&mut self.sock))
            .await
            .expect("timed out waiting for agent frame")
            .expect("agent connection failed")
    }

    /// Next text frame parsed as JSON, skipping anything else.
    pub async fn next_json(&mut self) -> serde_json::Value {
        loop {
            let frame = self.next_frame().await;
            if frame.opcode == OpCode::Text {
                return serde_json::from_slice(&frame.payload).unwrap();
            }
        }
    }

    /// Skip frames until a JSON message with the given `type` arrives.
    pub async fn expect_json_type(&mut self, kind: &str) -> serde_json::Value {
        loop {
            let value = self.next_json().await;
            if value["type"] == kind {
                return value;
            }
        }
    }

    /// Skip frames until a binary tunnel frame arrives.
    pub async fn expect_tunnel_frame(&mut self) -> loopnode_proto::TunnelFrame {
        loop {
            let frame = self.next_frame().await;
            if frame.opcode == OpCode::Binary {
                return loopnode_proto::decode_tunnel_frame(&frame.payload)
                    .expect("undecodable tunnel frame");
            }
        }
    }
}

/// Fetcher that always fails: integration tests never hit the network,
/// and a failed fetch means no ip_info frames interleave with the
/// scripted exchange.
pub struct OfflineFetcher;

#[async_trait]
impl PageFetcher for OfflineFetcher {
    async fn get_text(&self, _url: &str, _timeout: Duration) -> Result<String, IpInfoError> {
        Err(IpInfoError::Fetch("offline test fetcher".to_string()))
    }
}

/// Agent wired for tests: memory store, no-op stats, offline fetcher.
pub fn test_agent(url: &str) -> Agent {
    test_agent_with_store(url, Arc::new(MemoryStore::new()))
}

pub fn test_agent_with_store(url: &str, store: Arc<dyn SecretStore>) -> Agent {
    let config = AgentConfig::default()
        .with_server_url(url)
        .with_node_id("test-node")
        .with_device_model("test-device");
    Agent::with_parts(config, store, Arc::new(NoopStats), Arc::new(OfflineFetcher)).unwrap()
}

/// An echo server handling one connection.
pub async fn spawn_echo() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut sock, _)) = listener.accept().await {
            let mut buf = [0u8; 4096];
            while let Ok(n) = sock.read(&mut buf).await {
                if n == 0 || sock.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    });
    addr
}
