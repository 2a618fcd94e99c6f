//! End-to-end tunnel relay through the scripted gateway: open, binary
//! data both directions, EOF handling, connect failure reporting.

mod common;

use std::time::{Duration, Instant};

use common::{spawn_echo, test_agent, GatewayStub};

const ID: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";

#[tokio::test]
async fn test_happy_path_tunnel_echo() {
    let stub = GatewayStub::start().await;
    let echo = spawn_echo().await;
    let agent = test_agent(&stub.url);
    agent.start().await.unwrap();

    let mut conn = stub.accept().await;
    let _ = conn.expect_json_type("hello").await;

    conn.send_text(r#"{"type":"welcome"}"#).await;
    conn.send_text(&format!(
        r#"{{"type":"tunnel_open","tunnel_id":"{ID}","host":"127.0.0.1","port":{}}}"#,
        echo.port()
    ))
    .await;

    let response = conn.expect_json_type("tunnel_response").await;
    assert_eq!(response["data"]["tunnel_id"], ID);
    assert_eq!(response["data"]["success"], true);
    assert_eq!(agent.active_tunnel_count().await, 1);

    // Data toward the target comes back through the echo server.
    conn.send_tunnel_frame(ID, b"ping", false).await;
    let frame = conn.expect_tunnel_frame().await;
    assert_eq!(frame.tunnel_id, ID);
    assert!(!frame.eof);
    assert_eq!(frame.payload.as_ref(), b"ping");

    // Gateway EOF: agent answers with exactly one EOF frame and the
    // tunnel is gone shortly after.
    let eof_sent = Instant::now();
    conn.send_tunnel_frame(ID, &[], true).await;

    let frame = conn.expect_tunnel_frame().await;
    assert_eq!(frame.tunnel_id, ID);
    assert!(frame.eof);
    assert!(frame.payload.is_empty());
    assert!(
        eof_sent.elapsed() < Duration::from_millis(500),
        "EOF ack took {:?}",
        eof_sent.elapsed()
    );

    tokio::time::timeout(Duration::from_secs(2), async {
        while agent.active_tunnel_count().await != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("tunnel count did not return to 0");

    agent.stop().await;
}

#[tokio::test]
async fn test_connect_failure_reports_single_error() {
    let stub = GatewayStub::start().await;
    let agent = test_agent(&stub.url);
    agent.start().await.unwrap();

    let mut conn = stub.accept().await;
    let _ = conn.expect_json_type("hello").await;

    conn.send_text(&format!(
        r#"{{"type":"tunnel_open","tunnel_id":"{ID}","host":"127.0.0.1","port":1}}"#
    ))
    .await;

    let response = conn.expect_json_type("tunnel_response").await;
    assert_eq!(response["data"]["success"], false);
    assert_eq!(response["data"]["error"], "Failed to connect to 127.0.0.1:1");
    assert_eq!(agent.active_tunnel_count().await, 0);

    agent.stop().await;
}

#[tokio::test]
async fn test_target_eof_relayed_to_gateway() {
    let stub = GatewayStub::start().await;

    // Target that sends a banner and closes.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = listener.local_addr().unwrap();
    tokio::spawn(async move {
        use tokio::io::AsyncWriteExt;
        if let Ok((mut sock, _)) = listener.accept().await {
            let _ = sock.write_all(b"bye").await;
        }
    });

    let agent = test_agent(&stub.url);
    agent.start().await.unwrap();

    let mut conn = stub.accept().await;
    let _ = conn.expect_json_type("hello").await;

    conn.send_text(&format!(
        r#"{{"type":"tunnel_open","tunnel_id":"{ID}","host":"127.0.0.1","port":{}}}"#,
        target.port()
    ))
    .await;
    let response = conn.expect_json_type("tunnel_response").await;
    assert_eq!(response["data"]["success"], true);

    // Banner, then EOF from the target side.
    let frame = conn.expect_tunnel_frame().await;
    assert_eq!(frame.payload.as_ref(), b"bye");

    let frame = conn.expect_tunnel_frame().await;
    assert!(frame.eof);

    agent.stop().await;
}

#[tokio::test]
async fn test_base64_tunnel_data_path() {
    let stub = GatewayStub::start().await;
    let echo = spawn_echo().await;
    let agent = test_agent(&stub.url);
    agent.start().await.unwrap();

    let mut conn = stub.accept().await;
    let _ = conn.expect_json_type("hello").await;

    conn.send_text(&format!(
        r#"{{"type":"tunnel_open","tunnel_id":"{ID}","host":"127.0.0.1","port":{}}}"#,
        echo.port()
    ))
    .await;
    let _ = conn.expect_json_type("tunnel_response").await;

    // "ping" as base64 over the text fallback path.
    conn.send_text(&format!(
        r#"{{"type":"tunnel_data","tunnel_id":"{ID}","data":"cGluZw=="}}"#
    ))
    .await;

    let frame = conn.expect_tunnel_frame().await;
    assert_eq!(frame.payload.as_ref(), b"ping");

    // EOF over the text path closes the tunnel too.
    conn.send_text(&format!(
        r#"{{"type":"tunnel_data","tunnel_id":"{ID}","eof":true}}"#
    ))
    .await;

    tokio::time::timeout(Duration::from_secs(2), async {
        while agent.active_tunnel_count().await != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("tunnel not closed after text EOF");

    agent.stop().await;
}
