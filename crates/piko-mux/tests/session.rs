// Session behavior over the in-memory transport pair.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use piko_mux::transport::memory_pair;
use piko_mux::{FrameTransport, MuxError, Role, Session, SessionConfig};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn session_pair(config: SessionConfig) -> (Session, Session) {
    let (a, b) = memory_pair(64);
    let client = Session::spawn(a, Role::Client, config.clone());
    let server = Session::spawn(b, Role::Server, config);
    (client, server)
}

fn quick_keepalive() -> SessionConfig {
    SessionConfig {
        keepalive_interval: Duration::from_millis(50),
        max_missed_pings: 2,
        ..SessionConfig::default()
    }
}

#[tokio::test]
async fn open_accept_echo_roundtrip() {
    let (client, server) = session_pair(SessionConfig::default());

    let echo = tokio::spawn(async move {
        let (mut stream, kind) = server.accept().await.unwrap();
        assert_eq!(kind, 2);
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(&buf).await.unwrap();
        stream.flush().await.unwrap();
    });

    let mut stream = client.open_stream(2).await.unwrap();
    stream.write_all(b"hello").await.unwrap();
    stream.flush().await.unwrap();
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
    echo.await.unwrap();
}

#[tokio::test]
async fn both_sides_can_open_streams() {
    let (client, server) = session_pair(SessionConfig::default());

    // Server-initiated stream (even id) while a client-initiated stream
    // (odd id) is live.
    let mut from_client = client.open_stream(1).await.unwrap();
    let (accepted_on_server, _) = server.accept().await.unwrap();
    let mut from_server = server.open_stream(2).await.unwrap();
    let (accepted_on_client, _) = client.accept().await.unwrap();

    assert_eq!(from_client.id() % 2, 1);
    assert_eq!(from_server.id() % 2, 0);
    drop(accepted_on_server);
    drop(accepted_on_client);

    // Streams stay independent: ids never collide.
    assert_ne!(from_client.id(), from_server.id());
    from_client.shutdown().await.unwrap();
    from_server.shutdown().await.unwrap();
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Ping {
    message: String,
}

#[tokio::test]
async fn rpc_roundtrip() {
    let (client, server) = session_pair(SessionConfig::default());

    tokio::spawn(async move {
        let (mut stream, kind) = server.accept().await.unwrap();
        assert_eq!(kind, 1);
        let request: Ping = piko_protocol::read_frame(&mut stream).await.unwrap();
        piko_protocol::write_frame(
            &mut stream,
            &Ping {
                message: format!("re: {}", request.message),
            },
        )
        .await
        .unwrap();
    });

    let response: Ping = client
        .rpc(
            1,
            &Ping {
                message: "hi".to_owned(),
            },
        )
        .await
        .unwrap();
    assert_eq!(response.message, "re: hi");
}

#[tokio::test]
async fn write_half_close_still_allows_reads() {
    let (client, server) = session_pair(SessionConfig::default());

    let responder = tokio::spawn(async move {
        let (mut stream, _) = server.accept().await.unwrap();
        let mut request = Vec::new();
        // EOF arrives when the client shuts its write half down.
        stream.read_to_end(&mut request).await.unwrap();
        stream.write_all(b"response").await.unwrap();
        stream.flush().await.unwrap();
        request
    });

    let mut stream = client.open_stream(2).await.unwrap();
    stream.write_all(b"request").await.unwrap();
    stream.shutdown().await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, b"response");
    assert_eq!(responder.await.unwrap(), b"request");
}

#[tokio::test]
async fn abort_fails_pending_accept_and_open() {
    let (client, server) = session_pair(SessionConfig::default());

    let pending_accept = tokio::spawn({
        let server = server.clone();
        async move { server.accept().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    client.abort();
    assert!(matches!(
        client.open_stream(2).await,
        Err(MuxError::SessionClosed)
    ));

    // The peer notices the dropped transport and fails its accept too.
    let accepted = tokio::time::timeout(Duration::from_secs(2), pending_accept)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(accepted, Err(MuxError::SessionClosed)));
}

#[tokio::test]
async fn session_close_reaches_open_streams() {
    let (client, server) = session_pair(SessionConfig::default());

    let mut stream = client.open_stream(2).await.unwrap();
    let (mut peer_stream, _) = server.accept().await.unwrap();

    server.abort();

    // Reads end (EOF) and writes eventually fail once the teardown lands.
    let mut buf = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(2), peer_stream.read_to_end(&mut buf))
        .await
        .unwrap();
    let mut write_failed = false;
    for _ in 0..64 {
        if stream.write_all(&[0u8; 4096]).await.is_err() {
            write_failed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(write_failed, "writes must fail after the session closes");
}

struct SilentTransport;

#[async_trait]
impl FrameTransport for SilentTransport {
    async fn send(&mut self, _frame: Bytes) -> std::io::Result<()> {
        Ok(())
    }

    async fn recv(&mut self) -> std::io::Result<Option<Bytes>> {
        std::future::pending().await
    }

    async fn close(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn missed_keepalives_abort_the_session() {
    let session = Session::spawn(SilentTransport, Role::Client, quick_keepalive());
    tokio::time::timeout(Duration::from_secs(2), session.closed())
        .await
        .expect("keepalive must abort a dead carrier");
    assert!(session.is_closed());
}

#[tokio::test]
async fn keepalive_tolerates_a_responsive_peer() {
    let (client, server) = session_pair(quick_keepalive());
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!client.is_closed());
    assert!(!server.is_closed());
}

#[tokio::test]
async fn send_window_blocks_until_consumed() {
    let config = SessionConfig {
        window: 1024,
        stream_buffer: 1024,
        max_frame: 256,
        ..SessionConfig::default()
    };
    let (client, server) = session_pair(config);

    let mut stream = client.open_stream(2).await.unwrap();
    let (mut peer_stream, _) = server.accept().await.unwrap();

    let payload = vec![7u8; 16 * 1024];
    let writer = tokio::spawn(async move {
        stream.write_all(&payload).await.unwrap();
        stream.shutdown().await.unwrap();
    });

    // With nobody reading, the writer must stall well short of 16 KiB.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!writer.is_finished(), "writer must block on the window");

    let mut received = Vec::new();
    peer_stream.read_to_end(&mut received).await.unwrap();
    assert_eq!(received.len(), 16 * 1024);
    assert!(received.iter().all(|&b| b == 7));
    writer.await.unwrap();
}

#[tokio::test]
async fn draining_session_refuses_new_opens() {
    let config = SessionConfig {
        drain_grace: Duration::from_millis(200),
        ..SessionConfig::default()
    };
    let (client, server) = session_pair(config);

    let closer = tokio::spawn({
        let client = client.clone();
        async move { client.close().await }
    });
    closer.await.unwrap();

    assert!(matches!(
        client.open_stream(2).await,
        Err(MuxError::SessionClosed)
    ));
    // The peer saw GoAway and refuses its own opens once it drains.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(server.open_stream(2).await.is_err());
}
