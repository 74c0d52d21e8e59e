// Single-node raw-TCP proxying through the WebSocket front-end.

mod common;

use common::{proxy_ws_url, start_node, upstream_config};
use piko_client::Dialer;
use piko_test_utils::spawn_tcp_echo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn dialed_connection_echoes_three_bytes() {
    let node = start_node(None, vec![]).await;
    let upstream = piko_client::Upstream::new(upstream_config(&node)).unwrap();
    spawn_tcp_echo(upstream.listen("my-endpoint").await.unwrap());

    let dialer = Dialer::new(proxy_ws_url(&node));
    let mut conn = dialer.dial("my-endpoint").await.unwrap();
    conn.write_all(b"foo").await.unwrap();
    conn.flush().await.unwrap();

    let mut buf = [0u8; 3];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"foo");

    node.shutdown().await;
}

#[tokio::test]
async fn large_payload_roundtrips_in_order() {
    let node = start_node(None, vec![]).await;
    let upstream = piko_client::Upstream::new(upstream_config(&node)).unwrap();
    spawn_tcp_echo(upstream.listen("bulk").await.unwrap());

    let dialer = Dialer::new(proxy_ws_url(&node));
    let mut conn = dialer.dial("bulk").await.unwrap();

    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 256) as u8).collect();
    let (mut rd, mut wr) = tokio::io::split(conn);
    let to_send = payload.clone();
    let writer = tokio::spawn(async move {
        wr.write_all(&to_send).await.unwrap();
        wr.flush().await.unwrap();
        wr
    });

    let mut received = vec![0u8; payload.len()];
    rd.read_exact(&mut received).await.unwrap();
    assert_eq!(received, payload);
    writer.await.unwrap();

    node.shutdown().await;
}

#[tokio::test]
async fn concurrent_tcp_connections_stay_isolated() {
    let node = start_node(None, vec![]).await;
    let upstream = piko_client::Upstream::new(upstream_config(&node)).unwrap();
    spawn_tcp_echo(upstream.listen("many").await.unwrap());

    let dialer = Dialer::new(proxy_ws_url(&node));
    let mut tasks = Vec::new();
    for i in 0..8u8 {
        let dialer = dialer.clone();
        tasks.push(tokio::spawn(async move {
            let mut conn = dialer.dial("many").await.unwrap();
            let message = vec![i; 128];
            conn.write_all(&message).await.unwrap();
            conn.flush().await.unwrap();
            let mut buf = vec![0u8; 128];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, message);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    node.shutdown().await;
}
