// Cross-node routing: traffic arrives on one node while the upstream is
// connected to another.

mod common;

use std::time::Duration;

use common::{proxy_url, proxy_ws_url, start_node, upstream_config};
use piko_client::Dialer;
use piko_test_utils::{spawn_http_echo, spawn_tcp_echo, wait_until};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn http_request_reaches_upstream_on_another_node() {
    let node0 = start_node(None, vec![]).await;
    let seed = vec![node0.gossip_addr()];
    let node1 = start_node(None, seed.clone()).await;
    let node2 = start_node(None, seed).await;

    let upstream = piko_client::Upstream::new(upstream_config(&node0)).unwrap();
    spawn_http_echo(upstream.listen("my-endpoint").await.unwrap());

    // Wait for the endpoint advertisement to reach the other nodes.
    wait_until(Duration::from_secs(10), || {
        !node1.state().cluster.lookup_remote("my-endpoint").is_empty()
            && !node2.state().cluster.lookup_remote("my-endpoint").is_empty()
    })
    .await;

    let body = b"routed across the cluster".to_vec();
    let response = reqwest::Client::new()
        .get(format!("{}/", proxy_url(&node1)))
        .header("x-piko-endpoint", "my-endpoint")
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap().as_ref(), body.as_slice());

    node2.shutdown().await;
    node1.shutdown().await;
    node0.shutdown().await;
}

#[tokio::test]
async fn tcp_dial_reaches_upstream_on_another_node() {
    let node0 = start_node(None, vec![]).await;
    let node1 = start_node(None, vec![node0.gossip_addr()]).await;

    let upstream = piko_client::Upstream::new(upstream_config(&node0)).unwrap();
    spawn_tcp_echo(upstream.listen("cross-tcp").await.unwrap());

    wait_until(Duration::from_secs(10), || {
        !node1.state().cluster.lookup_remote("cross-tcp").is_empty()
    })
    .await;

    let dialer = Dialer::new(proxy_ws_url(&node1));
    let mut conn = dialer.dial("cross-tcp").await.unwrap();
    conn.write_all(b"foo").await.unwrap();
    conn.flush().await.unwrap();
    let mut buf = [0u8; 3];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"foo");

    node1.shutdown().await;
    node0.shutdown().await;
}

#[tokio::test]
async fn deregistration_propagates_and_clears_routes() {
    let node0 = start_node(None, vec![]).await;
    let node1 = start_node(None, vec![node0.gossip_addr()]).await;

    let upstream = piko_client::Upstream::new(upstream_config(&node0)).unwrap();
    let listener = upstream.listen("fleeting").await.unwrap();
    wait_until(Duration::from_secs(10), || {
        !node1.state().cluster.lookup_remote("fleeting").is_empty()
    })
    .await;

    listener.close();
    wait_until(Duration::from_secs(10), || {
        node1.state().cluster.lookup_remote("fleeting").is_empty()
    })
    .await;

    // With no upstream anywhere, dispatch on either node is a 502.
    let response = reqwest::Client::new()
        .get(format!("{}/", proxy_url(&node1)))
        .header("x-piko-endpoint", "fleeting")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);

    node1.shutdown().await;
    node0.shutdown().await;
}
