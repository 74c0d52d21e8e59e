// Upstream authentication with an HS256 secret configured.

mod common;

use common::{proxy_url, start_node, upstream_config};
use piko_client::ClientError;
use piko_test_utils::{mint_token, spawn_http_echo};

const SECRET: &str = "test-signing-secret";

#[tokio::test]
async fn valid_token_is_accepted_and_traffic_flows() {
    let node = start_node(Some(SECRET), vec![]).await;
    let mut config = upstream_config(&node);
    config.token = Some(mint_token(SECRET, &[]));

    let upstream = piko_client::Upstream::new(config).unwrap();
    spawn_http_echo(upstream.listen("secured").await.unwrap());

    let response = reqwest::Client::new()
        .get(format!("{}/", proxy_url(&node)))
        .header("x-piko-endpoint", "secured")
        .body("ping")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "ping");

    node.shutdown().await;
}

#[tokio::test]
async fn wrong_key_token_yields_invalid_token() {
    let node = start_node(Some(SECRET), vec![]).await;

    // Observable directly on the upstream port as a 401 envelope.
    let response = reqwest::Client::new()
        .get(format!("http://{}/piko/v1/upstream/ws", node.upstream_addr()))
        .bearer_auth(mint_token("some-other-secret", &[]))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    assert_eq!(response.text().await.unwrap(), r#"{"error":"invalid token"}"#);

    // And the SDK surfaces it as a terminal (non-retryable) dial error.
    let mut config = upstream_config(&node);
    config.token = Some(mint_token("some-other-secret", &[]));
    let upstream = piko_client::Upstream::new(config).unwrap();
    let err = upstream.listen("secured").await.unwrap_err();
    match err {
        ClientError::Connect(dial) => {
            assert!(!dial.retryable, "401 must not be retried: {dial}");
            assert!(dial.message.contains("401"), "got: {dial}");
        }
        other => panic!("expected Connect error, got {other:?}"),
    }

    node.shutdown().await;
}

#[tokio::test]
async fn missing_authorization_yields_its_own_401() {
    let node = start_node(Some(SECRET), vec![]).await;

    let response = reqwest::Client::new()
        .get(format!("http://{}/piko/v1/upstream/ws", node.upstream_addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    assert_eq!(
        response.text().await.unwrap(),
        r#"{"error":"missing authorization"}"#
    );

    let upstream = piko_client::Upstream::new(upstream_config(&node)).unwrap();
    let err = upstream.listen("secured").await.unwrap_err();
    match err {
        ClientError::Connect(dial) => assert!(!dial.retryable),
        other => panic!("expected Connect error, got {other:?}"),
    }

    node.shutdown().await;
}

#[tokio::test]
async fn token_endpoint_list_gates_registration() {
    let node = start_node(Some(SECRET), vec![]).await;
    let mut config = upstream_config(&node);
    config.token = Some(mint_token(SECRET, &["allowed-endpoint"]));
    let upstream = piko_client::Upstream::new(config).unwrap();

    // Permitted endpoint registers fine.
    let listener = upstream.listen("allowed-endpoint").await.unwrap();
    listener.close();

    // Any other endpoint is rejected at the Listen RPC, not retried.
    let err = upstream.listen("forbidden-endpoint").await.unwrap_err();
    match err {
        ClientError::Rejected(reason) => assert_eq!(reason, "endpoint not permitted"),
        other => panic!("expected Rejected, got {other:?}"),
    }

    node.shutdown().await;
}
