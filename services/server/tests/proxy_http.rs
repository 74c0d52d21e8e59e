// Single-node HTTP proxying through a registered upstream.

mod common;

use common::{proxy_url, start_node, upstream_config};
use piko_test_utils::spawn_http_echo;

fn test_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) % 251) as u8).collect()
}

#[tokio::test]
async fn http_request_is_echoed_byte_exact() {
    let node = start_node(None, vec![]).await;
    let upstream = piko_client::Upstream::new(upstream_config(&node)).unwrap();
    let listener = upstream.listen("my-endpoint").await.unwrap();
    spawn_http_echo(listener);

    let body = test_body(4096);
    let response = reqwest::Client::new()
        .get(format!("{}/", proxy_url(&node)))
        .header("x-piko-endpoint", "my-endpoint")
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let echoed = response.bytes().await.unwrap();
    assert_eq!(echoed.as_ref(), body.as_slice());

    node.shutdown().await;
}

#[tokio::test]
async fn requests_spread_across_multiple_upstreams() {
    let node = start_node(None, vec![]).await;
    let upstream = piko_client::Upstream::new(upstream_config(&node)).unwrap();
    // Two registrations for the same endpoint; both serve echoes.
    spawn_http_echo(upstream.listen("shared").await.unwrap());
    spawn_http_echo(upstream.listen("shared").await.unwrap());

    let client = reqwest::Client::new();
    for i in 0..10 {
        let body = test_body(64 + i);
        let response = client
            .post(format!("{}/work", proxy_url(&node)))
            .header("x-piko-endpoint", "shared")
            .body(body.clone())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.bytes().await.unwrap().as_ref(), body.as_slice());
    }

    node.shutdown().await;
}

#[tokio::test]
async fn endpoint_header_is_stripped_before_forwarding() {
    let node = start_node(None, vec![]).await;
    let upstream = piko_client::Upstream::new(upstream_config(&node)).unwrap();
    let listener = upstream.listen("observer").await.unwrap();

    // A bespoke upstream that reports whether the routing header survived.
    tokio::spawn(async move {
        while let Ok(conn) = listener.accept().await {
            tokio::spawn(async move {
                use http_body_util::Full;
                use hyper::body::Bytes;
                use hyper::service::service_fn;
                let service = service_fn(|request: hyper::Request<hyper::body::Incoming>| async move {
                    let leaked = request.headers().contains_key("x-piko-endpoint");
                    let body = if leaked { "leaked" } else { "clean" };
                    Ok::<_, std::convert::Infallible>(hyper::Response::new(Full::new(
                        Bytes::from(body),
                    )))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(hyper_util::rt::TokioIo::new(conn), service)
                    .await;
            });
        }
    });

    let response = reqwest::Client::new()
        .get(format!("{}/", proxy_url(&node)))
        .header("x-piko-endpoint", "observer")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "clean");

    node.shutdown().await;
}
