// piko-test-utils: shared helpers for the integration suites.
//
// Token minting for the HS256 verifier, echo upstream services that sit
// behind a tunnel listener, and a polling helper for eventual-consistency
// assertions.

use std::convert::Infallible;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use jsonwebtoken::{encode, EncodingKey, Header};
use piko_client::Listener;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

#[derive(Debug, Serialize)]
struct Claims {
    endpoints: Vec<String>,
    exp: u64,
}

/// Mint an HS256 endpoint token for tests.  An empty `endpoints` list means
/// the token permits every endpoint.
pub fn mint_token(secret: &str, endpoints: &[&str]) -> String {
    let exp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock before epoch")
        .as_secs()
        + 3600;
    encode(
        &Header::default(),
        &Claims {
            endpoints: endpoints.iter().map(|s| (*s).to_owned()).collect(),
            exp,
        },
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("token encoding")
}

/// Poll `condition` until it holds or `deadline` passes (then panic).
pub async fn wait_until<F>(deadline: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let start = tokio::time::Instant::now();
    loop {
        if condition() {
            return;
        }
        assert!(
            start.elapsed() < deadline,
            "condition not reached within {deadline:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Serve an HTTP echo (status 200, response body = request body) on every
/// connection the listener accepts.  Runs until the listener closes.
pub fn spawn_http_echo(listener: Listener) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(conn) = listener.accept().await {
            tokio::spawn(async move {
                let service = service_fn(|request: Request<Incoming>| async move {
                    let body = match request.into_body().collect().await {
                        Ok(collected) => collected.to_bytes(),
                        Err(_) => Bytes::new(),
                    };
                    Ok::<_, Infallible>(Response::new(Full::new(body)))
                });
                if let Err(e) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(conn), service)
                    .await
                {
                    tracing::debug!(error = %e, "echo connection ended");
                }
            });
        }
    })
}

/// Serve a byte echo on every connection the listener accepts.
pub fn spawn_tcp_echo(listener: Listener) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(mut conn) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match conn.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if conn.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                            let _ = conn.flush().await;
                        }
                    }
                }
            });
        }
    })
}
