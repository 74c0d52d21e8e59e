//! HTTP reverse proxy.
//!
//! Requests are rewritten onto the chosen upstream byte stream with a
//! hyper http1 client connection: locally that stream is a mux Proxy
//! stream (after its header), remotely a WebSocket-tunneled connection to
//! the advertising peer.  `101 Switching Protocols` responses are spliced
//! byte-for-byte after both handshakes complete, which is what carries
//! proxied WebSockets end to end.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use hyper_util::rt::TokioIo;
use piko_client::Dialer;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::proxy::{
    resolve_endpoint_id, route, ProxyError, Route, ENDPOINT_HEADER, FORWARDED_HEADER,
};
use crate::state::AppState;
use crate::upstream_ws::open_proxy_stream;

pub async fn proxy_http_handler(State(state): State<AppState>, mut request: Request) -> Response {
    let Some(endpoint_id) = resolve_endpoint_id(request.headers()) else {
        return ProxyError::MissingEndpoint.into_response();
    };
    let local_only = request.headers().contains_key(FORWARDED_HEADER);
    request.headers_mut().remove(ENDPOINT_HEADER);
    request.headers_mut().remove(FORWARDED_HEADER);

    let timeout = state.config.proxy.http_timeout;
    let result = match route(&state, &endpoint_id, local_only) {
        Route::Local(session) => match open_proxy_stream(&session, &endpoint_id).await {
            Ok(stream) => proxy_request_over(stream, request, timeout).await,
            Err(e) => {
                debug!(%endpoint_id, error = %e, "failed to open upstream stream");
                Err(ProxyError::Upstream("upstream session closed".to_owned()))
            }
        },
        Route::Remote(addr) => {
            let dialer = Dialer::new(format!("ws://{addr}"));
            match dialer.dial_forwarded(&endpoint_id).await {
                Ok(conn) => proxy_request_over(conn, request, timeout).await,
                Err(e) => {
                    debug!(%endpoint_id, peer = %addr, error = %e, "remote hop dial failed");
                    Err(ProxyError::Upstream("peer node unavailable".to_owned()))
                }
            }
        }
        Route::None => Err(ProxyError::NoUpstreams),
    };

    match result {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// Send `request` over `io` with a dedicated http1 client connection and
/// stream the response back.
async fn proxy_request_over<IO>(
    io: IO,
    mut request: Request,
    timeout: Duration,
) -> Result<Response, ProxyError>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // Taken now so a later 101 can upgrade the downstream side too.
    let downstream_upgrade = request.extensions_mut().remove::<hyper::upgrade::OnUpgrade>();

    let exchange = async move {
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!(error = %e, "proxy connection task ended");
            }
        });
        sender
            .send_request(request)
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))
    };
    let mut response = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| ProxyError::Timeout)??;

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        match downstream_upgrade {
            Some(downstream_upgrade) => {
                let upstream_upgrade = hyper::upgrade::on(&mut response);
                tokio::spawn(async move {
                    match tokio::try_join!(upstream_upgrade, downstream_upgrade) {
                        Ok((upstream, downstream)) => {
                            let mut upstream = TokioIo::new(upstream);
                            let mut downstream = TokioIo::new(downstream);
                            let _ = tokio::io::copy_bidirectional(&mut downstream, &mut upstream)
                                .await;
                        }
                        Err(e) => debug!(error = %e, "upgrade splice failed"),
                    }
                });
            }
            None => {
                warn!("upstream switched protocols but downstream cannot upgrade");
            }
        }
    }

    Ok(response.map(Body::new).into_response())
}
