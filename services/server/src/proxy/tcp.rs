//! Raw-TCP front-end: `GET /_piko/v1/tcp/{endpoint}` upgrades to a
//! WebSocket whose binary messages are the spliced connection bytes.
//!
//! Routing happens before the upgrade so a request with no upstream gets a
//! proper `502` instead of an aborted socket.  Node-to-node hops arrive
//! here with the forwarded marker and resolve strictly locally.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use piko_client::Dialer;
use tracing::debug;

use crate::proxy::{route, ProxyError, Route, FORWARDED_HEADER};
use crate::state::AppState;
use crate::upstream_ws::open_proxy_stream;
use crate::ws::AxumWsConn;

pub async fn proxy_tcp_handler(
    ws: WebSocketUpgrade,
    Path(endpoint_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let local_only = headers.contains_key(FORWARDED_HEADER);
    match route(&state, &endpoint_id, local_only) {
        Route::Local(session) => ws.on_upgrade(move |socket| async move {
            let mut stream = match open_proxy_stream(&session, &endpoint_id).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(%endpoint_id, error = %e, "upstream stream open failed");
                    return;
                }
            };
            let mut downstream = AxumWsConn::new(socket);
            let _ = tokio::io::copy_bidirectional(&mut downstream, &mut stream).await;
        }),
        Route::Remote(addr) => ws.on_upgrade(move |socket| async move {
            let dialer = Dialer::new(format!("ws://{addr}"));
            let mut remote = match dialer.dial_forwarded(&endpoint_id).await {
                Ok(conn) => conn,
                Err(e) => {
                    debug!(%endpoint_id, peer = %addr, error = %e, "remote hop dial failed");
                    return;
                }
            };
            let mut downstream = AxumWsConn::new(socket);
            let _ = tokio::io::copy_bidirectional(&mut downstream, &mut remote).await;
        }),
        Route::None => ProxyError::NoUpstreams.into_response(),
    }
}
