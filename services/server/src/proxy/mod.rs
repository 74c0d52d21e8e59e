//! Proxy front-end: endpoint resolution, load balancing, and the two
//! forwarding paths (HTTP reverse proxy and WebSocket-tunneled TCP).

pub mod http;
pub mod tcp;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use piko_mux::Session;
use piko_protocol::{error_codes, ErrorBody};
use rand::seq::SliceRandom;

use crate::state::AppState;

/// Header naming the target endpoint of a proxied HTTP request.  Stripped
/// before forwarding.
pub const ENDPOINT_HEADER: &str = "x-piko-endpoint";
/// Marker set on node-to-node hops.  A request carrying it resolves
/// strictly locally — routing never takes more than one extra hop.
pub const FORWARDED_HEADER: &str = "x-piko-forwarded";

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("no available upstreams")]
    NoUpstreams,
    #[error("missing endpoint id")]
    MissingEndpoint,
    #[error("upstream timeout")]
    Timeout,
    #[error("upstream unavailable: {0}")]
    Upstream(String),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ProxyError::NoUpstreams => (
                StatusCode::BAD_GATEWAY,
                error_codes::NO_AVAILABLE_UPSTREAMS.to_owned(),
            ),
            ProxyError::MissingEndpoint => {
                (StatusCode::BAD_REQUEST, "missing endpoint id".to_owned())
            }
            ProxyError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "upstream timeout".to_owned()),
            ProxyError::Upstream(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
        };
        (status, Json(ErrorBody::new(message))).into_response()
    }
}

/// Where a connection for an endpoint should go.
pub enum Route {
    /// A locally connected upstream session.
    Local(Session),
    /// A peer's proxy address, one hop away.
    Remote(String),
    None,
}

/// Resolve an endpoint to a route: any local upstream wins (uniform random
/// among them), otherwise a random advertising peer, unless `local_only`
/// pins resolution to this node.
pub fn route(state: &AppState, endpoint_id: &str, local_only: bool) -> Route {
    if let Some(session) = state.registry.select(endpoint_id) {
        return Route::Local(session);
    }
    if local_only {
        return Route::None;
    }
    let candidates = state.cluster.lookup_remote(endpoint_id);
    match candidates.choose(&mut rand::thread_rng()) {
        Some((_, addr)) => Route::Remote(addr.clone()),
        None => Route::None,
    }
}

/// Endpoint ID of an HTTP request: the `x-piko-endpoint` header, else the
/// `Host` sub-domain (`my-endpoint.piko.example.com` -> `my-endpoint`).
pub fn resolve_endpoint_id(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(ENDPOINT_HEADER) {
        let endpoint_id = value.to_str().ok()?.trim();
        if !endpoint_id.is_empty() {
            return Some(endpoint_id.to_owned());
        }
    }
    let host = headers.get(axum::http::header::HOST)?.to_str().ok()?;
    let host = host.rsplit_once(':').map_or(host, |(h, _)| h);
    let labels: Vec<&str> = host.split('.').collect();
    // Only hosts with a sub-domain name an endpoint.
    if labels.len() >= 3 && !labels[0].is_empty() {
        return Some(labels[0].to_owned());
    }
    None
}
