//! Upstream port: where agents dial in and register endpoints.
//!
//! `GET /piko/v1/upstream/ws` authenticates the bearer token before the
//! upgrade, then runs a server-role mux session.  The agent issues Listen
//! RPCs over it; the server opens Proxy streams back.  Every registration
//! made by a session is removed when the session ends, however it ends.

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use piko_mux::{Role, Session};
use piko_protocol::{
    error_codes, ErrorBody, ListenRequest, ListenResponse, ProxyHeader, StreamKind,
};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auth::{extract_token_from_headers, AuthError, EndpointToken};
use crate::state::AppState;
use crate::ws::AxumWsTransport;

const LISTEN_RPC_TIMEOUT: Duration = Duration::from_secs(10);

// Auth runs before the upgrade extractor is consulted, so a rejected
// token is an ordinary 401 JSON response whether or not the request was a
// well-formed WebSocket upgrade.
pub async fn upstream_ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let token = extract_token_from_headers(&headers);
    let token = match state.verifier.verify_endpoint_token(token.as_deref()) {
        Ok(token) => token,
        Err(AuthError::MissingAuthorization) => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorBody::new(error_codes::MISSING_AUTHORIZATION)),
            )
                .into_response();
        }
        Err(AuthError::InvalidToken) => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorBody::new(error_codes::INVALID_TOKEN)),
            )
                .into_response();
        }
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    ws.on_upgrade(move |socket| async move {
        let session = Session::spawn(
            AxumWsTransport::new(socket),
            Role::Server,
            state.session_config.clone(),
        );
        serve_session(state, session, token).await;
    })
}

async fn serve_session(state: AppState, session: Session, token: EndpointToken) {
    info!("upstream session established");
    let mut registrations: Vec<(String, u64)> = Vec::new();

    loop {
        let (stream, kind) = match session.accept().await {
            Ok(accepted) => accepted,
            Err(_) => break,
        };
        match StreamKind::from_u8(kind) {
            Some(StreamKind::Listen) => {
                if let Some(registration) =
                    serve_listen_rpc(&state, &session, stream, &token).await
                {
                    registrations.push(registration);
                }
            }
            other => {
                warn!(kind, ?other, "dropping upstream stream of unexpected kind");
            }
        }
    }

    for (endpoint_id, registration_id) in registrations {
        state.registry.remove(&endpoint_id, registration_id);
    }
    info!("upstream session ended");
}

/// Serve one Listen RPC stream: read the request, check the token's
/// endpoint list, register, respond.
async fn serve_listen_rpc(
    state: &AppState,
    session: &Session,
    mut stream: piko_mux::MuxStream,
    token: &EndpointToken,
) -> Option<(String, u64)> {
    let request: ListenRequest =
        match tokio::time::timeout(LISTEN_RPC_TIMEOUT, piko_protocol::read_frame(&mut stream))
            .await
        {
            Ok(Ok(request)) => request,
            Ok(Err(e)) => {
                debug!(error = %e, "malformed listen request");
                return None;
            }
            Err(_) => {
                debug!("timed out reading listen request");
                return None;
            }
        };

    if !token.permits(&request.endpoint_id) {
        warn!(endpoint_id = %request.endpoint_id, "token does not permit endpoint");
        let response = ListenResponse {
            endpoint_id: request.endpoint_id,
            error: Some(error_codes::ENDPOINT_NOT_PERMITTED.to_owned()),
        };
        let _ = piko_protocol::write_frame(&mut stream, &response).await;
        return None;
    }

    let registration_id = state.registry.add(&request.endpoint_id, session.clone());
    let response = ListenResponse {
        endpoint_id: request.endpoint_id.clone(),
        error: None,
    };
    if piko_protocol::write_frame(&mut stream, &response)
        .await
        .is_err()
    {
        state.registry.remove(&request.endpoint_id, registration_id);
        return None;
    }
    Some((request.endpoint_id, registration_id))
}

/// Open a Proxy stream toward a registered upstream and write the header
/// that names the endpoint the traffic is for.
pub async fn open_proxy_stream(
    session: &Session,
    endpoint_id: &str,
) -> Result<piko_mux::MuxStream, piko_mux::MuxError> {
    let mut stream = session.open_stream(StreamKind::Proxy.as_u8()).await?;
    piko_protocol::write_frame(
        &mut stream,
        &ProxyHeader {
            endpoint_id: endpoint_id.to_owned(),
        },
    )
    .await
    .map_err(|e| match e {
        piko_protocol::FrameError::Io(io) => piko_mux::MuxError::Io(io),
        other => piko_mux::MuxError::Codec(other),
    })?;
    Ok(stream)
}
