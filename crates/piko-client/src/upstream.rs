//! Outbound tunnel and listener surface.
//!
//! One session per listener.  A reconnect task owns the session handle and
//! hands accepted connections to the listener over a channel, so neither
//! side holds a back-pointer into the other.

use std::time::Duration;

use piko_mux::{Role, Session, SessionConfig};
use piko_protocol::{ListenRequest, ListenResponse, ProxyHeader, StreamKind};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::error::ClientError;
use crate::ws::{dial_ws, WsTransport};
use crate::Conn;

/// Upstream tunnel configuration; a plain record validated at construction.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Server base URL, e.g. `ws://127.0.0.1:8088`.
    pub url: String,
    /// Bearer token presented on the upgrade request.
    pub token: Option<String>,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Deadline for the Listen RPC.
    pub listen_timeout: Duration,
    pub session: SessionConfig,
}

impl UpstreamConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(15),
            listen_timeout: Duration::from_secs(10),
            session: SessionConfig::default(),
        }
    }
}

/// Factory for endpoint listeners over outbound tunnels.
pub struct Upstream {
    config: UpstreamConfig,
}

impl Upstream {
    pub fn new(config: UpstreamConfig) -> Result<Self, ClientError> {
        if config.url.is_empty() {
            return Err(ClientError::Configuration("url must be set".to_owned()));
        }
        Ok(Self { config })
    }

    /// Register `endpoint_id` and return its listener.
    ///
    /// Dials with backoff until the first success; terminal failures (a
    /// rejected token, an endpoint the token does not permit) surface
    /// immediately instead of retrying forever.
    pub async fn listen(&self, endpoint_id: &str) -> Result<Listener, ClientError> {
        let cancel = CancellationToken::new();
        let mut backoff = Backoff::new(self.config.backoff_base, self.config.backoff_max);
        let session = loop {
            match connect_and_listen(&self.config, endpoint_id).await {
                Ok(session) => break session,
                Err(ClientError::Connect(dial)) if dial.retryable => {
                    debug!(error = %dial, "listen dial failed, backing off");
                    if !backoff.wait(&cancel).await {
                        return Err(ClientError::Cancelled);
                    }
                }
                Err(e) => return Err(e),
            }
        };
        info!(endpoint_id, "listener registered");

        let (conn_tx, conn_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(ListenerState::Connected);
        tokio::spawn(run_listener(
            self.config.clone(),
            endpoint_id.to_owned(),
            session,
            conn_tx,
            state_tx,
            cancel.clone(),
        ));

        Ok(Listener {
            endpoint_id: endpoint_id.to_owned(),
            conn_rx: tokio::sync::Mutex::new(conn_rx),
            state_rx,
            cancel,
        })
    }
}

/// Listener lifecycle, observable through [`Listener::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

/// A registered endpoint listener.
///
/// `accept` yields proxied connections; the tunnel behind it reconnects
/// transparently until `close` (or a terminal dial error).
#[derive(Debug)]
pub struct Listener {
    endpoint_id: String,
    conn_rx: tokio::sync::Mutex<mpsc::Receiver<Conn>>,
    state_rx: watch::Receiver<ListenerState>,
    cancel: CancellationToken,
}

impl Listener {
    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    pub fn state(&self) -> ListenerState {
        *self.state_rx.borrow()
    }

    /// Next proxied connection.  Fails with [`ClientError::SessionClosed`]
    /// once the listener is closed for good.
    pub async fn accept(&self) -> Result<Conn, ClientError> {
        let mut rx = self.conn_rx.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ClientError::SessionClosed),
            conn = rx.recv() => conn.ok_or(ClientError::SessionClosed),
        }
    }

    /// Stop the reconnect loop and close the session.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Dial the upstream port, start a client-role session, and issue the
/// Listen RPC.
async fn connect_and_listen(
    config: &UpstreamConfig,
    endpoint_id: &str,
) -> Result<Session, ClientError> {
    let url = format!(
        "{}/piko/v1/upstream/ws",
        config.url.trim_end_matches('/')
    );
    let ws = dial_ws(&url, config.token.as_deref(), &[])
        .await
        .map_err(ClientError::Connect)?;
    let session = Session::spawn(WsTransport::new(ws), Role::Client, config.session.clone());

    let request = ListenRequest {
        endpoint_id: endpoint_id.to_owned(),
    };
    let response: ListenResponse = tokio::time::timeout(
        config.listen_timeout,
        session.rpc(StreamKind::Listen.as_u8(), &request),
    )
    .await
    .map_err(|_| ClientError::Timeout)?
    .map_err(ClientError::Mux)?;

    if let Some(error) = response.error {
        session.abort();
        return Err(ClientError::Rejected(error));
    }
    Ok(session)
}

/// Owns the session across reconnects and feeds accepted streams to the
/// listener.
async fn run_listener(
    config: UpstreamConfig,
    endpoint_id: String,
    first_session: Session,
    conn_tx: mpsc::Sender<Conn>,
    state_tx: watch::Sender<ListenerState>,
    cancel: CancellationToken,
) {
    let mut session = Some(first_session);
    let mut backoff = Backoff::new(config.backoff_base, config.backoff_max);

    'reconnect: loop {
        let current = match session.take() {
            Some(session) => session,
            None => {
                let _ = state_tx.send(ListenerState::Connecting);
                loop {
                    if cancel.is_cancelled() {
                        break 'reconnect;
                    }
                    match connect_and_listen(&config, &endpoint_id).await {
                        Ok(session) => {
                            backoff.reset();
                            break session;
                        }
                        Err(ClientError::Connect(dial)) if dial.retryable => {
                            debug!(%endpoint_id, error = %dial, "reconnect failed, backing off");
                            if !backoff.wait(&cancel).await {
                                break 'reconnect;
                            }
                        }
                        Err(e) => {
                            warn!(%endpoint_id, error = %e, "terminal listener error");
                            break 'reconnect;
                        }
                    }
                }
            }
        };
        let _ = state_tx.send(ListenerState::Connected);
        info!(%endpoint_id, "listener connected");

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => {
                    current.close().await;
                    break 'reconnect;
                }
                accepted = current.accept() => accepted,
            };
            match accepted {
                Ok((stream, kind)) => {
                    dispatch_stream(&endpoint_id, stream, kind, &conn_tx);
                }
                Err(_) => {
                    debug!(%endpoint_id, "session lost, reconnecting");
                    break;
                }
            }
        }
        let _ = state_tx.send(ListenerState::Disconnected);
    }

    let _ = state_tx.send(ListenerState::Closed);
    info!(%endpoint_id, "listener closed");
}

/// Strip and verify the proxy header off a server-opened stream, then hand
/// it to `accept`.  Runs detached so a malformed stream cannot stall the
/// session accept loop.
fn dispatch_stream(endpoint_id: &str, mut stream: Conn, kind: u8, conn_tx: &mpsc::Sender<Conn>) {
    if StreamKind::from_u8(kind) != Some(StreamKind::Proxy) {
        warn!(endpoint_id, kind, "ignoring stream of unexpected kind");
        return;
    }
    let endpoint_id = endpoint_id.to_owned();
    let conn_tx = conn_tx.clone();
    tokio::spawn(async move {
        let header: Result<ProxyHeader, _> = tokio::time::timeout(
            Duration::from_secs(5),
            piko_protocol::read_frame(&mut stream),
        )
        .await
        .map_err(|_| ())
        .and_then(|r| r.map_err(|_| ()));
        match header {
            Ok(header) if header.endpoint_id == endpoint_id => {
                let _ = conn_tx.send(stream).await;
            }
            Ok(header) => {
                warn!(
                    endpoint_id,
                    got = %header.endpoint_id,
                    "proxy header endpoint mismatch, dropping stream"
                );
            }
            Err(()) => {
                warn!(%endpoint_id, "malformed or missing proxy header");
            }
        }
    });
}
