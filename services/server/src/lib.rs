//! piko-server: one node of the reverse-tunnel gateway fleet.
//!
//! Three listeners per node: the proxy port (downstream HTTP and tunneled
//! TCP), the upstream port (agent tunnels), and the admin port.  Cluster
//! routing state rides on gossip; any node can take a request for any
//! endpoint and reach its upstream in at most one extra hop.

pub mod admin;
pub mod auth;
pub mod cluster;
pub mod config;
pub mod proxy;
pub mod registry;
pub mod state;
pub mod upstream_ws;
pub mod ws;

pub use config::{ConfigError, ServerConfig};
pub use state::AppState;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{error, info};

use crate::auth::{AllowAllVerifier, HmacVerifier, Verifier};
use crate::cluster::ClusterIndex;
use crate::registry::Registry;

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("bind {what}: {source}")]
    Bind {
        what: &'static str,
        source: std::io::Error,
    },
    #[error("gossip: {0}")]
    Gossip(#[from] piko_gossip::GossipError),
}

/// An invariant violation inside a handler panics that handler's task; the
/// catch-panic layer turns it into a 500 and the process keeps serving.
fn panic_to_response(
    err: Box<dyn std::any::Any + Send + 'static>,
) -> axum::http::Response<axum::body::Body> {
    let detail = err
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| err.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned());
    error!(%detail, "handler panicked");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        axum::Json(piko_protocol::ErrorBody::new("internal error")),
    )
        .into_response()
}

/// Proxy-port router: the TCP front-end route plus a catch-all reverse
/// proxy for every other method and path.
pub fn build_proxy_router(state: AppState) -> Router {
    Router::new()
        .route("/_piko/v1/tcp/{endpoint_id}", get(proxy::tcp::proxy_tcp_handler))
        .fallback(proxy::http::proxy_http_handler)
        .layer(CatchPanicLayer::custom(panic_to_response))
        .with_state(state)
}

pub fn build_upstream_router(state: AppState) -> Router {
    Router::new()
        .route("/piko/v1/upstream/ws", get(upstream_ws::upstream_ws_handler))
        .layer(CatchPanicLayer::custom(panic_to_response))
        .with_state(state)
}

pub fn build_admin_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(admin::health))
        .route("/ready", get(admin::ready))
        .route("/status/cluster", get(admin::cluster_status))
        .with_state(state)
}

/// A started node.  Owns its listeners, gossip instance and server tasks.
pub struct Node {
    state: AppState,
    gossip: piko_gossip::Gossip,
    proxy_addr: SocketAddr,
    upstream_addr: SocketAddr,
    admin_addr: SocketAddr,
    upstream_shutdown: CancellationToken,
    proxy_shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Bind all listeners, start gossip, and begin serving.
    pub async fn start(config: ServerConfig) -> Result<Node, StartError> {
        let proxy_listener = bind("proxy", config.proxy.bind).await?;
        let upstream_listener = bind("upstream", config.upstream.bind).await?;
        let admin_listener = bind("admin", config.admin.bind).await?;
        let proxy_addr = local_addr("proxy", &proxy_listener)?;
        let upstream_addr = local_addr("upstream", &upstream_listener)?;
        let admin_addr = local_addr("admin", &admin_listener)?;

        let cluster = Arc::new(ClusterIndex::new());
        let gossip = piko_gossip::Gossip::spawn(
            piko_gossip::GossipConfig {
                bind_addr: config.gossip.bind,
                advertise_addr: config.gossip.advertise_addr.clone(),
                join: config.gossip.join.clone(),
                interval: config.gossip.interval,
                suspicion_threshold: config.gossip.suspicion_threshold,
                node_expiry: config.gossip.node_expiry,
                compaction_threshold: config.gossip.compaction_threshold,
                ..piko_gossip::GossipConfig::default()
            },
            Arc::clone(&cluster) as Arc<dyn piko_gossip::Watcher>,
        )
        .await?;
        cluster.attach(gossip.clone(), &proxy_addr.to_string());

        let verifier: Arc<dyn Verifier> = match &config.auth.hmac_secret {
            Some(secret) => Arc::new(HmacVerifier::new(secret)),
            None => Arc::new(AllowAllVerifier),
        };
        let registry = Arc::new(Registry::new(Arc::clone(&cluster)));
        let state = AppState {
            config: Arc::new(config),
            registry,
            cluster,
            verifier,
            session_config: piko_mux::SessionConfig::default(),
            node_id: gossip.node_id(),
        };

        let upstream_shutdown = CancellationToken::new();
        let proxy_shutdown = CancellationToken::new();
        let tasks = vec![
            serve(
                proxy_listener,
                build_proxy_router(state.clone()),
                proxy_shutdown.clone(),
            ),
            serve(
                upstream_listener,
                build_upstream_router(state.clone()),
                upstream_shutdown.clone(),
            ),
            serve(
                admin_listener,
                build_admin_router(state.clone()),
                proxy_shutdown.clone(),
            ),
        ];

        info!(
            node_id = %state.node_id,
            proxy = %proxy_addr,
            upstream = %upstream_addr,
            admin = %admin_addr,
            gossip = %gossip.local_addr(),
            "node started"
        );
        Ok(Node {
            state,
            gossip,
            proxy_addr,
            upstream_addr,
            admin_addr,
            upstream_shutdown,
            proxy_shutdown,
            tasks,
        })
    }

    pub fn proxy_addr(&self) -> SocketAddr {
        self.proxy_addr
    }

    pub fn upstream_addr(&self) -> SocketAddr {
        self.upstream_addr
    }

    pub fn admin_addr(&self) -> SocketAddr {
        self.admin_addr
    }

    pub fn gossip_addr(&self) -> String {
        self.gossip.advertise_addr().to_owned()
    }

    pub fn node_id(&self) -> &str {
        &self.state.node_id
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Graceful shutdown: stop accepting upstream tunnels, announce the
    /// departure, give in-flight proxied streams the grace period, then
    /// stop everything.
    pub async fn shutdown(mut self) {
        info!(node_id = %self.state.node_id, "shutting down");
        self.upstream_shutdown.cancel();
        self.gossip.leave().await;

        let grace = self.state.config.grace_period;
        self.proxy_shutdown.cancel();
        let drain = async {
            for task in self.tasks.drain(..) {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            info!("grace period elapsed with streams still in flight");
        }
        self.gossip.shutdown();
        info!("node stopped");
    }
}

async fn bind(what: &'static str, addr: SocketAddr) -> Result<TcpListener, StartError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| StartError::Bind { what, source })
}

fn local_addr(what: &'static str, listener: &TcpListener) -> Result<SocketAddr, StartError> {
    listener
        .local_addr()
        .map_err(|source| StartError::Bind { what, source })
}

fn serve(listener: TcpListener, router: Router, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await;
        if let Err(e) = result {
            error!(error = %e, "server error");
        }
    })
}
