//! Admin surface: liveness, readiness, and a cluster status view.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

pub async fn health() -> impl IntoResponse {
    "ok"
}

pub async fn ready() -> impl IntoResponse {
    "ok"
}

#[derive(Debug, Serialize)]
pub struct NodeStatus {
    pub id: String,
    pub addr: String,
    pub left: bool,
    pub unreachable: bool,
}

#[derive(Debug, Serialize)]
pub struct ClusterStatus {
    pub node_id: String,
    pub nodes: Vec<NodeStatus>,
}

/// Gossip membership as this node sees it.
pub async fn cluster_status(State(state): State<AppState>) -> impl IntoResponse {
    let nodes = state
        .cluster
        .nodes_meta()
        .into_iter()
        .map(|meta| NodeStatus {
            id: meta.id,
            addr: meta.addr,
            left: meta.left,
            unreachable: meta.unreachable,
        })
        .collect();
    Json(ClusterStatus {
        node_id: state.node_id.clone(),
        nodes,
    })
}
