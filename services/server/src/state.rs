use std::sync::Arc;

use piko_mux::SessionConfig;

use crate::auth::Verifier;
use crate::cluster::ClusterIndex;
use crate::config::ServerConfig;
use crate::registry::Registry;

/// Shared server state threaded through the routers.
///
/// Constructed per node (never a process-wide singleton) so tests can run
/// whole clusters inside one process.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<Registry>,
    pub cluster: Arc<ClusterIndex>,
    pub verifier: Arc<dyn Verifier>,
    pub session_config: SessionConfig,
    pub node_id: String,
}
