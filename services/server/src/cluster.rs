//! Cluster endpoint index: the application layer over gossip.
//!
//! Local upstream counts are published as `endpoint:<id>` entries on this
//! node's replicated table; each peer's entries feed the remote map through
//! the gossip watcher callbacks.  Lookup answers "who can take traffic for
//! this endpoint" with the set of reachable peers advertising a non-zero
//! count, plus their proxy addresses (published under `proxy_addr`).

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, OnceLock};

use piko_gossip::{Gossip, NodeId, Watcher};
use tracing::{debug, warn};

/// Key prefix for endpoint presence entries.
pub const ENDPOINT_KEY_PREFIX: &str = "endpoint:";
/// Key under which each node publishes its proxy port address.
pub const KEY_PROXY_ADDR: &str = "proxy_addr";

fn endpoint_key(endpoint_id: &str) -> String {
    format!("{ENDPOINT_KEY_PREFIX}{endpoint_id}")
}

#[derive(Default)]
struct RemoteNode {
    proxy_addr: Option<String>,
    endpoints: HashSet<String>,
    unreachable: bool,
}

#[derive(Default)]
struct RemoteIndex {
    /// endpoint -> nodes advertising it.
    endpoints: HashMap<String, HashSet<NodeId>>,
    nodes: HashMap<NodeId, RemoteNode>,
}

impl RemoteIndex {
    fn add_endpoint(&mut self, node: &NodeId, endpoint_id: &str) {
        self.endpoints
            .entry(endpoint_id.to_owned())
            .or_default()
            .insert(node.clone());
        self.nodes
            .entry(node.clone())
            .or_default()
            .endpoints
            .insert(endpoint_id.to_owned());
    }

    fn remove_endpoint(&mut self, node: &NodeId, endpoint_id: &str) {
        if let Some(nodes) = self.endpoints.get_mut(endpoint_id) {
            nodes.remove(node);
            if nodes.is_empty() {
                self.endpoints.remove(endpoint_id);
            }
        }
        if let Some(remote) = self.nodes.get_mut(node) {
            remote.endpoints.remove(endpoint_id);
        }
    }

    fn purge_node(&mut self, node: &NodeId) {
        if let Some(remote) = self.nodes.remove(node) {
            for endpoint_id in remote.endpoints {
                if let Some(nodes) = self.endpoints.get_mut(&endpoint_id) {
                    nodes.remove(node);
                    if nodes.is_empty() {
                        self.endpoints.remove(&endpoint_id);
                    }
                }
            }
        }
    }
}

pub struct ClusterIndex {
    remote: Mutex<RemoteIndex>,
    local: Mutex<HashMap<String, usize>>,
    gossip: OnceLock<Gossip>,
}

impl ClusterIndex {
    pub fn new() -> Self {
        Self {
            remote: Mutex::new(RemoteIndex::default()),
            local: Mutex::new(HashMap::new()),
            gossip: OnceLock::new(),
        }
    }

    /// Wire in the gossip handle once it exists (the index is constructed
    /// first because gossip needs it as the watcher) and publish this
    /// node's proxy address.
    pub fn attach(&self, gossip: Gossip, proxy_addr: &str) {
        gossip.upsert_local(KEY_PROXY_ADDR, proxy_addr);
        if self.gossip.set(gossip).is_err() {
            warn!("cluster index attached twice");
        }
    }

    /// Record the local upstream count for an endpoint and publish the
    /// change to the cluster (count zero deletes the entry).
    pub fn set_local_count(&self, endpoint_id: &str, count: usize) {
        {
            let mut local = lock(&self.local);
            if count == 0 {
                local.remove(endpoint_id);
            } else {
                local.insert(endpoint_id.to_owned(), count);
            }
        }
        let Some(gossip) = self.gossip.get() else {
            return;
        };
        let key = endpoint_key(endpoint_id);
        if count == 0 {
            gossip.delete_local(&key);
        } else {
            gossip.upsert_local(&key, &count.to_string());
        }
    }

    pub fn local_count(&self, endpoint_id: &str) -> usize {
        lock(&self.local).get(endpoint_id).copied().unwrap_or(0)
    }

    /// Gossip membership view, for the admin status surface.
    pub fn nodes_meta(&self) -> Vec<piko_gossip::NodeMeta> {
        self.gossip.get().map(Gossip::nodes).unwrap_or_default()
    }

    /// Reachable peers advertising `endpoint_id`, with their proxy
    /// addresses.
    pub fn lookup_remote(&self, endpoint_id: &str) -> Vec<(NodeId, String)> {
        let remote = lock(&self.remote);
        let Some(nodes) = remote.endpoints.get(endpoint_id) else {
            return Vec::new();
        };
        nodes
            .iter()
            .filter_map(|id| {
                let node = remote.nodes.get(id)?;
                if node.unreachable {
                    return None;
                }
                let addr = node.proxy_addr.clone()?;
                Some((id.clone(), addr))
            })
            .collect()
    }
}

impl Default for ClusterIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// Watcher callbacks run under the gossip state lock: O(1) map updates only.
impl Watcher for ClusterIndex {
    fn on_upsert_key(&self, node: &NodeId, key: &str, value: &str) {
        if key == KEY_PROXY_ADDR {
            lock(&self.remote)
                .nodes
                .entry(node.clone())
                .or_default()
                .proxy_addr = Some(value.to_owned());
            return;
        }
        let Some(endpoint_id) = key.strip_prefix(ENDPOINT_KEY_PREFIX) else {
            return;
        };
        let count: usize = value.parse().unwrap_or(0);
        let mut remote = lock(&self.remote);
        if count > 0 {
            remote.add_endpoint(node, endpoint_id);
        } else {
            remote.remove_endpoint(node, endpoint_id);
        }
        debug!(node = %node, endpoint_id, count, "remote endpoint updated");
    }

    fn on_delete_key(&self, node: &NodeId, key: &str) {
        if let Some(endpoint_id) = key.strip_prefix(ENDPOINT_KEY_PREFIX) {
            lock(&self.remote).remove_endpoint(node, endpoint_id);
            debug!(node = %node, endpoint_id, "remote endpoint removed");
        }
    }

    fn on_leave(&self, node: &NodeId) {
        lock(&self.remote).purge_node(node);
        debug!(node = %node, "node left, routes dropped");
    }

    fn on_expired(&self, node: &NodeId) {
        lock(&self.remote).purge_node(node);
        debug!(node = %node, "node expired, routes dropped");
    }

    fn on_unreachable(&self, node: &NodeId) {
        lock(&self.remote)
            .nodes
            .entry(node.clone())
            .or_default()
            .unreachable = true;
    }

    fn on_reachable(&self, node: &NodeId) {
        lock(&self.remote)
            .nodes
            .entry(node.clone())
            .or_default()
            .unreachable = false;
    }
}
