use crate::state::NodeId;

/// Observer of remote cluster-state changes.
///
/// Callbacks run under the cluster-state mutex and are delivered in version
/// order per peer.  They must be O(1) and non-blocking; anything heavier
/// belongs behind a channel.  Internal (`_internal:*`) keys never reach the
/// key callbacks, and a node's own local mutations fire nothing.
#[allow(unused_variables)]
pub trait Watcher: Send + Sync + 'static {
    /// A previously unknown peer was observed via digest or delta.
    fn on_join(&self, node: &NodeId) {}
    /// A peer published its leave tombstone.
    fn on_leave(&self, node: &NodeId) {}
    /// A left or unreachable peer passed its expiry and was removed along
    /// with all of its entries.
    fn on_expired(&self, node: &NodeId) {}
    fn on_reachable(&self, node: &NodeId) {}
    fn on_unreachable(&self, node: &NodeId) {}
    fn on_upsert_key(&self, node: &NodeId, key: &str, value: &str) {}
    fn on_delete_key(&self, node: &NodeId, key: &str) {}
}

/// Watcher that ignores everything.
pub struct NoopWatcher;

impl Watcher for NoopWatcher {}
