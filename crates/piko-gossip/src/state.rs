//! The versioned per-node key/value table and its merge rules.
//!
//! The local node is authoritative for its own entries: only it bumps its
//! version counter.  Everything learned about peers flows through
//! [`State::apply_delta`], which enforces version monotonicity, fires
//! watcher callbacks in version order, and honors compaction boundaries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::watcher::Watcher;
use crate::wire::{Delta, Digest, DigestEntry, NodeDelta};

pub type NodeId = String;

/// Reserved key namespace; internal entries replicate but never reach key
/// watchers.
pub const INTERNAL_PREFIX: &str = "_internal:";
/// Leave tombstone.  Sticky: once seen, the node is gone for good.
pub const KEY_LEFT: &str = "_internal:left";
/// Compaction boundary; the value is the last discarded version.
pub const KEY_COMPACT: &str = "_internal:compact";

/// One replicated entry.  `(node, key)` is unique; the latest version wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    pub value: String,
    pub version: u64,
    pub internal: bool,
    pub deleted: bool,
}

/// Point-in-time view of one known node, for status surfaces and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMeta {
    pub id: NodeId,
    pub addr: String,
    pub version: u64,
    pub left: bool,
    pub unreachable: bool,
}

struct NodeState {
    addr: String,
    max_version: u64,
    left: bool,
    unreachable: bool,
    expiry: Option<Instant>,
    entries: HashMap<String, Entry>,
}

impl NodeState {
    fn new(addr: String) -> Self {
        Self {
            addr,
            max_version: 0,
            left: false,
            unreachable: false,
            expiry: None,
            entries: HashMap::new(),
        }
    }
}

pub(crate) struct State {
    local_id: NodeId,
    nodes: HashMap<NodeId, NodeState>,
    node_expiry: Duration,
    watcher: Arc<dyn Watcher>,
}

impl State {
    pub fn new(
        local_id: NodeId,
        local_addr: String,
        node_expiry: Duration,
        watcher: Arc<dyn Watcher>,
    ) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(local_id.clone(), NodeState::new(local_addr));
        Self {
            local_id,
            nodes,
            node_expiry,
            watcher,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    fn local_mut(&mut self) -> &mut NodeState {
        self.nodes
            .get_mut(&self.local_id)
            .expect("local node always present")
    }

    // -----------------------------------------------------------------------
    // Local mutations (authoritative)
    // -----------------------------------------------------------------------

    pub fn upsert_local(&mut self, key: &str, value: &str) {
        let internal = key.starts_with(INTERNAL_PREFIX);
        let local = self.local_mut();
        local.max_version += 1;
        let version = local.max_version;
        local.entries.insert(
            key.to_owned(),
            Entry {
                key: key.to_owned(),
                value: value.to_owned(),
                version,
                internal,
                deleted: false,
            },
        );
    }

    /// Replace a live entry with a tombstone.  Absent keys are a no-op:
    /// there is nothing for peers to forget.
    pub fn delete_local(&mut self, key: &str) {
        let internal = key.starts_with(INTERNAL_PREFIX);
        let local = self.local_mut();
        if !local.entries.contains_key(key) {
            return;
        }
        local.max_version += 1;
        let version = local.max_version;
        local.entries.insert(
            key.to_owned(),
            Entry {
                key: key.to_owned(),
                value: String::new(),
                version,
                internal,
                deleted: true,
            },
        );
    }

    /// Publish the leave tombstone once.  Idempotent.
    ///
    /// Also flags the local node `left` so our own digests carry the
    /// tombstone and peers that never knew us do not discover us on the
    /// way out.
    pub fn leave_local(&mut self) {
        if self.local_mut().entries.contains_key(KEY_LEFT) {
            return;
        }
        self.upsert_local(KEY_LEFT, "");
        self.local_mut().left = true;
    }

    /// Number of deleted (tombstoned) local entries, the compaction trigger.
    pub fn deleted_local_count(&self) -> usize {
        self.nodes[&self.local_id]
            .entries
            .values()
            .filter(|e| e.deleted)
            .count()
    }

    /// Rewrite the local table: drop tombstones and any prior compaction
    /// marker, re-version survivors ascending above the previous maximum,
    /// then record the discard boundary so peers can drop the same entries.
    ///
    /// Returns false when there was nothing to discard.
    pub fn compact_local(&mut self) -> bool {
        let local = self.local_mut();
        let (mut survivors, discarded): (Vec<Entry>, Vec<Entry>) = local
            .entries
            .drain()
            .map(|(_, entry)| entry)
            .partition(|entry| !entry.deleted && entry.key != KEY_COMPACT);
        if discarded.is_empty() {
            for entry in survivors {
                local.entries.insert(entry.key.clone(), entry);
            }
            return false;
        }

        let last_discarded = discarded.iter().map(|e| e.version).max().unwrap_or(0);
        survivors.sort_by_key(|entry| entry.version);
        for mut entry in survivors {
            local.max_version += 1;
            entry.version = local.max_version;
            local.entries.insert(entry.key.clone(), entry);
        }
        local.max_version += 1;
        let version = local.max_version;
        local.entries.insert(
            KEY_COMPACT.to_owned(),
            Entry {
                key: KEY_COMPACT.to_owned(),
                value: last_discarded.to_string(),
                version,
                internal: true,
                deleted: false,
            },
        );
        debug!(last_discarded, "compacted local entries");
        true
    }

    // -----------------------------------------------------------------------
    // Digests and deltas
    // -----------------------------------------------------------------------

    pub fn digest(&self) -> Digest {
        let local = &self.nodes[&self.local_id];
        Digest {
            sender: self.local_id.clone(),
            sender_addr: local.addr.clone(),
            entries: self
                .nodes
                .iter()
                .map(|(id, node)| DigestEntry {
                    id: id.clone(),
                    addr: node.addr.clone(),
                    version: node.max_version,
                    left: node.left,
                })
                .collect(),
            full: true,
        }
    }

    /// Compute the entries the digest's sender is missing: for each node we
    /// share, everything above the digest's version; for nodes a full digest
    /// omits, everything from zero.  The sender's own node is skipped — it
    /// is authoritative for itself.
    pub fn delta_for(&self, digest: &Digest) -> Delta {
        let mut known_versions: HashMap<&str, u64> = HashMap::new();
        for entry in &digest.entries {
            known_versions.insert(entry.id.as_str(), entry.version);
        }

        let mut nodes = Vec::new();
        for (id, node) in &self.nodes {
            if *id == digest.sender {
                continue;
            }
            let from_version = match known_versions.get(id.as_str()) {
                Some(v) => *v,
                None if digest.full => 0,
                None => continue,
            };
            if node.max_version <= from_version {
                continue;
            }
            let mut entries: Vec<Entry> = node
                .entries
                .values()
                .filter(|entry| entry.version > from_version)
                .cloned()
                .collect();
            if entries.is_empty() {
                continue;
            }
            entries.sort_by_key(|entry| entry.version);
            nodes.push(NodeDelta {
                id: id.clone(),
                addr: node.addr.clone(),
                entries,
            });
        }
        Delta { nodes }
    }

    /// Learn node existence from a digest.  Unknown nodes marked `left` are
    /// ignored so tombstoned members are never rediscovered.
    pub fn observe_digest(&mut self, digest: &Digest) {
        for entry in &digest.entries {
            if entry.id == self.local_id || self.nodes.contains_key(&entry.id) {
                continue;
            }
            if entry.left {
                continue;
            }
            self.nodes
                .insert(entry.id.clone(), NodeState::new(entry.addr.clone()));
            self.watcher.on_join(&entry.id);
        }
    }

    /// Merge a delta.  Per entry: discard stale versions, apply the rest in
    /// version order, and fire watcher callbacks.  Deltas about ourselves
    /// are ignored.
    pub fn apply_delta(&mut self, delta: &Delta) {
        for node_delta in &delta.nodes {
            if node_delta.id == self.local_id {
                continue;
            }
            self.apply_node_delta(node_delta);
        }
    }

    fn apply_node_delta(&mut self, node_delta: &NodeDelta) {
        if !self.nodes.contains_key(&node_delta.id) {
            // Never resurrect a node we only know through its tombstone.
            if node_delta
                .entries
                .iter()
                .any(|entry| entry.key == KEY_LEFT && !entry.deleted)
            {
                return;
            }
            self.nodes.insert(
                node_delta.id.clone(),
                NodeState::new(node_delta.addr.clone()),
            );
            self.watcher.on_join(&node_delta.id);
        }

        let mut entries = node_delta.entries.clone();
        entries.sort_by_key(|entry| entry.version);

        for entry in entries {
            let Some(node) = self.nodes.get_mut(&node_delta.id) else {
                return;
            };
            let known = node.entries.get(&entry.key).map_or(0, |e| e.version);
            if entry.version <= known {
                continue;
            }
            node.max_version = node.max_version.max(entry.version);
            node.entries.insert(entry.key.clone(), entry.clone());

            if entry.key == KEY_LEFT && !entry.deleted {
                self.mark_left(&node_delta.id);
                continue;
            }
            if entry.key == KEY_COMPACT && !entry.deleted {
                self.apply_compact_boundary(&node_delta.id, &entry);
                continue;
            }
            if entry.internal {
                continue;
            }
            if entry.deleted {
                self.watcher.on_delete_key(&node_delta.id, &entry.key);
            } else {
                self.watcher
                    .on_upsert_key(&node_delta.id, &entry.key, &entry.value);
            }
        }
    }

    fn mark_left(&mut self, id: &NodeId) {
        let expiry = Instant::now() + self.node_expiry;
        if let Some(node) = self.nodes.get_mut(id) {
            if node.left {
                return;
            }
            node.left = true;
            node.expiry = Some(expiry);
        }
        self.watcher.on_leave(id);
    }

    /// Drop every entry of `id` at or below the announced boundary.  The
    /// surviving re-versioned copies arrive in the same (or an earlier)
    /// delta, so the table is never left holding stale versions.
    fn apply_compact_boundary(&mut self, id: &NodeId, entry: &Entry) {
        let Ok(boundary) = entry.value.parse::<u64>() else {
            debug!(node = %id, value = %entry.value, "ignoring malformed compact boundary");
            return;
        };
        if let Some(node) = self.nodes.get_mut(id) {
            node.entries.retain(|_, e| e.version > boundary);
        }
    }

    // -----------------------------------------------------------------------
    // Liveness bookkeeping
    // -----------------------------------------------------------------------

    pub fn mark_unreachable(&mut self, id: &NodeId) {
        let expiry = Instant::now() + self.node_expiry;
        if let Some(node) = self.nodes.get_mut(id) {
            if node.unreachable || node.left {
                return;
            }
            node.unreachable = true;
            node.expiry = Some(expiry);
        } else {
            return;
        }
        self.watcher.on_unreachable(id);
    }

    pub fn mark_reachable(&mut self, id: &NodeId) {
        if let Some(node) = self.nodes.get_mut(id) {
            if !node.unreachable || node.left {
                return;
            }
            node.unreachable = false;
            node.expiry = None;
        } else {
            return;
        }
        self.watcher.on_reachable(id);
    }

    /// Remove nodes whose expiry has passed, with all their entries.
    /// Returns the removed IDs so the caller can drop detector history.
    pub fn remove_expired(&mut self, now: Instant) -> Vec<NodeId> {
        let expired: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(id, node)| {
                **id != self.local_id
                    && (node.left || node.unreachable)
                    && node.expiry.is_some_and(|at| at <= now)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.nodes.remove(id);
            self.watcher.on_expired(id);
        }
        expired
    }

    // -----------------------------------------------------------------------
    // Views
    // -----------------------------------------------------------------------

    /// Peers eligible as gossip targets: live, not left, not us.
    pub fn live_peers(&self) -> Vec<(NodeId, String)> {
        self.nodes
            .iter()
            .filter(|(id, node)| **id != self.local_id && !node.left && !node.unreachable)
            .map(|(id, node)| (id.clone(), node.addr.clone()))
            .collect()
    }

    pub fn unreachable_peers(&self) -> Vec<(NodeId, String)> {
        self.nodes
            .iter()
            .filter(|(id, node)| **id != self.local_id && !node.left && node.unreachable)
            .map(|(id, node)| (id.clone(), node.addr.clone()))
            .collect()
    }

    pub fn nodes_meta(&self) -> Vec<NodeMeta> {
        self.nodes
            .iter()
            .map(|(id, node)| NodeMeta {
                id: id.clone(),
                addr: node.addr.clone(),
                version: node.max_version,
                left: node.left,
                unreachable: node.unreachable,
            })
            .collect()
    }

    pub fn entries_of(&self, id: &NodeId) -> Option<Vec<Entry>> {
        self.nodes.get(id).map(|node| {
            let mut entries: Vec<Entry> = node.entries.values().cloned().collect();
            entries.sort_by_key(|entry| entry.version);
            entries
        })
    }

    pub fn get(&self, id: &NodeId, key: &str) -> Option<Entry> {
        self.nodes.get(id)?.entries.get(key).cloned()
    }
}
