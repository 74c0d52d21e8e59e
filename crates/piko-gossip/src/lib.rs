//! piko-gossip: eventually consistent cluster state.
//!
//! Every node owns a versioned key/value table; peers replicate it through
//! scuttlebutt-style anti-entropy rounds (`SYN -> SYN-ACK -> ACK2`) over
//! TCP.  Only the owning node mutates its own table; peers are read-only
//! replicas converging on the latest version per key.
//!
//! A φ-style failure detector flags silent peers `UNREACHABLE`; explicit
//! departure is a sticky `_internal:left` tombstone.  Both paths end in
//! expiry-driven removal.  Deleted entries are garbage-collected by
//! compaction, announced to peers with an `_internal:compact` boundary.

mod config;
mod failure;
mod gossiper;
mod state;
mod transport;
mod watcher;
mod wire;

pub use config::GossipConfig;
pub use gossiper::{Gossip, GossipError};
pub use state::{Entry, NodeId, NodeMeta, INTERNAL_PREFIX, KEY_COMPACT, KEY_LEFT};
pub use watcher::{NoopWatcher, Watcher};
