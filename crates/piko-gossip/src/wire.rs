//! Anti-entropy wire schema.
//!
//! All messages are JSON with a top-level `kind` tag, length-delimited on
//! the TCP stream.  One exchange is exactly three messages:
//!
//! ```text
//! initiator                listener
//!     | --- syn { digest } --->
//!     | <-- syn_ack { digest, delta }
//!     | --- ack2 { delta } --->
//! ```

use serde::{Deserialize, Serialize};

use crate::state::{Entry, NodeId};

/// One node's line in a digest: enough for the receiver to decide which
/// entries the sender is missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestEntry {
    pub id: NodeId,
    pub addr: String,
    pub version: u64,
    pub left: bool,
}

/// Compact summary of every node the sender knows.
///
/// `full` declares the digest complete: nodes missing from it are unknown
/// to the sender and warrant a from-zero delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
    pub sender: NodeId,
    pub sender_addr: String,
    pub entries: Vec<DigestEntry>,
    pub full: bool,
}

/// Entries newer than a digest's version, for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDelta {
    pub id: NodeId,
    pub addr: String,
    /// Sorted ascending by version.
    pub entries: Vec<Entry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub nodes: Vec<NodeDelta>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum Message {
    Syn { digest: Digest },
    SynAck { digest: Digest, delta: Delta },
    Ack2 { sender: NodeId, delta: Delta },
}
