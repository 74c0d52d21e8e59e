use std::net::SocketAddr;
use std::time::Duration;

/// Gossip runtime configuration.
///
/// Defaults follow the tuning in the top-level design: 1 s rounds and a
/// suspicion threshold of 8.0 unless measurement dictates otherwise.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// TCP bind address for anti-entropy exchanges.  Port 0 binds an
    /// ephemeral port (used throughout the tests).
    pub bind_addr: SocketAddr,
    /// Address peers should dial; defaults to the bound address.
    pub advertise_addr: Option<String>,
    /// Node ID; generated per process lifetime when absent.
    pub node_id: Option<String>,
    /// Seed addresses contacted on startup.
    pub join: Vec<String>,
    /// Interval between gossip rounds.
    pub interval: Duration,
    /// Deadline for one full three-message exchange.
    pub round_timeout: Duration,
    /// φ score above which a peer flips to unreachable.
    pub suspicion_threshold: f64,
    /// How long a left or unreachable node is retained before removal.
    pub node_expiry: Duration,
    /// Deleted local entries tolerated before compaction rewrites the table.
    pub compaction_threshold: usize,
    /// Inter-arrival samples kept per peer by the failure detector.
    pub sample_window: usize,
    /// Every Nth round targets an unreachable peer instead of a live one.
    pub probe_period: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".parse().expect("static addr"),
            advertise_addr: None,
            node_id: None,
            join: Vec::new(),
            interval: Duration::from_secs(1),
            round_timeout: Duration::from_secs(2),
            suspicion_threshold: 8.0,
            node_expiry: Duration::from_secs(30),
            compaction_threshold: 100,
            sample_window: 16,
            probe_period: 5,
        }
    }
}
