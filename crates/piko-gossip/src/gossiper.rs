use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use rand::seq::SliceRandom;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::GossipConfig;
use crate::failure::FailureDetector;
use crate::state::{Entry, NodeId, NodeMeta, State};
use crate::transport;
use crate::watcher::Watcher;

#[derive(Debug, thiserror::Error)]
pub enum GossipError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("peer closed mid-exchange")]
    PeerClosed,
    #[error("protocol: {0}")]
    Protocol(String),
}

/// State shared between the public handle, the round loop and the listener.
pub(crate) struct Shared {
    state: Mutex<State>,
    detector: Mutex<FailureDetector>,
    pub(crate) local_id: NodeId,
    pub(crate) round_timeout: std::time::Duration,
}

impl Shared {
    pub(crate) fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn detector(&self) -> MutexGuard<'_, FailureDetector> {
        self.detector
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Handle to a running gossip instance.  Cheap to clone; all clones share
/// one node identity and shut down together.
#[derive(Clone)]
pub struct Gossip {
    shared: Arc<Shared>,
    config: Arc<GossipConfig>,
    shutdown: CancellationToken,
    local_addr: SocketAddr,
    advertise_addr: String,
}

impl Gossip {
    /// Bind the gossip listener, start the round loop, and contact the
    /// configured seeds.
    pub async fn spawn(
        config: GossipConfig,
        watcher: Arc<dyn Watcher>,
    ) -> Result<Gossip, GossipError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let advertise_addr = config
            .advertise_addr
            .clone()
            .unwrap_or_else(|| local_addr.to_string());
        let node_id = config
            .node_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let shared = Arc::new(Shared {
            state: Mutex::new(State::new(
                node_id.clone(),
                advertise_addr.clone(),
                config.node_expiry,
                watcher,
            )),
            detector: Mutex::new(FailureDetector::new(config.sample_window)),
            local_id: node_id.clone(),
            round_timeout: config.round_timeout,
        });
        let config = Arc::new(config);
        let shutdown = CancellationToken::new();

        tokio::spawn(transport::serve(
            listener,
            Arc::clone(&shared),
            shutdown.clone(),
        ));
        tokio::spawn(run_rounds(
            Arc::clone(&shared),
            Arc::clone(&config),
            shutdown.clone(),
        ));

        // Contact seeds immediately rather than waiting for the first round.
        for seed in config.join.clone() {
            if seed == advertise_addr {
                continue;
            }
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                if let Err(e) = transport::exchange(&shared, &seed).await {
                    debug!(seed = %seed, error = %e, "seed join failed, rounds will retry");
                }
            });
        }

        info!(node_id = %node_id, addr = %advertise_addr, "gossip started");
        Ok(Gossip {
            shared,
            config,
            shutdown,
            local_addr,
            advertise_addr,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.shared.local_id.clone()
    }

    /// The actually bound gossip address (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn advertise_addr(&self) -> &str {
        &self.advertise_addr
    }

    /// Upsert a key in the local node's replicated table.
    pub fn upsert_local(&self, key: &str, value: &str) {
        self.shared.state().upsert_local(key, value);
    }

    /// Tombstone a key in the local node's replicated table.
    pub fn delete_local(&self, key: &str) {
        self.shared.state().delete_local(key);
    }

    /// Force a compaction regardless of the threshold.
    pub fn compact_local(&self) -> bool {
        self.shared.state().compact_local()
    }

    pub fn nodes(&self) -> Vec<NodeMeta> {
        self.shared.state().nodes_meta()
    }

    pub fn entries_of(&self, id: &NodeId) -> Option<Vec<Entry>> {
        self.shared.state().entries_of(id)
    }

    pub fn get(&self, id: &NodeId, key: &str) -> Option<Entry> {
        self.shared.state().get(id, key)
    }

    /// Publish the leave tombstone and push it to a few peers right away so
    /// the departure does not depend on someone else's next round.
    pub async fn leave(&self) {
        self.shared.state().leave_local();
        let mut peers = self.shared.state().live_peers();
        peers.shuffle(&mut rand::thread_rng());
        for (_, addr) in peers.into_iter().take(3) {
            let _ = tokio::time::timeout(
                self.config.round_timeout,
                transport::exchange(&self.shared, &addr),
            )
            .await;
        }
    }

    /// Stop the round loop and listener.  Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn run_rounds(shared: Arc<Shared>, config: Arc<GossipConfig>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(config.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut round: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        round += 1;

        {
            let mut state = shared.state();
            if state.deleted_local_count() > config.compaction_threshold {
                state.compact_local();
            }
        }
        update_suspicions(&shared, config.suspicion_threshold);
        let expired = shared.state().remove_expired(Instant::now());
        if !expired.is_empty() {
            let mut detector = shared.detector();
            for id in &expired {
                detector.forget(id);
            }
        }

        let Some(addr) = pick_target(&shared, &config, round) else {
            continue;
        };
        let exchange = tokio::time::timeout(
            config.round_timeout,
            transport::exchange(&shared, &addr),
        );
        match exchange.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(peer = %addr, error = %e, "gossip round failed"),
            Err(_) => debug!(peer = %addr, "gossip round timed out"),
        }
    }
}

/// Choose this round's exchange target: a live peer uniformly at random;
/// every `probe_period`th round an unreachable peer instead (so flapping
/// nodes can come back); seeds when nobody is known yet.
fn pick_target(shared: &Arc<Shared>, config: &GossipConfig, round: u64) -> Option<String> {
    let (live, unreachable) = {
        let state = shared.state();
        (state.live_peers(), state.unreachable_peers())
    };
    let mut rng = rand::thread_rng();

    if round % config.probe_period == 0 {
        if let Some((_, addr)) = unreachable.choose(&mut rng) {
            return Some(addr.clone());
        }
    }
    if let Some((_, addr)) = live.choose(&mut rng) {
        return Some(addr.clone());
    }
    if let Some((_, addr)) = unreachable.choose(&mut rng) {
        return Some(addr.clone());
    }
    config.join.choose(&mut rng).cloned()
}

fn update_suspicions(shared: &Arc<Shared>, threshold: f64) {
    let now = Instant::now();
    let metas = shared.state().nodes_meta();

    let mut newly_unreachable = Vec::new();
    let mut newly_reachable = Vec::new();
    {
        let detector = shared.detector();
        for meta in &metas {
            if meta.id == shared.local_id || meta.left {
                continue;
            }
            let level = detector.suspicion_level(&meta.id, now);
            if level > threshold && !meta.unreachable {
                newly_unreachable.push(meta.id.clone());
            } else if level <= threshold && meta.unreachable {
                newly_reachable.push(meta.id.clone());
            }
        }
    }

    if newly_unreachable.is_empty() && newly_reachable.is_empty() {
        return;
    }
    let mut state = shared.state();
    for id in newly_unreachable {
        debug!(node = %id, "peer became unreachable");
        state.mark_unreachable(&id);
    }
    for id in newly_reachable {
        debug!(node = %id, "peer became reachable");
        state.mark_reachable(&id);
    }
}
