//! φ-style accrual failure detection.
//!
//! Each peer gets a windowed estimator of the interval between successful
//! contacts.  The suspicion score grows with the silence since the last
//! contact, scaled by the estimated interval:
//!
//! ```text
//! φ = (elapsed / mean_interval) · log₁₀e
//! ```
//!
//! which is `-log₁₀ P(gap ≥ elapsed)` under an exponential inter-arrival
//! model.  A threshold of 8.0 tolerates roughly 18 mean intervals of
//! silence before flipping a peer to unreachable.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use crate::state::NodeId;

const LOG10_E: f64 = std::f64::consts::LOG10_E;
/// Contacts required before a peer can be suspected at all.
const MIN_SAMPLES: usize = 2;

struct PeerEstimator {
    last_contact: Instant,
    samples: VecDeque<f64>,
}

pub(crate) struct FailureDetector {
    window: usize,
    peers: HashMap<NodeId, PeerEstimator>,
}

impl FailureDetector {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(MIN_SAMPLES),
            peers: HashMap::new(),
        }
    }

    /// Record a successful message from `peer` at `now`.
    pub fn record_contact(&mut self, peer: &NodeId, now: Instant) {
        match self.peers.get_mut(peer) {
            Some(estimator) => {
                let gap = now
                    .saturating_duration_since(estimator.last_contact)
                    .as_secs_f64();
                estimator.last_contact = now;
                estimator.samples.push_back(gap);
                while estimator.samples.len() > self.window {
                    estimator.samples.pop_front();
                }
            }
            None => {
                self.peers.insert(
                    peer.clone(),
                    PeerEstimator {
                        last_contact: now,
                        samples: VecDeque::new(),
                    },
                );
            }
        }
    }

    /// Current suspicion score for `peer`.  Unknown or barely seen peers
    /// score 0.0 — there is no interval model to be abnormal against.
    pub fn suspicion_level(&self, peer: &NodeId, now: Instant) -> f64 {
        let Some(estimator) = self.peers.get(peer) else {
            return 0.0;
        };
        if estimator.samples.len() < MIN_SAMPLES {
            return 0.0;
        }
        let mean =
            estimator.samples.iter().sum::<f64>() / estimator.samples.len() as f64;
        if mean <= f64::EPSILON {
            return 0.0;
        }
        let elapsed = now
            .saturating_duration_since(estimator.last_contact)
            .as_secs_f64();
        (elapsed / mean) * LOG10_E
    }

    pub fn forget(&mut self, peer: &NodeId) {
        self.peers.remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn contact_every(detector: &mut FailureDetector, peer: &NodeId, start: Instant, n: usize) {
        for i in 0..n {
            detector.record_contact(peer, start + Duration::from_secs(i as u64));
        }
    }

    #[test]
    fn fresh_peers_are_never_suspected() {
        let mut detector = FailureDetector::new(16);
        let peer = "node-1".to_owned();
        let t0 = Instant::now();
        assert_eq!(detector.suspicion_level(&peer, t0), 0.0);
        detector.record_contact(&peer, t0);
        assert_eq!(
            detector.suspicion_level(&peer, t0 + Duration::from_secs(3600)),
            0.0
        );
    }

    #[test]
    fn suspicion_grows_with_silence() {
        let mut detector = FailureDetector::new(16);
        let peer = "node-1".to_owned();
        let t0 = Instant::now();
        contact_every(&mut detector, &peer, t0, 8);
        let last = t0 + Duration::from_secs(7);

        let fresh = detector.suspicion_level(&peer, last + Duration::from_secs(1));
        let silent = detector.suspicion_level(&peer, last + Duration::from_secs(60));
        assert!(fresh < 1.0, "one interval of silence is normal: {fresh}");
        assert!(silent > 8.0, "a minute of silence is abnormal: {silent}");
        assert!(fresh < silent);
    }

    #[test]
    fn contact_resets_suspicion() {
        let mut detector = FailureDetector::new(16);
        let peer = "node-1".to_owned();
        let t0 = Instant::now();
        contact_every(&mut detector, &peer, t0, 8);
        let late = t0 + Duration::from_secs(120);
        assert!(detector.suspicion_level(&peer, late) > 8.0);

        detector.record_contact(&peer, late);
        assert!(detector.suspicion_level(&peer, late + Duration::from_secs(1)) < 8.0);
    }

    #[test]
    fn window_bounds_sample_history() {
        let mut detector = FailureDetector::new(4);
        let peer = "node-1".to_owned();
        let t0 = Instant::now();
        contact_every(&mut detector, &peer, t0, 100);
        let estimator = detector.peers.get(&peer).unwrap();
        assert_eq!(estimator.samples.len(), 4);
    }
}
