//! Local endpoint registry: which upstream sessions serve which endpoints
//! on this node.
//!
//! Set-valued and additive: one endpoint may have many upstreams (including
//! several registrations from the same session), and selection is uniform
//! random among them.  Count transitions are mirrored into the cluster
//! index so peers learn about local capacity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use piko_mux::Session;
use rand::seq::SliceRandom;
use tracing::info;

use crate::cluster::ClusterIndex;

struct RegisteredUpstream {
    registration_id: u64,
    session: Session,
}

pub struct Registry {
    inner: Mutex<HashMap<String, Vec<RegisteredUpstream>>>,
    cluster: Arc<ClusterIndex>,
    next_registration_id: AtomicU64,
}

impl Registry {
    pub fn new(cluster: Arc<ClusterIndex>) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            cluster,
            next_registration_id: AtomicU64::new(1),
        }
    }

    /// Register an upstream for `endpoint_id`; returns the registration ID
    /// used to remove it when its session closes.
    pub fn add(&self, endpoint_id: &str, session: Session) -> u64 {
        let registration_id = self.next_registration_id.fetch_add(1, Ordering::Relaxed);
        let count = {
            let mut inner = self.lock();
            let upstreams = inner.entry(endpoint_id.to_owned()).or_default();
            upstreams.push(RegisteredUpstream {
                registration_id,
                session,
            });
            upstreams.len()
        };
        info!(endpoint_id, count, "upstream registered");
        self.cluster.set_local_count(endpoint_id, count);
        registration_id
    }

    pub fn remove(&self, endpoint_id: &str, registration_id: u64) {
        let count = {
            let mut inner = self.lock();
            let Some(upstreams) = inner.get_mut(endpoint_id) else {
                return;
            };
            upstreams.retain(|u| u.registration_id != registration_id);
            let count = upstreams.len();
            if count == 0 {
                inner.remove(endpoint_id);
            }
            count
        };
        info!(endpoint_id, count, "upstream deregistered");
        self.cluster.set_local_count(endpoint_id, count);
    }

    /// Pick a local upstream for `endpoint_id` uniformly at random.
    pub fn select(&self, endpoint_id: &str) -> Option<Session> {
        let inner = self.lock();
        let upstreams = inner.get(endpoint_id)?;
        upstreams
            .choose(&mut rand::thread_rng())
            .map(|u| u.session.clone())
    }

    pub fn local_count(&self, endpoint_id: &str) -> usize {
        self.lock().get(endpoint_id).map_or(0, Vec::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<RegisteredUpstream>>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
