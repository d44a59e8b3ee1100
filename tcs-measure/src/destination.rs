use std::{net::IpAddr, sync::Arc};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::{
    history::{History, Statistics},
    rx::RxHistory,
};

/// A remote endpoint whose traffic towards this node is shaped and measured.
#[derive(Debug)]
pub struct Destination {
    /// Identifier of the filter record this destination was discovered from.
    id: String,
    /// The local node.
    host_name: String,
    remote_name: String,
    remote_address: IpAddr,
    ifb_id: RwLock<String>,
    history: History,
    /// Last aggregation of `history`.
    stats: RwLock<Statistics>,
    rx: RxHistory,
}

impl Destination {
    pub fn new(
        id: impl Into<String>,
        host_name: impl Into<String>,
        remote_name: impl Into<String>,
        remote_address: IpAddr,
        ifb_id: impl Into<String>,
        capacity: usize,
    ) -> Self {
        Self {
            id: id.into(),
            host_name: host_name.into(),
            remote_name: remote_name.into(),
            remote_address,
            ifb_id: RwLock::new(ifb_id.into()),
            history: History::new(capacity),
            stats: RwLock::new(Statistics::default()),
            rx: RxHistory::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    pub fn remote_address(&self) -> IpAddr {
        self.remote_address
    }

    /// The shaping target currently carrying this destination's traffic.
    pub fn ifb_id(&self) -> String {
        self.ifb_id.read().clone()
    }

    pub fn set_ifb_id(&self, ifb_id: impl Into<String>) {
        *self.ifb_id.write() = ifb_id.into();
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn statistics(&self) -> Statistics {
        *self.stats.read()
    }

    pub fn set_statistics(&self, stats: Statistics) {
        *self.stats.write() = stats;
    }

    pub fn rx(&self) -> &RxHistory {
        &self.rx
    }
}

/// The set of destinations, keyed by filter id.
///
/// Written by the traffic reconciler, read by the measurement loops. Cloning yields another
/// handle to the same index.
#[derive(Debug, Clone, Default)]
pub struct DestinationIndex {
    inner: Arc<RwLock<FxHashMap<String, Arc<Destination>>>>,
}

impl DestinationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `destination`, or updates the shaping target of the existing entry if it points
    /// at the same remote. A destination whose remote changed is replaced, dropping its history.
    pub fn upsert(&self, destination: Destination) -> Arc<Destination> {
        let mut inner = self.inner.write();

        if let Some(existing) = inner.get(destination.id()) {
            if existing.remote_address == destination.remote_address
                && existing.remote_name == destination.remote_name
            {
                existing.set_ifb_id(destination.ifb_id());
                return Arc::clone(existing);
            }
            tracing::debug!(
                id = destination.id(),
                remote = %destination.remote_address,
                "destination changed, resetting history"
            );
        }

        let destination = Arc::new(destination);
        inner.insert(destination.id.clone(), Arc::clone(&destination));
        destination
    }

    pub fn get(&self, id: &str) -> Option<Arc<Destination>> {
        self.inner.read().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Destination>> {
        self.inner.write().remove(id)
    }

    /// Keeps only the destinations for which `keep` returns `true` and returns the others.
    pub fn retain(&self, mut keep: impl FnMut(&Destination) -> bool) -> Vec<Arc<Destination>> {
        let mut inner = self.inner.write();
        let removed: Vec<String> =
            inner.iter().filter(|(_, d)| !keep(d)).map(|(id, _)| id.clone()).collect();

        removed.iter().filter_map(|id| inner.remove(id)).collect()
    }

    /// A point-in-time copy of the index, so loops never hold the lock while measuring.
    pub fn snapshot(&self) -> Vec<Arc<Destination>> {
        self.inner.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
