use std::{
    net::IpAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use rustc_hash::{FxHashMap, FxHashSet};
use tcs_common::{command, Executor};
use tcs_measure::{history::DEFAULT_CAPACITY, Destination, DestinationIndex};
use tcs_store::{FilterRecord, KeySchema, ShapingRecord, Store};
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{tc, Result, TransactionCounter};

/// Field of the transaction-state entry holding the last transaction stored by the engine.
pub const TRANSACTION_FIELD: &str = "transactionIdStored";

/// Options of the [`TrafficReconciler`].
#[derive(Debug, Clone)]
pub struct TrafficOptions {
    /// Interface whose incoming traffic is classified into the shaping targets.
    pub device: String,
    /// Upper bound on resolving a destination that is not given as an address.
    pub resolve_timeout: Duration,
    /// RTT samples kept per discovered destination.
    pub history_capacity: usize,
}

impl Default for TrafficOptions {
    fn default() -> Self {
        Self {
            device: "eth0".to_string(),
            resolve_timeout: Duration::from_secs(15),
            history_capacity: DEFAULT_CAPACITY,
        }
    }
}

impl TrafficOptions {
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    pub fn with_resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }
}

/// What a single traffic pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub ifbs_created: usize,
    pub ifbs_refreshed: usize,
    pub ifbs_deleted: usize,
    pub filters_created: usize,
    pub filters_deleted: usize,
    /// Records skipped because a command failed or the record was invalid.
    pub failures: usize,
    /// A newer pass was requested while this one ran; orphans were left to it.
    pub stale: bool,
}

/// What this node has applied to the kernel.
#[derive(Debug, Default)]
struct TrafficState {
    ifbs: FxHashSet<String>,
    /// Filter id to the ifb id it redirects to.
    filters: FxHashMap<String, String>,
    /// Filter id to its source host and the address that host resolved to.
    sources: FxHashMap<String, (String, IpAddr)>,
    bootstrapped: bool,
}

/// Converges the shaping targets and classifiers of this node to the records in the store.
///
/// Passes are serialized. Every pass takes a ticket from a shared epoch counter when it is
/// requested; a pass that finds the counter moved on by the time it would sweep orphans skips the
/// sweep, since the pending pass will see a fresher store.
#[derive(Debug)]
pub struct TrafficReconciler<S, E> {
    store: Arc<S>,
    executor: Arc<E>,
    keys: KeySchema,
    options: TrafficOptions,
    counter: TransactionCounter,
    destinations: DestinationIndex,
    state: Mutex<TrafficState>,
    epoch: AtomicU64,
}

impl<S, E> TrafficReconciler<S, E>
where
    S: Store,
    E: Executor,
{
    pub fn new(
        store: Arc<S>,
        executor: Arc<E>,
        keys: KeySchema,
        destinations: DestinationIndex,
        options: TrafficOptions,
    ) -> Self {
        Self {
            store,
            executor,
            keys,
            options,
            counter: TransactionCounter::new(),
            destinations,
            state: Mutex::new(TrafficState::default()),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn counter(&self) -> &TransactionCounter {
        &self.counter
    }

    pub fn destinations(&self) -> &DestinationIndex {
        &self.destinations
    }

    /// Handles a network-characteristic event announcing transaction `id`.
    ///
    /// The transaction the store holds when the pass starts applying is what the pass applies,
    /// so it becomes the last applied one once the pass completes.
    pub async fn on_transaction(&self, id: Option<u64>) -> Result<PassReport> {
        if let Some(id) = id {
            self.counter.set_current(id);
        }

        self.pass(true).await
    }

    async fn stored_transaction(&self) -> Result<u64> {
        let key = self.keys.db_state_key();
        let fields = self.store.fields(&key).await?;

        Ok(match fields.get(TRANSACTION_FIELD).map(|v| v.trim().parse::<u64>()) {
            Some(Ok(id)) => id,
            Some(Err(e)) => {
                warn!(%key, %e, "invalid stored transaction id");
                0
            }
            None => 0,
        })
    }

    /// Runs one traffic pass.
    ///
    /// A store failure aborts the pass and is returned; command failures only skip the record
    /// they belong to.
    pub async fn reconcile(&self) -> Result<PassReport> {
        self.pass(false).await
    }

    /// Runs one traffic pass. With `track`, the stored transaction is read once the pass holds
    /// the state and marked applied before it releases it, so passes complete in the order they
    /// read.
    async fn pass(&self, track: bool) -> Result<PassReport> {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let span = info_span!("traffic_pass", epoch);

        async move {
            let mut state = self.state.lock().await;
            let mut report = PassReport::default();

            let stored = if track { Some(self.stored_transaction().await?) } else { None };

            self.bootstrap(&mut state).await;
            self.apply_shapes(&mut state, &mut report).await?;
            let live_filters = self.apply_filters(&mut state, &mut report).await?;

            if self.epoch.load(Ordering::Acquire) != epoch {
                info!("newer pass pending, skipping orphan sweep");
                report.stale = true;
                self.mark_applied(stored);
                return Ok(report);
            }

            self.sweep_filters(&mut state, &mut report).await?;
            self.sweep_ifbs(&mut state, &mut report).await?;

            state.sources.retain(|id, _| live_filters.contains(id));
            for removed in self.destinations.retain(|d| live_filters.contains(d.id())) {
                info!(remote = removed.remote_name(), "destination removed");
            }

            self.mark_applied(stored);
            info!(?report, "traffic pass complete");
            Ok(report)
        }
        .instrument(span)
        .await
    }

    fn mark_applied(&self, stored: Option<u64>) {
        if let Some(stored) = stored {
            self.counter.mark_applied(stored);
            debug!(current = self.counter.current(), applied = stored, "transaction applied");
        }
    }

    async fn bootstrap(&self, state: &mut TrafficState) {
        if state.bootstrapped {
            return;
        }

        for cmd in tc::bootstrap(&self.options.device) {
            if let Err(e) = self.executor.run(&cmd).await {
                warn!(%e, "failed to bootstrap ingress disciplines, retrying next pass");
                return;
            }
        }

        state.bootstrapped = true;
    }

    async fn apply_shapes(&self, state: &mut TrafficState, report: &mut PassReport) -> Result<()> {
        let refresh = self.counter.needs_refresh();

        for entry in self.store.scan(&self.keys.shape_pattern()).await? {
            let record = match ShapingRecord::from_fields(&entry.fields) {
                Ok(record) => record,
                Err(e) => {
                    warn!(key = %entry.key, %e, "skipping shaping record");
                    report.failures += 1;
                    continue;
                }
            };

            if !state.ifbs.contains(&record.ifb_id) {
                match self.create_ifb(&record).await {
                    Ok(()) => {
                        debug!(ifb = %record.ifb_id, "ifb created");
                        state.ifbs.insert(record.ifb_id);
                        report.ifbs_created += 1;
                    }
                    Err(e) => {
                        warn!(ifb = %record.ifb_id, %e, "failed to create ifb");
                        report.failures += 1;
                    }
                }
            } else if refresh {
                match self.executor.run(&tc::set_ifb(&record)).await {
                    Ok(_) => report.ifbs_refreshed += 1,
                    Err(e) => {
                        warn!(ifb = %record.ifb_id, %e, "failed to refresh ifb");
                        report.failures += 1;
                    }
                }
            }
        }

        Ok(())
    }

    /// Instantiates and parameterizes the shaping target of `record`. An interface left behind by
    /// an earlier run is adopted.
    async fn create_ifb(&self, record: &ShapingRecord) -> command::Result<()> {
        let [add, up, qdisc] = tc::create_ifb(&record.ifb_id);

        match self.executor.run(&add).await {
            Ok(_) => {}
            Err(command::Error::NonZero { output, .. })
                if output.stderr.contains("File exists") =>
            {
                debug!(ifb = %record.ifb_id, "adopting existing interface");
            }
            Err(e) => return Err(e),
        }

        self.executor.run(&up).await?;
        self.executor.run(&qdisc).await?;
        self.executor.run(&tc::set_ifb(record)).await?;

        Ok(())
    }

    /// Installs missing classifiers and refreshes the destination index. Returns the ids of all
    /// filters currently in the store.
    async fn apply_filters(
        &self,
        state: &mut TrafficState,
        report: &mut PassReport,
    ) -> Result<FxHashSet<String>> {
        let mut live = FxHashSet::default();

        for entry in self.store.scan(&self.keys.filter_pattern()).await? {
            let record = match FilterRecord::from_fields(&entry.fields) {
                Ok(record) => record,
                Err(e) => {
                    warn!(key = %entry.key, %e, "skipping filter record");
                    report.failures += 1;
                    continue;
                }
            };
            live.insert(record.filter_id.clone());

            let Some(source) = self.source_address(state, &record).await else {
                report.failures += 1;
                continue;
            };

            if !state.filters.contains_key(&record.filter_id) {
                match self.create_filter(&record, source).await {
                    Ok(()) => {
                        debug!(filter = %record.filter_id, ifb = %record.ifb_id, "filter created");
                        state.filters.insert(record.filter_id.clone(), record.ifb_id.clone());
                        report.filters_created += 1;
                    }
                    Err(e) => {
                        warn!(filter = %record.filter_id, %e, "failed to create filter");
                        report.failures += 1;
                        continue;
                    }
                }
            }

            self.destinations.upsert(Destination::new(
                record.filter_id,
                self.keys.node(),
                record.source_name,
                source,
                record.ifb_id,
                self.options.history_capacity,
            ));
        }

        Ok(live)
    }

    async fn create_filter(&self, record: &FilterRecord, source: IpAddr) -> command::Result<()> {
        let device = &self.options.device;

        self.executor
            .run(&tc::add_filter(device, &record.filter_id, &source.to_string(), &record.ifb_id))
            .await?;

        if let Some(service_ip) = &record.source_service_ip {
            self.executor
                .run(&tc::add_filter(device, &record.filter_id, service_ip, &record.ifb_id))
                .await?;
        }

        Ok(())
    }

    /// The address of the source of `record`. A host is only resolved again when the record
    /// names a different one.
    async fn source_address(
        &self,
        state: &mut TrafficState,
        record: &FilterRecord,
    ) -> Option<IpAddr> {
        if let Some((host, addr)) = state.sources.get(&record.filter_id) {
            if *host == record.source_ip {
                return Some(*addr);
            }
        }

        let addr = self.resolve(&record.source_ip).await?;
        state.sources.insert(record.filter_id.clone(), (record.source_ip.clone(), addr));
        Some(addr)
    }

    /// Parses `host` as an address, or resolves it by name within the configured timeout.
    async fn resolve(&self, host: &str) -> Option<IpAddr> {
        if let Ok(addr) = host.parse() {
            return Some(addr);
        }

        match tokio::time::timeout(self.options.resolve_timeout, tokio::net::lookup_host((host, 0)))
            .await
        {
            Ok(Ok(mut addrs)) => {
                let addr = addrs.next().map(|a| a.ip());
                if addr.is_none() {
                    warn!(host, "no address for source");
                }
                addr
            }
            Ok(Err(e)) => {
                warn!(host, %e, "failed to resolve source");
                None
            }
            Err(_) => {
                warn!(host, "timed out resolving source");
                None
            }
        }
    }

    async fn sweep_filters(&self, state: &mut TrafficState, report: &mut PassReport) -> Result<()> {
        let applied: Vec<String> = state.filters.keys().cloned().collect();

        for filter_id in applied {
            if self.store.exists(&self.keys.filter_key(&filter_id)).await? {
                continue;
            }

            match self.executor.run(&tc::delete_filter(&self.options.device, &filter_id)).await {
                Ok(_) => {
                    debug!(filter = %filter_id, "filter removed");
                    state.filters.remove(&filter_id);
                    report.filters_deleted += 1;
                }
                Err(e) => {
                    warn!(filter = %filter_id, %e, "failed to remove filter");
                    report.failures += 1;
                }
            }
        }

        Ok(())
    }

    async fn sweep_ifbs(&self, state: &mut TrafficState, report: &mut PassReport) -> Result<()> {
        let applied: Vec<String> = state.ifbs.iter().cloned().collect();

        for ifb_id in applied {
            if self.store.exists(&self.keys.shape_key(&ifb_id)).await? {
                continue;
            }

            match self.executor.run(&tc::delete_ifb(&ifb_id)).await {
                Ok(_) => {
                    debug!(ifb = %ifb_id, "ifb removed");
                    state.ifbs.remove(&ifb_id);
                    report.ifbs_deleted += 1;
                }
                Err(e) => {
                    warn!(ifb = %ifb_id, %e, "failed to remove ifb");
                    report.failures += 1;
                }
            }
        }

        Ok(())
    }
}
