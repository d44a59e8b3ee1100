use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use tcs_common::{ifb_device, Executor};
use tcs_store::{KeySchema, Store};
use tokio::{
    sync::Semaphore,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, trace, warn};

use crate::{
    destination::{Destination, DestinationIndex},
    history::DEFAULT_CAPACITY,
    parser::{CounterParser, JsonCounters},
    probe::{Prober, DEFAULT_PAYLOAD_SIZE},
    rx::RxSample,
};

/// Latest RTT, in milliseconds.
pub const LATENCY_FIELD: &str = "lat";
/// Received throughput, in Mbit/s.
pub const THROUGHPUT_FIELD: &str = "ulTput";
/// Drop rate, in percent.
pub const LOSS_FIELD: &str = "ulLoss";

/// Options of the [`MeasurementEngine`].
#[derive(Debug, Clone)]
pub struct MeasureOptions {
    /// Period of the probe loop.
    pub probe_interval: Duration,
    /// How long a probe waits for its reply.
    pub probe_timeout: Duration,
    /// Period of the passive sampling loop.
    pub sample_interval: Duration,
    /// RTT samples kept per destination.
    pub history_capacity: usize,
    /// ICMP payload bytes per probe.
    pub payload_size: usize,
}

impl Default for MeasureOptions {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(1),
            sample_interval: Duration::from_secs(1),
            history_capacity: DEFAULT_CAPACITY,
            payload_size: DEFAULT_PAYLOAD_SIZE,
        }
    }
}

impl MeasureOptions {
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn with_payload_size(mut self, size: usize) -> Self {
        self.payload_size = size;
        self
    }
}

/// Drives the two measurement loops over the shared [`DestinationIndex`].
///
/// The probe loop fires one probe and one aggregation task per destination on every tick and
/// never waits for them. The sampling loop reads the shaping counters of every destination and
/// publishes the resulting metrics; a single permit keeps sampling passes from overlapping.
#[derive(Debug)]
pub struct MeasurementEngine<P, E, S> {
    prober: Arc<P>,
    executor: Arc<E>,
    store: Arc<S>,
    parser: Arc<dyn CounterParser>,
    keys: KeySchema,
    destinations: DestinationIndex,
    options: MeasureOptions,
    sampling: Semaphore,
}

impl<P, E, S> MeasurementEngine<P, E, S>
where
    P: Prober,
    E: Executor,
    S: Store,
{
    pub fn new(
        prober: Arc<P>,
        executor: Arc<E>,
        store: Arc<S>,
        keys: KeySchema,
        destinations: DestinationIndex,
        options: MeasureOptions,
    ) -> Self {
        Self {
            prober,
            executor,
            store,
            parser: Arc::new(JsonCounters),
            keys,
            destinations,
            options,
            sampling: Semaphore::new(1),
        }
    }

    /// Replaces the default structured counter parser.
    pub fn with_parser(mut self, parser: Arc<dyn CounterParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn options(&self) -> &MeasureOptions {
        &self.options
    }

    /// Probes every destination on each tick, forever.
    pub async fn run_probe_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.options.probe_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let tasks = self.probe_tick();
            trace!(tasks = tasks.len(), "probe tick");
        }
    }

    /// Samples the shaping counters on each tick, forever. A pass outlasting the interval delays
    /// the next tick.
    pub async fn run_sampling_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.options.sample_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            self.sample_all().await;
        }
    }

    /// Spawns one probe task and one aggregation task per destination and returns their handles.
    pub fn probe_tick(&self) -> Vec<JoinHandle<()>> {
        let timeout = self.options.probe_timeout;
        let mut tasks = Vec::new();

        for destination in self.destinations.snapshot() {
            let prober = Arc::clone(&self.prober);
            let target = Arc::clone(&destination);
            tasks.push(tokio::spawn(async move {
                probe(prober.as_ref(), &target, timeout).await;
            }));

            tasks.push(tokio::spawn(async move {
                let stats = destination.history().statistics();
                trace!(remote = destination.remote_name(), ?stats, "aggregated");
                destination.set_statistics(stats);
            }));
        }

        tasks
    }

    /// Runs one probe tick and waits for all of its tasks.
    pub async fn probe_all(&self) {
        for res in join_all(self.probe_tick()).await {
            if let Err(e) = res {
                warn!(%e, "probe task failed");
            }
        }
    }

    /// Runs one sampling pass over all destinations, waiting for any pass in progress.
    pub async fn sample_all(&self) {
        let Ok(_permit) = self.sampling.acquire().await else {
            return;
        };

        let destinations = self.destinations.snapshot();
        join_all(destinations.iter().map(|d| self.sample(d))).await;
    }

    async fn sample(&self, destination: &Destination) {
        let device = ifb_device(&destination.ifb_id());

        let counters = match self.executor.run(&self.parser.command(&device)).await {
            Ok(output) => self.parser.parse(&output),
            Err(e) => {
                debug!(%e, %device, "failed to read qdisc statistics");
                None
            }
        };

        let sample = match counters {
            Some(counters) => destination.rx().sample(Instant::now().into_std(), counters),
            None => {
                debug!(%device, "no usable qdisc statistics, publishing zero sample");
                RxSample::default()
            }
        };

        self.publish(destination, sample).await;
    }

    async fn publish(&self, destination: &Destination, sample: RxSample) {
        let latency_ms = (destination.statistics().last.as_nanos() + 500_000) / 1_000_000;

        let mut fields = vec![
            (LATENCY_FIELD, latency_ms.to_string()),
            (LOSS_FIELD, format!("{:.3}", sample.drop_rate_pct)),
        ];
        if let Some(bps) = sample.throughput_bps {
            fields.push((THROUGHPUT_FIELD, format!("{:.3}", bps / 1_000_000.0)));
        }

        let key = self.keys.metrics_key(destination.remote_name());
        if let Err(e) = self.store.set_fields(&key, &fields).await {
            warn!(%e, %key, "failed to publish metrics");
            return;
        }

        // A throughput from an earlier sample would otherwise outlive a counter reset.
        if sample.throughput_bps.is_none() {
            if let Err(e) = self.store.remove_fields(&key, &[THROUGHPUT_FIELD]).await {
                warn!(%e, %key, "failed to clear throughput");
            }
        }
    }
}

async fn probe<P: Prober>(prober: &P, destination: &Destination, timeout: Duration) {
    let addr = destination.remote_address();
    match prober.probe(addr, timeout).await {
        Ok(rtt) => {
            trace!(remote = destination.remote_name(), %addr, ?rtt, "probe answered");
            destination.history().record(Some(rtt));
        }
        Err(e) => {
            debug!(remote = destination.remote_name(), %addr, %e, "probe failed");
            destination.history().record(None);
        }
    }
}
