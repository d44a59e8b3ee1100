//! The tc-sidecar process.
//!
//! Wires the store, the reconcilers and the measurement engine together: connects to the
//! store, converges once, then follows store events until interrupted while the measurement
//! loops run alongside.

use std::{fmt, future::Future, sync::Arc, time::Duration};

use futures::StreamExt;
use tcs_common::{ExponentialBackoff, Runner};
use tcs_measure::{DestinationIndex, IcmpProber, MeasurementEngine};
use tcs_nat::{IptablesCli, NatError, NatReconciler};
use tcs_shaping::TrafficReconciler;
use tcs_store::{RedisStore, StoreError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
pub use config::SidecarConfig;

mod dispatcher;
pub use dispatcher::Dispatcher;

#[derive(Debug, thiserror::Error)]
pub enum SidecarError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("NAT error: {0}")]
    Nat(#[from] NatError),
    #[error("failed to listen for shutdown signal: {0}")]
    Signal(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SidecarError>;

/// Installs the global subscriber. The filter comes from `RUST_LOG` and defaults to `info`.
pub fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Calls `connect` up to `attempts` times, sleeping `initial` after the first failure and twice
/// as long after every further one. Returns the last error once attempts are exhausted.
pub async fn connect_with_retries<T, Err, F, Fut>(
    attempts: u64,
    initial: Duration,
    mut connect: F,
) -> std::result::Result<T, Err>
where
    Err: fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, Err>>,
{
    let retries = usize::try_from(attempts.saturating_sub(1)).unwrap_or(usize::MAX);
    let mut backoff = ExponentialBackoff::new(initial, retries);

    loop {
        let attempt = backoff.retries() + 1;
        match connect().await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                warn!(%e, attempt, attempts, "store connection failed");
                if backoff.next().await.is_none() {
                    return Err(e);
                }
            }
        }
    }
}

/// Runs the sidecar until ctrl-c, or until the event subscription ends.
///
/// Missing `iptables` and an unreachable store are fatal before any loop starts.
pub async fn run(config: SidecarConfig) -> Result<()> {
    let keys = config.keys();
    info!(node = keys.node(), namespace = %config.namespace, "starting sidecar");

    let executor = Arc::new(Runner::new());
    let table = Arc::new(IptablesCli::new(Arc::clone(&executor)));
    table.ensure_available().await?;

    let url = config.store_url.as_str();
    let store =
        connect_with_retries(config.connect_attempts, config.connect_backoff(), move || {
            RedisStore::connect(url)
        })
        .await?;
    let store = Arc::new(store);

    let destinations = DestinationIndex::new();
    let traffic = Arc::new(TrafficReconciler::new(
        Arc::clone(&store),
        Arc::clone(&executor),
        keys.clone(),
        destinations.clone(),
        config.traffic_options(),
    ));
    let nat = Arc::new(NatReconciler::new(
        table,
        Arc::clone(&store),
        Arc::clone(&executor),
        keys.clone(),
        config.nat_options(),
    ));

    let dispatcher = Dispatcher::new(&keys, traffic, nat);
    // Subscribe first so nothing announced during the initial pass is missed.
    let events = store.subscribe(&dispatcher.channels()).await?;
    dispatcher.initial_pass().await;

    let options = config.measure_options();
    let prober = Arc::new(IcmpProber::new(options.payload_size));
    let engine =
        Arc::new(MeasurementEngine::new(prober, executor, store, keys, destinations, options));
    let probing = tokio::spawn(Arc::clone(&engine).run_probe_loop());
    let sampling = tokio::spawn(engine.run_sampling_loop());

    let res = tokio::select! {
        _ = dispatcher.run(events) => Err(StoreError::Closed.into()),
        res = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            res.map_err(SidecarError::Signal)
        }
    };

    probing.abort();
    sampling.abort();
    res
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use tokio::time::Instant;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn connects_after_transient_failures() {
        let calls = &AtomicU64::new(0);
        let start = Instant::now();

        let conn = connect_with_retries(5, Duration::from_millis(500), move || async move {
            match calls.fetch_add(1, Ordering::Relaxed) {
                0 | 1 => Err(StoreError::Closed),
                n => Ok(n),
            }
        })
        .await
        .unwrap();

        assert_eq!(conn, 2);
        assert_eq!(start.elapsed(), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_last_attempt() {
        let calls = &AtomicU64::new(0);

        let res: std::result::Result<(), _> =
            connect_with_retries(3, Duration::from_millis(100), move || async move {
                calls.fetch_add(1, Ordering::Relaxed);
                Err(StoreError::Closed)
            })
            .await;

        assert!(matches!(res, Err(StoreError::Closed)));
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn single_attempt_does_not_sleep() {
        let res: std::result::Result<(), _> =
            connect_with_retries(1, Duration::from_secs(3600), || async {
                Err(StoreError::Closed)
            })
            .await;
        assert!(res.is_err());
    }
}
