use std::time::Instant;

use parking_lot::Mutex;

/// Cumulative counters of a shaping discipline, as reported by the kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QdiscCounters {
    pub bytes: u64,
    pub packets: u64,
    pub dropped: u64,
}

/// The result of one passive sample.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RxSample {
    /// Received throughput in bits per second. `None` until two samples exist.
    pub throughput_bps: Option<f64>,
    /// Dropped packets over offered packets, in percent.
    pub drop_rate_pct: f64,
}

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    at: Instant,
    counters: QdiscCounters,
}

/// The previous passive sample of a destination, used to turn cumulative counters into rates.
#[derive(Debug, Default)]
pub struct RxHistory {
    prev: Mutex<Option<Snapshot>>,
}

impl RxHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derives throughput and drop rate from `counters` taken at `at`, then makes them the
    /// previous sample.
    ///
    /// With a previous sample, both values are computed over the deltas since that sample. On the
    /// first sample the drop rate uses the cumulative counters and no throughput is reported.
    /// Counters going backwards (the interface was recreated) are treated like a first sample.
    pub fn sample(&self, at: Instant, counters: QdiscCounters) -> RxSample {
        let mut prev = self.prev.lock();

        let delta = prev.as_ref().and_then(|p| {
            let elapsed = at.checked_duration_since(p.at)?.as_secs_f64();
            let bytes = counters.bytes.checked_sub(p.counters.bytes)?;
            let packets = counters.packets.checked_sub(p.counters.packets)?;
            let dropped = counters.dropped.checked_sub(p.counters.dropped)?;
            Some((elapsed, QdiscCounters { bytes, packets, dropped }))
        });

        let sample = match delta {
            Some((elapsed, delta)) => RxSample {
                throughput_bps: (elapsed > 0.0).then(|| 8.0 * delta.bytes as f64 / elapsed),
                drop_rate_pct: drop_rate(&delta),
            },
            None => RxSample { throughput_bps: None, drop_rate_pct: drop_rate(&counters) },
        };

        *prev = Some(Snapshot { at, counters });
        sample
    }
}

fn drop_rate(counters: &QdiscCounters) -> f64 {
    let offered = counters.packets + counters.dropped;
    if offered == 0 {
        return 0.0;
    }
    counters.dropped as f64 * 100.0 / offered as f64
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn counters(bytes: u64, packets: u64, dropped: u64) -> QdiscCounters {
        QdiscCounters { bytes, packets, dropped }
    }

    #[test]
    fn first_sample_has_no_throughput() {
        let rx = RxHistory::new();
        let sample = rx.sample(Instant::now(), counters(1000, 10, 0));
        assert_eq!(sample.throughput_bps, None);
    }

    #[test]
    fn throughput_from_consecutive_samples() {
        let rx = RxHistory::new();
        let t0 = Instant::now();

        rx.sample(t0, counters(1000, 10, 0));
        let sample = rx.sample(t0 + Duration::from_secs(1), counters(2000, 20, 0));

        assert_eq!(sample.throughput_bps, Some(8000.0));
        assert_eq!(sample.drop_rate_pct, 0.0);
    }

    #[test]
    fn drop_rate_over_offered_packets() {
        let rx = RxHistory::new();
        let t0 = Instant::now();

        let first = rx.sample(t0, counters(0, 30, 10));
        assert_eq!(first.drop_rate_pct, 25.0);

        let second = rx.sample(t0 + Duration::from_secs(1), counters(0, 39, 11));
        assert_eq!(second.drop_rate_pct, 10.0);
    }

    #[test]
    fn no_traffic_reports_zero_drop_rate() {
        let rx = RxHistory::new();
        assert_eq!(rx.sample(Instant::now(), QdiscCounters::default()).drop_rate_pct, 0.0);
    }

    #[test]
    fn counter_reset_restarts_history() {
        let rx = RxHistory::new();
        let t0 = Instant::now();

        rx.sample(t0, counters(5000, 50, 0));
        let reset = rx.sample(t0 + Duration::from_secs(1), counters(100, 1, 0));
        assert_eq!(reset.throughput_bps, None);

        let next = rx.sample(t0 + Duration::from_secs(2), counters(1100, 2, 0));
        assert_eq!(next.throughput_bps, Some(8000.0));
    }
}
