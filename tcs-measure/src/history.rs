use std::time::Duration;

use parking_lot::RwLock;

/// Default number of RTT samples kept per destination.
pub const DEFAULT_CAPACITY: usize = 50;

/// Fixed-capacity ring buffer of RTT samples with received/lost counters.
///
/// A successful probe is stored at `received % capacity`, so once the buffer is full the oldest
/// sample is overwritten. The buffer is never cleared. Readers (statistics) may run concurrently
/// with each other, but not with the probe recording a result.
#[derive(Debug)]
pub struct History {
    inner: RwLock<Ring>,
}

#[derive(Debug)]
struct Ring {
    received: usize,
    lost: usize,
    results: Vec<Duration>,
}

/// Statistics derived from the valid window of a [`History`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Statistics {
    /// Probes sent, i.e. received + lost.
    pub sent: usize,
    /// Fraction of lost probes, between 0 and 1.
    pub loss: f64,
    pub last: Duration,
    pub best: Duration,
    pub worst: Duration,
    pub mean: Duration,
    /// Population standard deviation.
    pub stddev: Duration,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let ring = Ring { received: 0, lost: 0, results: vec![Duration::ZERO; capacity] };
        Self { inner: RwLock::new(ring) }
    }

    pub fn capacity(&self) -> usize {
        self.inner.read().results.len()
    }

    pub fn received(&self) -> usize {
        self.inner.read().received
    }

    pub fn lost(&self) -> usize {
        self.inner.read().lost
    }

    /// Records the outcome of a probe: `Some(rtt)` on success, `None` on failure.
    pub fn record(&self, rtt: Option<Duration>) {
        let mut ring = self.inner.write();
        match rtt {
            Some(rtt) => {
                let idx = ring.received % ring.results.len();
                ring.results[idx] = rtt;
                ring.received += 1;
            }
            None => ring.lost += 1,
        }
    }

    pub fn statistics(&self) -> Statistics {
        let ring = self.inner.read();
        let mut stats = Statistics { sent: ring.received + ring.lost, ..Default::default() };

        if ring.received == 0 {
            if ring.lost > 0 {
                stats.loss = 1.0;
            }
            return stats;
        }

        stats.loss = ring.lost as f64 / stats.sent as f64;

        let capacity = ring.results.len();
        stats.last = ring.results[(ring.received - 1) % capacity];

        let window = &ring.results[..ring.received.min(capacity)];
        let size = window.len() as f64;

        stats.best = window.iter().copied().min().unwrap_or_default();
        stats.worst = window.iter().copied().max().unwrap_or_default();

        let nanos = |rtt: &Duration| rtt.as_nanos() as f64;
        let mean = window.iter().map(nanos).sum::<f64>() / size;
        let variance = window.iter().map(|rtt| (nanos(rtt) - mean).powi(2)).sum::<f64>() / size;

        stats.mean = Duration::from_nanos(mean.round() as u64);
        stats.stddev = Duration::from_nanos(variance.sqrt().round() as u64);

        stats
    }

    #[cfg(test)]
    fn slots(&self) -> Vec<Duration> {
        self.inner.read().results.clone()
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn ring_wraps_at_capacity() {
        let history = History::new(3);
        for rtt in [10, 20, 30, 40] {
            history.record(Some(ms(rtt)));
        }

        assert_eq!(history.slots(), vec![ms(40), ms(20), ms(30)]);
        assert_eq!(history.received(), 4);

        let stats = history.statistics();
        assert_eq!(stats.last, ms(40));
        assert_eq!(stats.best, ms(20));
        assert_eq!(stats.worst, ms(40));
        assert_eq!(stats.mean, ms(30));
        assert_eq!(stats.sent, 4);
    }

    #[test]
    fn window_only_covers_received_samples() {
        let history = History::new(5);
        history.record(Some(ms(10)));
        history.record(Some(ms(30)));

        let stats = history.statistics();
        assert_eq!(stats.best, ms(10));
        assert_eq!(stats.worst, ms(30));
        assert_eq!(stats.mean, ms(20));
        assert_eq!(stats.stddev, ms(10));
        assert_eq!(stats.last, ms(30));
    }

    #[test]
    fn loss_fraction() {
        let all_lost = History::new(3);
        all_lost.record(None);
        all_lost.record(None);
        let stats = all_lost.statistics();
        assert_eq!(stats.loss, 1.0);
        assert_eq!(stats.mean, Duration::ZERO);
        assert_eq!(stats.last, Duration::ZERO);

        let none_lost = History::new(3);
        for _ in 0..5 {
            none_lost.record(Some(ms(1)));
        }
        assert_eq!(none_lost.statistics().loss, 0.0);

        let some_lost = History::new(3);
        for _ in 0..3 {
            some_lost.record(Some(ms(1)));
        }
        some_lost.record(None);
        assert_eq!(some_lost.statistics().loss, 0.25);
        assert_eq!(some_lost.lost(), 1);
    }

    #[test]
    fn empty_history_is_all_zero() {
        assert_eq!(History::new(3).statistics(), Statistics::default());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let history = History::new(0);
        history.record(Some(ms(5)));
        assert_eq!(history.capacity(), 1);
        assert_eq!(history.statistics().last, ms(5));
    }
}
