use std::sync::atomic::{AtomicU64, Ordering};

/// Tracks which transaction of the engine has been applied to the kernel.
///
/// `current` is the latest transaction announced on the network channel; `last_applied` the one
/// the store held when the last pass finished. Existing shaping targets are only re-applied while
/// the two differ.
#[derive(Debug, Default)]
pub struct TransactionCounter {
    current: AtomicU64,
    last_applied: AtomicU64,
}

impl TransactionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied.load(Ordering::Acquire)
    }

    /// Records an announced transaction. Ids may go backwards when the engine restarts.
    pub fn set_current(&self, id: u64) {
        self.current.store(id, Ordering::Release);
    }

    pub fn mark_applied(&self, id: u64) {
        self.last_applied.store(id, Ordering::Release);
    }

    /// Whether existing shaping targets must be re-parameterized.
    pub fn needs_refresh(&self) -> bool {
        self.last_applied() < self.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_only_when_behind() {
        let counter = TransactionCounter::new();
        assert!(!counter.needs_refresh());

        counter.set_current(3);
        assert!(counter.needs_refresh());

        counter.mark_applied(3);
        assert!(!counter.needs_refresh());

        counter.set_current(4);
        counter.mark_applied(3);
        assert!(counter.needs_refresh());
    }
}
