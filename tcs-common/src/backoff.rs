use futures::{FutureExt, Stream};
use std::{pin::Pin, task::Poll, time::Duration};
use tokio::time::sleep;

/// A stream that yields exponentially increasing backoff durations, used to space out
/// connection attempts at startup.
///
/// The first item is yielded after `initial` has elapsed, every following one after twice the
/// previous delay. The stream closes after `max_retries` items.
#[derive(Debug)]
pub struct ExponentialBackoff {
    /// Current number of retries.
    retry_count: usize,
    /// Maximum number of retries before closing the stream.
    max_retries: usize,
    /// The delay before the next item.
    backoff: Duration,
    /// Pending delay. `Sleep` is not `Unpin`.
    timeout: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max_retries: usize) -> Self {
        Self { retry_count: 0, max_retries, backoff: initial, timeout: None }
    }

    /// Number of items yielded so far.
    pub const fn retries(&self) -> usize {
        self.retry_count
    }
}

impl Stream for ExponentialBackoff {
    type Item = Duration;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.retry_count >= this.max_retries {
            return Poll::Ready(None);
        }

        let timeout = this.timeout.get_or_insert_with(|| Box::pin(sleep(this.backoff)));
        if timeout.poll_unpin(cx).is_pending() {
            return Poll::Pending;
        }

        let waited = this.backoff;
        this.timeout = None;
        this.retry_count += 1;
        this.backoff = this.backoff.saturating_mul(2);

        Poll::Ready(Some(waited))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test(start_paused = true)]
    async fn doubles_until_exhausted() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(100), 3);

        assert_eq!(backoff.next().await, Some(Duration::from_millis(100)));
        assert_eq!(backoff.next().await, Some(Duration::from_millis(200)));
        assert_eq!(backoff.next().await, Some(Duration::from_millis(400)));
        assert_eq!(backoff.next().await, None);
        assert_eq!(backoff.retries(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retries_closes_immediately() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), 0);
        assert_eq!(backoff.next().await, None);
    }
}
