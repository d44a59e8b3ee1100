use tcs_common::Executor;
use tracing::debug;

use crate::Result;

const PROGRAM: &str = "conntrack";

/// Flushes the connection-tracking table so established flows hit the new rules.
///
/// Returns `false` without doing anything if `conntrack` is not installed.
pub async fn flush<E: Executor>(executor: &E) -> Result<bool> {
    if !executor.available(PROGRAM).await {
        debug!("conntrack not available, skipping flush");
        return Ok(false);
    }

    executor.run(&format!("{PROGRAM} -F")).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use tcs_common::testing::RecordingExecutor;

    use super::*;

    #[tokio::test]
    async fn flushes_when_available() {
        let executor = RecordingExecutor::new();
        assert!(flush(&executor).await.unwrap());
        assert_eq!(executor.commands(), vec!["conntrack -F"]);
    }

    #[tokio::test]
    async fn skips_when_missing() {
        let executor = RecordingExecutor::new();
        executor.mark_missing("conntrack");
        assert!(!flush(&executor).await.unwrap());
        assert!(executor.commands().is_empty());
    }
}
