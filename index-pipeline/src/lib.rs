#![allow(clippy::missing_docs_in_private_items)]

pub mod chunker;
pub mod embedding;
pub mod indexer;
pub mod ledger;
pub mod vector;

use std::sync::Arc;

use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use common::error::AppError;
pub use indexer::Indexer;

/// Ceiling for the retry wait after an unexpected error; quota exhaustion
/// never waits, it exits.
const FAILURE_WAIT_CAP: Duration = Duration::from_secs(60);

/// Self-pacing indexing loop. Idle cycles double the wait up to
/// `max_backoff`; any progress resets it to `base_poll`. Unknown errors are
/// logged and retried after an exponential wait capped at a short ceiling.
/// Quota exhaustion is the only fatal outcome.
pub async fn run_indexer_loop(
    indexer: Arc<Indexer>,
    base_poll: Duration,
    max_backoff: Duration,
) -> Result<(), AppError> {
    let mut idle_wait = base_poll;
    let mut failures: u32 = 0;

    loop {
        match indexer.index_pending().await {
            Ok(0) => {
                failures = 0;
                sleep(idle_wait).await;
                idle_wait = (idle_wait * 2).min(max_backoff);
            }
            Ok(indexed) => {
                info!(indexed, "indexing cycle finished");
                failures = 0;
                idle_wait = base_poll;
                sleep(base_poll).await;
            }
            Err(err) if err.is_quota_exhausted() => {
                error!(error = %err, "embedding quota exhausted; stopping the indexing loop");
                return Err(err);
            }
            Err(err) => {
                let wait = failure_wait(failures);
                warn!(error = %err, retry_in_secs = wait.as_secs(), "indexing cycle failed");
                sleep(wait).await;
                failures = failures.saturating_add(1);
            }
        }
    }
}

fn failure_wait(failures: u32) -> Duration {
    let secs = 2u64.saturating_pow(failures.min(16));
    Duration::from_secs(secs).min(FAILURE_WAIT_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_wait_grows_and_caps() {
        assert_eq!(failure_wait(0), Duration::from_secs(1));
        assert_eq!(failure_wait(1), Duration::from_secs(2));
        assert_eq!(failure_wait(5), Duration::from_secs(32));
        assert_eq!(failure_wait(6), FAILURE_WAIT_CAP);
        assert_eq!(failure_wait(40), FAILURE_WAIT_CAP);
    }
}
