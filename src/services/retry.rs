/// Retry policy for transient source failures, exponential backoff without jitter
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Extra attempts after the first failure
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        Duration::from_millis(
            ((current.as_millis() as f64 * self.backoff_multiplier)
                .min(self.max_backoff.as_millis() as f64)) as u64,
        )
    }

    /// Total time spent sleeping when every retry is used
    pub fn total_backoff(&self) -> Duration {
        let mut total = Duration::ZERO;
        let mut backoff = self.initial_backoff;
        for _ in 0..self.max_retries {
            total += backoff;
            backoff = self.next_backoff(backoff);
        }
        total
    }
}

/// Outcome of a retried operation together with the retries it consumed
#[derive(Debug)]
pub struct Retried<T> {
    pub result: AppResult<T>,
    pub retries: u32,
}

/// Runs `f`, retrying only while it fails with `SourceUnavailable`.
///
/// Any other error is returned immediately. After the last retry the final
/// error is returned unchanged.
pub async fn retry_unavailable<F, Fut, T>(policy: &RetryPolicy, mut f: F) -> Retried<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut retries = 0;
    let mut backoff = policy.initial_backoff;

    loop {
        match f().await {
            Err(AppError::SourceUnavailable(reason)) if retries < policy.max_retries => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = policy.max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    reason = %reason,
                    "Candidate source unavailable, retrying"
                );

                tokio::time::sleep(backoff).await;

                backoff = policy.next_backoff(backoff);
            }
            result => return Retried { result, retries },
        }
    }
}
