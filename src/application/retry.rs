use crate::error::Result;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// How often, and how patiently, a transaction body is re-run after a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 25,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Full-jitter exponential backoff for the given (1-based) attempt.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_backoff
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_backoff);
        let cap = exp.as_micros() as u64;
        if cap == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(rand::thread_rng().gen_range(0..=cap))
    }
}

/// Runs `attempt` until it succeeds, fails with a non-retryable error, or the policy
/// runs out of attempts.
///
/// Every call to `attempt` must open its own transaction so that a retry re-reads
/// fresh state instead of replaying values computed before the conflict.
pub async fn run_with_retry<T, F, Fut>(policy: &RetryPolicy, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut tries = 0;
    loop {
        tries += 1;
        match attempt().await {
            Err(e) if e.is_retryable() && tries < policy.max_attempts => {
                let wait = policy.backoff(tries);
                debug!(attempt = tries, error = %e, "retrying transaction");
                tokio::time::sleep(wait).await;
            }
            outcome => return outcome,
        }
    }
}
