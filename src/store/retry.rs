use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Backoff settings for retrying transient backend failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 200,
            max_backoff_ms: 5_000,
            jitter_ms: 100,
        }
    }
}

/// Run `op` until it succeeds, fails with an error `retryable` rejects, or
/// the retry budget is spent. The last error is returned on exhaustion.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !retryable(&e) => return Err(e),
            Err(e) => {
                if attempt > policy.max_retries {
                    debug!(
                        "Exhausted {} retries for {}; last error: {}",
                        policy.max_retries, what, e
                    );
                    return Err(e);
                }

                let wait_duration = calculate_backoff(policy, attempt);
                warn!(
                    "{}: attempt {}/{} failed with error: {}. Retrying in {:?}...",
                    what,
                    attempt,
                    policy.max_retries + 1,
                    e,
                    wait_duration
                );

                sleep(wait_duration).await;
            }
        }
    }
}

fn calculate_backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy.base_backoff_ms as f64;
    let max = policy.max_backoff_ms as f64;

    // Exponential: base * 2^(attempt - 1)
    let raw_backoff = base * 2_f64.powi((attempt as i32) - 1);
    let capped_backoff = raw_backoff.min(max);

    let jitter = rand::thread_rng().gen_range(0..=policy.jitter_ms);

    Duration::from_millis((capped_backoff as u64) + jitter)
}
