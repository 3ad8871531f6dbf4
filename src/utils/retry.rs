//! Retry logic with exponential backoff for transient network errors

use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

const MAX_DELAY: Duration = Duration::from_secs(5);
const BASE_DELAY: Duration = Duration::from_millis(100);
const MAX_ATTEMPTS: usize = 5;

/// Retry policy for calls to remote collaborators
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_delay: BASE_DELAY,
            max_delay: MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy with custom parameters
    pub fn new(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Maximum number of attempts, including the first
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Execute an operation, retrying errors that report `is_retryable`
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = self.base_delay;
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!("Operation succeeded on attempt {}", attempt);
                    }
                    return Ok(result);
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    warn!(
                        "Operation failed on attempt {}: {}. Retrying in {:?}...",
                        attempt, e, delay
                    );

                    // Jitter keeps a fleet of nodes from retrying in lockstep
                    let jitter = delay.as_millis() as f64 * 0.1 * rand::random::<f64>();
                    tokio::time::sleep(delay + Duration::from_millis(jitter as u64)).await;

                    delay = std::cmp::min(delay * 2, self.max_delay);
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        warn!("Operation failed after {} attempts: {}", attempt, e);
                    } else {
                        debug!("Non-retryable error: {}", e);
                    }
                    return Err(e);
                }
            }
        }
    }
}
