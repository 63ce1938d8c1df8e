//! # Retry Policy Module
//!
//! Fixed-delay retry for broker calls that are worth a second attempt.
//!
//! Unlike an exponential policy, every pause between attempts has the same
//! length and no jitter is applied.

use crate::error::TransportError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;

/// Retry policy with a fixed pause between attempts
///
/// # Examples
///
/// ```rust
/// use snssqs_transport::retry::RetryPolicy;
/// use std::time::Duration;
///
/// // Default policy: 2 attempts in total, 5s apart
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.max_attempts, 2);
///
/// let policy = RetryPolicy::new(3, Duration::from_millis(250));
/// assert!(policy.should_retry(2));
/// assert!(!policy.should_retry(3));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,

    /// Pause between consecutive attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy; `max_attempts` below one is raised to one
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Check if another attempt may follow `attempts_made` attempts
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Run `operation` until it succeeds or the attempts are used up.
    ///
    /// Every error is retried; the last one is returned together with the
    /// number of attempts made.
    pub async fn run<F, Fut, T>(&self, operation: &str, mut call: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut state = RetryState::new();

        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(error) if self.should_retry(state.attempts) => {
                    warn!(
                        operation = %operation,
                        attempt = state.attempts,
                        max_attempts = self.max_attempts,
                        delay_ms = self.delay.as_millis(),
                        error = %error,
                        "Attempt failed, retrying after fixed delay"
                    );
                    tokio::time::sleep(self.delay).await;
                    state.next_attempt();
                }
                Err(error) => {
                    return Err(RetryError {
                        attempts: state.attempts,
                        error,
                    })
                }
            }
        }
    }
}

/// Attempt counter for a single retried operation
#[derive(Debug, Clone)]
pub struct RetryState {
    /// Attempts made so far, including the one in progress
    pub attempts: u32,
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryState {
    pub fn new() -> Self {
        Self { attempts: 1 }
    }

    pub fn next_attempt(&mut self) {
        self.attempts += 1;
    }
}

/// Final failure of a retried operation
#[derive(Debug)]
pub struct RetryError {
    pub attempts: u32,
    pub error: TransportError,
}
