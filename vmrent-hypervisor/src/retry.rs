//! Retry policy for backend calls.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::TransportError;

/// Linear-backoff retry policy.
///
/// Only transient transport failures are retried. Authentication failures
/// and every other error return immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    /// Delay before retry `n` is `n * backoff_step`
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff_step: Duration::ZERO,
        }
    }

    /// Retry without sleeping between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff_step: Duration::ZERO,
        }
    }

    /// Delay before the given retry (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.backoff_step * retry
    }

    /// Run `call` until it succeeds, fails non-transiently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut retry = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && retry + 1 < self.max_attempts => {
                    retry += 1;
                    let delay = self.delay_for(retry);
                    warn!(
                        operation = %what,
                        retry,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient backend error, retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_single_attempt_policy() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;

        let result: Result<(), _> = RetryPolicy::none()
            .run("list_nodes", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::Timeout("slow".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;
        let policy = RetryPolicy::immediate(3);

        let result = policy
            .run("list_nodes", || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(TransportError::Timeout("slow".into()))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;
        let policy = RetryPolicy::immediate(3);

        let result: Result<(), _> = policy
            .run("list_nodes", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::Connect("reset".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_auth_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;
        let policy = RetryPolicy::immediate(3);

        let result: Result<(), _> = policy
            .run("list_nodes", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::from_status(401, "invalid token"))
            })
            .await;

        assert!(result.unwrap_err().is_auth());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
