//! Bounded polling of asynchronous backend tasks.

use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{HypervisorError, Result};

/// Progress of a backend task at one poll.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskProgress {
    /// Queued or running
    Pending,
    /// Finished successfully, with the task's result value
    Succeeded(Value),
    /// Finished with an error message from the backend
    Failed(String),
}

/// Fixed-interval poller with an explicit ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskPoller {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for TaskPoller {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl TaskPoller {
    /// Poller with explicit interval and ceiling.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Poll `check` until the task finishes or the ceiling is reached.
    pub async fn wait<F, Fut>(&self, task: &str, mut check: F) -> Result<Value>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<TaskProgress>>,
    {
        let started = Instant::now();
        loop {
            match check().await? {
                TaskProgress::Succeeded(value) => {
                    debug!(task = %task, elapsed_ms = started.elapsed().as_millis() as u64, "Task finished");
                    return Ok(value);
                }
                TaskProgress::Failed(message) => {
                    return Err(HypervisorError::Operation(format!("task {} failed: {}", task, message)));
                }
                TaskProgress::Pending => {
                    if started.elapsed() >= self.timeout {
                        return Err(HypervisorError::Timeout(format!(
                            "task {} still running after {}s",
                            task,
                            self.timeout.as_secs()
                        )));
                    }
                    tokio::time::sleep(self.interval).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_wait_until_success() {
        let polls = AtomicU32::new(0);
        let counter = &polls;
        let poller = TaskPoller::new(Duration::from_millis(1), Duration::from_secs(5));

        let value = poller
            .wait("clone", || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Ok(TaskProgress::Pending)
                } else {
                    Ok(TaskProgress::Succeeded(Value::String("vm-42".into())))
                }
            })
            .await
            .unwrap();

        assert_eq!(value, Value::String("vm-42".into()));
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_task_carries_backend_message() {
        let poller = TaskPoller::new(Duration::from_millis(1), Duration::from_secs(5));
        let err = poller
            .wait("power-on", || async { Ok(TaskProgress::Failed("insufficient resources".into())) })
            .await
            .unwrap_err();

        assert!(matches!(err, HypervisorError::Operation(ref m) if m.contains("insufficient resources")));
    }

    #[tokio::test]
    async fn test_stuck_task_times_out() {
        let poller = TaskPoller::new(Duration::from_millis(1), Duration::from_millis(20));
        let err = poller
            .wait("reconfigure", || async { Ok(TaskProgress::Pending) })
            .await
            .unwrap_err();

        assert!(matches!(err, HypervisorError::Timeout(_)));
    }
}
