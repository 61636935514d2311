//! Stopwatch for operations whose duration is reported.

use std::time::{Duration, Instant};

/// Measures the wall-clock duration of a named operation.
#[derive(Debug, Clone)]
pub struct TimedOperation {
    name: String,
    started: Instant,
}

impl TimedOperation {
    /// Start timing `name` now.
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            started: Instant::now(),
        }
    }

    /// Name given at start.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Time elapsed since start.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time elapsed since start, in fractional seconds.
    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_is_monotonic() {
        let op = TimedOperation::start("provision");
        let first = op.elapsed_secs();
        std::thread::sleep(Duration::from_millis(5));
        assert!(op.elapsed_secs() >= first);
        assert_eq!(op.name(), "provision");
    }
}
