//! Retry pacing for failed state reads.
//!
//! Consecutive failures double the delay up to a cap; one success resets it.

use std::time::Duration;

use tokio::sync::watch;

use crate::error::{WatchError, WatchResult};
use crate::scope::cancelled;

/// Exponential backoff between consecutive failed reads.
#[derive(Debug)]
pub struct RetryBackoff {
    base: Duration,
    max: Duration,
    current: Duration,
    consecutive_failures: u32,
}

impl RetryBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: base,
            consecutive_failures: 0,
        }
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn failure(&mut self) -> Duration {
        let delay = self.current;
        self.consecutive_failures += 1;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Forget earlier failures.
    pub fn reset(&mut self) {
        self.current = self.base;
        self.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Record a failure and sleep for the resulting delay, returning early
    /// with [`WatchError::Cancelled`] if `scope` is cancelled.
    pub async fn wait(&mut self, scope: &watch::Receiver<bool>) -> WatchResult<()> {
        let delay = self.failure();
        let mut scope = scope.clone();
        tokio::select! {
            biased;
            _ = cancelled(&mut scope) => Err(WatchError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}
