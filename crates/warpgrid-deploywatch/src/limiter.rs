//! Shared token bucket for state queries.
//!
//! One `QueryLimiter` is created per registry and handed to every
//! per-deployment watcher, so the discovery loop and all watchers draw from
//! the same budget. Only reads are limited; consensus writes never wait here.

use std::num::NonZeroU32;

use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::sync::watch;

use crate::error::{WatchError, WatchResult};
use crate::scope::cancelled;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Rate limiter gating blocking state queries.
pub struct QueryLimiter {
    inner: DirectLimiter,
}

impl QueryLimiter {
    /// Allow `per_second` queries per second with bursts of up to `burst`.
    ///
    /// Zero values are clamped: a zero rate becomes one query per second and
    /// a zero burst falls back to the rate.
    pub fn new(per_second: u32, burst: u32) -> Self {
        let rate = NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst).unwrap_or(rate);
        Self {
            inner: RateLimiter::direct(Quota::per_second(rate).allow_burst(burst)),
        }
    }

    /// Wait for a token, or fail with [`WatchError::Cancelled`] once `scope`
    /// is cancelled.
    pub async fn wait(&self, scope: &watch::Receiver<bool>) -> WatchResult<()> {
        let mut scope = scope.clone();
        tokio::select! {
            biased;
            _ = cancelled(&mut scope) => Err(WatchError::Cancelled),
            _ = self.inner.until_ready() => Ok(()),
        }
    }
}

impl std::fmt::Debug for QueryLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryLimiter").finish_non_exhaustive()
    }
}
