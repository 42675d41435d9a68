//! Deployment watcher configuration.
//!
//! Every field has a default, so an empty `[watcher]` table (or none at all)
//! yields the stock behavior: 200 ms evaluation batches and a 15 req/s
//! (burst 100) budget for state queries.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the deployments watcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Window over which evaluation creation is coalesced into one write.
    #[serde(default = "default_eval_batch_ms")]
    pub eval_batch_ms: u64,

    /// Sustained state queries per second shared by all watchers.
    #[serde(default = "default_query_rate_per_second")]
    pub query_rate_per_second: u32,

    /// Queries allowed above the sustained rate.
    #[serde(default = "default_query_burst")]
    pub query_burst: u32,

    /// First delay after a failed deployment list query.
    #[serde(default = "default_read_retry_base_ms")]
    pub read_retry_base_ms: u64,

    /// Cap on the delay between consecutive failed list queries.
    #[serde(default = "default_read_retry_max_ms")]
    pub read_retry_max_ms: u64,

    /// Priority stamped on evaluations created by deployment watchers.
    #[serde(default = "default_eval_priority")]
    pub eval_priority: u32,
}

const fn default_eval_batch_ms() -> u64 {
    200
}

const fn default_query_rate_per_second() -> u32 {
    15
}

const fn default_query_burst() -> u32 {
    100
}

const fn default_read_retry_base_ms() -> u64 {
    250
}

const fn default_read_retry_max_ms() -> u64 {
    10_000
}

const fn default_eval_priority() -> u32 {
    50
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            eval_batch_ms: default_eval_batch_ms(),
            query_rate_per_second: default_query_rate_per_second(),
            query_burst: default_query_burst(),
            read_retry_base_ms: default_read_retry_base_ms(),
            read_retry_max_ms: default_read_retry_max_ms(),
            eval_priority: default_eval_priority(),
        }
    }
}

impl WatcherConfig {
    pub fn eval_batch_duration(&self) -> Duration {
        Duration::from_millis(self.eval_batch_ms.max(1))
    }

    pub fn read_retry_base(&self) -> Duration {
        Duration::from_millis(self.read_retry_base_ms)
    }

    pub fn read_retry_max(&self) -> Duration {
        Duration::from_millis(self.read_retry_max_ms.max(self.read_retry_base_ms))
    }
}
