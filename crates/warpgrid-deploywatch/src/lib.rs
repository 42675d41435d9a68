//! warpgrid-deploywatch: leader-only supervision of rolling deployments.
//!
//! While this node leads the cluster, [`DeploymentsWatcher`] discovers every
//! active deployment through a long-poll query and hands each one to a
//! per-deployment watcher. Watchers react to allocation health and operator
//! requests and write results back through consensus. Evaluation creation is
//! coalesced by an [`EvalBatcher`] into one write per batch window.
//!
//! # Architecture
//!
//! ```text
//! DeploymentsWatcher (enabled on the leader)
//!   ├── discovery loop ── QueryLimiter ── DeploymentStateReader
//!   ├── DeploymentId → Box<dyn DeploymentWatcher>   (RolloutWatcher by default)
//!   │     └── allocation long-poll, health / promote / pause decisions
//!   └── epoch
//!         ├── cancellation scope (watch channel)
//!         └── EvalBatcher ── DeploymentRaftEndpoints::upsert_evals
//!               └── EvalFuture shared by every caller of a window
//! ```
//!
//! # Epochs
//!
//! Disabling or flushing the watcher cancels the current epoch: watchers
//! stop, blocked reads return [`WatchError::Cancelled`], and evaluations
//! still waiting for a batch resolve with `Cancelled`. A fresh epoch starts
//! immediately.
//!
//! # Backends
//!
//! Collaborators are traits. [`StoreBackend`] implements them over a local
//! `warpgrid_state::StateStore` for single-node use and tests.

pub mod backend;
pub mod backoff;
pub mod batcher;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod future;
pub mod limiter;
pub mod registry;
pub mod rollout;
pub mod scope;
pub mod watcher;

#[cfg(test)]
mod testing;

pub use backend::StoreBackend;
pub use batcher::EvalBatcher;
pub use config::WatcherConfig;
pub use endpoints::{DeploymentRaftEndpoints, DeploymentStateReader, DeploymentTriggers};
pub use error::{WatchError, WatchResult};
pub use future::EvalFuture;
pub use limiter::QueryLimiter;
pub use registry::DeploymentsWatcher;
pub use rollout::{RolloutWatcher, RolloutWatcherFactory};
pub use watcher::{DeploymentWatcher, WatcherContext, WatcherFactory};
