//! warpgrid-state: deployment state store for WarpGrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for deployments, jobs, evaluations and allocations, together with
//! the request types the deployment watcher commits.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{namespace}/{job_id}`, `{deployment_id}:{alloc_id}`)
//! enable prefix scans for related records.
//!
//! Every write bumps a single global modify index in the same transaction.
//! Readers block on that index (`StateStore::wait_for_index`) to implement
//! long-poll queries.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
