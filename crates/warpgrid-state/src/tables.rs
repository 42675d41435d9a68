//! redb table definitions for the WarpGrid state store.
//!
//! Each data table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Composite keys follow the pattern `{namespace}/{job_id}` or
//! `{parent_id}:{child_id}`.

use redb::TableDefinition;

/// Deployments keyed by `{deployment_id}`.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Latest job version keyed by `{namespace}/{job_id}`.
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Every job version keyed by `{namespace}/{job_id}@{version:020}`.
pub const JOB_VERSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("job_versions");

/// Evaluations keyed by `{eval_id}`.
pub const EVALUATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("evaluations");

/// Allocations keyed by `{deployment_id}:{alloc_id}`.
pub const ALLOCATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("allocations");

/// Store metadata; holds the global modify index under [`INDEX_KEY`].
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Key of the global modify index in [`META`].
pub const INDEX_KEY: &str = "index";
