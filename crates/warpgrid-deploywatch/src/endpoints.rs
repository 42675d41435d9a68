//! Collaborator interfaces consumed by the deployments watcher.
//!
//! - [`DeploymentStateReader`] reads cluster state, with long-poll semantics
//!   on the list queries.
//! - [`DeploymentRaftEndpoints`] commits mutations through consensus.
//! - [`DeploymentTriggers`] is the handle per-deployment watchers use to write
//!   back through the registry; evaluation creation on it is batched.

use async_trait::async_trait;
use warpgrid_state::*;

use crate::error::WatchResult;

/// Read access to the cluster state needed to supervise deployments.
#[async_trait]
pub trait DeploymentStateReader: Send + Sync {
    /// List all deployments once the state index exceeds `min_index`.
    ///
    /// Implementations may give up after a bounded wait and echo the
    /// unchanged index; callers loop until the index advances.
    async fn list_deployments(&self, min_index: u64) -> WatchResult<DeploymentListResponse>;

    /// Look up a single deployment without blocking.
    async fn get_deployment(&self, deployment_id: &str) -> WatchResult<Option<Deployment>>;

    /// Look up the latest version of a job.
    async fn get_job(&self, namespace: &str, job_id: &str) -> WatchResult<Option<Job>>;

    /// All stored versions of a job, newest first.
    async fn job_versions(&self, namespace: &str, job_id: &str) -> WatchResult<Vec<Job>>;

    /// Evaluations created for a job.
    async fn evaluations(&self, namespace: &str, job_id: &str) -> WatchResult<Vec<Evaluation>>;

    /// Allocations of a deployment, blocking like [`list_deployments`](Self::list_deployments).
    async fn allocations(&self, deployment_id: &str, min_index: u64)
    -> WatchResult<AllocListResponse>;
}

/// Consensus-backed mutations. Every method returns the commit index.
#[async_trait]
pub trait DeploymentRaftEndpoints: Send + Sync {
    async fn upsert_evals(&self, evals: Vec<Evaluation>) -> WatchResult<u64>;

    async fn upsert_job(&self, job: Job) -> WatchResult<u64>;

    /// Commit a status transition with an optional evaluation and job.
    async fn upsert_deployment_status_update(
        &self,
        req: DeploymentStatusUpdateRequest,
    ) -> WatchResult<u64>;

    async fn upsert_deployment_promotion(&self, req: ApplyDeploymentPromoteRequest)
    -> WatchResult<u64>;

    async fn upsert_deployment_alloc_health(
        &self,
        req: ApplyDeploymentAllocHealthRequest,
    ) -> WatchResult<u64>;
}

/// Write path handed to each per-deployment watcher.
#[async_trait]
pub trait DeploymentTriggers: Send + Sync {
    /// Create an evaluation, batched with other callers; resolves once the
    /// batch is committed.
    async fn create_evaluation(&self, eval: Evaluation) -> WatchResult<u64>;

    async fn upsert_job(&self, job: Job) -> WatchResult<u64>;

    async fn upsert_deployment_status_update(
        &self,
        update: DeploymentStatusUpdate,
        eval: Option<Evaluation>,
        job: Option<Job>,
    ) -> WatchResult<u64>;

    async fn upsert_deployment_promotion(&self, req: ApplyDeploymentPromoteRequest)
    -> WatchResult<u64>;

    async fn upsert_deployment_alloc_health(
        &self,
        req: ApplyDeploymentAllocHealthRequest,
    ) -> WatchResult<u64>;
}
