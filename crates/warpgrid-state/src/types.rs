//! Domain types for the WarpGrid state store.
//!
//! These types represent the persisted state of deployments, jobs,
//! evaluations and allocations, plus the request payloads the deployment
//! watcher commits through the consensus layer. All types are serializable
//! to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique identifier for a deployment.
pub type DeploymentId = String;

/// Unique identifier for a job (namespace-scoped).
pub type JobId = String;

/// Unique identifier for an evaluation.
pub type EvalId = String;

/// Unique identifier for an allocation.
pub type AllocId = String;

// ── Deployment ─────────────────────────────────────────────────────

/// A tracked rollout of one job version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: DeploymentId,
    pub namespace: String,
    pub job_id: JobId,
    pub job_version: u64,
    /// Create index of the job version this deployment rolls out.
    pub job_create_index: u64,
    pub status: DeploymentStatus,
    pub status_description: String,
    /// Per task group rollout state, keyed by group name.
    pub task_groups: BTreeMap<String, DeploymentGroupState>,
    pub create_index: u64,
    pub modify_index: u64,
}

/// Lifecycle status of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Running,
    Paused,
    Failed,
    Successful,
    Cancelled,
}

/// Rollout progress of one task group within a deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DeploymentGroupState {
    pub auto_revert: bool,
    pub promoted: bool,
    pub desired_canaries: u32,
    pub desired_total: u32,
    /// Allocation IDs of placed canaries.
    pub placed_canaries: Vec<AllocId>,
    pub placed_allocs: u32,
    pub healthy_allocs: u32,
    pub unhealthy_allocs: u32,
}

impl Deployment {
    /// Whether the deployment still needs supervision.
    pub fn active(&self) -> bool {
        matches!(
            self.status,
            DeploymentStatus::Running | DeploymentStatus::Paused
        )
    }

    /// Whether any task group asks for automatic rollback on failure.
    pub fn has_auto_revert(&self) -> bool {
        self.task_groups.values().any(|g| g.auto_revert)
    }
}

// ── Job ────────────────────────────────────────────────────────────

/// One version of a job definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub namespace: String,
    pub version: u64,
    /// Marked once a deployment of this version succeeded.
    pub stable: bool,
    pub task_groups: Vec<TaskGroup>,
    pub create_index: u64,
    pub modify_index: u64,
}

/// A group of identical tasks within a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskGroup {
    pub name: String,
    pub count: u32,
    pub update: Option<UpdateStrategy>,
}

/// Rolling update parameters for a task group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateStrategy {
    pub max_parallel: u32,
    pub canary: u32,
    pub auto_revert: bool,
}

impl Job {
    /// Build the composite key for the jobs table.
    pub fn table_key(&self) -> String {
        job_key(&self.namespace, &self.id)
    }

    /// Build the composite key for the job versions table.
    pub fn version_key(&self) -> String {
        format!("{}@{:020}", self.table_key(), self.version)
    }
}

/// Composite `{namespace}/{job_id}` key.
pub fn job_key(namespace: &str, job_id: &str) -> String {
    format!("{namespace}/{job_id}")
}

// ── Evaluation ─────────────────────────────────────────────────────

/// A request for the scheduler to reconcile a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Evaluation {
    pub id: EvalId,
    pub namespace: String,
    pub priority: u32,
    pub triggered_by: EvalTrigger,
    pub job_id: JobId,
    pub job_modify_index: u64,
    pub deployment_id: DeploymentId,
    pub status: EvalStatus,
}

/// Why an evaluation was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalTrigger {
    DeploymentWatcher,
    AllocHealth,
    Promotion,
    Resume,
    Rollback,
}

/// Scheduling status of an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalStatus {
    Pending,
    Complete,
    Failed,
    Cancelled,
}

// ── Allocation ─────────────────────────────────────────────────────

/// A placed instance of a task group belonging to a deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Allocation {
    pub id: AllocId,
    pub namespace: String,
    pub job_id: JobId,
    pub deployment_id: DeploymentId,
    pub task_group: String,
    pub canary: bool,
    /// Deployment health as reported by the client; `None` until known.
    pub healthy: Option<bool>,
    pub create_index: u64,
    pub modify_index: u64,
}

impl Allocation {
    /// Build the composite key for the allocations table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.deployment_id, self.id)
    }
}

// ── Requests ───────────────────────────────────────────────────────

/// A status transition for a deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentStatusUpdate {
    pub deployment_id: DeploymentId,
    pub status: DeploymentStatus,
    pub status_description: String,
}

/// A status transition bundled with an optional evaluation and job in one write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentStatusUpdateRequest {
    pub update: DeploymentStatusUpdate,
    pub eval: Option<Evaluation>,
    pub job: Option<Job>,
}

/// Operator or client report of allocation health within a deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DeploymentAllocHealthRequest {
    pub deployment_id: DeploymentId,
    pub healthy_allocation_ids: Vec<AllocId>,
    pub unhealthy_allocation_ids: Vec<AllocId>,
}

/// The committed form of an alloc health report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplyDeploymentAllocHealthRequest {
    pub request: DeploymentAllocHealthRequest,
    pub status_update: Option<DeploymentStatusUpdate>,
    pub eval: Option<Evaluation>,
    pub job: Option<Job>,
}

/// Request to promote canaries of some or all task groups.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DeploymentPromoteRequest {
    pub deployment_id: DeploymentId,
    pub all: bool,
    pub groups: Vec<String>,
}

/// The committed form of a promotion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplyDeploymentPromoteRequest {
    pub request: DeploymentPromoteRequest,
    pub eval: Option<Evaluation>,
}

/// Request to pause or resume a deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentPauseRequest {
    pub deployment_id: DeploymentId,
    pub pause: bool,
}

/// Outcome of a deployment update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DeploymentUpdateResponse {
    pub eval_id: Option<EvalId>,
    pub eval_create_index: u64,
    pub deployment_modify_index: u64,
    /// Job version rolled back to, if the update triggered a rollback.
    pub reverted_job_version: Option<u64>,
    pub index: u64,
}

// ── Query responses ────────────────────────────────────────────────

/// Result of a (blocking) deployment list query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DeploymentListResponse {
    pub deployments: Vec<Deployment>,
    pub index: u64,
}

/// Result of a (blocking) allocation list query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AllocListResponse {
    pub allocations: Vec<Allocation>,
    pub index: u64,
}
