//! Per-deployment watcher contract.
//!
//! The registry owns one [`DeploymentWatcher`] per active deployment and
//! builds it through a [`WatcherFactory`]. Watchers read cluster state
//! through the shared reader (gated by the shared limiter) and write back
//! only through the [`DeploymentTriggers`] handle they are given.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use warpgrid_state::{
    Deployment, DeploymentAllocHealthRequest, DeploymentPauseRequest, DeploymentPromoteRequest,
    DeploymentUpdateResponse, Job,
};

use crate::endpoints::{DeploymentStateReader, DeploymentTriggers};
use crate::error::WatchResult;
use crate::limiter::QueryLimiter;

/// Everything a watcher is bound to when it is created.
pub struct WatcherContext {
    /// Cancellation scope of the epoch the watcher was created in.
    pub scope: watch::Receiver<bool>,
    pub query_limiter: Arc<QueryLimiter>,
    pub reader: Arc<dyn DeploymentStateReader>,
    pub deployment: Deployment,
    pub job: Job,
    pub triggers: Arc<dyn DeploymentTriggers>,
    /// Priority for evaluations the watcher creates.
    pub eval_priority: u32,
}

/// Supervises the rollout of a single deployment.
#[async_trait]
pub trait DeploymentWatcher: Send + Sync {
    /// Signal all background work to stop.
    ///
    /// Returns the watcher's background task, if it has one, for the caller
    /// to join. Safe to call more than once; only the first call yields the
    /// task.
    fn stop_watch(&self) -> Option<JoinHandle<()>>;

    async fn set_alloc_health(
        &self,
        req: &DeploymentAllocHealthRequest,
    ) -> WatchResult<DeploymentUpdateResponse>;

    async fn promote_deployment(
        &self,
        req: &DeploymentPromoteRequest,
    ) -> WatchResult<DeploymentUpdateResponse>;

    async fn pause_deployment(
        &self,
        req: &DeploymentPauseRequest,
    ) -> WatchResult<DeploymentUpdateResponse>;
}

/// Builds per-deployment watchers for the registry.
pub trait WatcherFactory: Send + Sync {
    fn create(&self, ctx: WatcherContext) -> Box<dyn DeploymentWatcher>;
}
