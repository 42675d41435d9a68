//! Deployments watcher registry.
//!
//! Tracks one per-deployment watcher for every active deployment while this
//! node is the leader. Leadership is expressed through
//! [`DeploymentsWatcher::set_enabled`]; while disabled every mutating
//! operation is a silent no-op.
//!
//! Work is grouped into epochs. An epoch pairs a cancellation scope with an
//! [`EvalBatcher`]; every watcher created during the epoch is bound to its
//! scope. [`flush`](DeploymentsWatcher::flush) (and any disable) stops all
//! watchers, cancels the epoch and starts a fresh one.
//!
//! ```text
//!   set_enabled(true) ──▶ discovery loop ──list_deployments(index)──▶ reader
//!                             │
//!                   active ───┼──▶ add ──▶ WatcherFactory::create ──▶ watcher
//!                   terminal ─┴──▶ remove ──▶ stop_watch
//!
//!   watcher ──create_evaluation──▶ handle ──▶ current EvalBatcher ──▶ raft
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use warpgrid_state::*;

use crate::backoff::RetryBackoff;
use crate::batcher::EvalBatcher;
use crate::config::WatcherConfig;
use crate::endpoints::{DeploymentRaftEndpoints, DeploymentStateReader, DeploymentTriggers};
use crate::error::{WatchError, WatchResult};
use crate::limiter::QueryLimiter;
use crate::rollout::RolloutWatcherFactory;
use crate::scope::{cancelled, new_scope};
use crate::watcher::{DeploymentWatcher, WatcherContext, WatcherFactory};

/// Leader-only supervisor of all active deployments.
#[derive(Clone)]
pub struct DeploymentsWatcher {
    inner: Arc<Inner>,
}

struct Inner {
    config: WatcherConfig,
    limiter: Arc<QueryLimiter>,
    reader: Arc<dyn DeploymentStateReader>,
    raft: Arc<dyn DeploymentRaftEndpoints>,
    factory: Arc<dyn WatcherFactory>,
    handle: Arc<RegistryHandle>,
    state: RwLock<RegistryState>,
}

struct RegistryState {
    enabled: bool,
    watchers: HashMap<DeploymentId, Box<dyn DeploymentWatcher>>,
    epoch: Epoch,
    discovery: Option<JoinHandle<()>>,
    /// Bumped each time a discovery loop is started.
    discovery_run: u64,
}

struct Epoch {
    shutdown_tx: watch::Sender<bool>,
    batcher: Arc<EvalBatcher>,
}

impl DeploymentsWatcher {
    /// Create a disabled registry using [`RolloutWatcher`](crate::RolloutWatcher)s.
    ///
    /// Must be called within a Tokio runtime: the first epoch's batcher is
    /// started immediately.
    pub fn new(
        config: WatcherConfig,
        reader: Arc<dyn DeploymentStateReader>,
        raft: Arc<dyn DeploymentRaftEndpoints>,
    ) -> Self {
        Self::with_factory(config, reader, raft, Arc::new(RolloutWatcherFactory))
    }

    /// Create a disabled registry building watchers with `factory`.
    pub fn with_factory(
        config: WatcherConfig,
        reader: Arc<dyn DeploymentStateReader>,
        raft: Arc<dyn DeploymentRaftEndpoints>,
        factory: Arc<dyn WatcherFactory>,
    ) -> Self {
        let limiter = Arc::new(QueryLimiter::new(
            config.query_rate_per_second,
            config.query_burst,
        ));
        let epoch = Epoch::new(&raft, &config);
        let handle = Arc::new(RegistryHandle {
            raft: raft.clone(),
            batcher: std::sync::RwLock::new(epoch.batcher.clone()),
        });

        Self {
            inner: Arc::new(Inner {
                config,
                limiter,
                reader,
                raft,
                factory,
                handle,
                state: RwLock::new(RegistryState {
                    enabled: false,
                    watchers: HashMap::new(),
                    epoch,
                    discovery: None,
                    discovery_run: 0,
                }),
            }),
        }
    }

    /// Enable or disable the registry.
    ///
    /// Disabling flushes all tracked deployments and waits for the discovery
    /// loop and every watcher task to exit. Enabling a disabled registry starts a fresh epoch and a
    /// new discovery loop.
    pub async fn set_enabled(&self, enabled: bool) {
        let mut joins = Vec::new();
        {
            let mut state = self.inner.state.write().await;
            let was_enabled = state.enabled;
            state.enabled = enabled;

            if !enabled {
                joins.extend(state.discovery.take());
                joins.extend(self.inner.flush_locked(&mut state));
                if was_enabled {
                    info!("deployments watcher disabled");
                }
            } else if !was_enabled {
                joins.extend(self.inner.flush_locked(&mut state));
                state.discovery_run += 1;
                let run = state.discovery_run;
                state.discovery = Some(tokio::spawn(self.clone().discover(run)));
                info!("deployments watcher enabled");
            }
        }
        join_all(joins).await;
    }

    /// Stop every watcher, cancel the current epoch and start a new one.
    ///
    /// Returns once the stopped watchers and the old batcher have exited.
    pub async fn flush(&self) {
        let joins = {
            let mut state = self.inner.state.write().await;
            self.inner.flush_locked(&mut state)
        };
        join_all(joins).await;
    }

    pub async fn is_enabled(&self) -> bool {
        self.inner.state.read().await.enabled
    }

    /// IDs of tracked deployments, sorted.
    pub async fn watched_deployments(&self) -> Vec<DeploymentId> {
        let state = self.inner.state.read().await;
        let mut ids: Vec<_> = state.watchers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn is_watching(&self, deployment_id: &str) -> bool {
        self.inner
            .state
            .read()
            .await
            .watchers
            .contains_key(deployment_id)
    }

    /// Start tracking `deployment`.
    ///
    /// No-op while disabled or if the deployment is already tracked. Fails
    /// with [`WatchError::JobNotFound`] if its job does not exist.
    pub async fn add(&self, deployment: &Deployment) -> WatchResult<()> {
        let mut state = self.inner.state.write().await;
        if !state.enabled || state.watchers.contains_key(&deployment.id) {
            return Ok(());
        }

        let job = self
            .inner
            .reader
            .get_job(&deployment.namespace, &deployment.job_id)
            .await?
            .ok_or_else(|| WatchError::JobNotFound {
                deployment_id: deployment.id.clone(),
                job_id: deployment.job_id.clone(),
            })?;

        let watcher = self.inner.factory.create(WatcherContext {
            scope: state.epoch.shutdown_tx.subscribe(),
            query_limiter: self.inner.limiter.clone(),
            reader: self.inner.reader.clone(),
            deployment: deployment.clone(),
            job,
            triggers: self.inner.handle.clone(),
            eval_priority: self.inner.config.eval_priority,
        });
        state.watchers.insert(deployment.id.clone(), watcher);
        trace!(deployment_id = %deployment.id, "tracking deployment");
        Ok(())
    }

    /// Stop tracking `deployment` and wait for its watcher to exit. No-op
    /// while disabled or if untracked.
    pub async fn remove(&self, deployment: &Deployment) {
        let task = {
            let mut state = self.inner.state.write().await;
            if !state.enabled {
                return;
            }
            let Some(watcher) = state.watchers.remove(&deployment.id) else {
                return;
            };
            trace!(deployment_id = %deployment.id, "untracking deployment");
            watcher.stop_watch()
        };
        join_all(task).await;
    }

    /// Record allocation health for a tracked deployment.
    pub async fn set_alloc_health(
        &self,
        req: &DeploymentAllocHealthRequest,
    ) -> WatchResult<DeploymentUpdateResponse> {
        let state = self.inner.state.write().await;
        if !state.enabled {
            return Ok(DeploymentUpdateResponse::default());
        }
        watcher_for(&state, &req.deployment_id)?
            .set_alloc_health(req)
            .await
    }

    /// Promote canaries of a tracked deployment.
    pub async fn promote_deployment(
        &self,
        req: &DeploymentPromoteRequest,
    ) -> WatchResult<DeploymentUpdateResponse> {
        let state = self.inner.state.write().await;
        if !state.enabled {
            return Ok(DeploymentUpdateResponse::default());
        }
        watcher_for(&state, &req.deployment_id)?
            .promote_deployment(req)
            .await
    }

    /// Pause or resume a tracked deployment.
    pub async fn pause_deployment(
        &self,
        req: &DeploymentPauseRequest,
    ) -> WatchResult<DeploymentUpdateResponse> {
        let state = self.inner.state.write().await;
        if !state.enabled {
            return Ok(DeploymentUpdateResponse::default());
        }
        watcher_for(&state, &req.deployment_id)?
            .pause_deployment(req)
            .await
    }

    /// Submit an evaluation to the current batch and wait for its commit.
    pub async fn create_evaluation(&self, eval: Evaluation) -> WatchResult<u64> {
        self.inner.handle.create_evaluation(eval).await
    }

    pub async fn upsert_job(&self, job: Job) -> WatchResult<u64> {
        self.inner.raft.upsert_job(job).await
    }

    pub async fn upsert_deployment_status_update(
        &self,
        update: DeploymentStatusUpdate,
        eval: Option<Evaluation>,
        job: Option<Job>,
    ) -> WatchResult<u64> {
        self.inner
            .handle
            .upsert_deployment_status_update(update, eval, job)
            .await
    }

    pub async fn upsert_deployment_promotion(
        &self,
        req: ApplyDeploymentPromoteRequest,
    ) -> WatchResult<u64> {
        self.inner.raft.upsert_deployment_promotion(req).await
    }

    pub async fn upsert_deployment_alloc_health(
        &self,
        req: ApplyDeploymentAllocHealthRequest,
    ) -> WatchResult<u64> {
        self.inner.raft.upsert_deployment_alloc_health(req).await
    }

    /// Discovery loop for one enabled period.
    async fn discover(self, run: u64) {
        let config = &self.inner.config;
        let mut backoff = RetryBackoff::new(config.read_retry_base(), config.read_retry_max());
        let mut index = 0;

        debug!(run, "deployment discovery starting");
        while let Some(scope) = self.discovery_scope(run).await {
            match self.get_deploys(index, &scope).await {
                Ok(resp) => {
                    backoff.reset();
                    for deployment in &resp.deployments {
                        if deployment.active() {
                            if let Err(e) = self.add(deployment).await {
                                error!(deployment_id = %deployment.id, error = %e, "failed to track deployment");
                            }
                        } else {
                            self.remove(deployment).await;
                        }
                    }
                    index = resp.index;
                }
                // The epoch ended. Either the registry was disabled and the
                // next scope lookup ends the loop, or it was flushed and
                // everything must be rediscovered.
                Err(WatchError::Cancelled) => index = 0,
                Err(e) => {
                    error!(
                        error = %e,
                        failures = backoff.consecutive_failures() + 1,
                        "failed to retrieve deployments"
                    );
                    // Cancelled while backing off: same as a cancelled read,
                    // the next scope lookup decides whether to go on.
                    if let Err(WatchError::Cancelled) = backoff.wait(&scope).await {
                        index = 0;
                    }
                }
            }
        }
        debug!(run, "deployment discovery exiting");
    }

    /// Scope of the current epoch, or `None` once this discovery run should
    /// stop.
    async fn discovery_scope(&self, run: u64) -> Option<watch::Receiver<bool>> {
        let state = self.inner.state.read().await;
        (state.enabled && state.discovery_run == run).then(|| state.epoch.shutdown_tx.subscribe())
    }

    /// Blocking deployment list query, returning once the index moves past
    /// `min_index`.
    async fn get_deploys(
        &self,
        min_index: u64,
        scope: &watch::Receiver<bool>,
    ) -> WatchResult<DeploymentListResponse> {
        let mut stop = scope.clone();
        loop {
            self.inner.limiter.wait(scope).await?;
            let resp = tokio::select! {
                biased;
                _ = cancelled(&mut stop) => return Err(WatchError::Cancelled),
                resp = self.inner.reader.list_deployments(min_index) => resp?,
            };
            if resp.index > min_index {
                return Ok(resp);
            }
        }
    }

    #[cfg(test)]
    async fn current_batcher(&self) -> Arc<EvalBatcher> {
        self.inner.state.read().await.epoch.batcher.clone()
    }
}

impl Inner {
    /// Stop all watchers and swap in a fresh epoch. Returns the watcher
    /// tasks and the old batcher's task for the caller to join once the lock
    /// is released.
    fn flush_locked(&self, state: &mut RegistryState) -> Vec<JoinHandle<()>> {
        let mut joins = Vec::with_capacity(state.watchers.len() + 1);
        for (deployment_id, watcher) in state.watchers.drain() {
            joins.extend(watcher.stop_watch());
            trace!(%deployment_id, "untracking deployment");
        }

        let old = std::mem::replace(&mut state.epoch, Epoch::new(&self.raft, &self.config));
        self.handle.publish(state.epoch.batcher.clone());
        old.shutdown_tx.send_replace(true);
        debug!(watchers = joins.len(), "deployment watcher epoch flushed");
        joins.extend(old.batcher.take_task());
        joins
    }
}

impl Epoch {
    fn new(raft: &Arc<dyn DeploymentRaftEndpoints>, config: &WatcherConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = new_scope();
        let batcher = EvalBatcher::new(raft.clone(), config.eval_batch_duration(), shutdown_rx);
        Self {
            shutdown_tx,
            batcher: Arc::new(batcher),
        }
    }
}

fn watcher_for<'a>(
    state: &'a RegistryState,
    deployment_id: &str,
) -> WatchResult<&'a dyn DeploymentWatcher> {
    state
        .watchers
        .get(deployment_id)
        .map(|w| w.as_ref())
        .ok_or_else(|| WatchError::NotWatched(deployment_id.to_string()))
}

async fn join_all(handles: impl IntoIterator<Item = JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "deployment watcher task failed");
        }
    }
}

/// Write path handed to watchers.
///
/// Holds the current batcher behind its own lock so watchers can submit
/// evaluations while a delegation holds the registry lock.
struct RegistryHandle {
    raft: Arc<dyn DeploymentRaftEndpoints>,
    batcher: std::sync::RwLock<Arc<EvalBatcher>>,
}

impl RegistryHandle {
    fn current(&self) -> Arc<EvalBatcher> {
        self.batcher
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn publish(&self, batcher: Arc<EvalBatcher>) {
        *self
            .batcher
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = batcher;
    }
}

#[async_trait]
impl DeploymentTriggers for RegistryHandle {
    async fn create_evaluation(&self, eval: Evaluation) -> WatchResult<u64> {
        let future = self.current().create_eval(eval);
        future.results().await
    }

    async fn upsert_job(&self, job: Job) -> WatchResult<u64> {
        self.raft.upsert_job(job).await
    }

    async fn upsert_deployment_status_update(
        &self,
        update: DeploymentStatusUpdate,
        eval: Option<Evaluation>,
        job: Option<Job>,
    ) -> WatchResult<u64> {
        self.raft
            .upsert_deployment_status_update(DeploymentStatusUpdateRequest { update, eval, job })
            .await
    }

    async fn upsert_deployment_promotion(
        &self,
        req: ApplyDeploymentPromoteRequest,
    ) -> WatchResult<u64> {
        self.raft.upsert_deployment_promotion(req).await
    }

    async fn upsert_deployment_alloc_health(
        &self,
        req: ApplyDeploymentAllocHealthRequest,
    ) -> WatchResult<u64> {
        self.raft.upsert_deployment_alloc_health(req).await
    }
}
