//! Default per-deployment watcher.
//!
//! A `RolloutWatcher` follows the allocations of one deployment and reacts
//! to client-reported health:
//!
//! - healthy allocations appearing ⇒ a `DeploymentWatcher` evaluation so the
//!   scheduler can place the next batch;
//! - an allocation turning unhealthy ⇒ the deployment is failed and, when a
//!   task group asks for auto-revert, the latest stable job version is
//!   re-submitted as a new version.
//!
//! Operator requests (alloc health, promotion, pause) are validated against
//! the current deployment and committed through the registry's triggers.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use warpgrid_state::*;

use crate::backoff::RetryBackoff;
use crate::endpoints::{DeploymentStateReader, DeploymentTriggers};
use crate::error::{WatchError, WatchResult};
use crate::limiter::QueryLimiter;
use crate::scope::cancelled;
use crate::watcher::{DeploymentWatcher, WatcherContext, WatcherFactory};

const DESC_UNHEALTHY: &str = "Failed due to unhealthy allocations";
const DESC_PAUSED: &str = "Deployment is paused";
const DESC_RUNNING: &str = "Deployment is running";

const ALLOC_RETRY_BASE: Duration = Duration::from_millis(250);
const ALLOC_RETRY_MAX: Duration = Duration::from_secs(10);

/// Builds a [`RolloutWatcher`] for every tracked deployment.
#[derive(Debug, Default, Clone, Copy)]
pub struct RolloutWatcherFactory;

impl WatcherFactory for RolloutWatcherFactory {
    fn create(&self, ctx: WatcherContext) -> Box<dyn DeploymentWatcher> {
        Box::new(RolloutWatcher::start(ctx))
    }
}

/// Supervises one deployment until stopped or its epoch ends.
pub struct RolloutWatcher {
    shared: Arc<Shared>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    deployment_id: DeploymentId,
    job: Job,
    scope: watch::Receiver<bool>,
    limiter: Arc<QueryLimiter>,
    reader: Arc<dyn DeploymentStateReader>,
    triggers: Arc<dyn DeploymentTriggers>,
    eval_priority: u32,
}

impl RolloutWatcher {
    /// Bind a watcher to `ctx` and start following its allocations.
    pub fn start(ctx: WatcherContext) -> Self {
        let shared = Arc::new(Shared {
            deployment_id: ctx.deployment.id.clone(),
            job: ctx.job,
            scope: ctx.scope,
            limiter: ctx.query_limiter,
            reader: ctx.reader,
            triggers: ctx.triggers,
            eval_priority: ctx.eval_priority,
        });
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(watch_allocations(shared.clone(), stop_rx));
        debug!(deployment_id = %shared.deployment_id, "rollout watcher started");

        Self {
            shared,
            stop_tx,
            task: Mutex::new(Some(task)),
        }
    }
}

impl Drop for RolloutWatcher {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}

#[async_trait]
impl DeploymentWatcher for RolloutWatcher {
    fn stop_watch(&self) -> Option<JoinHandle<()>> {
        if !self.stop_tx.send_replace(true) {
            debug!(deployment_id = %self.shared.deployment_id, "rollout watcher stopped");
        }
        self.task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    async fn set_alloc_health(
        &self,
        req: &DeploymentAllocHealthRequest,
    ) -> WatchResult<DeploymentUpdateResponse> {
        if req.healthy_allocation_ids.is_empty() && req.unhealthy_allocation_ids.is_empty() {
            return Err(WatchError::InvalidRequest(
                "must specify at least one healthy or unhealthy allocation".to_string(),
            ));
        }

        let shared = &self.shared;
        let deployment = shared.active_deployment("set allocation health of").await?;

        let allocs = shared.allocations().await?;
        let known: HashSet<&str> = allocs.iter().map(|a| a.id.as_str()).collect();
        for id in req
            .healthy_allocation_ids
            .iter()
            .chain(&req.unhealthy_allocation_ids)
        {
            if !known.contains(id.as_str()) {
                return Err(WatchError::InvalidRequest(format!(
                    "allocation {id:?} is not part of deployment {:?}",
                    deployment.id
                )));
            }
        }

        let (status_update, job) = if req.unhealthy_allocation_ids.is_empty() {
            (None, None)
        } else {
            let (update, job) = shared.failure_outcome(&deployment).await?;
            (Some(update), job)
        };
        let reverted_job_version = job.as_ref().map(|j| j.version);

        let eval = shared.new_eval(EvalTrigger::AllocHealth);
        let eval_id = eval.id.clone();
        let index = shared
            .triggers
            .upsert_deployment_alloc_health(ApplyDeploymentAllocHealthRequest {
                request: req.clone(),
                status_update,
                eval: Some(eval),
                job,
            })
            .await?;

        Ok(DeploymentUpdateResponse {
            eval_id: Some(eval_id),
            eval_create_index: index,
            deployment_modify_index: index,
            reverted_job_version,
            index,
        })
    }

    async fn promote_deployment(
        &self,
        req: &DeploymentPromoteRequest,
    ) -> WatchResult<DeploymentUpdateResponse> {
        let shared = &self.shared;
        let deployment = shared.active_deployment("promote").await?;

        let groups: Vec<&String> = if req.all {
            deployment
                .task_groups
                .iter()
                .filter(|(_, state)| state.desired_canaries > 0)
                .map(|(name, _)| name)
                .collect()
        } else {
            let mut groups = Vec::with_capacity(req.groups.len());
            for name in &req.groups {
                match deployment.task_groups.get_key_value(name) {
                    Some((name, _)) => groups.push(name),
                    None => {
                        return Err(WatchError::InvalidRequest(format!(
                            "deployment has no task group {name:?}"
                        )));
                    }
                }
            }
            groups
        };
        if groups.is_empty() {
            return Err(WatchError::InvalidRequest(
                "no canaries to promote".to_string(),
            ));
        }

        let allocs = shared.allocations().await?;
        for name in &groups {
            let desired = deployment.task_groups[*name].desired_canaries;
            let healthy = allocs
                .iter()
                .filter(|a| &a.task_group == *name && a.canary && a.healthy == Some(true))
                .count();
            if healthy < desired as usize {
                return Err(WatchError::InvalidRequest(format!(
                    "task group {name:?} has {healthy}/{desired} healthy canaries"
                )));
            }
        }

        let eval = shared.new_eval(EvalTrigger::Promotion);
        let eval_id = eval.id.clone();
        let index = shared
            .triggers
            .upsert_deployment_promotion(ApplyDeploymentPromoteRequest {
                request: req.clone(),
                eval: Some(eval),
            })
            .await?;
        info!(deployment_id = %deployment.id, groups = groups.len(), "deployment promoted");

        Ok(DeploymentUpdateResponse {
            eval_id: Some(eval_id),
            eval_create_index: index,
            deployment_modify_index: index,
            reverted_job_version: None,
            index,
        })
    }

    async fn pause_deployment(
        &self,
        req: &DeploymentPauseRequest,
    ) -> WatchResult<DeploymentUpdateResponse> {
        let shared = &self.shared;
        let action = if req.pause { "pause" } else { "resume" };
        let deployment = shared.active_deployment(action).await?;

        let (status, description) = if req.pause {
            (DeploymentStatus::Paused, DESC_PAUSED)
        } else {
            (DeploymentStatus::Running, DESC_RUNNING)
        };
        let eval = (!req.pause).then(|| shared.new_eval(EvalTrigger::Resume));
        let eval_id = eval.as_ref().map(|e| e.id.clone());

        let index = shared
            .triggers
            .upsert_deployment_status_update(
                DeploymentStatusUpdate {
                    deployment_id: deployment.id.clone(),
                    status,
                    status_description: description.to_string(),
                },
                eval,
                None,
            )
            .await?;
        info!(deployment_id = %deployment.id, %action, "deployment status updated");

        Ok(DeploymentUpdateResponse {
            eval_create_index: if eval_id.is_some() { index } else { 0 },
            eval_id,
            deployment_modify_index: index,
            reverted_job_version: None,
            index,
        })
    }
}

impl Shared {
    /// Fetch the current deployment, rejecting terminal ones.
    async fn active_deployment(&self, action: &str) -> WatchResult<Deployment> {
        self.limiter.wait(&self.scope).await?;
        let deployment = self
            .reader
            .get_deployment(&self.deployment_id)
            .await?
            .ok_or_else(|| {
                WatchError::InvalidRequest(format!(
                    "deployment {:?} not found",
                    self.deployment_id
                ))
            })?;
        if !deployment.active() {
            return Err(WatchError::InvalidRequest(format!(
                "can't {action} terminal deployment {:?}",
                deployment.id
            )));
        }
        Ok(deployment)
    }

    async fn allocations(&self) -> WatchResult<Vec<Allocation>> {
        self.limiter.wait(&self.scope).await?;
        Ok(self.reader.allocations(&self.deployment_id, 0).await?.allocations)
    }

    /// Status update failing `deployment`, plus the rollback job if any of
    /// its groups asks for auto-revert and a stable older version exists.
    async fn failure_outcome(
        &self,
        deployment: &Deployment,
    ) -> WatchResult<(DeploymentStatusUpdate, Option<Job>)> {
        let mut description = DESC_UNHEALTHY.to_string();
        let mut rollback = None;

        if deployment.has_auto_revert() {
            self.limiter.wait(&self.scope).await?;
            let versions = self
                .reader
                .job_versions(&deployment.namespace, &deployment.job_id)
                .await?;
            let latest = versions
                .first()
                .map_or(self.job.version, |j| j.version.max(self.job.version));
            match versions
                .iter()
                .find(|j| j.stable && j.version < deployment.job_version)
            {
                Some(stable) => {
                    description =
                        format!("{DESC_UNHEALTHY} - rolling back to job version {}", stable.version);
                    let mut job = stable.clone();
                    job.version = latest + 1;
                    job.stable = false;
                    rollback = Some(job);
                }
                None => {
                    description =
                        format!("{DESC_UNHEALTHY} - no stable job version to auto revert to");
                }
            }
        }

        Ok((
            DeploymentStatusUpdate {
                deployment_id: deployment.id.clone(),
                status: DeploymentStatus::Failed,
                status_description: description,
            },
            rollback,
        ))
    }

    fn new_eval(&self, triggered_by: EvalTrigger) -> Evaluation {
        Evaluation {
            id: Uuid::new_v4().to_string(),
            namespace: self.job.namespace.clone(),
            priority: self.eval_priority,
            triggered_by,
            job_id: self.job.id.clone(),
            job_modify_index: self.job.modify_index,
            deployment_id: self.deployment_id.clone(),
            status: EvalStatus::Pending,
        }
    }

    /// React to one allocation snapshot.
    async fn handle_allocations(
        &self,
        allocs: &[Allocation],
        healthy_seen: &mut HashSet<AllocId>,
        unhealthy_seen: &mut HashSet<AllocId>,
    ) -> WatchResult<()> {
        let mut grew_healthy = false;
        let mut new_unhealthy = false;
        for alloc in allocs {
            match alloc.healthy {
                Some(true) => grew_healthy |= healthy_seen.insert(alloc.id.clone()),
                Some(false) => new_unhealthy |= unhealthy_seen.insert(alloc.id.clone()),
                None => {}
            }
        }

        if new_unhealthy {
            self.limiter.wait(&self.scope).await?;
            let Some(deployment) = self.reader.get_deployment(&self.deployment_id).await? else {
                return Ok(());
            };
            // Already failed through an explicit health report.
            if !deployment.active() {
                return Ok(());
            }
            let (update, job) = self.failure_outcome(&deployment).await?;
            warn!(
                deployment_id = %deployment.id,
                rollback = job.is_some(),
                "failing deployment with unhealthy allocations"
            );
            let eval = self.new_eval(EvalTrigger::AllocHealth);
            self.triggers
                .upsert_deployment_status_update(update, Some(eval), job)
                .await?;
        } else if grew_healthy {
            let index = self
                .triggers
                .create_evaluation(self.new_eval(EvalTrigger::DeploymentWatcher))
                .await?;
            debug!(deployment_id = %self.deployment_id, index, "healthy allocations changed");
        }
        Ok(())
    }
}

/// Long-poll the deployment's allocations until stopped or cancelled.
async fn watch_allocations(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    let mut scope = shared.scope.clone();
    let mut index = 0;
    let mut healthy_seen = HashSet::new();
    let mut unhealthy_seen = HashSet::new();
    let mut backoff = RetryBackoff::new(ALLOC_RETRY_BASE, ALLOC_RETRY_MAX);

    loop {
        let round = async {
            shared.limiter.wait(&shared.scope).await?;
            let resp = shared.reader.allocations(&shared.deployment_id, index).await?;
            if resp.index > index {
                index = resp.index;
                shared
                    .handle_allocations(&resp.allocations, &mut healthy_seen, &mut unhealthy_seen)
                    .await?;
            }
            Ok::<_, WatchError>(())
        };

        let result = tokio::select! {
            biased;
            _ = cancelled(&mut stop) => break,
            _ = cancelled(&mut scope) => break,
            result = round => result,
        };

        match result {
            Ok(()) => backoff.reset(),
            Err(WatchError::Cancelled) => break,
            Err(e) => {
                warn!(deployment_id = %shared.deployment_id, error = %e, "allocation watch failed");
                let delay = backoff.failure();
                tokio::select! {
                    biased;
                    _ = cancelled(&mut stop) => break,
                    _ = cancelled(&mut scope) => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    debug!(deployment_id = %shared.deployment_id, "allocation watch exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::new_scope;
    use crate::testing::{
        MockRaft, MockState, RecordingTriggers, test_alloc, test_deployment, test_job,
    };

    struct Harness {
        state: Arc<MockState>,
        raft: Arc<MockRaft>,
        watcher: RolloutWatcher,
        _scope: watch::Sender<bool>,
    }

    fn harness(deployment: Deployment, job: Job) -> Harness {
        let state = MockState::new();
        state.upsert_job(job.clone());
        state.upsert_deployment(deployment.clone());
        let raft = Arc::new(MockRaft::default());
        let (scope_tx, scope) = new_scope();
        let watcher = RolloutWatcher::start(WatcherContext {
            scope,
            query_limiter: Arc::new(QueryLimiter::new(1000, 1000)),
            reader: state.clone(),
            deployment,
            job,
            triggers: Arc::new(RecordingTriggers::new(raft.clone())),
            eval_priority: 50,
        });
        Harness {
            state,
            raft,
            watcher,
            _scope: scope_tx,
        }
    }

    fn canary_deployment(auto_revert: bool) -> Deployment {
        let mut d = test_deployment("d1", "web", 2);
        let group = d.task_groups.get_mut("api").unwrap();
        group.desired_canaries = 1;
        group.auto_revert = auto_revert;
        d
    }

    #[tokio::test]
    async fn healthy_report_writes_eval_without_status_change() {
        let h = harness(canary_deployment(false), test_job("web", 2, false));
        h.state.upsert_alloc(test_alloc("a1", "d1", true));

        let resp = h
            .watcher
            .set_alloc_health(&DeploymentAllocHealthRequest {
                deployment_id: "d1".to_string(),
                healthy_allocation_ids: vec!["a1".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();

        let writes = h.raft.alloc_health();
        assert_eq!(writes.len(), 1);
        assert!(writes[0].status_update.is_none());
        assert!(writes[0].job.is_none());
        let eval = writes[0].eval.as_ref().unwrap();
        assert_eq!(eval.triggered_by, EvalTrigger::AllocHealth);
        assert_eq!(resp.eval_id.as_deref(), Some(eval.id.as_str()));
        assert_eq!(resp.index, resp.eval_create_index);
        assert!(resp.reverted_job_version.is_none());
    }

    #[tokio::test]
    async fn unhealthy_report_fails_and_rolls_back() {
        let h = harness(canary_deployment(true), test_job("web", 2, false));
        h.state.upsert_job(test_job("web", 1, true));
        h.state.upsert_alloc(test_alloc("a1", "d1", true));

        let resp = h
            .watcher
            .set_alloc_health(&DeploymentAllocHealthRequest {
                deployment_id: "d1".to_string(),
                unhealthy_allocation_ids: vec!["a1".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();

        let writes = h.raft.alloc_health();
        let update = writes[0].status_update.as_ref().unwrap();
        assert_eq!(update.status, DeploymentStatus::Failed);
        assert!(update.status_description.starts_with(DESC_UNHEALTHY));
        assert!(update.status_description.contains("job version 1"));
        let job = writes[0].job.as_ref().unwrap();
        assert_eq!(job.version, 3);
        assert!(!job.stable);
        assert_eq!(resp.reverted_job_version, Some(3));
    }

    #[tokio::test]
    async fn unhealthy_without_stable_version_only_fails() {
        let h = harness(canary_deployment(true), test_job("web", 2, false));
        h.state.upsert_alloc(test_alloc("a1", "d1", false));

        h.watcher
            .set_alloc_health(&DeploymentAllocHealthRequest {
                deployment_id: "d1".to_string(),
                unhealthy_allocation_ids: vec!["a1".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();

        let writes = h.raft.alloc_health();
        let update = writes[0].status_update.as_ref().unwrap();
        assert_eq!(update.status, DeploymentStatus::Failed);
        assert!(update.status_description.contains("no stable job version"));
        assert!(writes[0].job.is_none());
    }

    #[tokio::test]
    async fn unknown_alloc_is_rejected() {
        let h = harness(canary_deployment(false), test_job("web", 2, false));

        let err = h
            .watcher
            .set_alloc_health(&DeploymentAllocHealthRequest {
                deployment_id: "d1".to_string(),
                healthy_allocation_ids: vec!["ghost".to_string()],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::InvalidRequest(_)));
        assert_eq!(h.raft.write_count(), 0);
    }

    #[tokio::test]
    async fn promotion_requires_healthy_canaries() {
        let h = harness(canary_deployment(false), test_job("web", 2, false));
        h.state.upsert_alloc(test_alloc("c1", "d1", true));
        let req = DeploymentPromoteRequest {
            deployment_id: "d1".to_string(),
            all: true,
            ..Default::default()
        };

        let err = h.watcher.promote_deployment(&req).await.unwrap_err();
        assert_eq!(
            err,
            WatchError::InvalidRequest("task group \"api\" has 0/1 healthy canaries".to_string())
        );
        assert_eq!(h.raft.write_count(), 0);

        let mut healthy = test_alloc("c1", "d1", true);
        healthy.healthy = Some(true);
        h.state.upsert_alloc(healthy);

        let resp = h.watcher.promote_deployment(&req).await.unwrap();
        let promotions = h.raft.promotions();
        assert_eq!(promotions.len(), 1);
        assert_eq!(
            promotions[0].eval.as_ref().unwrap().triggered_by,
            EvalTrigger::Promotion
        );
        assert!(resp.eval_id.is_some());
    }

    #[tokio::test]
    async fn promotion_of_unknown_group_is_rejected() {
        let h = harness(canary_deployment(false), test_job("web", 2, false));
        let err = h
            .watcher
            .promote_deployment(&DeploymentPromoteRequest {
                deployment_id: "d1".to_string(),
                groups: vec!["db".to_string()],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::InvalidRequest(msg) if msg.contains("db")));
    }

    #[tokio::test]
    async fn pause_then_resume() {
        let h = harness(canary_deployment(false), test_job("web", 2, false));

        let paused = h
            .watcher
            .pause_deployment(&DeploymentPauseRequest {
                deployment_id: "d1".to_string(),
                pause: true,
            })
            .await
            .unwrap();
        assert!(paused.eval_id.is_none());
        assert_eq!(paused.eval_create_index, 0);

        let resumed = h
            .watcher
            .pause_deployment(&DeploymentPauseRequest {
                deployment_id: "d1".to_string(),
                pause: false,
            })
            .await
            .unwrap();
        assert!(resumed.eval_id.is_some());

        let updates = h.raft.status_updates();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].update.status, DeploymentStatus::Paused);
        assert_eq!(updates[0].update.status_description, DESC_PAUSED);
        assert!(updates[0].eval.is_none());
        assert_eq!(updates[1].update.status, DeploymentStatus::Running);
        assert_eq!(
            updates[1].eval.as_ref().unwrap().triggered_by,
            EvalTrigger::Resume
        );
    }

    #[tokio::test]
    async fn terminal_deployment_rejects_requests() {
        let mut deployment = canary_deployment(false);
        deployment.status = DeploymentStatus::Successful;
        let h = harness(deployment, test_job("web", 2, false));

        let err = h
            .watcher
            .pause_deployment(&DeploymentPauseRequest {
                deployment_id: "d1".to_string(),
                pause: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::InvalidRequest(msg) if msg.contains("terminal")));
        assert_eq!(h.raft.write_count(), 0);
    }

    #[tokio::test]
    async fn background_watch_evaluates_on_healthy_allocs() {
        let h = harness(canary_deployment(false), test_job("web", 2, false));
        let mut alloc = test_alloc("a1", "d1", false);
        alloc.healthy = Some(true);
        h.state.upsert_alloc(alloc);

        h.raft.wait_for_eval_batches(1).await;
        let batches = h.raft.eval_batches();
        assert_eq!(batches[0][0].triggered_by, EvalTrigger::DeploymentWatcher);
        assert_eq!(batches[0][0].deployment_id, "d1");
    }

    #[tokio::test]
    async fn background_watch_fails_on_unhealthy_alloc() {
        let h = harness(canary_deployment(false), test_job("web", 2, false));
        let mut alloc = test_alloc("a1", "d1", false);
        alloc.healthy = Some(false);
        h.state.upsert_alloc(alloc);

        h.raft.wait_for_status_updates(1).await;
        let updates = h.raft.status_updates();
        assert_eq!(updates[0].update.status, DeploymentStatus::Failed);
        assert_eq!(updates[0].update.status_description, DESC_UNHEALTHY);
    }

    #[tokio::test]
    async fn stop_watch_is_idempotent() {
        let h = harness(canary_deployment(false), test_job("web", 2, false));
        let task = h.watcher.stop_watch().expect("first stop yields the task");
        assert!(h.watcher.stop_watch().is_none());
        task.await.unwrap();

        let mut alloc = test_alloc("a1", "d1", false);
        alloc.healthy = Some(true);
        h.state.upsert_alloc(alloc);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.raft.eval_batches().is_empty());
    }
}
