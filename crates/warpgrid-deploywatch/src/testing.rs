//! In-memory collaborators and fixtures for unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use warpgrid_state::*;

use crate::endpoints::{DeploymentRaftEndpoints, DeploymentStateReader, DeploymentTriggers};
use crate::error::{WatchError, WatchResult};
use crate::scope::cancelled;
use crate::watcher::{DeploymentWatcher, WatcherContext, WatcherFactory};

// ── Fixtures ───────────────────────────────────────────────────────

pub(crate) fn test_job(id: &str, version: u64, stable: bool) -> Job {
    Job {
        id: id.to_string(),
        namespace: "default".to_string(),
        version,
        stable,
        task_groups: vec![TaskGroup {
            name: "api".to_string(),
            count: 3,
            update: Some(UpdateStrategy {
                max_parallel: 1,
                canary: 1,
                auto_revert: false,
            }),
        }],
        create_index: version,
        modify_index: version,
    }
}

pub(crate) fn test_deployment(id: &str, job_id: &str, job_version: u64) -> Deployment {
    let mut task_groups = BTreeMap::new();
    task_groups.insert(
        "api".to_string(),
        DeploymentGroupState {
            desired_total: 3,
            ..Default::default()
        },
    );
    Deployment {
        id: id.to_string(),
        namespace: "default".to_string(),
        job_id: job_id.to_string(),
        job_version,
        job_create_index: job_version,
        status: DeploymentStatus::Running,
        status_description: String::new(),
        task_groups,
        create_index: 1,
        modify_index: 1,
    }
}

pub(crate) fn test_alloc(id: &str, deployment_id: &str, canary: bool) -> Allocation {
    Allocation {
        id: id.to_string(),
        namespace: "default".to_string(),
        job_id: "web".to_string(),
        deployment_id: deployment_id.to_string(),
        task_group: "api".to_string(),
        canary,
        healthy: None,
        create_index: 1,
        modify_index: 1,
    }
}

pub(crate) fn test_eval(id: &str, deployment_id: &str) -> Evaluation {
    Evaluation {
        id: id.to_string(),
        namespace: "default".to_string(),
        priority: 50,
        triggered_by: EvalTrigger::DeploymentWatcher,
        job_id: "web".to_string(),
        job_modify_index: 1,
        deployment_id: deployment_id.to_string(),
        status: EvalStatus::Pending,
    }
}

// ── State reader ───────────────────────────────────────────────────

#[derive(Default)]
struct StateInner {
    deployments: BTreeMap<DeploymentId, Deployment>,
    jobs: HashMap<String, Vec<Job>>,
    allocations: BTreeMap<AllocId, Allocation>,
    read_error: Option<WatchError>,
    list_calls: usize,
}

/// Blocking-query state reader over in-memory maps.
pub(crate) struct MockState {
    inner: Mutex<StateInner>,
    index: watch::Sender<u64>,
}

impl MockState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(StateInner::default()),
            index: watch::channel(1).0,
        })
    }

    fn bump(&self) {
        self.index.send_modify(|i| *i += 1);
    }

    pub(crate) fn upsert_deployment(&self, deployment: Deployment) {
        self.inner
            .lock()
            .unwrap()
            .deployments
            .insert(deployment.id.clone(), deployment);
        self.bump();
    }

    pub(crate) fn upsert_job(&self, job: Job) {
        {
            let mut inner = self.inner.lock().unwrap();
            let versions = inner.jobs.entry(job.table_key()).or_default();
            versions.retain(|j| j.version != job.version);
            versions.push(job);
            versions.sort_by(|a, b| b.version.cmp(&a.version));
        }
        self.bump();
    }

    pub(crate) fn upsert_alloc(&self, alloc: Allocation) {
        self.inner
            .lock()
            .unwrap()
            .allocations
            .insert(alloc.id.clone(), alloc);
        self.bump();
    }

    /// Make every deployment list query fail with `err` until cleared.
    pub(crate) fn set_read_error(&self, err: Option<WatchError>) {
        self.inner.lock().unwrap().read_error = err;
        self.bump();
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.inner.lock().unwrap().list_calls
    }

    async fn wait_past(&self, min_index: u64) -> u64 {
        let mut rx = self.index.subscribe();
        let index = *rx.wait_for(|i| *i > min_index).await.unwrap();
        index
    }
}

#[async_trait]
impl DeploymentStateReader for MockState {
    async fn list_deployments(&self, min_index: u64) -> WatchResult<DeploymentListResponse> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.list_calls += 1;
            if let Some(err) = inner.read_error.clone() {
                return Err(err);
            }
        }
        let index = self.wait_past(min_index).await;
        let inner = self.inner.lock().unwrap();
        if let Some(err) = inner.read_error.clone() {
            return Err(err);
        }
        Ok(DeploymentListResponse {
            deployments: inner.deployments.values().cloned().collect(),
            index,
        })
    }

    async fn get_deployment(&self, deployment_id: &str) -> WatchResult<Option<Deployment>> {
        Ok(self.inner.lock().unwrap().deployments.get(deployment_id).cloned())
    }

    async fn get_job(&self, namespace: &str, job_id: &str) -> WatchResult<Option<Job>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .get(&job_key(namespace, job_id))
            .and_then(|versions| versions.first().cloned()))
    }

    async fn job_versions(&self, namespace: &str, job_id: &str) -> WatchResult<Vec<Job>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .get(&job_key(namespace, job_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn evaluations(&self, _namespace: &str, _job_id: &str) -> WatchResult<Vec<Evaluation>> {
        Ok(Vec::new())
    }

    async fn allocations(
        &self,
        deployment_id: &str,
        min_index: u64,
    ) -> WatchResult<AllocListResponse> {
        let index = self.wait_past(min_index).await;
        let inner = self.inner.lock().unwrap();
        Ok(AllocListResponse {
            allocations: inner
                .allocations
                .values()
                .filter(|a| a.deployment_id == deployment_id)
                .cloned()
                .collect(),
            index,
        })
    }
}

// ── Consensus writes ───────────────────────────────────────────────

#[derive(Default)]
struct RaftLog {
    index: u64,
    eval_batches: Vec<Vec<Evaluation>>,
    jobs: Vec<Job>,
    status_updates: Vec<DeploymentStatusUpdateRequest>,
    promotions: Vec<ApplyDeploymentPromoteRequest>,
    alloc_health: Vec<ApplyDeploymentAllocHealthRequest>,
    fail_with: Option<WatchError>,
}

/// Records every write; optionally fails them all.
pub(crate) struct MockRaft {
    log: Mutex<RaftLog>,
    writes: watch::Sender<usize>,
}

impl Default for MockRaft {
    fn default() -> Self {
        Self {
            log: Mutex::new(RaftLog::default()),
            writes: watch::channel(0).0,
        }
    }
}

impl MockRaft {
    pub(crate) fn fail_with(&self, err: WatchError) {
        self.log.lock().unwrap().fail_with = Some(err);
    }

    fn record(&self, apply: impl FnOnce(&mut RaftLog)) -> WatchResult<u64> {
        let index = {
            let mut log = self.log.lock().unwrap();
            if let Some(err) = log.fail_with.clone() {
                return Err(err);
            }
            log.index += 1;
            apply(&mut log);
            log.index
        };
        self.writes.send_modify(|n| *n += 1);
        Ok(index)
    }

    pub(crate) fn write_count(&self) -> usize {
        *self.writes.borrow()
    }

    pub(crate) fn eval_batches(&self) -> Vec<Vec<Evaluation>> {
        self.log.lock().unwrap().eval_batches.clone()
    }

    pub(crate) fn jobs(&self) -> Vec<Job> {
        self.log.lock().unwrap().jobs.clone()
    }

    pub(crate) fn status_updates(&self) -> Vec<DeploymentStatusUpdateRequest> {
        self.log.lock().unwrap().status_updates.clone()
    }

    pub(crate) fn promotions(&self) -> Vec<ApplyDeploymentPromoteRequest> {
        self.log.lock().unwrap().promotions.clone()
    }

    pub(crate) fn alloc_health(&self) -> Vec<ApplyDeploymentAllocHealthRequest> {
        self.log.lock().unwrap().alloc_health.clone()
    }

    async fn wait_until(&self, done: impl Fn(&RaftLog) -> bool) {
        let mut rx = self.writes.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|_| done(&*self.log.lock().unwrap())),
        )
        .await
        .expect("timed out waiting for writes")
        .unwrap();
    }

    pub(crate) async fn wait_for_eval_batches(&self, n: usize) {
        self.wait_until(|log| log.eval_batches.len() >= n).await;
    }

    pub(crate) async fn wait_for_status_updates(&self, n: usize) {
        self.wait_until(|log| log.status_updates.len() >= n).await;
    }
}

#[async_trait]
impl DeploymentRaftEndpoints for MockRaft {
    async fn upsert_evals(&self, evals: Vec<Evaluation>) -> WatchResult<u64> {
        self.record(|log| log.eval_batches.push(evals))
    }

    async fn upsert_job(&self, job: Job) -> WatchResult<u64> {
        self.record(|log| log.jobs.push(job))
    }

    async fn upsert_deployment_status_update(
        &self,
        req: DeploymentStatusUpdateRequest,
    ) -> WatchResult<u64> {
        self.record(|log| log.status_updates.push(req))
    }

    async fn upsert_deployment_promotion(
        &self,
        req: ApplyDeploymentPromoteRequest,
    ) -> WatchResult<u64> {
        self.record(|log| log.promotions.push(req))
    }

    async fn upsert_deployment_alloc_health(
        &self,
        req: ApplyDeploymentAllocHealthRequest,
    ) -> WatchResult<u64> {
        self.record(|log| log.alloc_health.push(req))
    }
}

/// Triggers that write straight to a [`MockRaft`] without batching.
pub(crate) struct RecordingTriggers {
    raft: Arc<MockRaft>,
}

impl RecordingTriggers {
    pub(crate) fn new(raft: Arc<MockRaft>) -> Self {
        Self { raft }
    }
}

#[async_trait]
impl DeploymentTriggers for RecordingTriggers {
    async fn create_evaluation(&self, eval: Evaluation) -> WatchResult<u64> {
        self.raft.upsert_evals(vec![eval]).await
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

// ── Watchers ───────────────────────────────────────────────────────

/// Factory for [`StubWatcher`]s that counts creations, stops and exited
/// background tasks.
#[derive(Default)]
pub(crate) struct StubWatcherFactory {
    created: AtomicUsize,
    stopped: Arc<AtomicUsize>,
    exited: Arc<AtomicUsize>,
}

impl StubWatcherFactory {
    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub(crate) fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn exited(&self) -> usize {
        self.exited.load(Ordering::SeqCst)
    }
}

impl WatcherFactory for StubWatcherFactory {
    fn create(&self, ctx: WatcherContext) -> Box<dyn DeploymentWatcher> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let (stop_tx, mut stop) = watch::channel(false);
        let mut scope = ctx.scope;
        let exited = self.exited.clone();
        // Lingers after the stop signal so only a joined task is seen as exited.
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = cancelled(&mut stop) => {}
                _ = cancelled(&mut scope) => {}
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
            exited.fetch_add(1, Ordering::SeqCst);
        });
        Box::new(StubWatcher {
            deployment_id: ctx.deployment.id,
            triggers: ctx.triggers,
            stop_tx,
            stop_count: self.stopped.clone(),
            task: Mutex::new(Some(task)),
        })
    }
}

/// Watcher that forwards every request straight to its triggers.
pub(crate) struct StubWatcher {
    deployment_id: DeploymentId,
    triggers: Arc<dyn DeploymentTriggers>,
    stop_tx: watch::Sender<bool>,
    stop_count: Arc<AtomicUsize>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl DeploymentWatcher for StubWatcher {
    fn stop_watch(&self) -> Option<JoinHandle<()>> {
        if !self.stop_tx.send_replace(true) {
            self.stop_count.fetch_add(1, Ordering::SeqCst);
        }
        self.task.lock().unwrap().take()
    }

    async fn set_alloc_health(
        &self,
        _req: &DeploymentAllocHealthRequest,
    ) -> WatchResult<DeploymentUpdateResponse> {
        let mut eval = test_eval("health", &self.deployment_id);
        eval.triggered_by = EvalTrigger::AllocHealth;
        let index = self.triggers.create_evaluation(eval).await?;
        Ok(DeploymentUpdateResponse {
            eval_id: Some("health".to_string()),
            eval_create_index: index,
            index,
            ..Default::default()
        })
    }

    async fn promote_deployment(
        &self,
        req: &DeploymentPromoteRequest,
    ) -> WatchResult<DeploymentUpdateResponse> {
        let index = self
            .triggers
            .upsert_deployment_promotion(ApplyDeploymentPromoteRequest {
                request: req.clone(),
                eval: None,
            })
            .await?;
        Ok(DeploymentUpdateResponse {
            deployment_modify_index: index,
            index,
            ..Default::default()
        })
    }

    async fn pause_deployment(
        &self,
        req: &DeploymentPauseRequest,
    ) -> WatchResult<DeploymentUpdateResponse> {
        let status = if req.pause {
            DeploymentStatus::Paused
        } else {
            DeploymentStatus::Running
        };
        let index = self
            .triggers
            .upsert_deployment_status_update(
                DeploymentStatusUpdate {
                    deployment_id: req.deployment_id.clone(),
                    status,
                    status_description: String::new(),
                },
                None,
                None,
            )
            .await?;
        Ok(DeploymentUpdateResponse {
            deployment_modify_index: index,
            index,
            ..Default::default()
        })
    }
}
