//! StateStore: redb-backed state persistence for the deployment watcher.
//!
//! Provides typed access to deployments, jobs, evaluations and allocations.
//! All values are JSON-serialized into redb's `&[u8]` value columns. Every
//! write commits in a single transaction together with a bump of the global
//! modify index, which is then published on a `watch` channel so readers can
//! block until the state moves past an index they have already seen.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable<'txn> = redb::Table<'txn, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    /// Latest committed modify index.
    index_tx: Arc<watch::Sender<u64>>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::init(db)?;
        debug!(?path, index = store.index(), "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::init(db)?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn init(db: Database) -> StateResult<Self> {
        ensure_tables(&db)?;
        let index = {
            let txn = db.begin_read().map_err(map_err!(Transaction))?;
            let meta = txn.open_table(META).map_err(map_err!(Table))?;
            match meta.get(INDEX_KEY).map_err(map_err!(Read))? {
                Some(guard) => guard.value(),
                None => 0,
            }
        };
        let (index_tx, _) = watch::channel(index);
        Ok(Self {
            db: Arc::new(db),
            index_tx: Arc::new(index_tx),
        })
    }

    // ── Index ──────────────────────────────────────────────────────

    /// The latest committed modify index.
    pub fn index(&self) -> u64 {
        *self.index_tx.borrow()
    }

    /// Wait until the modify index exceeds `min_index` or `max_wait` elapses.
    ///
    /// Returns the index observed on wakeup, which equals the unchanged
    /// current index when the wait timed out.
    pub async fn wait_for_index(&self, min_index: u64, max_wait: Duration) -> u64 {
        let mut rx = self.index_tx.subscribe();
        let _ = tokio::time::timeout(max_wait, rx.wait_for(|index| *index > min_index)).await;
        let current = *rx.borrow();
        current
    }

    /// Run `apply` inside one write transaction at the next modify index.
    fn commit<F>(&self, apply: F) -> StateResult<u64>
    where
        F: FnOnce(&WriteTransaction, u64) -> StateResult<()>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let index = {
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            let current = match meta.get(INDEX_KEY).map_err(map_err!(Read))? {
                Some(guard) => guard.value(),
                None => 0,
            };
            let next = current + 1;
            meta.insert(INDEX_KEY, next).map_err(map_err!(Write))?;
            next
        };
        apply(&txn, index)?;
        txn.commit().map_err(map_err!(Transaction))?;
        self.index_tx.send_if_modified(|current| {
            if index > *current {
                *current = index;
                true
            } else {
                false
            }
        });
        Ok(index)
    }

    // ── Jobs ───────────────────────────────────────────────────────

    /// Insert a job version and make it the latest version of the job.
    pub fn put_job(&self, job: &Job) -> StateResult<u64> {
        let index = self.commit(|txn, index| put_job_in(txn, job, index))?;
        debug!(job_id = %job.id, version = job.version, index, "job stored");
        Ok(index)
    }

    /// Get the latest version of a job.
    pub fn get_job(&self, namespace: &str, job_id: &str) -> StateResult<Option<Job>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        get_json(&table, &job_key(namespace, job_id))
    }

    /// List every stored version of a job, newest first.
    pub fn job_versions(&self, namespace: &str, job_id: &str) -> StateResult<Vec<Job>> {
        let prefix = format!("{}@", job_key(namespace, job_id));
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOB_VERSIONS).map_err(map_err!(Table))?;
        let mut versions: Vec<Job> = scan_json(&table, &prefix)?;
        versions.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(versions)
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Insert or update a deployment.
    pub fn put_deployment(&self, deployment: &Deployment) -> StateResult<u64> {
        let index = self.commit(|txn, index| {
            let mut stored = deployment.clone();
            stamp(&mut stored.create_index, &mut stored.modify_index, index);
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            insert_json(&mut table, &stored.id, &stored)
        })?;
        debug!(deployment_id = %deployment.id, index, "deployment stored");
        Ok(index)
    }

    /// Get a deployment by ID.
    pub fn get_deployment(&self, deployment_id: &str) -> StateResult<Option<Deployment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        get_json(&table, deployment_id)
    }

    /// List all deployments.
    pub fn list_deployments(&self) -> StateResult<Vec<Deployment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        scan_json(&table, "")
    }

    // ── Allocations ────────────────────────────────────────────────

    /// Insert or update an allocation and refresh its deployment's counters.
    pub fn put_allocation(&self, alloc: &Allocation) -> StateResult<u64> {
        self.commit(|txn, index| {
            {
                let mut stored = alloc.clone();
                stamp(&mut stored.create_index, &mut stored.modify_index, index);
                let mut table = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
                insert_json(&mut table, &stored.table_key(), &stored)?;
            }
            refresh_group_counts(txn, &alloc.deployment_id, index, false)
        })
    }

    /// List all allocations belonging to a deployment.
    pub fn list_allocations_for_deployment(
        &self,
        deployment_id: &str,
    ) -> StateResult<Vec<Allocation>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
        scan_json(&table, &format!("{deployment_id}:"))
    }

    // ── Evaluations ────────────────────────────────────────────────

    /// Insert a batch of evaluations in one write.
    pub fn upsert_evals(&self, evals: &[Evaluation]) -> StateResult<u64> {
        let index = self.commit(|txn, _| {
            let mut table = txn.open_table(EVALUATIONS).map_err(map_err!(Table))?;
            for eval in evals {
                insert_json(&mut table, &eval.id, eval)?;
            }
            Ok(())
        })?;
        debug!(count = evals.len(), index, "evaluations stored");
        Ok(index)
    }

    /// Get an evaluation by ID.
    pub fn get_evaluation(&self, eval_id: &str) -> StateResult<Option<Evaluation>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EVALUATIONS).map_err(map_err!(Table))?;
        get_json(&table, eval_id)
    }

    /// List all evaluations for a job.
    pub fn evaluations_for_job(&self, namespace: &str, job_id: &str) -> StateResult<Vec<Evaluation>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EVALUATIONS).map_err(map_err!(Table))?;
        let all: Vec<Evaluation> = scan_json(&table, "")?;
        Ok(all
            .into_iter()
            .filter(|e| e.namespace == namespace && e.job_id == job_id)
            .collect())
    }

    // ── Deployment updates ─────────────────────────────────────────

    /// Apply a status transition plus its optional evaluation and job.
    pub fn apply_deployment_status_update(
        &self,
        req: &DeploymentStatusUpdateRequest,
    ) -> StateResult<u64> {
        let index = self.commit(|txn, index| {
            update_status(txn, &req.update, index)?;
            put_optional(txn, req.eval.as_ref(), req.job.as_ref(), index)
        })?;
        debug!(
            deployment_id = %req.update.deployment_id,
            status = ?req.update.status,
            index,
            "deployment status updated"
        );
        Ok(index)
    }

    /// Mark canaries of the requested task groups as promoted.
    pub fn apply_deployment_promotion(&self, req: &ApplyDeploymentPromoteRequest) -> StateResult<u64> {
        let deployment_id = &req.request.deployment_id;
        self.commit(|txn, index| {
            {
                let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
                let mut deployment: Deployment = get_json(&table, deployment_id)?
                    .ok_or_else(|| StateError::not_found("deployment", deployment_id.as_str()))?;
                for (name, group) in deployment.task_groups.iter_mut() {
                    let selected = req.request.all || req.request.groups.contains(name);
                    if selected && group.desired_canaries > 0 {
                        group.promoted = true;
                    }
                }
                deployment.modify_index = index;
                insert_json(&mut table, deployment_id, &deployment)?;
            }
            put_optional(txn, req.eval.as_ref(), None, index)
        })
    }

    /// Record allocation health, refresh counters and apply the optional
    /// status update, evaluation and job in one write.
    pub fn apply_deployment_alloc_health(
        &self,
        req: &ApplyDeploymentAllocHealthRequest,
    ) -> StateResult<u64> {
        let deployment_id = &req.request.deployment_id;
        self.commit(|txn, index| {
            {
                let mut table = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
                let marks = req
                    .request
                    .healthy_allocation_ids
                    .iter()
                    .map(|id| (id, true))
                    .chain(req.request.unhealthy_allocation_ids.iter().map(|id| (id, false)));
                for (alloc_id, healthy) in marks {
                    let key = format!("{deployment_id}:{alloc_id}");
                    let mut alloc: Allocation = get_json(&table, &key)?
                        .ok_or_else(|| StateError::not_found("allocation", key.as_str()))?;
                    alloc.healthy = Some(healthy);
                    alloc.modify_index = index;
                    insert_json(&mut table, &key, &alloc)?;
                }
            }
            refresh_group_counts(txn, deployment_id, index, true)?;
            if let Some(update) = &req.status_update {
                update_status(txn, update, index)?;
            }
            put_optional(txn, req.eval.as_ref(), req.job.as_ref(), index)
        })
    }
}

/// Create all tables if they don't exist yet.
fn ensure_tables(db: &Database) -> StateResult<()> {
    let txn = db.begin_write().map_err(map_err!(Transaction))?;
    // Opening a table in a write transaction creates it if absent.
    txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
    txn.open_table(JOBS).map_err(map_err!(Table))?;
    txn.open_table(JOB_VERSIONS).map_err(map_err!(Table))?;
    txn.open_table(EVALUATIONS).map_err(map_err!(Table))?;
    txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
    txn.open_table(META).map_err(map_err!(Table))?;
    txn.commit().map_err(map_err!(Transaction))?;
    Ok(())
}

fn stamp(create_index: &mut u64, modify_index: &mut u64, index: u64) {
    if *create_index == 0 {
        *create_index = index;
    }
    *modify_index = index;
}

fn put_job_in(txn: &WriteTransaction, job: &Job, index: u64) -> StateResult<()> {
    let mut stored = job.clone();
    stamp(&mut stored.create_index, &mut stored.modify_index, index);
    let mut latest = txn.open_table(JOBS).map_err(map_err!(Table))?;
    insert_json(&mut latest, &stored.table_key(), &stored)?;
    let mut versions = txn.open_table(JOB_VERSIONS).map_err(map_err!(Table))?;
    insert_json(&mut versions, &stored.version_key(), &stored)
}

fn put_optional(
    txn: &WriteTransaction,
    eval: Option<&Evaluation>,
    job: Option<&Job>,
    index: u64,
) -> StateResult<()> {
    if let Some(eval) = eval {
        let mut table = txn.open_table(EVALUATIONS).map_err(map_err!(Table))?;
        insert_json(&mut table, &eval.id, eval)?;
    }
    if let Some(job) = job {
        put_job_in(txn, job, index)?;
    }
    Ok(())
}

fn update_status(
    txn: &WriteTransaction,
    update: &DeploymentStatusUpdate,
    index: u64,
) -> StateResult<()> {
    let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
    let mut deployment: Deployment = get_json(&table, &update.deployment_id)?
        .ok_or_else(|| StateError::not_found("deployment", update.deployment_id.as_str()))?;
    deployment.status = update.status;
    deployment.status_description = update.status_description.clone();
    deployment.modify_index = index;
    insert_json(&mut table, &update.deployment_id, &deployment)
}

/// Recount placed/healthy/unhealthy allocations per task group.
///
/// A missing deployment is an error only when `required` is set; allocations
/// may be placed before their deployment record exists.
fn refresh_group_counts(
    txn: &WriteTransaction,
    deployment_id: &str,
    index: u64,
    required: bool,
) -> StateResult<()> {
    let allocs: Vec<Allocation> = {
        let table = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
        scan_json(&table, &format!("{deployment_id}:"))?
    };
    let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
    let Some(mut deployment) = get_json::<Deployment, _>(&table, deployment_id)? else {
        if required {
            return Err(StateError::not_found("deployment", deployment_id));
        }
        return Ok(());
    };

    let mut counts: BTreeMap<&str, (u32, u32, u32)> = BTreeMap::new();
    for alloc in &allocs {
        let entry = counts.entry(alloc.task_group.as_str()).or_default();
        entry.0 += 1;
        match alloc.healthy {
            Some(true) => entry.1 += 1,
            Some(false) => entry.2 += 1,
            None => {}
        }
    }
    for (name, group) in deployment.task_groups.iter_mut() {
        let (placed, healthy, unhealthy) = counts.get(name.as_str()).copied().unwrap_or_default();
        group.placed_allocs = placed;
        group.healthy_allocs = healthy;
        group.unhealthy_allocs = unhealthy;
        group.placed_canaries = allocs
            .iter()
            .filter(|a| a.canary && &a.task_group == name)
            .map(|a| a.id.clone())
            .collect();
    }
    deployment.modify_index = index;
    insert_json(&mut table, deployment_id, &deployment)
}

fn insert_json<T: Serialize>(table: &mut JsonTable<'_>, key: &str, value: &T) -> StateResult<()> {
    let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

fn get_json<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let value: T = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn scan_json<T, R>(table: &R, prefix: &str) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if key.value().starts_with(prefix) {
            let item: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(item);
        }
    }
    Ok(results)
}
