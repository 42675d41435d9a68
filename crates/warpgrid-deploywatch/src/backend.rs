//! Collaborators backed by a local [`StateStore`].
//!
//! Reads block on the store's modify index for up to `max_query_wait`,
//! then answer from the latest snapshot. Writes are committed directly; on a
//! single node the store's commit is the consensus commit.

use std::time::Duration;

use async_trait::async_trait;
use warpgrid_state::*;

use crate::endpoints::{DeploymentRaftEndpoints, DeploymentStateReader};
use crate::error::{WatchError, WatchResult};

/// Reader and writer over one state store.
#[derive(Clone)]
pub struct StoreBackend {
    store: StateStore,
    max_query_wait: Duration,
}

impl StoreBackend {
    pub fn new(store: StateStore, max_query_wait: Duration) -> Self {
        Self {
            store,
            max_query_wait,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }
}

fn read_err(e: StateError) -> WatchError {
    WatchError::Read(e.to_string())
}

fn write_err(e: StateError) -> WatchError {
    WatchError::Consensus(e.to_string())
}

#[async_trait]
impl DeploymentStateReader for StoreBackend {
    async fn list_deployments(&self, min_index: u64) -> WatchResult<DeploymentListResponse> {
        let index = self
            .store
            .wait_for_index(min_index, self.max_query_wait)
            .await;
        Ok(DeploymentListResponse {
            deployments: self.store.list_deployments().map_err(read_err)?,
            index,
        })
    }

    async fn get_deployment(&self, deployment_id: &str) -> WatchResult<Option<Deployment>> {
        self.store.get_deployment(deployment_id).map_err(read_err)
    }

    async fn get_job(&self, namespace: &str, job_id: &str) -> WatchResult<Option<Job>> {
        self.store.get_job(namespace, job_id).map_err(read_err)
    }

    async fn job_versions(&self, namespace: &str, job_id: &str) -> WatchResult<Vec<Job>> {
        self.store.job_versions(namespace, job_id).map_err(read_err)
    }

    async fn evaluations(&self, namespace: &str, job_id: &str) -> WatchResult<Vec<Evaluation>> {
        self.store
            .evaluations_for_job(namespace, job_id)
            .map_err(read_err)
    }

    async fn allocations(
        &self,
        deployment_id: &str,
        min_index: u64,
    ) -> WatchResult<AllocListResponse> {
        let index = self
            .store
            .wait_for_index(min_index, self.max_query_wait)
            .await;
        Ok(AllocListResponse {
            allocations: self
                .store
                .list_allocations_for_deployment(deployment_id)
                .map_err(read_err)?,
            index,
        })
    }
}

#[async_trait]
impl DeploymentRaftEndpoints for StoreBackend {
    async fn upsert_evals(&self, evals: Vec<Evaluation>) -> WatchResult<u64> {
        self.store.upsert_evals(&evals).map_err(write_err)
    }

    async fn upsert_job(&self, job: Job) -> WatchResult<u64> {
        self.store.put_job(&job).map_err(write_err)
    }

    async fn upsert_deployment_status_update(
        &self,
        req: DeploymentStatusUpdateRequest,
    ) -> WatchResult<u64> {
        self.store
            .apply_deployment_status_update(&req)
            .map_err(write_err)
    }

    async fn upsert_deployment_promotion(
        &self,
        req: ApplyDeploymentPromoteRequest,
    ) -> WatchResult<u64> {
        self.store.apply_deployment_promotion(&req).map_err(write_err)
    }

    async fn upsert_deployment_alloc_health(
        &self,
        req: ApplyDeploymentAllocHealthRequest,
    ) -> WatchResult<u64> {
        self.store
            .apply_deployment_alloc_health(&req)
            .map_err(write_err)
    }
}
