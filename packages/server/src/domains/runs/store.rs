//! The repository: abstracted reads/writes for deployments, versions,
//! runs, and outputs. The dispatch core only sees this trait; tests run
//! against the in-memory implementation in the kernel.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::models::{OutputData, Run, RunOutput, RunStatus};
use crate::domains::workflows::{Deployment, WorkflowVersion};

#[async_trait]
pub trait Repository: Send + Sync {
    async fn find_deployment(&self, id: Uuid) -> Result<Option<Deployment>>;
    async fn find_workflow_version(&self, id: Uuid) -> Result<Option<WorkflowVersion>>;

    async fn insert_run(&self, run: &Run) -> Result<()>;
    async fn find_run(&self, id: Uuid) -> Result<Option<Run>>;
    async fn find_run_by_queue_job(&self, queue_job_id: &str) -> Result<Option<Run>>;

    /// `not-started -> running` plus `started_at`; dispatcher-owned.
    async fn mark_run_started(&self, id: Uuid) -> Result<()>;

    /// Write a status and return the previous one (None when the run
    /// does not exist). Terminal statuses stamp `ended_at`.
    async fn transition_run_status(
        &self,
        id: Uuid,
        status: RunStatus,
    ) -> Result<Option<RunStatus>>;

    async fn bump_run_retry(&self, id: Uuid) -> Result<()>;

    /// All output rows for a run, oldest first.
    async fn outputs_for_run(&self, run_id: Uuid) -> Result<Vec<RunOutput>>;

    /// Replace all output rows for the run with one canonical row.
    async fn save_canonical_output(&self, run_id: Uuid, data: &OutputData) -> Result<()>;

    async fn clear_outputs(&self, run_id: Uuid) -> Result<()>;
}

/// PostgreSQL-backed repository delegating to the model queries.
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Repository for PostgresRepository {
    async fn find_deployment(&self, id: Uuid) -> Result<Option<Deployment>> {
        Deployment::find_by_id(id, &self.pool).await
    }

    async fn find_workflow_version(&self, id: Uuid) -> Result<Option<WorkflowVersion>> {
        WorkflowVersion::find_by_id(id, &self.pool).await
    }

    async fn insert_run(&self, run: &Run) -> Result<()> {
        run.insert(&self.pool).await
    }

    async fn find_run(&self, id: Uuid) -> Result<Option<Run>> {
        Run::find_by_id(id, &self.pool).await
    }

    async fn find_run_by_queue_job(&self, queue_job_id: &str) -> Result<Option<Run>> {
        Run::find_by_queue_job(queue_job_id, &self.pool).await
    }

    async fn mark_run_started(&self, id: Uuid) -> Result<()> {
        Run::mark_started(id, &self.pool).await
    }

    async fn transition_run_status(
        &self,
        id: Uuid,
        status: RunStatus,
    ) -> Result<Option<RunStatus>> {
        Run::transition_status(id, status, &self.pool).await
    }

    async fn bump_run_retry(&self, id: Uuid) -> Result<()> {
        Run::bump_retry(id, &self.pool).await
    }

    async fn outputs_for_run(&self, run_id: Uuid) -> Result<Vec<RunOutput>> {
        RunOutput::find_by_run(run_id, &self.pool).await
    }

    async fn save_canonical_output(&self, run_id: Uuid, data: &OutputData) -> Result<()> {
        RunOutput::save_canonical(run_id, data, &self.pool).await
    }

    async fn clear_outputs(&self, run_id: Uuid) -> Result<()> {
        RunOutput::delete_by_run(run_id, &self.pool).await
    }
}
