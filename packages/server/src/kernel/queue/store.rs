//! Durable job store: trait and PostgreSQL implementation.
//!
//! One `queue_jobs` table backs every named queue. Claims take an
//! exclusive lock token with an expiry; stalled jobs (expired locks) are
//! reclaimable by the next claim, so a crashed processor never strands
//! work. All state-changing operations on a claimed job must present the
//! claim token, which prevents lost updates after a lock expiry.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::job::{ClaimedJob, JobState, QueueJob};

/// Options for enqueueing a job.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Transient-retry ceiling for this job.
    pub max_attempts: i32,
    /// Delay first visibility until this instant.
    pub delay_until: Option<DateTime<Utc>>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            delay_until: None,
        }
    }
}

/// Trait for durable queue operations.
///
/// Implementations provide storage and retrieval of opaque job payloads
/// with ordered claiming, delayed visibility, and state observability.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job; returns its id.
    async fn enqueue(
        &self,
        queue: &str,
        data: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<String>;

    /// Claim the oldest runnable job, acquiring an exclusive token that
    /// expires after `lock_ms`. Delayed jobs whose time has come and
    /// active jobs with expired locks are both claimable.
    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
        lock_ms: i64,
    ) -> Result<Option<ClaimedJob>>;

    /// Finish a job successfully, recording its return value.
    async fn mark_completed(
        &self,
        job_id: &str,
        token: Uuid,
        return_value: serde_json::Value,
    ) -> Result<()>;

    /// Finish a job as failed, recording the reason.
    async fn mark_failed(&self, job_id: &str, token: Uuid, reason: &str) -> Result<()>;

    /// Put a claimed job back at the front of the waiting set.
    async fn return_to_waiting(&self, job_id: &str, token: Uuid) -> Result<()>;

    /// Re-schedule a claimed job to become visible at `until`.
    async fn move_to_delayed(&self, job_id: &str, token: Uuid, until: DateTime<Utc>)
        -> Result<()>;

    /// Shallow-merge `patch` into the job payload.
    async fn update_data(&self, job_id: &str, patch: serde_json::Value) -> Result<()>;

    /// Remove a job. Active jobs require the claim token; for any other
    /// state the token is ignored. Returns whether a row was removed.
    async fn remove(&self, job_id: &str, token: Option<Uuid>) -> Result<bool>;

    /// Full envelope with state.
    async fn get_job(&self, job_id: &str) -> Result<Option<QueueJob>>;

    /// Ordered view over one state, oldest first.
    async fn jobs_in_state(
        &self,
        queue: &str,
        state: JobState,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<QueueJob>>;

    /// Number of jobs currently in `state`.
    async fn count_in_state(&self, queue: &str, state: JobState) -> Result<i64>;

    /// Remove up to `max_count` finished jobs in `state` older than
    /// `max_age_secs`. Returns how many were removed.
    async fn clean(
        &self,
        queue: &str,
        state: JobState,
        max_age_secs: i64,
        max_count: i64,
    ) -> Result<u64>;

    /// Keep only the most recent `keep` finished jobs in `state`.
    async fn trim(&self, queue: &str, state: JobState, keep: i64) -> Result<u64>;

    /// Put active jobs whose lock expired back into the waiting set.
    /// Claims also recover stalled jobs lazily; this sweep exists so a
    /// stalled job does not have to wait for the next claim.
    async fn requeue_stalled(&self, queue: &str) -> Result<u64>;

    /// Cheap connectivity check against the backing store.
    async fn ping(&self) -> Result<()>;
}

/// PostgreSQL-backed job store.
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn enqueue(
        &self,
        queue: &str,
        data: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<String> {
        let mut job = QueueJob::new(queue, data, opts.max_attempts);
        if let Some(until) = opts.delay_until {
            job.state = JobState::Delayed;
            job.delay_until = Some(until);
        }

        sqlx::query(
            r#"
            INSERT INTO queue_jobs (
                id, queue, priority, data, state, attempts_made, max_attempts,
                delay_until, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&job.id)
        .bind(&job.queue)
        .bind(job.priority)
        .bind(&job.data)
        .bind(job.state)
        .bind(job.attempts_made)
        .bind(job.max_attempts)
        .bind(job.delay_until)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(job.id)
    }

    async fn claim_next(
        &self,
        queue: &str,
        _worker_id: &str,
        lock_ms: i64,
    ) -> Result<Option<ClaimedJob>> {
        let token = Uuid::new_v4();

        let job = sqlx::query_as::<_, QueueJob>(
            r#"
            WITH next_job AS (
                SELECT id
                FROM queue_jobs
                WHERE queue = $1
                  AND (
                      state IN ('waiting', 'prioritized')
                      OR (state = 'delayed' AND delay_until <= NOW())
                      OR (state = 'active' AND lock_expires_at < NOW())
                  )
                ORDER BY priority, created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queue_jobs
            SET state = 'active',
                lock_token = $2,
                lock_expires_at = NOW() + ($3 || ' milliseconds')::INTERVAL,
                attempts_made = attempts_made + 1,
                processed_on = COALESCE(processed_on, NOW()),
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_job)
            RETURNING *
            "#,
        )
        .bind(queue)
        .bind(token)
        .bind(lock_ms.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(job.map(|job| ClaimedJob { job, token }))
    }

    async fn mark_completed(
        &self,
        job_id: &str,
        token: Uuid,
        return_value: serde_json::Value,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET state = 'completed',
                return_value = $3,
                lock_token = NULL,
                lock_expires_at = NULL,
                finished_on = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND lock_token = $2
            "#,
        )
        .bind(job_id)
        .bind(token)
        .bind(return_value)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!("job {} not held by this token", job_id);
        }
        Ok(())
    }

    async fn mark_failed(&self, job_id: &str, token: Uuid, reason: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET state = 'failed',
                failed_reason = $3,
                lock_token = NULL,
                lock_expires_at = NULL,
                finished_on = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND lock_token = $2
            "#,
        )
        .bind(job_id)
        .bind(token)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!("job {} not held by this token", job_id);
        }
        Ok(())
    }

    async fn return_to_waiting(&self, job_id: &str, token: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET state = 'waiting',
                lock_token = NULL,
                lock_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND lock_token = $2
            "#,
        )
        .bind(job_id)
        .bind(token)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!("job {} not held by this token", job_id);
        }
        Ok(())
    }

    async fn move_to_delayed(
        &self,
        job_id: &str,
        token: Uuid,
        until: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET state = 'delayed',
                delay_until = $3,
                lock_token = NULL,
                lock_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND lock_token = $2
            "#,
        )
        .bind(job_id)
        .bind(token)
        .bind(until)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!("job {} not held by this token", job_id);
        }
        Ok(())
    }

    async fn update_data(&self, job_id: &str, patch: serde_json::Value) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET data = data || $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(patch)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove(&self, job_id: &str, token: Option<Uuid>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM queue_jobs
            WHERE id = $1
              AND (state <> 'active' OR ($2::uuid IS NOT NULL AND lock_token = $2))
            "#,
        )
        .bind(job_id)
        .bind(token)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<QueueJob>> {
        let job = sqlx::query_as::<_, QueueJob>("SELECT * FROM queue_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }

    async fn jobs_in_state(
        &self,
        queue: &str,
        state: JobState,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<QueueJob>> {
        let jobs = sqlx::query_as::<_, QueueJob>(
            r#"
            SELECT * FROM queue_jobs
            WHERE queue = $1 AND state = $2
            ORDER BY priority, created_at
            OFFSET $3 LIMIT $4
            "#,
        )
        .bind(queue)
        .bind(state)
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn count_in_state(&self, queue: &str, state: JobState) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM queue_jobs WHERE queue = $1 AND state = $2",
        )
        .bind(queue)
        .bind(state)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn clean(
        &self,
        queue: &str,
        state: JobState,
        max_age_secs: i64,
        max_count: i64,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM queue_jobs
            WHERE id IN (
                SELECT id FROM queue_jobs
                WHERE queue = $1
                  AND state = $2
                  AND finished_on < NOW() - ($3 || ' seconds')::INTERVAL
                ORDER BY finished_on
                LIMIT $4
            )
            "#,
        )
        .bind(queue)
        .bind(state)
        .bind(max_age_secs.to_string())
        .bind(max_count)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn trim(&self, queue: &str, state: JobState, keep: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM queue_jobs
            WHERE id IN (
                SELECT id FROM queue_jobs
                WHERE queue = $1 AND state = $2
                ORDER BY finished_on DESC NULLS LAST
                OFFSET $3
            )
            "#,
        )
        .bind(queue)
        .bind(state)
        .bind(keep)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn requeue_stalled(&self, queue: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET state = 'waiting',
                lock_token = NULL,
                lock_expires_at = NULL,
                updated_at = NOW()
            WHERE queue = $1
              AND state = 'active'
              AND lock_expires_at < NOW()
            "#,
        )
        .bind(queue)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
