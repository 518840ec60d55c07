//! Scheduled background tasks using tokio-cron-scheduler.
//!
//! Two maintenance sweeps run on schedules:
//! - Queue retention: enforce the completed/failed retention policy on
//!   both queues.
//! - Machine drift reconciliation: pull true queue depths from classic
//!   machine backends, recovering counters after lost callbacks.

use std::sync::Arc;

use anyhow::Result;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::common::queues::{NOTIFICATION_QUEUE, RUN_QUEUE};
use crate::domains::machines::MachineRegistry;
use crate::kernel::queue::{JobState, JobStore};
use crate::kernel::ServerKernel;

/// How many finished jobs one sweep may delete per state.
const SWEEP_BATCH: i64 = 1_000;

/// Start all scheduled tasks
pub async fn start_scheduler(
    kernel: Arc<ServerKernel>,
    registry: Arc<MachineRegistry>,
) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    // Queue retention sweep - runs every 5 minutes
    let sweep_kernel = kernel.clone();
    let sweep_job = Job::new_async("0 */5 * * * *", move |_uuid, _lock| {
        let kernel = sweep_kernel.clone();
        Box::pin(async move {
            if let Err(e) = run_retention_sweep(&kernel).await {
                tracing::error!("Queue retention sweep failed: {}", e);
            }
        })
    })?;

    scheduler.add(sweep_job).await?;

    // Machine drift reconciliation - runs every 2 minutes
    let reconcile_registry = registry.clone();
    let reconcile_job = Job::new_async("0 */2 * * * *", move |_uuid, _lock| {
        let registry = reconcile_registry.clone();
        Box::pin(async move {
            if let Err(e) = run_drift_reconciliation(&registry).await {
                tracing::error!("Machine reconciliation failed: {}", e);
            }
        })
    })?;

    scheduler.add(reconcile_job).await?;
    scheduler.start().await?;

    tracing::info!(
        "Scheduled tasks started (retention sweep every 5 minutes, reconciliation every 2 minutes)"
    );
    Ok(scheduler)
}

/// Enforce the retention policy on both queues.
async fn run_retention_sweep(kernel: &ServerKernel) -> Result<()> {
    let config = &kernel.config;
    let jobs = &kernel.jobs;

    let mut removed = 0;
    removed += jobs
        .clean(
            RUN_QUEUE,
            JobState::Completed,
            config.completed_retention_secs,
            SWEEP_BATCH,
        )
        .await?;
    removed += jobs
        .trim(
            RUN_QUEUE,
            JobState::Completed,
            config.completed_retention_count,
        )
        .await?;
    removed += jobs
        .clean(
            RUN_QUEUE,
            JobState::Failed,
            config.run_failed_retention_secs,
            SWEEP_BATCH,
        )
        .await?;
    removed += jobs
        .clean(
            NOTIFICATION_QUEUE,
            JobState::Completed,
            config.notification_completed_retention_secs,
            SWEEP_BATCH,
        )
        .await?;
    removed += jobs
        .clean(
            NOTIFICATION_QUEUE,
            JobState::Failed,
            config.notification_failed_retention_secs,
            SWEEP_BATCH,
        )
        .await?;

    if removed > 0 {
        tracing::info!("Retention sweep removed {} finished jobs", removed);
    }

    Ok(())
}

/// Reconcile every classic machine against its backend.
async fn run_drift_reconciliation(registry: &MachineRegistry) -> Result<()> {
    let reports = registry.reconcile_all().await?;

    let failures = reports.iter().filter(|r| r.result.is_err()).count();
    if !reports.is_empty() {
        tracing::info!(
            "Reconciled {} machines ({} failures)",
            reports.len(),
            failures
        );
    }

    Ok(())
}
