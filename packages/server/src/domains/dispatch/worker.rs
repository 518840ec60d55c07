//! Worker-pull dispatch: a pool of processors each claiming one job at
//! a time off the run queue.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::dispatcher::{DispatchMode, DispatchOutcome, Dispatcher};
use super::events::{DispatchEvent, DispatchTrigger};
use crate::common::queues::RUN_QUEUE;
use crate::config::Config;
use crate::kernel::queue::JobStore;
use crate::kernel::service_host::Service;

const EMPTY_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct RunWorker {
    jobs: Arc<dyn JobStore>,
    dispatcher: Arc<Dispatcher>,
    config: Arc<Config>,
    worker_id: String,
}

impl RunWorker {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        dispatcher: Arc<Dispatcher>,
        config: Arc<Config>,
        index: usize,
    ) -> Self {
        Self {
            jobs,
            dispatcher,
            config,
            worker_id: format!("run-worker-{}", index),
        }
    }
}

#[async_trait::async_trait]
impl Service for RunWorker {
    fn name(&self) -> &'static str {
        "run-worker"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let claimed = match self
                .jobs
                .claim_next(
                    RUN_QUEUE,
                    &self.worker_id,
                    self.config.worker_lock_duration_ms,
                )
                .await
            {
                Ok(claimed) => claimed,
                Err(e) => {
                    error!(worker_id = %self.worker_id, error = %e, "failed to claim job");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    }
                }
            };

            let Some(claimed) = claimed else {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(EMPTY_POLL_INTERVAL) => {}
                }
                continue;
            };

            let job_id = claimed.job.id.clone();
            match self
                .dispatcher
                .dispatch_claimed(claimed, DispatchMode::Worker)
                .await
            {
                Ok(DispatchOutcome::Processed { run_id, .. }) => {
                    debug!(worker_id = %self.worker_id, job_id = %job_id, run_id = %run_id, "job dispatched");
                }
                Ok(outcome) => {
                    debug!(worker_id = %self.worker_id, job_id = %job_id, ?outcome, "job not dispatched");
                }
                Err(e) => {
                    error!(worker_id = %self.worker_id, job_id = %job_id, error = %e, "dispatch attempt errored");
                }
            }
        }

        Ok(())
    }
}

/// Periodic stalled-job recovery for event-driven mode.
///
/// Worker claims recover expired locks on their own; with no claim loop
/// running, a stalled job would otherwise sit until the next enqueue or
/// release event. The sweep puts it back in the waiting set and fires a
/// dispatch pass.
pub struct StalledJobSweeper {
    jobs: Arc<dyn JobStore>,
    trigger: DispatchTrigger,
    interval: Duration,
}

impl StalledJobSweeper {
    pub fn new(jobs: Arc<dyn JobStore>, trigger: DispatchTrigger, config: &Config) -> Self {
        Self {
            jobs,
            trigger,
            interval: Duration::from_millis(config.worker_stalled_interval_ms.max(1_000) as u64),
        }
    }
}

#[async_trait::async_trait]
impl Service for StalledJobSweeper {
    fn name(&self) -> &'static str {
        "stalled-job-sweeper"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            match self.jobs.requeue_stalled(RUN_QUEUE).await {
                Ok(0) => {}
                Ok(requeued) => {
                    tracing::warn!(requeued, "requeued stalled jobs");
                    self.trigger.fire(DispatchEvent::JobEnqueued);
                }
                Err(e) => error!(error = %e, "stalled-job sweep failed"),
            }
        }

        Ok(())
    }
}
