//! The dispatcher: matches waiting jobs to machines with free capacity.
//!
//! Two mutually exclusive regimes share the same per-job logic:
//!
//! ```text
//! worker mode        RunWorker pool ──► claim ──► dispatch_claimed(Worker)
//! event-driven mode  enqueue/release ─► try_next ─► dispatch_claimed(EventDriven)
//! ```
//!
//! The modes must never run against the same queue simultaneously; they
//! would race each other for job tokens.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::request::RunRequest;
use super::start_run::{StartRunError, StartRunner};
use crate::common::queues::RUN_QUEUE;
use crate::config::Config;
use crate::domains::machines::{Machine, MachineRegistry, MachineSelector, MachineStore};
use crate::domains::notifications::Notifier;
use crate::domains::runs::store::Repository;
use crate::domains::workflows::Deployment;
use crate::kernel::queue::{ClaimedJob, JobStore};

/// Start-run failure budget per job in event-driven mode.
const START_RUN_MAX_RETRIES: i32 = 3;

/// What one dispatch attempt did.
#[derive(Debug)]
pub enum DispatchOutcome {
    Processed { job_id: String, run_id: Uuid },
    NoWaitingJobs,
    NoAvailableMachines,
    DeploymentNotFound { job_id: String },
    InvalidJob { job_id: String, reason: String },
    MachineQueueFull { job_id: String },
    RetriesExhausted { job_id: String },
    StartFailed { job_id: String, error: String, removed: bool },
}

impl DispatchOutcome {
    /// Whether another pass could make progress right away.
    pub fn made_progress(&self) -> bool {
        matches!(self, DispatchOutcome::Processed { .. })
    }
}

/// Which regime is driving this dispatch attempt; decides how transient
/// failures are re-queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Worker,
    EventDriven,
}

pub struct Dispatcher {
    jobs: Arc<dyn JobStore>,
    registry: Arc<MachineRegistry>,
    selector: Arc<MachineSelector>,
    repository: Arc<dyn Repository>,
    starter: Arc<StartRunner>,
    notifier: Arc<Notifier>,
    config: Arc<Config>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: Arc<dyn JobStore>,
        registry: Arc<MachineRegistry>,
        selector: Arc<MachineSelector>,
        repository: Arc<dyn Repository>,
        starter: Arc<StartRunner>,
        notifier: Arc<Notifier>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            jobs,
            registry,
            selector,
            repository,
            starter,
            notifier,
            config,
        }
    }

    /// One event-driven dispatch attempt: check the fleet, pull the
    /// oldest runnable job, admit it somewhere, start it.
    pub async fn try_next(&self) -> Result<DispatchOutcome> {
        let eligible = self.registry.eligible_machines().await?;
        if eligible.is_empty() {
            return Ok(DispatchOutcome::NoAvailableMachines);
        }

        let claimed = self
            .jobs
            .claim_next(
                RUN_QUEUE,
                "dispatcher",
                self.config.worker_lock_duration_ms,
            )
            .await?;
        let Some(claimed) = claimed else {
            return Ok(DispatchOutcome::NoWaitingJobs);
        };

        self.dispatch_claimed(claimed, DispatchMode::EventDriven)
            .await
    }

    /// Loop `try_next` until nothing moves, bounded to avoid a dispatch
    /// pass monopolizing the process. Used on startup and per trigger.
    pub async fn process_all_available_jobs(&self) -> Result<usize> {
        let mut processed = 0;

        for _ in 0..self.config.dispatch_batch_limit {
            let outcome = self.try_next().await?;
            if !outcome.made_progress() {
                break;
            }
            processed += 1;
        }

        if processed > 0 {
            info!(processed, "dispatch pass admitted jobs");
        }
        Ok(processed)
    }

    /// Steps 3-6 of a dispatch attempt, shared by both regimes.
    pub async fn dispatch_claimed(
        &self,
        claimed: ClaimedJob,
        mode: DispatchMode,
    ) -> Result<DispatchOutcome> {
        let job_id = claimed.job.id.clone();
        let token = claimed.token;

        let request: RunRequest = match claimed.deserialize() {
            Ok(request) => request,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "removing undecodable job");
                self.jobs.remove(&job_id, Some(token)).await?;
                self.notifier
                    .notify_queue_failure(&job_id, None, &e.to_string())
                    .await?;
                return Ok(DispatchOutcome::InvalidJob {
                    job_id,
                    reason: e.to_string(),
                });
            }
        };

        // The deployment must exist at dispatch time.
        let Some(deployment) = self.repository.find_deployment(request.deployment_id).await? else {
            warn!(job_id = %job_id, deployment_id = %request.deployment_id, "deployment not found, removing job");
            self.jobs.remove(&job_id, Some(token)).await?;
            self.notifier
                .notify_queue_failure(
                    &job_id,
                    Some(request.deployment_id),
                    "deployment not found",
                )
                .await?;
            return Ok(DispatchOutcome::DeploymentNotFound { job_id });
        };

        let Some(version) = self
            .repository
            .find_workflow_version(deployment.workflow_version_id)
            .await?
        else {
            let reason = format!(
                "workflow version {} not found",
                deployment.workflow_version_id
            );
            warn!(job_id = %job_id, reason = %reason, "removing job");
            self.jobs.remove(&job_id, Some(token)).await?;
            self.notifier
                .notify_queue_failure(&job_id, Some(deployment.id), &reason)
                .await?;
            return Ok(DispatchOutcome::InvalidJob { job_id, reason });
        };

        let candidates = self.candidate_machines(&deployment).await?;
        if candidates.is_empty() {
            let reason = "deployment has no machine bound".to_string();
            warn!(job_id = %job_id, deployment_id = %deployment.id, reason = %reason, "removing job");
            self.jobs.remove(&job_id, Some(token)).await?;
            self.notifier
                .notify_queue_failure(&job_id, Some(deployment.id), &reason)
                .await?;
            return Ok(DispatchOutcome::InvalidJob { job_id, reason });
        }

        // Selection is advisory; admit below is the real gate.
        let Some(machine) = self
            .selector
            .select(&candidates, self.config.load_balancer_strategy)
        else {
            return self
                .handle_transient(&claimed, mode, Some(deployment.id))
                .await;
        };
        let machine = machine.clone();

        if !self.registry.admit(machine.id, Some(machine.capacity)).await? {
            return self
                .handle_transient(&claimed, mode, Some(deployment.id))
                .await;
        }

        match self
            .starter
            .start_new_run(&request, &version, &machine, &job_id)
            .await
        {
            Ok(run_id) => {
                match mode {
                    DispatchMode::EventDriven => {
                        self.jobs.remove(&job_id, Some(token)).await?;
                    }
                    DispatchMode::Worker => {
                        self.jobs
                            .mark_completed(
                                &job_id,
                                token,
                                json!({ "workflow_run_id": run_id }),
                            )
                            .await?;
                    }
                }
                Ok(DispatchOutcome::Processed { job_id, run_id })
            }
            Err(e) => {
                self.registry.release(machine.id).await?;
                self.handle_start_failure(&claimed, request, deployment.id, mode, e)
                    .await
            }
        }
    }

    async fn candidate_machines(&self, deployment: &Deployment) -> Result<Vec<Machine>> {
        let store = self.registry.store();
        match (deployment.machine_group_id, deployment.machine_id) {
            (Some(group_id), _) => store.group_members(group_id).await,
            (None, Some(machine_id)) => Ok(store.find(machine_id).await?.into_iter().collect()),
            (None, None) => Ok(Vec::new()),
        }
    }

    /// No machine could take the job: leave it queued. Worker mode delays
    /// it by the flat retry interval and enforces the queue retry
    /// ceiling; event-driven mode puts it straight back, since the next
    /// machine release re-triggers dispatch.
    async fn handle_transient(
        &self,
        claimed: &ClaimedJob,
        mode: DispatchMode,
        deployment_id: Option<Uuid>,
    ) -> Result<DispatchOutcome> {
        let job_id = claimed.job.id.clone();
        let token = claimed.token;

        match mode {
            DispatchMode::EventDriven => {
                self.jobs.return_to_waiting(&job_id, token).await?;
                Ok(DispatchOutcome::MachineQueueFull { job_id })
            }
            DispatchMode::Worker => {
                if claimed.job.attempts_exhausted() {
                    warn!(
                        job_id = %job_id,
                        attempts = claimed.job.attempts_made,
                        "no machine became available within the retry budget"
                    );
                    self.jobs.remove(&job_id, Some(token)).await?;
                    self.notifier
                        .notify_queue_failure(
                            &job_id,
                            deployment_id,
                            "no machine available: max retries exceeded",
                        )
                        .await?;
                    Ok(DispatchOutcome::RetriesExhausted { job_id })
                } else {
                    let retry_at =
                        Utc::now() + Duration::milliseconds(self.config.queue_retry_delay_ms);
                    self.jobs.move_to_delayed(&job_id, token, retry_at).await?;
                    Ok(DispatchOutcome::MachineQueueFull { job_id })
                }
            }
        }
    }

    /// The backend rejected the run. The run row is already failed and
    /// notified by the starter; what remains is the job's fate.
    async fn handle_start_failure(
        &self,
        claimed: &ClaimedJob,
        request: RunRequest,
        deployment_id: Uuid,
        mode: DispatchMode,
        error: StartRunError,
    ) -> Result<DispatchOutcome> {
        let job_id = claimed.job.id.clone();
        let token = claimed.token;
        let message = error.to_string();

        match mode {
            DispatchMode::EventDriven => {
                let retry_count = request.retry_count + 1;
                if retry_count > START_RUN_MAX_RETRIES {
                    warn!(job_id = %job_id, retry_count, error = %message, "start-run retries exhausted, removing job");
                    self.jobs.remove(&job_id, Some(token)).await?;
                    self.notifier
                        .notify_queue_failure(&job_id, Some(deployment_id), &message)
                        .await?;
                    Ok(DispatchOutcome::StartFailed {
                        job_id,
                        error: message,
                        removed: true,
                    })
                } else {
                    self.jobs
                        .update_data(&job_id, json!({ "retry_count": retry_count }))
                        .await?;
                    self.jobs.return_to_waiting(&job_id, token).await?;
                    Ok(DispatchOutcome::StartFailed {
                        job_id,
                        error: message,
                        removed: false,
                    })
                }
            }
            DispatchMode::Worker => {
                if claimed.job.attempts_exhausted() {
                    warn!(job_id = %job_id, attempts = claimed.job.attempts_made, error = %message, "job failed after exhausting queue retries");
                    self.jobs.mark_failed(&job_id, token, &message).await?;
                    self.notifier
                        .notify_queue_failure(&job_id, Some(deployment_id), &message)
                        .await?;
                    Ok(DispatchOutcome::RetriesExhausted { job_id })
                } else {
                    let retry_at =
                        Utc::now() + Duration::milliseconds(self.config.queue_retry_delay_ms);
                    self.jobs.move_to_delayed(&job_id, token, retry_at).await?;
                    Ok(DispatchOutcome::StartFailed {
                        job_id,
                        error: message,
                        removed: false,
                    })
                }
            }
        }
    }
}
