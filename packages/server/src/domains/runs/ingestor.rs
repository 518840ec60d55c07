//! Ingestion of run-status callbacks from machines.
//!
//! Machines call back with partial output deltas and status updates,
//! possibly repeated. Output merges commute, and the `is_completing`
//! guard makes terminal side effects (slot release, dispatch trigger,
//! notification) fire at most once per run.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::models::{OutputData, Run, RunStatus};
use super::store::Repository;
use crate::config::Config;
use crate::domains::dispatch::events::{DispatchEvent, DispatchTrigger};
use crate::domains::dispatch::retry::is_retryable_error;
use crate::domains::dispatch::start_run::StartRunner;
use crate::domains::machines::MachineRegistry;
use crate::domains::notifications::Notifier;

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("run {0} not found")]
    RunNotFound(Uuid),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub struct CallbackIngestor {
    repository: Arc<dyn Repository>,
    registry: Arc<MachineRegistry>,
    notifier: Arc<Notifier>,
    starter: Arc<StartRunner>,
    trigger: DispatchTrigger,
    config: Arc<Config>,
}

impl CallbackIngestor {
    pub fn new(
        repository: Arc<dyn Repository>,
        registry: Arc<MachineRegistry>,
        notifier: Arc<Notifier>,
        starter: Arc<StartRunner>,
        trigger: DispatchTrigger,
        config: Arc<Config>,
    ) -> Self {
        Self {
            repository,
            registry,
            notifier,
            starter,
            trigger,
            config,
        }
    }

    /// Apply a callback. Both parts are independently optional: an
    /// output-only callback merges artifacts, a status-only callback
    /// transitions the run, and a combined one does both.
    pub async fn apply(
        &self,
        run_id: Uuid,
        status: Option<RunStatus>,
        output_data: Option<serde_json::Value>,
    ) -> Result<(), CallbackError> {
        let mut merged_outputs = None;

        if let Some(value) = output_data {
            let delta = OutputData::from_value(value).map_err(CallbackError::Internal)?;
            if !delta.is_trivial() {
                merged_outputs = Some(self.merge_outputs(run_id, delta).await?);
            }
        }

        let Some(status) = status else {
            return Ok(());
        };

        let run = self
            .repository
            .find_run(run_id)
            .await?
            .ok_or(CallbackError::RunNotFound(run_id))?;

        let would_complete = status.is_terminal() && !run.status.is_terminal();

        // A retryable failure re-executes instead of going terminal.
        if status == RunStatus::Failed
            && would_complete
            && self.config.execution_retry_enabled
            && run.can_retry_execution()
        {
            let error = merged_outputs
                .as_ref()
                .and_then(|data| data.error.clone())
                .unwrap_or(serde_json::Value::Null);

            if is_retryable_error(&error) {
                self.schedule_execution_retry(run).await?;
                return Ok(());
            }
        }

        let previous = self
            .repository
            .transition_run_status(run_id, status)
            .await?
            .ok_or(CallbackError::RunNotFound(run_id))?;

        // Repeated terminal callbacks write the same status again but
        // never re-fire the side effects.
        let is_completing = status.is_terminal() && !previous.is_terminal();
        if !is_completing {
            return Ok(());
        }

        info!(run_id = %run_id, status = %status, "run completed");

        if let Some(machine_id) = run.machine_id {
            self.registry.release(machine_id).await?;
            self.trigger.fire(DispatchEvent::MachineReleased(machine_id));
        }

        let outputs = match merged_outputs {
            Some(outputs) => Some(outputs),
            None => self.load_merged_outputs(run_id).await?,
        };
        let error = outputs.as_ref().and_then(|data| data.error.clone());

        self.notifier
            .notify_run_terminal(&run, status, outputs, error)
            .await?;

        Ok(())
    }

    /// Left-fold any historical duplicate rows, fold in the delta, and
    /// persist one canonical row.
    async fn merge_outputs(&self, run_id: Uuid, delta: OutputData) -> Result<OutputData> {
        let existing = self.repository.outputs_for_run(run_id).await?;

        let mut data = OutputData::default();
        for row in existing {
            data.merge(row.data);
        }
        data.merge(delta);

        self.repository.save_canonical_output(run_id, &data).await?;
        Ok(data)
    }

    async fn load_merged_outputs(&self, run_id: Uuid) -> Result<Option<OutputData>> {
        let rows = self.repository.outputs_for_run(run_id).await?;
        if rows.is_empty() {
            return Ok(None);
        }

        let mut data = OutputData::default();
        for row in rows {
            data.merge(row.data);
        }
        Ok(Some(data))
    }

    /// Execution-level retry: clear outputs, spend one retry, free the
    /// slot, and re-dispatch the same run after the configured delay.
    async fn schedule_execution_retry(&self, run: Run) -> Result<()> {
        info!(
            run_id = %run.id,
            retry_count = run.retry_count + 1,
            max_retries = run.max_retries,
            "scheduling execution retry"
        );

        self.repository.clear_outputs(run.id).await?;
        self.repository.bump_run_retry(run.id).await?;

        if let Some(machine_id) = run.machine_id {
            self.registry.release(machine_id).await?;
        }

        let repository = self.repository.clone();
        let starter = self.starter.clone();
        let delay = Duration::from_millis(self.config.execution_retry_delay_ms.max(0) as u64);
        let run_id = run.id;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            match repository.find_run(run_id).await {
                Ok(Some(run)) => {
                    if let Err(e) = starter.restart_run(&run).await {
                        error!(run_id = %run_id, error = %e, "execution retry failed to start");
                    }
                }
                Ok(None) => warn!(run_id = %run_id, "run vanished before execution retry"),
                Err(e) => error!(run_id = %run_id, error = %e, "failed to reload run for retry"),
            }
        });

        Ok(())
    }
}
