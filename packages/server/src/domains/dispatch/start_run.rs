//! Hands a run to a machine: builds the graph payload, records the run
//! row, and invokes the backend start-run RPC.

use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

use super::request::RunRequest;
use crate::config::Config;
use crate::domains::machines::{Machine, MachineStore};
use crate::domains::notifications::Notifier;
use crate::domains::runs::models::{Run, RunStatus};
use crate::domains::runs::store::Repository;
use crate::domains::workflows::{apply_external_inputs, RunInputs, WorkflowVersion};
use crate::kernel::machine_backend::{MachineBackend, RunPayload};

/// Execution-retry budget recorded on new runs.
const DEFAULT_EXECUTION_MAX_RETRIES: i32 = 3;

#[derive(Debug, Error)]
pub enum StartRunError {
    #[error("workflow version {0} not found")]
    VersionNotFound(Uuid),
    #[error("machine {0} not found")]
    MachineNotFound(Uuid),
    #[error("machine rejected run {run_id}: {message}")]
    Backend { run_id: Uuid, message: String },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub struct StartRunner {
    repository: Arc<dyn Repository>,
    machines: Arc<dyn MachineStore>,
    backend: Arc<dyn MachineBackend>,
    notifier: Arc<Notifier>,
    config: Arc<Config>,
}

impl StartRunner {
    pub fn new(
        repository: Arc<dyn Repository>,
        machines: Arc<dyn MachineStore>,
        backend: Arc<dyn MachineBackend>,
        notifier: Arc<Notifier>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            repository,
            machines,
            backend,
            notifier,
            config,
        }
    }

    /// The base URL machines call back on. `API_URL` wins over the
    /// request-derived origin because machines may only be able to reach
    /// the API over a private network.
    fn effective_origin(&self, request_origin: &str) -> String {
        self.config
            .api_url
            .clone()
            .unwrap_or_else(|| request_origin.to_string())
    }

    /// Create a run row for `request` and start it on `machine`.
    pub async fn start_new_run(
        &self,
        request: &RunRequest,
        version: &WorkflowVersion,
        machine: &Machine,
        queue_job_id: &str,
    ) -> Result<Uuid, StartRunError> {
        let workflow_inputs = match &request.inputs {
            Some(inputs) => Some(
                serde_json::to_value(inputs).map_err(|e| StartRunError::Internal(e.into()))?,
            ),
            None => None,
        };

        let now = Utc::now();
        let run = Run {
            id: Uuid::new_v4(),
            workflow_id: version.workflow_id,
            workflow_version_id: version.id,
            workflow_inputs,
            machine_id: Some(machine.id),
            origin: "api".to_string(),
            callback_origin: self.effective_origin(&request.origin),
            queue_job_id: Some(queue_job_id.to_string()),
            status: RunStatus::NotStarted,
            retry_count: 0,
            max_retries: DEFAULT_EXECUTION_MAX_RETRIES,
            user_id: request.user_id.clone(),
            org_id: request.org_id.clone(),
            created_at: now,
            started_at: None,
            ended_at: None,
            updated_at: now,
        };

        self.repository.insert_run(&run).await?;

        self.post_to_machine(&run, version, machine, request.inputs.as_ref())
            .await?;

        Ok(run.id)
    }

    /// Re-dispatch an existing run to its recorded machine (execution
    /// retry). The caller has already cleared outputs and bumped the
    /// retry counter.
    pub async fn restart_run(&self, run: &Run) -> Result<(), StartRunError> {
        let version = self
            .repository
            .find_workflow_version(run.workflow_version_id)
            .await?
            .ok_or(StartRunError::VersionNotFound(run.workflow_version_id))?;

        let machine_id = run
            .machine_id
            .ok_or_else(|| anyhow!("run {} has no machine recorded", run.id))?;
        let machine = self
            .machines
            .find(machine_id)
            .await?
            .ok_or(StartRunError::MachineNotFound(machine_id))?;

        let inputs: Option<RunInputs> = match &run.workflow_inputs {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| StartRunError::Internal(e.into()))?,
            None => None,
        };

        self.post_to_machine(run, &version, &machine, inputs.as_ref())
            .await
    }

    async fn post_to_machine(
        &self,
        run: &Run,
        version: &WorkflowVersion,
        machine: &Machine,
        inputs: Option<&RunInputs>,
    ) -> Result<(), StartRunError> {
        let mut workflow_api = version.workflow_api.clone();
        if let Some(inputs) = inputs {
            apply_external_inputs(&mut workflow_api, inputs);
        }

        let origin = run.callback_origin.trim_end_matches('/');
        let payload = RunPayload {
            prompt_id: run.id,
            workflow_api_raw: workflow_api,
            workflow: version.workflow.clone(),
            status_endpoint: format!("{}/api/update-run", origin),
            file_upload_endpoint: format!("{}/api/file-upload", origin),
        };

        match self.backend.start_run(machine, &payload).await {
            Ok(()) => {
                self.repository.mark_run_started(run.id).await?;
                info!(
                    run_id = %run.id,
                    machine_id = %machine.id,
                    workflow_version_id = %version.id,
                    "run started on machine"
                );
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                error!(run_id = %run.id, machine_id = %machine.id, error = %message, "start-run RPC failed");

                self.repository
                    .transition_run_status(run.id, RunStatus::Failed)
                    .await?;
                self.notifier
                    .notify_run_terminal(
                        run,
                        RunStatus::Failed,
                        None,
                        Some(json!({ "message": message })),
                    )
                    .await?;

                Err(StartRunError::Backend {
                    run_id: run.id,
                    message,
                })
            }
        }
    }
}
