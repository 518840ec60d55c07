//! Run endpoints: enqueue, status query, machine status callback.

use axum::{
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::error;
use uuid::Uuid;

use crate::common::queues::RUN_QUEUE;
use crate::domains::dispatch::{DispatchEvent, RunRequest};
use crate::domains::runs::{CallbackError, Repository, Run, RunStatus};
use crate::domains::workflows::RunInputs;
use crate::kernel::queue::{EnqueueOptions, JobState, JobStore, QueueJob};
use crate::server::app::AppState;

/// Rough seconds-per-job used for the wait estimate.
const WAIT_SECONDS_PER_JOB: i64 = 30;

type ApiError = (StatusCode, Json<Value>);

fn internal_error(e: anyhow::Error) -> ApiError {
    error!(error = %e, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal error" })),
    )
}

// =============================================================================
// POST /api/run
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateRunBody {
    pub deployment_id: Uuid,
    #[serde(default)]
    pub inputs: Option<RunInputs>,
    /// Callback base URL for machines to report back on.
    pub origin: String,
    #[serde(default, rename = "apiUser")]
    pub api_user: Option<ApiUser>,
}

#[derive(Debug, Deserialize)]
pub struct ApiUser {
    pub user_id: String,
    #[serde(default)]
    pub org_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateRunResponse {
    pub job_id: String,
    pub status: &'static str,
    pub estimated_wait_time: i64,
}

pub async fn create_run_handler(
    Extension(state): Extension<AppState>,
    Json(body): Json<CreateRunBody>,
) -> Result<Json<CreateRunResponse>, ApiError> {
    // The deployment may legitimately not exist yet at enqueue time, but
    // a staging deployment bound to a group is always a caller error.
    if let Some(deployment) = state
        .kernel
        .repository
        .find_deployment(body.deployment_id)
        .await
        .map_err(internal_error)?
    {
        if !deployment.is_valid_target() {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "staging deployments cannot target a machine group" })),
            ));
        }
    }

    let request = RunRequest {
        deployment_id: body.deployment_id,
        inputs: body.inputs,
        origin: body.origin,
        user_id: body.api_user.as_ref().map(|u| u.user_id.clone()),
        org_id: body.api_user.and_then(|u| u.org_id),
        retry_count: 0,
    };

    let job_id = state
        .kernel
        .jobs
        .enqueue(
            RUN_QUEUE,
            serde_json::to_value(&request).map_err(|e| internal_error(e.into()))?,
            EnqueueOptions {
                max_attempts: state.kernel.config.max_queue_retries,
                delay_until: None,
            },
        )
        .await
        .map_err(internal_error)?;

    let waiting = state
        .kernel
        .jobs
        .count_in_state(RUN_QUEUE, JobState::Waiting)
        .await
        .unwrap_or(0);

    state.trigger.fire(DispatchEvent::JobEnqueued);

    Ok(Json(CreateRunResponse {
        job_id,
        status: "queued",
        estimated_wait_time: waiting * WAIT_SECONDS_PER_JOB,
    }))
}

// =============================================================================
// GET /api/run/{job_id}
// =============================================================================

pub async fn run_status_handler(
    Extension(state): Extension<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if let Some(job) = state
        .kernel
        .jobs
        .get_job(&job_id)
        .await
        .map_err(internal_error)?
    {
        let run = run_for_job(&state, &job).await.map_err(internal_error)?;
        return Ok(Json(job_status_body(&job, run.as_ref())));
    }

    // Gone from the queue: the run row keyed by the job id is the record
    // of what happened.
    if let Some(run) = state
        .kernel
        .repository
        .find_run_by_queue_job(&job_id)
        .await
        .map_err(internal_error)?
    {
        return Ok(Json(json!({
            "job_id": job_id,
            "queue_status": "completed",
            "workflow_run_id": run.id,
            "workflow_status": run.status,
            "created_at": run.created_at,
            "started_at": run.started_at,
            "ended_at": run.ended_at,
        })));
    }

    Err((
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "job not found" })),
    ))
}

async fn run_for_job(state: &AppState, job: &QueueJob) -> anyhow::Result<Option<Run>> {
    let from_return_value = job
        .return_value
        .as_ref()
        .and_then(|value| value.get("workflow_run_id"))
        .and_then(Value::as_str)
        .and_then(|id| Uuid::parse_str(id).ok());

    match from_return_value {
        Some(run_id) => state.kernel.repository.find_run(run_id).await,
        None => state.kernel.repository.find_run_by_queue_job(&job.id).await,
    }
}

fn job_status_body(job: &QueueJob, run: Option<&Run>) -> Value {
    let mut body = json!({
        "job_id": job.id,
        "queue_state": job.state,
        "attempts_made": job.attempts_made,
        "failed_reason": job.failed_reason,
        "created_at": job.created_at,
        "processed_on": job.processed_on,
        "finished_on": job.finished_on,
    });

    if let Some(run) = run {
        body["workflow_run_id"] = json!(run.id);
        body["workflow_status"] = json!(run.status);
    }

    body
}

// =============================================================================
// POST /api/update-run
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct UpdateRunBody {
    pub run_id: Uuid,
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub output_data: Option<Value>,
}

pub async fn update_run_handler(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    Json(body): Json<UpdateRunBody>,
) -> Result<Json<Value>, ApiError> {
    // Machines live inside the trust boundary; deployments that want a
    // shared secret anyway configure one.
    if let Some(secret) = &state.kernel.config.callback_shared_secret {
        let presented = headers
            .get("x-callback-secret")
            .and_then(|value| value.to_str().ok());
        if presented != Some(secret.as_str()) {
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "invalid callback secret" })),
            ));
        }
    }

    match state
        .ingestor
        .apply(body.run_id, body.status, body.output_data)
        .await
    {
        Ok(()) => Ok(Json(json!({ "status": "ok" }))),
        Err(CallbackError::RunNotFound(run_id)) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("run {} not found", run_id) })),
        )),
        Err(CallbackError::Internal(e)) => Err(internal_error(e)),
    }
}
