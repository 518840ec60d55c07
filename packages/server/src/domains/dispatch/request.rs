//! The payload enqueued from the API edge.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domains::workflows::RunInputs;

/// A user-submitted request to execute a deployment. The deployment is
/// resolved at dispatch time, not at enqueue time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub deployment_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<RunInputs>,
    /// Callback base URL derived from the submitting request.
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    /// Start-run failures observed so far (event-driven mode).
    #[serde(default)]
    pub retry_count: i32,
}
