//! Failure classification for execution-level retries.
//!
//! Workflow errors split into two classes: transient backend trouble
//! worth re-running, and permanent workflow errors (bad inputs, missing
//! nodes) that will fail identically every time.

/// Error markers that make a failed run permanent. Matching is a
/// case-insensitive substring test against the whole error payload, so
/// both `error_type` fields and free-form messages are covered.
const NON_RETRYABLE_PATTERNS: [&str; 6] = [
    "value_error",
    "node_not_found",
    "invalid_workflow",
    "missing_node",
    "invalid_input",
    "type_error",
];

/// Whether a failed run's error payload is worth retrying.
pub fn is_retryable_error(error: &serde_json::Value) -> bool {
    let haystack = error.to_string().to_lowercase();
    !NON_RETRYABLE_PATTERNS
        .iter()
        .any(|pattern| haystack.contains(pattern))
}
