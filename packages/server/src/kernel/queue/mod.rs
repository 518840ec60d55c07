//! Durable job queue infrastructure.
//!
//! Two named queues share the same store: the workflow-run queue feeding
//! the dispatcher and the notification queue feeding webhook delivery.
//!
//! ```text
//! API edge ──► JobStore.enqueue ──► queue_jobs (waiting)
//!                                        │
//! Dispatcher / workers ◄── claim_next ───┘  (FOR UPDATE SKIP LOCKED + token)
//! ```

mod job;
mod store;

pub use job::{generate_job_id, ClaimedJob, JobState, QueueJob};
pub use store::{EnqueueOptions, JobStore, PostgresJobStore};
