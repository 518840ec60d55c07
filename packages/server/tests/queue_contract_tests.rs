//! Contract tests for the durable queue semantics the dispatcher relies
//! on: ordering, claim tokens, delayed visibility, stalled recovery,
//! retention.

mod common;

use std::time::Duration;

use common::*;
use dispatch_core::common::queues::RUN_QUEUE;
use dispatch_core::kernel::queue::{EnqueueOptions, JobState, JobStore};
use serde_json::json;
use uuid::Uuid;

fn opts(max_attempts: i32) -> EnqueueOptions {
    EnqueueOptions {
        max_attempts,
        delay_until: None,
    }
}

#[tokio::test]
async fn claims_come_out_oldest_first() {
    let h = harness();
    let jobs = &h.deps.jobs;

    let first = jobs.enqueue(RUN_QUEUE, json!({"n": 1}), opts(1)).await.unwrap();
    let second = jobs.enqueue(RUN_QUEUE, json!({"n": 2}), opts(1)).await.unwrap();

    let a = jobs.claim_next(RUN_QUEUE, "w", 60_000).await.unwrap().unwrap();
    let b = jobs.claim_next(RUN_QUEUE, "w", 60_000).await.unwrap().unwrap();

    assert_eq!(a.job.id, first);
    assert_eq!(b.job.id, second);
    assert!(jobs.claim_next(RUN_QUEUE, "w", 60_000).await.unwrap().is_none());
}

#[tokio::test]
async fn state_changes_require_the_claim_token() {
    let h = harness();
    let jobs = &h.deps.jobs;

    let id = jobs.enqueue(RUN_QUEUE, json!({}), opts(1)).await.unwrap();
    let claimed = jobs.claim_next(RUN_QUEUE, "w", 60_000).await.unwrap().unwrap();

    // a stale token cannot move the job
    let stale = Uuid::new_v4();
    assert!(jobs.mark_completed(&id, stale, json!({})).await.is_err());
    assert!(jobs.return_to_waiting(&id, stale).await.is_err());

    // an active job cannot be removed without its token
    assert!(!jobs.remove(&id, None).await.unwrap());
    assert!(!jobs.remove(&id, Some(stale)).await.unwrap());

    // the real token works
    assert!(jobs.remove(&id, Some(claimed.token)).await.unwrap());
    assert!(jobs.get_job(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn delayed_jobs_surface_once_their_time_comes() {
    let h = harness();
    let jobs = &h.deps.jobs;

    let id = jobs
        .enqueue(
            RUN_QUEUE,
            json!({}),
            EnqueueOptions {
                max_attempts: 1,
                delay_until: Some(chrono::Utc::now() + chrono::Duration::milliseconds(50)),
            },
        )
        .await
        .unwrap();

    assert!(jobs.claim_next(RUN_QUEUE, "w", 60_000).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(80)).await;

    let claimed = jobs.claim_next(RUN_QUEUE, "w", 60_000).await.unwrap().unwrap();
    assert_eq!(claimed.job.id, id);
}

#[tokio::test]
async fn stalled_claims_are_reclaimable_after_lock_expiry() {
    let h = harness();
    let jobs = &h.deps.jobs;

    let id = jobs.enqueue(RUN_QUEUE, json!({}), opts(3)).await.unwrap();

    // claim with an immediately-expiring lock (a crashed processor)
    let first = jobs.claim_next(RUN_QUEUE, "w1", 0).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = jobs.claim_next(RUN_QUEUE, "w2", 60_000).await.unwrap().unwrap();
    assert_eq!(second.job.id, id);
    assert_eq!(second.job.attempts_made, 2);

    // the first processor's token is now dead
    assert!(jobs
        .mark_completed(&id, first.token, json!({}))
        .await
        .is_err());
}

#[tokio::test]
async fn update_data_shallow_merges_the_payload() {
    let h = harness();
    let jobs = &h.deps.jobs;

    let id = jobs
        .enqueue(RUN_QUEUE, json!({"keep": true, "retry_count": 0}), opts(1))
        .await
        .unwrap();

    jobs.update_data(&id, json!({"retry_count": 2})).await.unwrap();

    let job = jobs.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.data["keep"], json!(true));
    assert_eq!(job.data["retry_count"], json!(2));
}

#[tokio::test]
async fn trim_keeps_only_the_most_recent_completed_jobs() {
    let h = harness();
    let jobs = &h.deps.jobs;

    for n in 0..5 {
        let id = jobs.enqueue(RUN_QUEUE, json!({"n": n}), opts(1)).await.unwrap();
        let claimed = jobs.claim_next(RUN_QUEUE, "w", 60_000).await.unwrap().unwrap();
        jobs.mark_completed(&id, claimed.token, json!({})).await.unwrap();
    }

    let removed = jobs.trim(RUN_QUEUE, JobState::Completed, 2).await.unwrap();
    assert_eq!(removed, 3);
    assert_eq!(
        jobs.count_in_state(RUN_QUEUE, JobState::Completed).await.unwrap(),
        2
    );
}

#[tokio::test]
async fn concurrent_admits_never_oversubscribe_a_machine() {
    use dispatch_core::domains::machines::MachineStore;

    let h = harness();
    let machine = h.add_machine("gpu-1", 3);

    let mut handles = Vec::new();
    for _ in 0..10 {
        let machines = h.deps.machines.clone();
        let id = machine.id;
        handles.push(tokio::spawn(async move {
            machines.try_admit(id, None).await.unwrap()
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }

    assert_eq!(admitted, 3);
    let machine = h.machine(machine.id);
    assert_eq!(machine.current_queue, 3);
    assert!(machine.current_queue <= machine.capacity);
}
