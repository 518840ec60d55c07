//! End-to-end dispatch scenarios against the in-memory kernel.

mod common;

use common::*;

use dispatch_core::common::queues::{NOTIFICATION_QUEUE, RUN_QUEUE};
use dispatch_core::domains::dispatch::{DispatchMode, DispatchOutcome};
use dispatch_core::domains::machines::OperationalStatus;
use dispatch_core::domains::runs::RunStatus;
use dispatch_core::kernel::queue::{JobState, JobStore};
use uuid::Uuid;

#[tokio::test]
async fn happy_path_on_a_single_machine() {
    let mut h = harness();
    let machine = h.add_machine("gpu-1", 2);
    let version = h.seed_workflow_version();
    let deployment = h.seed_deployment_for_machine(machine.id, &version);

    let job_id = h.enqueue_run(deployment.id).await;

    let outcome = h.stack.dispatcher.try_next().await.unwrap();
    let DispatchOutcome::Processed { run_id, .. } = outcome else {
        panic!("expected Processed, got {:?}", outcome);
    };

    // slot admitted, backend called, run row running
    let machine_now = h.machine(machine.id);
    assert_eq!(machine_now.current_queue, 1);
    assert_eq!(machine_now.operational_status, OperationalStatus::Busy);

    let calls = h.deps.backend.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, machine.id);
    assert_eq!(calls[0].1.prompt_id, run_id);
    assert_eq!(
        calls[0].1.status_endpoint,
        "http://api.test/api/update-run"
    );

    let run = h.deps.repository.get_run(run_id).unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert!(run.started_at.is_some());
    assert_eq!(run.queue_job_id.as_deref(), Some(job_id.as_str()));

    // terminal callback with one image
    h.stack
        .ingestor
        .apply(
            run_id,
            Some(RunStatus::Success),
            Some(serde_json::json!({
                "images": [{ "filename": "out.png", "url": "http://files/out.png" }]
            })),
        )
        .await
        .unwrap();

    let machine_now = h.machine(machine.id);
    assert_eq!(machine_now.current_queue, 0);
    assert_eq!(machine_now.operational_status, OperationalStatus::Idle);

    let run = h.deps.repository.get_run(run_id).unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert!(run.ended_at.is_some());

    // the release fired a dispatch event and queued one notification
    assert!(h.trigger_rx.try_recv().is_ok());
    assert_eq!(
        h.deps
            .jobs
            .count_in_state(NOTIFICATION_QUEUE, JobState::Waiting)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn least_load_selection_picks_the_emptiest_group_member() {
    let h = harness();
    let group_id = Uuid::new_v4();
    let busy = h.add_group_machine("gpu-a", group_id, 2, 5);
    let idle = h.add_group_machine("gpu-b", group_id, 0, 5);
    let version = h.seed_workflow_version();
    let deployment = h.seed_deployment_for_group(group_id, &version);

    h.enqueue_run(deployment.id).await;

    let outcome = h.stack.dispatcher.try_next().await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Processed { .. }));

    assert_eq!(h.machine(idle.id).current_queue, 1);
    assert_eq!(h.machine(busy.id).current_queue, 2);
}

#[tokio::test]
async fn full_machine_backpressures_until_release() {
    let mut h = harness();
    let machine = h.add_machine("gpu-1", 1);
    let version = h.seed_workflow_version();
    let deployment = h.seed_deployment_for_machine(machine.id, &version);

    // capacity 1 already taken by an in-flight run
    let existing = h.seed_running_run(&machine, &version).await;
    assert_eq!(h.machine(machine.id).current_queue, 1);

    let job_id = h.enqueue_run(deployment.id).await;

    // attempt 1: nothing eligible, no mutation
    let outcome = h.stack.dispatcher.try_next().await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::NoAvailableMachines));
    let job = h.deps.jobs.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Waiting);
    assert_eq!(h.deps.backend.call_count(), 0);

    // the in-flight run completes, releasing the slot and firing dispatch
    h.stack
        .ingestor
        .apply(existing.id, Some(RunStatus::Success), None)
        .await
        .unwrap();
    assert_eq!(h.machine(machine.id).current_queue, 0);
    assert!(h.trigger_rx.try_recv().is_ok());

    // the triggered pass admits the waiting job
    let outcome = h.stack.dispatcher.try_next().await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Processed { .. }));
    assert_eq!(h.machine(machine.id).current_queue, 1);
}

#[tokio::test]
async fn transient_retries_exhaust_into_a_synthetic_failure_notification() {
    let mut config = test_config();
    config.max_queue_retries = 3;
    config.queue_retry_delay_ms = 0;
    let h = harness_with(config);

    let mut machine = h.add_machine("gpu-1", 1);
    machine.disabled = true;
    h.deps.machines.insert(machine.clone());

    let version = h.seed_workflow_version();
    let deployment = h.seed_deployment_for_machine(machine.id, &version);
    let job_id = h.enqueue_run(deployment.id).await;

    // worker mode claims regardless of fleet state and re-queues with
    // the flat delay until the budget runs out
    for attempt in 1..=3 {
        let claimed = h
            .deps
            .jobs
            .claim_next(RUN_QUEUE, "test-worker", 60_000)
            .await
            .unwrap()
            .expect("job should be claimable");
        assert_eq!(claimed.job.attempts_made, attempt);

        let outcome = h
            .stack
            .dispatcher
            .dispatch_claimed(claimed, DispatchMode::Worker)
            .await
            .unwrap();

        if attempt < 3 {
            assert!(matches!(outcome, DispatchOutcome::MachineQueueFull { .. }));
        } else {
            assert!(matches!(outcome, DispatchOutcome::RetriesExhausted { .. }));
        }
    }

    // job removed, one failure notification with the synthetic run id
    assert!(h.deps.jobs.get_job(&job_id).await.unwrap().is_none());

    let notifications = h
        .deps
        .jobs
        .jobs_in_state(NOTIFICATION_QUEUE, JobState::Waiting, 0, 10)
        .await
        .unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(
        notifications[0].data["workflow_run_id"],
        serde_json::json!(format!("queue-job-{}", job_id))
    );
    assert_eq!(h.deps.backend.call_count(), 0);
}

#[tokio::test]
async fn backend_rejection_fails_the_run_and_requeues_the_job() {
    let h = harness();
    let machine = h.add_machine("gpu-1", 2);
    let version = h.seed_workflow_version();
    let deployment = h.seed_deployment_for_machine(machine.id, &version);

    let job_id = h.enqueue_run(deployment.id).await;
    h.deps.backend.fail_next_with(1, "connection refused");

    let outcome = h.stack.dispatcher.try_next().await.unwrap();
    let DispatchOutcome::StartFailed { removed, .. } = outcome else {
        panic!("expected StartFailed, got {:?}", outcome);
    };
    assert!(!removed);

    // the slot was given back and the doomed run row is terminal
    assert_eq!(h.machine(machine.id).current_queue, 0);
    let failed_runs: Vec<_> = h
        .deps
        .repository
        .all_runs()
        .into_iter()
        .filter(|run| run.status == RunStatus::Failed)
        .collect();
    assert_eq!(failed_runs.len(), 1);
    assert_eq!(
        h.deps
            .jobs
            .count_in_state(NOTIFICATION_QUEUE, JobState::Waiting)
            .await
            .unwrap(),
        1
    );

    // the job is back waiting with its start-failure count recorded
    let job = h.deps.jobs.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Waiting);
    assert_eq!(job.data["retry_count"], serde_json::json!(1));

    // the backend recovers and the next pass dispatches a fresh run
    let outcome = h.stack.dispatcher.try_next().await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Processed { .. }));
    assert_eq!(h.machine(machine.id).current_queue, 1);
}

#[tokio::test]
async fn jobs_dispatch_in_enqueue_order() {
    let h = harness();
    let machine = h.add_machine("gpu-1", 5);
    let version = h.seed_workflow_version();
    let deployment = h.seed_deployment_for_machine(machine.id, &version);

    let first = h.enqueue_run(deployment.id).await;
    let second = h.enqueue_run(deployment.id).await;

    let DispatchOutcome::Processed { job_id, .. } = h.stack.dispatcher.try_next().await.unwrap()
    else {
        panic!("expected Processed");
    };
    assert_eq!(job_id, first);

    let DispatchOutcome::Processed { job_id, .. } = h.stack.dispatcher.try_next().await.unwrap()
    else {
        panic!("expected Processed");
    };
    assert_eq!(job_id, second);
}

#[tokio::test]
async fn missing_deployment_removes_the_job() {
    let h = harness();
    h.add_machine("gpu-1", 2);

    let job_id = h.enqueue_run(Uuid::new_v4()).await;

    let outcome = h.stack.dispatcher.try_next().await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::DeploymentNotFound { .. }));

    assert!(h.deps.jobs.get_job(&job_id).await.unwrap().is_none());
    assert_eq!(
        h.deps
            .jobs
            .count_in_state(NOTIFICATION_QUEUE, JobState::Waiting)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn process_all_drains_waiting_jobs_up_to_capacity() {
    let h = harness();
    let machine = h.add_machine("gpu-1", 2);
    let version = h.seed_workflow_version();
    let deployment = h.seed_deployment_for_machine(machine.id, &version);

    for _ in 0..4 {
        h.enqueue_run(deployment.id).await;
    }

    let processed = h.stack.dispatcher.process_all_available_jobs().await.unwrap();

    // two admitted, two still waiting behind the full machine
    assert_eq!(processed, 2);
    assert_eq!(h.machine(machine.id).current_queue, 2);
    assert_eq!(
        h.deps
            .jobs
            .count_in_state(RUN_QUEUE, JobState::Waiting)
            .await
            .unwrap(),
        2
    );
}
