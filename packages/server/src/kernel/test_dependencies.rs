// TestDependencies - in-memory implementations for testing
//
// Provides mock stores and transports that can be injected into
// ServerKernel for tests. The in-memory stores keep the same semantics
// as their PostgreSQL counterparts (atomic conditional admit, claim
// tokens, delayed visibility) under a process-local mutex.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::config::Config;
use crate::domains::machines::{Machine, MachineStore};
use crate::domains::runs::models::{OutputData, Run, RunOutput, RunStatus};
use crate::domains::runs::store::Repository;
use crate::domains::workflows::{Deployment, WorkflowVersion};
use crate::kernel::machine_backend::{MachineBackend, QueueSnapshot, RunPayload};
use crate::kernel::queue::{ClaimedJob, EnqueueOptions, JobState, JobStore, QueueJob};
use crate::kernel::webhook::WebhookSender;
use crate::kernel::ServerKernel;

// =============================================================================
// In-memory job store
// =============================================================================

pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<String, QueueJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot of every job, for assertions.
    pub fn all_jobs(&self) -> Vec<QueueJob> {
        self.jobs.lock().unwrap().values().cloned().collect()
    }

    fn claimable(job: &QueueJob, now: DateTime<Utc>) -> bool {
        match job.state {
            JobState::Waiting | JobState::Prioritized => true,
            JobState::Delayed => job.delay_until.map(|at| at <= now).unwrap_or(false),
            JobState::Active => job.lock_expires_at.map(|at| at < now).unwrap_or(false),
            JobState::Completed | JobState::Failed => false,
        }
    }

    fn with_held_job<T>(
        &self,
        job_id: &str,
        token: Uuid,
        f: impl FnOnce(&mut QueueJob) -> T,
    ) -> Result<T> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| anyhow!("job {} not found", job_id))?;
        if job.lock_token != Some(token) {
            bail!("job {} not held by this token", job_id);
        }
        Ok(f(job))
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(
        &self,
        queue: &str,
        data: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<String> {
        let mut job = QueueJob::new(queue, data, opts.max_attempts);
        if let Some(until) = opts.delay_until {
            job.state = JobState::Delayed;
            job.delay_until = Some(until);
        }

        let id = job.id.clone();
        self.jobs.lock().unwrap().insert(id.clone(), job);
        Ok(id)
    }

    async fn claim_next(
        &self,
        queue: &str,
        _worker_id: &str,
        lock_ms: i64,
    ) -> Result<Option<ClaimedJob>> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().unwrap();

        let next_id = jobs
            .values()
            .filter(|job| job.queue == queue && Self::claimable(job, now))
            .min_by_key(|job| (job.priority, job.created_at))
            .map(|job| job.id.clone());

        let Some(id) = next_id else {
            return Ok(None);
        };

        let token = Uuid::new_v4();
        let job = jobs.get_mut(&id).expect("job disappeared under lock");
        job.state = JobState::Active;
        job.lock_token = Some(token);
        job.lock_expires_at = Some(now + Duration::milliseconds(lock_ms));
        job.attempts_made += 1;
        job.processed_on.get_or_insert(now);
        job.updated_at = now;

        Ok(Some(ClaimedJob {
            job: job.clone(),
            token,
        }))
    }

    async fn mark_completed(
        &self,
        job_id: &str,
        token: Uuid,
        return_value: serde_json::Value,
    ) -> Result<()> {
        self.with_held_job(job_id, token, |job| {
            job.state = JobState::Completed;
            job.return_value = Some(return_value);
            job.lock_token = None;
            job.lock_expires_at = None;
            job.finished_on = Some(Utc::now());
        })
    }

    async fn mark_failed(&self, job_id: &str, token: Uuid, reason: &str) -> Result<()> {
        self.with_held_job(job_id, token, |job| {
            job.state = JobState::Failed;
            job.failed_reason = Some(reason.to_string());
            job.lock_token = None;
            job.lock_expires_at = None;
            job.finished_on = Some(Utc::now());
        })
    }

    async fn return_to_waiting(&self, job_id: &str, token: Uuid) -> Result<()> {
        self.with_held_job(job_id, token, |job| {
            job.state = JobState::Waiting;
            job.lock_token = None;
            job.lock_expires_at = None;
        })
    }

    async fn move_to_delayed(
        &self,
        job_id: &str,
        token: Uuid,
        until: DateTime<Utc>,
    ) -> Result<()> {
        self.with_held_job(job_id, token, |job| {
            job.state = JobState::Delayed;
            job.delay_until = Some(until);
            job.lock_token = None;
            job.lock_expires_at = None;
        })
    }

    async fn update_data(&self, job_id: &str, patch: serde_json::Value) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| anyhow!("job {} not found", job_id))?;

        if let (Some(data), Some(patch)) = (job.data.as_object_mut(), patch.as_object()) {
            for (key, value) in patch {
                data.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }

    async fn remove(&self, job_id: &str, token: Option<Uuid>) -> Result<bool> {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get(job_id) else {
            return Ok(false);
        };

        if job.state == JobState::Active && job.lock_token != token {
            return Ok(false);
        }

        jobs.remove(job_id);
        Ok(true)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<QueueJob>> {
        Ok(self.jobs.lock().unwrap().get(job_id).cloned())
    }

    async fn jobs_in_state(
        &self,
        queue: &str,
        state: JobState,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<QueueJob>> {
        let mut jobs: Vec<QueueJob> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|job| job.queue == queue && job.state == state)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| (job.priority, job.created_at));

        Ok(jobs
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn count_in_state(&self, queue: &str, state: JobState) -> Result<i64> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|job| job.queue == queue && job.state == state)
            .count() as i64)
    }

    async fn clean(
        &self,
        queue: &str,
        state: JobState,
        max_age_secs: i64,
        max_count: i64,
    ) -> Result<u64> {
        let cutoff = Utc::now() - Duration::seconds(max_age_secs);
        let mut jobs = self.jobs.lock().unwrap();

        let mut expired: Vec<String> = jobs
            .values()
            .filter(|job| {
                job.queue == queue
                    && job.state == state
                    && job.finished_on.map(|at| at < cutoff).unwrap_or(false)
            })
            .map(|job| job.id.clone())
            .collect();
        expired.truncate(max_count.max(0) as usize);

        for id in &expired {
            jobs.remove(id);
        }
        Ok(expired.len() as u64)
    }

    async fn trim(&self, queue: &str, state: JobState, keep: i64) -> Result<u64> {
        let mut jobs = self.jobs.lock().unwrap();

        let mut finished: Vec<(Option<DateTime<Utc>>, String)> = jobs
            .values()
            .filter(|job| job.queue == queue && job.state == state)
            .map(|job| (job.finished_on, job.id.clone()))
            .collect();
        finished.sort_by(|a, b| b.0.cmp(&a.0));

        let surplus: Vec<String> = finished
            .into_iter()
            .skip(keep.max(0) as usize)
            .map(|(_, id)| id)
            .collect();

        for id in &surplus {
            jobs.remove(id);
        }
        Ok(surplus.len() as u64)
    }

    async fn requeue_stalled(&self, queue: &str) -> Result<u64> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().unwrap();

        let mut requeued = 0;
        for job in jobs.values_mut() {
            if job.queue == queue
                && job.state == JobState::Active
                && job.lock_expires_at.map(|at| at < now).unwrap_or(false)
            {
                job.state = JobState::Waiting;
                job.lock_token = None;
                job.lock_expires_at = None;
                job.updated_at = now;
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// In-memory machine store
// =============================================================================

pub struct InMemoryMachineStore {
    machines: Mutex<HashMap<Uuid, Machine>>,
}

impl InMemoryMachineStore {
    pub fn new() -> Self {
        Self {
            machines: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, machine: Machine) {
        self.machines.lock().unwrap().insert(machine.id, machine);
    }

    pub fn get(&self, id: Uuid) -> Option<Machine> {
        self.machines.lock().unwrap().get(&id).cloned()
    }
}

impl Default for InMemoryMachineStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MachineStore for InMemoryMachineStore {
    async fn find(&self, id: Uuid) -> Result<Option<Machine>> {
        Ok(self.get(id))
    }

    async fn all(&self) -> Result<Vec<Machine>> {
        let mut machines: Vec<Machine> =
            self.machines.lock().unwrap().values().cloned().collect();
        machines.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(machines)
    }

    async fn group_members(&self, group_id: Uuid) -> Result<Vec<Machine>> {
        let mut machines: Vec<Machine> = self
            .machines
            .lock()
            .unwrap()
            .values()
            .filter(|m| m.machine_group_id == Some(group_id))
            .cloned()
            .collect();
        machines.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(machines)
    }

    async fn try_admit(&self, id: Uuid, capacity_hint: Option<i32>) -> Result<bool> {
        let mut machines = self.machines.lock().unwrap();
        let Some(machine) = machines.get_mut(&id) else {
            return Ok(false);
        };

        let ceiling = capacity_hint
            .map(|hint| hint.min(machine.capacity))
            .unwrap_or(machine.capacity);

        if !machine.is_eligible() || machine.current_queue >= ceiling {
            return Ok(false);
        }

        machine.current_queue += 1;
        machine.operational_status = crate::domains::machines::OperationalStatus::Busy;
        machine.updated_at = Utc::now();
        Ok(true)
    }

    async fn release_slot(&self, id: Uuid) -> Result<()> {
        let mut machines = self.machines.lock().unwrap();
        if let Some(machine) = machines.get_mut(&id) {
            machine.current_queue = (machine.current_queue - 1).max(0);
            if machine.current_queue == 0 {
                machine.operational_status = crate::domains::machines::OperationalStatus::Idle;
            }
            machine.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_queue_depth(&self, id: Uuid, depth: i32) -> Result<()> {
        let mut machines = self.machines.lock().unwrap();
        if let Some(machine) = machines.get_mut(&id) {
            machine.current_queue = depth;
            machine.operational_status = if depth == 0 {
                crate::domains::machines::OperationalStatus::Idle
            } else {
                crate::domains::machines::OperationalStatus::Busy
            };
            machine.updated_at = Utc::now();
        }
        Ok(())
    }
}

// =============================================================================
// In-memory repository
// =============================================================================

pub struct InMemoryRepository {
    deployments: Mutex<HashMap<Uuid, Deployment>>,
    versions: Mutex<HashMap<Uuid, WorkflowVersion>>,
    runs: Mutex<HashMap<Uuid, Run>>,
    outputs: Mutex<HashMap<Uuid, Vec<RunOutput>>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            deployments: Mutex::new(HashMap::new()),
            versions: Mutex::new(HashMap::new()),
            runs: Mutex::new(HashMap::new()),
            outputs: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert_deployment(&self, deployment: Deployment) {
        self.deployments
            .lock()
            .unwrap()
            .insert(deployment.id, deployment);
    }

    pub fn insert_workflow_version(&self, version: WorkflowVersion) {
        self.versions.lock().unwrap().insert(version.id, version);
    }

    pub fn get_run(&self, id: Uuid) -> Option<Run> {
        self.runs.lock().unwrap().get(&id).cloned()
    }

    pub fn all_runs(&self) -> Vec<Run> {
        self.runs.lock().unwrap().values().cloned().collect()
    }

    /// Plant a pre-existing duplicate output row (historical data shape).
    pub fn insert_output_row(&self, run_id: Uuid, data: OutputData) {
        let row = RunOutput {
            id: Uuid::new_v4(),
            run_id,
            data,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.outputs.lock().unwrap().entry(run_id).or_default().push(row);
    }

    pub fn output_rows(&self, run_id: Uuid) -> Vec<RunOutput> {
        self.outputs
            .lock()
            .unwrap()
            .get(&run_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn find_deployment(&self, id: Uuid) -> Result<Option<Deployment>> {
        Ok(self.deployments.lock().unwrap().get(&id).cloned())
    }

    async fn find_workflow_version(&self, id: Uuid) -> Result<Option<WorkflowVersion>> {
        Ok(self.versions.lock().unwrap().get(&id).cloned())
    }

    async fn insert_run(&self, run: &Run) -> Result<()> {
        self.runs.lock().unwrap().insert(run.id, run.clone());
        Ok(())
    }

    async fn find_run(&self, id: Uuid) -> Result<Option<Run>> {
        Ok(self.runs.lock().unwrap().get(&id).cloned())
    }

    async fn find_run_by_queue_job(&self, queue_job_id: &str) -> Result<Option<Run>> {
        Ok(self
            .runs
            .lock()
            .unwrap()
            .values()
            .filter(|run| run.queue_job_id.as_deref() == Some(queue_job_id))
            .max_by_key(|run| run.created_at)
            .cloned())
    }

    async fn mark_run_started(&self, id: Uuid) -> Result<()> {
        let mut runs = self.runs.lock().unwrap();
        if let Some(run) = runs.get_mut(&id) {
            run.status = RunStatus::Running;
            run.started_at = Some(Utc::now());
            run.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn transition_run_status(
        &self,
        id: Uuid,
        status: RunStatus,
    ) -> Result<Option<RunStatus>> {
        let mut runs = self.runs.lock().unwrap();
        let Some(run) = runs.get_mut(&id) else {
            return Ok(None);
        };

        let previous = run.status;
        run.status = status;
        if status.is_terminal() {
            run.ended_at = Some(Utc::now());
        }
        run.updated_at = Utc::now();
        Ok(Some(previous))
    }

    async fn bump_run_retry(&self, id: Uuid) -> Result<()> {
        let mut runs = self.runs.lock().unwrap();
        if let Some(run) = runs.get_mut(&id) {
            run.retry_count += 1;
            run.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn outputs_for_run(&self, run_id: Uuid) -> Result<Vec<RunOutput>> {
        Ok(self.output_rows(run_id))
    }

    async fn save_canonical_output(&self, run_id: Uuid, data: &OutputData) -> Result<()> {
        let row = RunOutput {
            id: Uuid::new_v4(),
            run_id,
            data: data.clone(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.outputs.lock().unwrap().insert(run_id, vec![row]);
        Ok(())
    }

    async fn clear_outputs(&self, run_id: Uuid) -> Result<()> {
        self.outputs.lock().unwrap().remove(&run_id);
        Ok(())
    }
}

// =============================================================================
// Mock machine backend
// =============================================================================

/// Records start-run calls and serves configured queue snapshots.
pub struct MockMachineBackend {
    calls: Mutex<Vec<(Uuid, RunPayload)>>,
    fail_remaining: Mutex<i32>,
    fail_message: Mutex<String>,
    snapshots: Mutex<HashMap<Uuid, QueueSnapshot>>,
}

impl MockMachineBackend {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_remaining: Mutex::new(0),
            fail_message: Mutex::new("backend unavailable".to_string()),
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    /// Make the next `times` start-run calls fail with `message`.
    pub fn fail_next_with(&self, times: i32, message: &str) {
        *self.fail_remaining.lock().unwrap() = times;
        *self.fail_message.lock().unwrap() = message.to_string();
    }

    pub fn set_queue_snapshot(&self, machine_id: Uuid, running: usize, pending: usize) {
        self.snapshots
            .lock()
            .unwrap()
            .insert(machine_id, QueueSnapshot { running, pending });
    }

    /// All recorded start-run calls as (machine id, payload).
    pub fn calls(&self) -> Vec<(Uuid, RunPayload)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Default for MockMachineBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MachineBackend for MockMachineBackend {
    async fn start_run(&self, machine: &Machine, payload: &RunPayload) -> Result<()> {
        {
            let mut remaining = self.fail_remaining.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                bail!("{}", self.fail_message.lock().unwrap().clone());
            }
        }

        self.calls
            .lock()
            .unwrap()
            .push((machine.id, payload.clone()));
        Ok(())
    }

    async fn queue_status(&self, machine: &Machine) -> Result<QueueSnapshot> {
        self.snapshots
            .lock()
            .unwrap()
            .get(&machine.id)
            .copied()
            .ok_or_else(|| anyhow!("machine {} unreachable", machine.id))
    }
}

// =============================================================================
// Spy webhook sender
// =============================================================================

/// Records webhook deliveries; can be told to fail.
pub struct SpyWebhookSender {
    deliveries: Mutex<Vec<(String, Option<String>, serde_json::Value)>>,
    fail_remaining: Mutex<i32>,
}

impl SpyWebhookSender {
    pub fn new() -> Self {
        Self {
            deliveries: Mutex::new(Vec::new()),
            fail_remaining: Mutex::new(0),
        }
    }

    pub fn fail_next(&self, times: i32) {
        *self.fail_remaining.lock().unwrap() = times;
    }

    pub fn deliveries(&self) -> Vec<(String, Option<String>, serde_json::Value)> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn delivery_count(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }
}

impl Default for SpyWebhookSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebhookSender for SpyWebhookSender {
    async fn deliver(
        &self,
        url: &str,
        auth_header: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<()> {
        {
            let mut remaining = self.fail_remaining.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                bail!("receiver returned 503");
            }
        }

        self.deliveries.lock().unwrap().push((
            url.to_string(),
            auth_header.map(str::to_string),
            body.clone(),
        ));
        Ok(())
    }
}

// =============================================================================
// Bundled test dependencies
// =============================================================================

/// All in-memory dependencies plus a kernel wired over them.
pub struct TestDependencies {
    pub jobs: Arc<InMemoryJobStore>,
    pub machines: Arc<InMemoryMachineStore>,
    pub repository: Arc<InMemoryRepository>,
    pub backend: Arc<MockMachineBackend>,
    pub webhooks: Arc<SpyWebhookSender>,
    pub config: Arc<Config>,
}

impl TestDependencies {
    pub fn new() -> Self {
        Self::with_config(Config::for_tests())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            jobs: Arc::new(InMemoryJobStore::new()),
            machines: Arc::new(InMemoryMachineStore::new()),
            repository: Arc::new(InMemoryRepository::new()),
            backend: Arc::new(MockMachineBackend::new()),
            webhooks: Arc::new(SpyWebhookSender::new()),
            config: Arc::new(config),
        }
    }

    pub fn kernel(&self) -> Arc<ServerKernel> {
        Arc::new(ServerKernel::new(
            self.jobs.clone(),
            self.machines.clone(),
            self.repository.clone(),
            self.backend.clone(),
            self.webhooks.clone(),
            self.config.clone(),
        ))
    }
}

impl Default for TestDependencies {
    fn default() -> Self {
        Self::new()
    }
}
