//! Test harness wiring the dispatch core over the in-memory kernel.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use dispatch_core::config::Config;
use dispatch_core::common::queues::RUN_QUEUE;
use dispatch_core::domains::dispatch::{
    build_dispatch_stack, DispatchEvent, DispatchStack, DispatchTrigger, RunRequest,
};
use dispatch_core::domains::machines::{Machine, MachineKind, OperationalStatus};
use dispatch_core::domains::runs::{Repository, Run, RunStatus};
use dispatch_core::domains::workflows::{Deployment, Environment, WorkflowVersion};
use dispatch_core::kernel::queue::{EnqueueOptions, JobStore};
use dispatch_core::kernel::{ServerKernel, TestDependencies};

pub struct TestHarness {
    pub deps: TestDependencies,
    pub kernel: Arc<ServerKernel>,
    pub stack: DispatchStack,
    pub trigger: DispatchTrigger,
    pub trigger_rx: mpsc::Receiver<DispatchEvent>,
}

pub fn harness() -> TestHarness {
    harness_with(test_config())
}

pub fn harness_with(config: Config) -> TestHarness {
    let deps = TestDependencies::with_config(config);
    let kernel = deps.kernel();
    let (trigger, trigger_rx) = DispatchTrigger::channel();
    let stack = build_dispatch_stack(&kernel, trigger.clone());

    TestHarness {
        deps,
        kernel,
        stack,
        trigger,
        trigger_rx,
    }
}

/// Test defaults with a webhook target so notifications are observable.
pub fn test_config() -> Config {
    let mut config = Config::for_tests();
    config.webhook_notification_url = Some("https://hooks.example.com/runs".to_string());
    config
}

impl TestHarness {
    pub fn add_machine(&self, name: &str, capacity: i32) -> Machine {
        let machine = Machine::builder()
            .name(name)
            .kind(MachineKind::Classic)
            .endpoint(format!("http://{}:8188", name))
            .capacity(capacity)
            .build();
        self.deps.machines.insert(machine.clone());
        machine
    }

    pub fn add_group_machine(
        &self,
        name: &str,
        group_id: Uuid,
        current_queue: i32,
        capacity: i32,
    ) -> Machine {
        let mut machine = Machine::builder()
            .name(name)
            .kind(MachineKind::Classic)
            .endpoint(format!("http://{}:8188", name))
            .current_queue(current_queue)
            .capacity(capacity)
            .machine_group_id(group_id)
            .build();
        if current_queue > 0 {
            machine.operational_status = OperationalStatus::Busy;
        }
        self.deps.machines.insert(machine.clone());
        machine
    }

    pub fn seed_workflow_version(&self) -> WorkflowVersion {
        let version = WorkflowVersion {
            id: Uuid::new_v4(),
            workflow_id: Uuid::new_v4(),
            version: 1,
            workflow: None,
            workflow_api: json!({
                "1": {
                    "class_type": "ComfyUIDeployExternalText",
                    "inputs": { "input_id": "prompt", "default_value": "a cat" }
                },
                "2": {
                    "class_type": "KSampler",
                    "inputs": { "seed": 7 }
                }
            }),
            created_at: Utc::now(),
        };
        self.deps.repository.insert_workflow_version(version.clone());
        version
    }

    pub fn seed_deployment_for_machine(
        &self,
        machine_id: Uuid,
        version: &WorkflowVersion,
    ) -> Deployment {
        let deployment = Deployment {
            id: Uuid::new_v4(),
            workflow_id: version.workflow_id,
            workflow_version_id: version.id,
            machine_id: Some(machine_id),
            machine_group_id: None,
            environment: Environment::Production,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.deps.repository.insert_deployment(deployment.clone());
        deployment
    }

    pub fn seed_deployment_for_group(
        &self,
        group_id: Uuid,
        version: &WorkflowVersion,
    ) -> Deployment {
        let deployment = Deployment {
            id: Uuid::new_v4(),
            workflow_id: version.workflow_id,
            workflow_version_id: version.id,
            machine_id: None,
            machine_group_id: Some(group_id),
            environment: Environment::Production,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.deps.repository.insert_deployment(deployment.clone());
        deployment
    }

    /// Enqueue a run request the way the API edge does.
    pub async fn enqueue_run(&self, deployment_id: Uuid) -> String {
        let request = RunRequest {
            deployment_id,
            inputs: None,
            origin: "http://api.test".to_string(),
            user_id: None,
            org_id: None,
            retry_count: 0,
        };

        self.deps
            .jobs
            .enqueue(
                RUN_QUEUE,
                serde_json::to_value(&request).unwrap(),
                EnqueueOptions {
                    max_attempts: self.deps.config.max_queue_retries,
                    delay_until: None,
                },
            )
            .await
            .unwrap()
    }

    /// A run already executing on `machine`, with the slot admitted.
    pub async fn seed_running_run(&self, machine: &Machine, version: &WorkflowVersion) -> Run {
        use dispatch_core::domains::machines::MachineStore;

        let run = Run::builder()
            .workflow_id(version.workflow_id)
            .workflow_version_id(version.id)
            .machine_id(machine.id)
            .callback_origin("http://api.test")
            .status(RunStatus::Running)
            .started_at(Utc::now())
            .build();
        self.deps.repository.insert_run(&run).await.unwrap();
        assert!(self
            .deps
            .machines
            .try_admit(machine.id, None)
            .await
            .unwrap());
        run
    }

    pub fn machine(&self, id: Uuid) -> Machine {
        self.deps.machines.get(id).expect("machine not seeded")
    }
}
