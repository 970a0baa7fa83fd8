// ABOUTME: Common test utilities for deployment integration tests
// ABOUTME: Scripted in-memory compute provider plus a harness wiring storage, queue, workers and manager

#![allow(dead_code)]

use async_trait::async_trait;
use boxyard_compute::{
    ComputeProvider, ExecOutput, InstanceHealth, InstanceSpec, ProviderError, ProviderRegistry,
    ProvisionedInstance,
};
use boxyard_config::{Backoff, PipelineConfig, PolicyTable, SetupCommand, StepKind, StepPolicy};
use boxyard_deploy::{BoxManager, CreateBoxRequest, DeployOrchestrator, LocalQueue};
use boxyard_storage::{connect_in_memory, BoxRecord, BoxStatus, DeployStep, StepNode};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const HEALTHY: InstanceHealth = InstanceHealth {
    running: true,
    healthy: true,
};
pub const UNHEALTHY: InstanceHealth = InstanceHealth {
    running: true,
    healthy: false,
};

#[derive(Default)]
struct FakeState {
    next_id: u32,
    live: HashSet<String>,
    create_calls: u32,
    create_errors: VecDeque<ProviderError>,
    create_delay: Duration,
    inspect_calls: u32,
    health_script: VecDeque<InstanceHealth>,
    inspect_errors: HashMap<String, String>,
    exec_log: Vec<(String, Vec<String>)>,
    exec_delay: Duration,
    /// (argument to match, exit code, remaining failures)
    command_failures: Vec<(String, i64, u32)>,
    destroyed: Vec<String>,
}

/// In-memory provider whose failures and health answers are scripted per test
#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<FakeState>,
    execs_in_flight: AtomicUsize,
    max_execs_in_flight: AtomicUsize,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_creates(&self, errors: Vec<ProviderError>) {
        self.state.lock().unwrap().create_errors.extend(errors);
    }

    pub fn set_create_delay(&self, delay: Duration) {
        self.state.lock().unwrap().create_delay = delay;
    }

    /// Answers for the next inspect calls; afterwards every live instance is healthy
    pub fn script_health(&self, answers: Vec<InstanceHealth>) {
        self.state.lock().unwrap().health_script.extend(answers);
    }

    pub fn fail_inspect(&self, instance_id: &str, message: &str) {
        self.state
            .lock()
            .unwrap()
            .inspect_errors
            .insert(instance_id.to_string(), message.to_string());
    }

    pub fn set_exec_delay(&self, delay: Duration) {
        self.state.lock().unwrap().exec_delay = delay;
    }

    /// Commands containing `arg` exit with `exit_code` for the next `times` runs
    pub fn fail_command(&self, arg: &str, exit_code: i64, times: u32) {
        self.state
            .lock()
            .unwrap()
            .command_failures
            .push((arg.to_string(), exit_code, times));
    }

    pub fn clear_command_failures(&self) {
        self.state.lock().unwrap().command_failures.clear();
    }

    /// Simulate the instance dying outside the system's control
    pub fn kill(&self, instance_id: &str) {
        self.state.lock().unwrap().live.remove(instance_id);
    }

    pub fn create_calls(&self) -> u32 {
        self.state.lock().unwrap().create_calls
    }

    pub fn inspect_calls(&self) -> u32 {
        self.state.lock().unwrap().inspect_calls
    }

    pub fn live_instances(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    pub fn is_live(&self, instance_id: &str) -> bool {
        self.state.lock().unwrap().live.contains(instance_id)
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.state.lock().unwrap().destroyed.clone()
    }

    pub fn exec_log(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().unwrap().exec_log.clone()
    }

    pub fn max_concurrent_execs(&self) -> usize {
        self.max_execs_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComputeProvider for FakeProvider {
    async fn create_instance(
        &self,
        spec: &InstanceSpec,
    ) -> Result<ProvisionedInstance, ProviderError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.create_calls += 1;
            if let Some(err) = state.create_errors.pop_front() {
                return Err(err);
            }
            state.create_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let instance_id = format!("{}-{}", spec.name, state.next_id);
        state.live.insert(instance_id.clone());
        Ok(ProvisionedInstance {
            url: Some(format!("http://{}:{}", instance_id, spec.port)),
            instance_id,
        })
    }

    async fn inspect(&self, instance_id: &str) -> Result<InstanceHealth, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.inspect_calls += 1;
        if let Some(message) = state.inspect_errors.get(instance_id) {
            return Err(ProviderError::Unavailable(message.clone()));
        }
        if !state.live.contains(instance_id) {
            return Err(ProviderError::NotFound(instance_id.to_string()));
        }
        Ok(state.health_script.pop_front().unwrap_or(HEALTHY))
    }

    async fn destroy(&self, instance_id: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        if state.live.remove(instance_id) {
            state.destroyed.push(instance_id.to_string());
        }
        Ok(())
    }

    async fn exec_command(
        &self,
        instance_id: &str,
        command: &[String],
    ) -> Result<ExecOutput, ProviderError> {
        let (delay, failure) = {
            let mut state = self.state.lock().unwrap();
            if !state.live.contains(instance_id) {
                return Err(ProviderError::NotFound(instance_id.to_string()));
            }
            state
                .exec_log
                .push((instance_id.to_string(), command.to_vec()));
            let failure = state
                .command_failures
                .iter_mut()
                .find(|(arg, _, remaining)| *remaining > 0 && command.contains(arg))
                .map(|(_, code, remaining)| {
                    *remaining -= 1;
                    *code
                });
            (state.exec_delay, failure)
        };

        let now = self.execs_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_execs_in_flight.fetch_max(now, Ordering::SeqCst);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.execs_in_flight.fetch_sub(1, Ordering::SeqCst);

        Ok(match failure {
            Some(exit_code) => ExecOutput {
                stdout: String::new(),
                stderr: format!("{} failed", command.join(" ")),
                exit_code,
            },
            None => ExecOutput {
                stdout: format!("ran {}", command.join(" ")),
                stderr: String::new(),
                exit_code: 0,
            },
        })
    }
}

/// Canonical policies on a clock a hundred times faster; the attempt watchdog keeps a generous budget
pub fn fast_policies() -> PolicyTable {
    PolicyTable::default().scaled(0.01).with_policy(
        StepKind::Orchestrator,
        StepPolicy::new(Duration::from_secs(30), 1, Backoff::None, 5),
    )
}

pub fn fast_pipeline() -> PipelineConfig {
    PipelineConfig {
        setup_steps: vec![
            SetupCommand::new("prepare-workspace", "Prepare workspace", &["setup", "workspace"]),
            SetupCommand::new("write-agent-env", "Write agent environment", &["setup", "env"]),
        ],
        skill_install_command: vec!["skills".to_string(), "install".to_string(), "{skill}".to_string()],
        access_command: Some(vec!["access".to_string(), "{host}".to_string()]),
        attempt_poll_interval_ms: 5,
        ..PipelineConfig::default()
    }
}

pub struct Harness {
    pub pool: SqlitePool,
    pub queue: Arc<LocalQueue>,
    pub provider: Arc<FakeProvider>,
    pub orchestrator: Arc<DeployOrchestrator>,
    pub manager: BoxManager,
}

pub async fn harness() -> Harness {
    harness_with(fast_policies(), fast_pipeline()).await
}

pub async fn harness_with(policies: PolicyTable, pipeline: PipelineConfig) -> Harness {
    let pool = connect_in_memory()
        .await
        .expect("Failed to create in-memory database");
    let queue = Arc::new(LocalQueue::new());
    let provider = FakeProvider::new();
    let providers = ProviderRegistry::new().with("fake", provider.clone());

    let orchestrator = Arc::new(DeployOrchestrator::new(
        pool.clone(),
        queue.clone(),
        providers,
        policies,
        pipeline,
    ));
    orchestrator
        .start_workers()
        .await
        .expect("Failed to start workers");

    let manager = BoxManager::new(orchestrator.clone(), "fake");

    Harness {
        pool,
        queue,
        provider,
        orchestrator,
        manager,
    }
}

pub fn request(subdomain: &str, skills: &[&str]) -> CreateBoxRequest {
    CreateBoxRequest {
        name: format!("Box {}", subdomain),
        subdomain: subdomain.to_string(),
        provider: None,
        skills: skills.iter().map(|s| s.to_string()).collect(),
    }
}

/// Poll until the box reaches one of `statuses`
pub async fn wait_for_status(manager: &BoxManager, box_id: &str, statuses: &[BoxStatus]) -> BoxRecord {
    for _ in 0..1000 {
        let record = manager.get_box(box_id).await.expect("box should exist");
        if statuses.contains(&record.status) {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("box {} never reached {:?}", box_id, statuses);
}

/// Poll until no job is queued, delayed or running
pub async fn wait_idle(queue: &LocalQueue) {
    for _ in 0..1000 {
        if queue.active_jobs().await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("queue never drained");
}

pub fn find<'a>(tree: &'a [StepNode], key: &str) -> &'a StepNode {
    tree.iter()
        .find(|node| node.step.step_key == key)
        .unwrap_or_else(|| panic!("step {} missing", key))
}

pub fn all_steps(tree: &[StepNode]) -> Vec<DeployStep> {
    tree.iter()
        .flat_map(|node| std::iter::once(node.step.clone()).chain(node.children.iter().cloned()))
        .collect()
}
