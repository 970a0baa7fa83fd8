// ABOUTME: Deploy orchestrator: starts attempts, chains step jobs through completion callbacks, aborts on terminal failure
// ABOUTME: Holds no authoritative state; every decision is re-derived from the box record and the step ledger

use crate::error::{DeployError, Result};
use crate::plan::{DeployPlan, PlannedStep, StepTask, CREATE_INSTANCE, SKILLS_GATE, WATCHDOG};
use crate::queue::{Job, JobError, JobHandler, JobQueue};
use crate::workers::{decode_task, StepWorker};
use async_trait::async_trait;
use boxyard_compute::{ComputeProvider, ProviderRegistry};
use boxyard_config::{PipelineConfig, PolicyTable, StepKind};
use boxyard_storage::{
    BoxRecord, BoxStatus, BoxStorage, DeployStep, StepLedger, StepStatus, StorageError,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct DeployOrchestrator {
    boxes: BoxStorage,
    ledger: StepLedger,
    providers: ProviderRegistry,
    queue: Arc<dyn JobQueue>,
    policies: PolicyTable,
    pipeline: PipelineConfig,
}

impl DeployOrchestrator {
    pub fn new(
        pool: SqlitePool,
        queue: Arc<dyn JobQueue>,
        providers: ProviderRegistry,
        policies: PolicyTable,
        pipeline: PipelineConfig,
    ) -> Self {
        Self {
            boxes: BoxStorage::new(pool.clone()),
            ledger: StepLedger::new(pool),
            providers,
            queue,
            policies,
            pipeline,
        }
    }

    pub fn boxes(&self) -> &BoxStorage {
        &self.boxes
    }

    pub fn ledger(&self) -> &StepLedger {
        &self.ledger
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn pipeline(&self) -> &PipelineConfig {
        &self.pipeline
    }

    /// Register a consumer for every job kind, each with its declared concurrency
    pub async fn start_workers(self: &Arc<Self>) -> Result<()> {
        for kind in StepKind::ALL {
            let handler: Arc<dyn JobHandler> = match kind {
                StepKind::Orchestrator => Arc::new(AttemptWatchdog {
                    orchestrator: self.clone(),
                }),
                _ => Arc::new(StepWorker::new(kind, self.clone())),
            };
            self.queue
                .consume(kind, handler, self.policies.get(kind).concurrency)
                .await?;
        }
        info!("Deployment workers started");
        Ok(())
    }

    pub(crate) fn provider_for(&self, record: &BoxRecord) -> Result<Arc<dyn ComputeProvider>> {
        self.providers
            .get(&record.provider)
            .ok_or_else(|| DeployError::ProviderNotRegistered(record.provider.clone()))
    }

    pub(crate) fn plan_for(&self, record: &BoxRecord) -> DeployPlan {
        DeployPlan::build(&self.pipeline, &record.skills)
    }

    /// Open a new attempt for the box and hand it to the watchdog.
    /// Fails with `AlreadyDeploying` while another attempt holds the box's marker.
    pub async fn start_deployment(&self, box_id: &str) -> Result<i64> {
        let attempt = self.boxes.begin_attempt(box_id).await?;

        if let Err(e) = self.launch_attempt(box_id, attempt).await {
            error!(
                "Failed to launch attempt {} for box {}: {}",
                attempt, box_id, e
            );
            self.boxes
                .fail_deployment(box_id, attempt, &format!("deployment failed to start: {}", e))
                .await?;
            return Err(e);
        }

        Ok(attempt)
    }

    /// Hand every attempt that still holds its marker back to a watchdog, e.g. after a restart.
    /// Completed steps re-fire their completion callbacks, so each pipeline picks up where it stopped.
    pub async fn resume_in_flight(&self) -> Result<usize> {
        let mut resumed = 0;
        for record in self.boxes.list_boxes(&[BoxStatus::Deploying]).await? {
            let Some(attempt) = self.boxes.deploy_marker(&record.id).await? else {
                continue;
            };
            match self.launch_attempt(&record.id, attempt).await {
                Ok(()) => {
                    info!("Resumed attempt {} of box {}", attempt, record.id);
                    resumed += 1;
                }
                Err(e) => warn!(
                    "Could not resume attempt {} of box {}: {}",
                    attempt, record.id, e
                ),
            }
        }
        Ok(resumed)
    }

    async fn launch_attempt(&self, box_id: &str, attempt: i64) -> Result<()> {
        let record = self.boxes.get_box(box_id).await?;
        let plan = self.plan_for(&record);

        // Materialise the whole tree up front so progress shows every step and aborts have rows to skip
        for step in plan.top_level() {
            let parent_id = self
                .ledger
                .upsert_step(&step.new_step(box_id, attempt, None))
                .await?;
            for child in plan.children_of(&step.key) {
                self.ledger
                    .upsert_step(&child.new_step(box_id, attempt, Some(parent_id.clone())))
                    .await?;
            }
        }

        let task = StepTask::new(box_id, attempt, WATCHDOG);
        let policy = self.policies.get(StepKind::Orchestrator);
        self.queue
            .enqueue(
                StepKind::Orchestrator,
                &task.job_id(),
                serde_json::to_value(&task)?,
                policy.into(),
            )
            .await?;

        info!(
            "Deployment attempt {} for box {} planned ({} steps)",
            attempt,
            box_id,
            plan.steps().len()
        );
        Ok(())
    }

    /// Enqueue a planned step if its attempt is still current; otherwise skip what never started
    async fn enqueue_step(&self, box_id: &str, attempt: i64, step: &PlannedStep) -> Result<bool> {
        let Some(kind) = step.kind else {
            return Ok(false);
        };

        if !self.boxes.is_attempt_active(box_id, attempt).await? {
            let skipped = self.ledger.skip_pending(box_id, attempt).await?;
            debug!(
                "Attempt {} of box {} no longer active; not enqueuing {} ({} steps skipped)",
                attempt, box_id, step.key, skipped
            );
            return Ok(false);
        }

        let task = step.task(box_id, attempt);
        let queued = self
            .queue
            .enqueue(
                kind,
                &task.job_id(),
                serde_json::to_value(&task)?,
                self.policies.get(kind).into(),
            )
            .await?;
        Ok(queued)
    }

    /// The ledger row a task refers to, created as `pending` if missing
    pub(crate) async fn resolve_step(&self, task: &StepTask) -> Result<DeployStep> {
        let record = self.boxes.get_box(&task.box_id).await?;
        let plan = self.plan_for(&record);

        let planned = plan
            .find(task.parent_key.as_deref(), &task.step_key)
            .ok_or_else(|| {
                DeployError::InvalidRequest(format!("step {} is not part of the plan", task.job_id()))
            })?;

        let parent_id = match task.parent_key.as_deref() {
            Some(parent_key) => {
                let group = plan.find(None, parent_key).ok_or_else(|| {
                    DeployError::InvalidRequest(format!("unknown step group {}", parent_key))
                })?;
                Some(
                    self.ledger
                        .upsert_step(&group.new_step(&task.box_id, task.attempt, None))
                        .await?,
                )
            }
            None => None,
        };

        let id = self
            .ledger
            .upsert_step(&planned.new_step(&task.box_id, task.attempt, parent_id))
            .await?;
        Ok(self.ledger.get_step(&id).await?)
    }

    /// Completion callback: decide what becomes runnable next. Safe to call repeatedly.
    pub(crate) async fn on_step_completed(&self, kind: StepKind, task: &StepTask) -> Result<()> {
        let record = self.boxes.get_box(&task.box_id).await?;
        let plan = self.plan_for(&record);

        match kind {
            StepKind::CreateInstance => self.fan_out(&plan, task).await,
            StepKind::SetupStep | StepKind::InstallSkill => self.child_completed(&plan, task).await,
            StepKind::SkillsGate | StepKind::HealthCheck | StepKind::EnableAccess => {
                if let Some(next) = plan.successor(kind) {
                    self.enqueue_step(&task.box_id, task.attempt, next).await?;
                }
                Ok(())
            }
            StepKind::Finalize | StepKind::Orchestrator => Ok(()),
        }
    }

    async fn fan_out(&self, plan: &DeployPlan, task: &StepTask) -> Result<()> {
        if !self.boxes.is_attempt_active(&task.box_id, task.attempt).await? {
            self.ledger.skip_pending(&task.box_id, task.attempt).await?;
            return Ok(());
        }

        let mut fanned = 0;
        for group in plan.groups() {
            let group_id = self
                .ledger
                .upsert_step(&group.new_step(&task.box_id, task.attempt, None))
                .await?;
            self.ledger.mark_running(&group_id).await?;

            for child in plan.children_of(&group.key) {
                self.enqueue_step(&task.box_id, task.attempt, child).await?;
                fanned += 1;
            }
        }

        if fanned == 0 {
            self.enqueue_gate(plan, task).await
        } else {
            debug!(
                "Box {} attempt {}: fanned out {} setup/skill steps",
                task.box_id, task.attempt, fanned
            );
            Ok(())
        }
    }

    async fn child_completed(&self, plan: &DeployPlan, task: &StepTask) -> Result<()> {
        let Some(parent_key) = task.parent_key.as_deref() else {
            return Ok(());
        };

        let parent = self
            .ledger
            .find_step(&task.box_id, task.attempt, None, parent_key)
            .await?
            .ok_or_else(|| StorageError::StepNotFound(parent_key.to_string()))?;

        if !self.ledger.complete_group_if_settled(&parent.id).await? {
            return Ok(());
        }

        for group in plan.groups() {
            let settled = self
                .ledger
                .find_step(&task.box_id, task.attempt, None, &group.key)
                .await?
                .map(|step| step.status == StepStatus::Completed)
                .unwrap_or(false);
            if !settled {
                return Ok(());
            }
        }

        self.enqueue_gate(plan, task).await
    }

    async fn enqueue_gate(&self, plan: &DeployPlan, task: &StepTask) -> Result<()> {
        if let Some(gate) = plan.find(None, SKILLS_GATE) {
            self.enqueue_step(&task.box_id, task.attempt, gate).await?;
        }
        Ok(())
    }

    /// Record a step's final failure and abort its attempt
    pub(crate) async fn record_step_failure(&self, task: &StepTask, message: &str) -> Result<()> {
        let step = self.resolve_step(task).await?;

        if step.status == StepStatus::Pending {
            self.ledger.mark_running(&step.id).await?;
        }
        self.ledger.mark_failed(&step.id, message).await?;
        if let Some(parent_id) = &step.parent_id {
            self.ledger.mark_failed(parent_id, message).await?;
        }

        let reason = format!("{} failed: {}", step.name, message);
        if self
            .boxes
            .fail_deployment(&task.box_id, task.attempt, &reason)
            .await?
        {
            warn!(
                "Box {} attempt {} aborted: {}",
                task.box_id, task.attempt, reason
            );
        }
        Ok(())
    }

    /// Kick off the attempt, then hold the watchdog job open until the attempt settles.
    /// The job's own timeout bounds the whole attempt.
    async fn watch_attempt(&self, task: &StepTask) -> Result<()> {
        if !self.boxes.is_attempt_active(&task.box_id, task.attempt).await? {
            return Ok(());
        }

        let record = self.boxes.get_box(&task.box_id).await?;
        let plan = self.plan_for(&record);
        if let Some(create) = plan.find(None, CREATE_INSTANCE) {
            self.enqueue_step(&task.box_id, task.attempt, create).await?;
        }

        let poll = self.pipeline.attempt_poll_interval();
        loop {
            tokio::time::sleep(poll).await;
            match self.boxes.is_attempt_active(&task.box_id, task.attempt).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => warn!("Watchdog could not read box {}: {}", task.box_id, e),
            }
        }

        let status = self.boxes.get_status(&task.box_id).await?;
        info!(
            "Deployment attempt {} for box {} settled: {}",
            task.attempt,
            task.box_id,
            status.as_str()
        );
        Ok(())
    }
}

/// Handler for the whole-attempt job
struct AttemptWatchdog {
    orchestrator: Arc<DeployOrchestrator>,
}

#[async_trait]
impl JobHandler for AttemptWatchdog {
    async fn handle(&self, job: &Job) -> std::result::Result<(), JobError> {
        let task = decode_task(job)?;
        self.orchestrator
            .watch_attempt(&task)
            .await
            .map_err(JobError::from)
    }

    async fn on_failed(&self, job: &Job, error: &JobError) {
        let Ok(task) = decode_task(job) else {
            return;
        };

        let reason = match error {
            JobError::Timeout(_) => "deployment timed out".to_string(),
            other => format!("deployment failed: {}", other),
        };

        match self
            .orchestrator
            .boxes
            .fail_deployment(&task.box_id, task.attempt, &reason)
            .await
        {
            Ok(true) => warn!("Box {} attempt {}: {}", task.box_id, task.attempt, reason),
            Ok(false) => {}
            Err(e) => error!(
                "Failed to abort attempt {} of box {}: {}",
                task.attempt, task.box_id, e
            ),
        }
    }
}
