// ABOUTME: Step workers: one job handler per step kind, each doing a single unit of provisioning work
// ABOUTME: Workers move their ledger row pending -> running -> completed and defer failure bookkeeping to the orchestrator

use crate::error::{DeployError, Result};
use crate::orchestrator::DeployOrchestrator;
use crate::plan::StepTask;
use crate::queue::{Job, JobError, JobHandler};
use async_trait::async_trait;
use boxyard_compute::{ComputeProvider, InstanceSpec};
use boxyard_config::{render_command, StepKind};
use boxyard_storage::{BoxRecord, DeployStep, FinalizeOutcome, StepStatus};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Bytes of stdout/stderr kept in step metadata
const OUTPUT_TAIL_BYTES: usize = 4096;

pub(crate) fn decode_task(job: &Job) -> std::result::Result<StepTask, JobError> {
    serde_json::from_value(job.payload.clone())
        .map_err(|e| JobError::Terminal(format!("invalid payload for job {}: {}", job.id, e)))
}

/// Last `max_bytes` of `text`, cut on a char boundary
fn tail(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

pub struct StepWorker {
    kind: StepKind,
    orchestrator: Arc<DeployOrchestrator>,
}

impl StepWorker {
    pub fn new(kind: StepKind, orchestrator: Arc<DeployOrchestrator>) -> Self {
        Self { kind, orchestrator }
    }

    async fn run(&self, task: &StepTask) -> Result<()> {
        let orch = &self.orchestrator;
        let step = orch.resolve_step(task).await?;

        match step.status {
            StepStatus::Completed => {
                // Re-delivered after completion (e.g. a crash before the callback ran)
                debug!("{} already completed; resuming pipeline", task.job_id());
                return orch.on_step_completed(self.kind, task).await;
            }
            StepStatus::Failed | StepStatus::Skipped => {
                debug!("{} already {}; nothing to do", task.job_id(), step.status.as_str());
                return Ok(());
            }
            StepStatus::Pending | StepStatus::Running => {}
        }

        if !orch
            .boxes()
            .is_attempt_active(&task.box_id, task.attempt)
            .await?
        {
            if step.status == StepStatus::Pending {
                orch.ledger().mark_skipped(&step.id).await?;
            } else {
                let reason = "deployment attempt is no longer active";
                orch.ledger().mark_failed(&step.id, reason).await?;
                // A group cannot complete once one of its children failed
                if let Some(parent_id) = &step.parent_id {
                    orch.ledger().mark_failed(parent_id, reason).await?;
                }
            }
            return Ok(());
        }

        let resumed = step.status == StepStatus::Running;
        orch.ledger().mark_running(&step.id).await?;
        info!(
            "Running step '{}' for box {} (attempt {})",
            step.name, task.box_id, task.attempt
        );

        let record = orch.boxes().get_box(&task.box_id).await?;

        if self.kind == StepKind::Finalize {
            self.finalize(&record, task, &step).await?;
        } else {
            let metadata = match self.kind {
                StepKind::CreateInstance => self.create_instance(&record, task, resumed).await?,
                StepKind::SetupStep | StepKind::InstallSkill => {
                    self.run_command(&record, &task.command).await?
                }
                StepKind::HealthCheck => self.health_check(&record).await?,
                StepKind::EnableAccess => self.enable_access(&record).await?,
                StepKind::SkillsGate => self.skills_gate(&record, task).await?,
                StepKind::Finalize | StepKind::Orchestrator => {
                    return Err(DeployError::InvalidRequest(format!(
                        "{} is not a step worker kind",
                        self.kind
                    )))
                }
            };
            orch.ledger().mark_completed(&step.id, Some(metadata)).await?;
        }

        orch.on_step_completed(self.kind, task).await
    }

    fn instance_of<'a>(&self, record: &'a BoxRecord) -> Result<&'a str> {
        record
            .instance_id
            .as_deref()
            .ok_or_else(|| DeployError::MissingInstance(record.id.clone()))
    }

    async fn create_instance(
        &self,
        record: &BoxRecord,
        task: &StepTask,
        resumed: bool,
    ) -> Result<JsonValue> {
        let provider = self.orchestrator.provider_for(record)?;
        let pipeline = self.orchestrator.pipeline();
        let name = format!("box-{}-a{}", record.subdomain, task.attempt);

        // Whatever instance is recorded belongs to an earlier try; replace it
        if let Some(previous) = record.instance_id.as_deref() {
            destroy_quietly(provider.as_ref(), previous).await;
        }
        if resumed {
            destroy_quietly(provider.as_ref(), &name).await;
        }

        let host = pipeline.public_host(&record.subdomain);
        let spec = InstanceSpec {
            name,
            image: pipeline.image.clone(),
            env_vars: HashMap::from([
                ("BOXYARD_BOX_ID".to_string(), record.id.clone()),
                ("BOXYARD_SUBDOMAIN".to_string(), record.subdomain.clone()),
                ("BOXYARD_PUBLIC_HOST".to_string(), host),
            ]),
            labels: HashMap::from([
                ("boxyard.box.id".to_string(), record.id.clone()),
                ("boxyard.box.attempt".to_string(), task.attempt.to_string()),
            ]),
            port: pipeline.agent_port,
        };

        let instance = provider.create_instance(&spec).await?;

        let recorded = self
            .orchestrator
            .boxes()
            .record_instance(
                &record.id,
                task.attempt,
                &instance.instance_id,
                instance.url.as_deref(),
            )
            .await?;

        if !recorded {
            warn!(
                "Box {} attempt {} is no longer active; discarding instance {}",
                record.id, task.attempt, instance.instance_id
            );
            destroy_quietly(provider.as_ref(), &instance.instance_id).await;
            return Ok(json!({ "instance_id": instance.instance_id, "discarded": true }));
        }

        Ok(json!({ "instance_id": instance.instance_id, "url": instance.url }))
    }

    async fn run_command(&self, record: &BoxRecord, command: &[String]) -> Result<JsonValue> {
        let provider = self.orchestrator.provider_for(record)?;
        let instance_id = self.instance_of(record)?;

        let output = provider.exec_command(instance_id, command).await?;
        if !output.success() {
            return Err(DeployError::CommandFailed {
                exit_code: output.exit_code,
                stderr: tail(&output.stderr, 512).trim().to_string(),
            });
        }

        Ok(json!({
            "exit_code": output.exit_code,
            "stdout": tail(&output.stdout, OUTPUT_TAIL_BYTES),
            "stderr": tail(&output.stderr, OUTPUT_TAIL_BYTES),
        }))
    }

    async fn health_check(&self, record: &BoxRecord) -> Result<JsonValue> {
        let provider = self.orchestrator.provider_for(record)?;
        let instance_id = self.instance_of(record)?;

        let health = provider.inspect(instance_id).await?;
        if !health.is_live_and_healthy() {
            return Err(DeployError::Unhealthy {
                running: health.running,
                healthy: health.healthy,
            });
        }

        Ok(json!({ "running": health.running, "healthy": health.healthy }))
    }

    async fn enable_access(&self, record: &BoxRecord) -> Result<JsonValue> {
        let pipeline = self.orchestrator.pipeline();
        let host = pipeline.public_host(&record.subdomain);

        if let Some(template) = &pipeline.access_command {
            let command = render_command(
                template,
                &[("host", host.as_str()), ("subdomain", record.subdomain.as_str())],
            );
            self.run_command(record, &command).await?;
        }

        Ok(json!({ "host": host, "url": format!("https://{}", host) }))
    }

    /// Join point: every setup and skill child must have settled
    async fn skills_gate(&self, record: &BoxRecord, task: &StepTask) -> Result<JsonValue> {
        let ledger = self.orchestrator.ledger();
        let plan = self.orchestrator.plan_for(record);
        let mut summary = serde_json::Map::new();

        for group in plan.groups() {
            let parent = ledger
                .find_step(&task.box_id, task.attempt, None, &group.key)
                .await?
                .ok_or_else(|| DeployError::NotSettled(group.key.clone()))?;
            let children = ledger.list_children(&parent.id).await?;
            if let Some(open) = children.iter().find(|c| !c.status.is_settled_ok()) {
                return Err(DeployError::NotSettled(format!("{}/{}", group.key, open.step_key)));
            }
            summary.insert(group.key.clone(), json!(children.len()));
        }

        Ok(JsonValue::Object(summary))
    }

    async fn finalize(&self, record: &BoxRecord, task: &StepTask, step: &DeployStep) -> Result<()> {
        let metadata = json!({ "instance_id": record.instance_id });
        let outcome = self
            .orchestrator
            .boxes()
            .complete_deployment(&task.box_id, task.attempt, &step.id, metadata)
            .await?;

        if let FinalizeOutcome::Stale(status) = outcome {
            info!(
                "Finalize for box {} attempt {} did not activate the box (now {})",
                task.box_id,
                task.attempt,
                status.as_str()
            );
        }
        Ok(())
    }
}

async fn destroy_quietly(provider: &dyn ComputeProvider, instance_id: &str) {
    if let Err(e) = provider.destroy(instance_id).await {
        warn!("Failed to destroy instance {}: {}", instance_id, e);
    }
}

#[async_trait]
impl JobHandler for StepWorker {
    async fn handle(&self, job: &Job) -> std::result::Result<(), JobError> {
        let task = decode_task(job)?;
        self.run(&task).await.map_err(|e| {
            debug!("{} attempt {} failed: {}", job.id, job.attempts_made, e);
            JobError::from(e)
        })
    }

    async fn on_failed(&self, job: &Job, error: &JobError) {
        let Ok(task) = decode_task(job) else {
            warn!("Dropping failure of job {} with unreadable payload", job.id);
            return;
        };

        if let Err(e) = self
            .orchestrator
            .record_step_failure(&task, &error.to_string())
            .await
        {
            tracing::error!("Failed to record failure of {}: {}", job.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_keeps_short_text() {
        assert_eq!(tail("hello", 10), "hello");
    }

    #[test]
    fn test_tail_cuts_on_char_boundary() {
        let text = "aé".repeat(10);
        let cut = tail(&text, 5);
        assert!(cut.len() <= 5);
        assert!(text.ends_with(cut));
    }
}
