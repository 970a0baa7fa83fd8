// ABOUTME: Deployment plan: the step tree one attempt walks through, and the task payload each step job carries
// ABOUTME: Derived deterministically from the pipeline configuration and the box's skills

use boxyard_config::{render_command, PipelineConfig, StepKind};
use boxyard_storage::NewStep;
use serde::{Deserialize, Serialize};

pub const CREATE_INSTANCE: &str = "create-instance";
pub const SETUP_GROUP: &str = "setup";
pub const SKILLS_GROUP: &str = "install-skills";
pub const SKILLS_GATE: &str = "skills-gate";
pub const HEALTH_CHECK: &str = "health-check";
pub const ENABLE_ACCESS: &str = "enable-access";
pub const FINALIZE: &str = "finalize";

/// Key of the attempt watchdog job; it has no ledger row
pub const WATCHDOG: &str = "deploy";

/// Payload of one step job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTask {
    pub box_id: String,
    pub attempt: i64,
    pub step_key: String,
    /// Key of the group this step belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_key: Option<String>,
    /// Command run inside the instance, for setup and skill steps
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
}

impl StepTask {
    pub fn new(box_id: &str, attempt: i64, step_key: &str) -> Self {
        Self {
            box_id: box_id.to_string(),
            attempt,
            step_key: step_key.to_string(),
            parent_key: None,
            command: Vec::new(),
        }
    }

    /// Queue job id: `box:attempt:parent/key`
    pub fn job_id(&self) -> String {
        format!(
            "{}:{}:{}/{}",
            self.box_id,
            self.attempt,
            self.parent_key.as_deref().unwrap_or(""),
            self.step_key
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    /// `None` for group parents, which are never enqueued
    pub kind: Option<StepKind>,
    pub key: String,
    pub name: String,
    pub order: i64,
    pub parent_key: Option<String>,
    pub command: Vec<String>,
}

impl PlannedStep {
    fn top(kind: Option<StepKind>, key: &str, name: &str, order: i64) -> Self {
        Self {
            kind,
            key: key.to_string(),
            name: name.to_string(),
            order,
            parent_key: None,
            command: Vec::new(),
        }
    }

    pub fn task(&self, box_id: &str, attempt: i64) -> StepTask {
        StepTask {
            box_id: box_id.to_string(),
            attempt,
            step_key: self.key.clone(),
            parent_key: self.parent_key.clone(),
            command: self.command.clone(),
        }
    }

    /// Ledger identity; `parent_id` is resolved by the caller
    pub fn new_step(&self, box_id: &str, attempt: i64, parent_id: Option<String>) -> NewStep {
        NewStep {
            box_id: box_id.to_string(),
            attempt,
            parent_id,
            step_key: self.key.clone(),
            step_order: self.order,
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeployPlan {
    steps: Vec<PlannedStep>,
}

impl DeployPlan {
    pub fn build(pipeline: &PipelineConfig, skills: &[String]) -> Self {
        let mut steps = vec![PlannedStep::top(
            Some(StepKind::CreateInstance),
            CREATE_INSTANCE,
            "Create instance",
            0,
        )];

        if !pipeline.setup_steps.is_empty() {
            steps.push(PlannedStep::top(None, SETUP_GROUP, "Run setup", 1));
            for (i, setup) in pipeline.setup_steps.iter().enumerate() {
                steps.push(PlannedStep {
                    kind: Some(StepKind::SetupStep),
                    key: setup.key.clone(),
                    name: setup.name.clone(),
                    order: i as i64,
                    parent_key: Some(SETUP_GROUP.to_string()),
                    command: setup.command.clone(),
                });
            }
        }

        if !skills.is_empty() {
            steps.push(PlannedStep::top(None, SKILLS_GROUP, "Install skills", 2));
            for (i, skill) in skills.iter().enumerate() {
                steps.push(PlannedStep {
                    kind: Some(StepKind::InstallSkill),
                    key: skill.clone(),
                    name: format!("Install {}", skill),
                    order: i as i64,
                    parent_key: Some(SKILLS_GROUP.to_string()),
                    command: render_command(&pipeline.skill_install_command, &[("skill", skill)]),
                });
            }
        }

        steps.extend([
            PlannedStep::top(Some(StepKind::SkillsGate), SKILLS_GATE, "Wait for setup and skills", 3),
            PlannedStep::top(Some(StepKind::HealthCheck), HEALTH_CHECK, "Health check", 4),
            PlannedStep::top(Some(StepKind::EnableAccess), ENABLE_ACCESS, "Enable access", 5),
            PlannedStep::top(Some(StepKind::Finalize), FINALIZE, "Finalize", 6),
        ]);

        Self { steps }
    }

    pub fn steps(&self) -> &[PlannedStep] {
        &self.steps
    }

    pub fn top_level(&self) -> impl Iterator<Item = &PlannedStep> {
        self.steps.iter().filter(|s| s.parent_key.is_none())
    }

    pub fn groups(&self) -> impl Iterator<Item = &PlannedStep> {
        self.top_level().filter(|s| s.kind.is_none())
    }

    pub fn children_of<'a>(&'a self, group_key: &'a str) -> impl Iterator<Item = &'a PlannedStep> {
        self.steps
            .iter()
            .filter(move |s| s.parent_key.as_deref() == Some(group_key))
    }

    pub fn find(&self, parent_key: Option<&str>, key: &str) -> Option<&PlannedStep> {
        self.steps
            .iter()
            .find(|s| s.parent_key.as_deref() == parent_key && s.key == key)
    }

    /// The step enqueued when `kind` completes, for the sequential tail of the pipeline
    pub fn successor(&self, kind: StepKind) -> Option<&PlannedStep> {
        let next = match kind {
            StepKind::SkillsGate => HEALTH_CHECK,
            StepKind::HealthCheck => ENABLE_ACCESS,
            StepKind::EnableAccess => FINALIZE,
            _ => return None,
        };
        self.find(None, next)
    }
}
