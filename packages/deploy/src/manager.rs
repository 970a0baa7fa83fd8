// ABOUTME: Box lifecycle manager: the request-facing entry point over storage, orchestrator and providers
// ABOUTME: Validates create requests, starts and restarts deployments, deletes boxes and serves progress reads

use crate::error::{DeployError, Result};
use crate::orchestrator::DeployOrchestrator;
use boxyard_storage::{BoxRecord, BoxStatus, NewBox, StepNode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Request to create a new box
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBoxRequest {
    pub name: String,
    pub subdomain: String,
    /// Falls back to the manager's default provider
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub skills: Vec<String>,
}

/// Progress of a box's current attempt, shaped for UI rendering
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployProgress {
    pub box_id: String,
    pub status: BoxStatus,
    pub attempt: i64,
    pub error_message: Option<String>,
    pub steps: Vec<StepNode>,
}

pub struct BoxManager {
    orchestrator: Arc<DeployOrchestrator>,
    default_provider: String,
}

impl BoxManager {
    pub fn new(orchestrator: Arc<DeployOrchestrator>, default_provider: impl Into<String>) -> Self {
        Self {
            orchestrator,
            default_provider: default_provider.into(),
        }
    }

    pub fn orchestrator(&self) -> &Arc<DeployOrchestrator> {
        &self.orchestrator
    }

    /// Record a new box and start its first deployment attempt
    pub async fn create_box(&self, request: CreateBoxRequest) -> Result<BoxRecord> {
        let name = request.name.trim();
        if name.is_empty() || name.len() > 100 {
            return Err(DeployError::InvalidRequest(
                "name must be between 1 and 100 characters".to_string(),
            ));
        }

        let subdomain = request.subdomain.trim().to_string();
        validate_subdomain(&subdomain)?;

        let provider = request
            .provider
            .unwrap_or_else(|| self.default_provider.clone());
        if !self.orchestrator.providers().contains(&provider) {
            return Err(DeployError::ProviderNotRegistered(provider));
        }

        let skills = normalize_skills(request.skills)?;

        let record = self
            .orchestrator
            .boxes()
            .create_box(NewBox {
                name: name.to_string(),
                subdomain,
                provider,
                skills,
            })
            .await?;

        info!(
            "Created box {} ({}) on {}",
            record.id, record.subdomain, record.provider
        );

        self.orchestrator.start_deployment(&record.id).await?;
        Ok(self.orchestrator.boxes().get_box(&record.id).await?)
    }

    /// Start a fresh attempt for a box that is `pending` or in `error`
    pub async fn redeploy(&self, box_id: &str) -> Result<i64> {
        let record = self.orchestrator.boxes().get_box(box_id).await?;

        match record.status {
            BoxStatus::Deploying => return Err(DeployError::AlreadyDeploying(box_id.to_string())),
            status if !status.can_transition_to(BoxStatus::Deploying) => {
                return Err(DeployError::InvalidTransition(format!(
                    "box {} is {} and cannot be redeployed",
                    box_id,
                    status.as_str()
                )))
            }
            _ => {}
        }

        let attempt = self.orchestrator.start_deployment(box_id).await?;
        info!("Redeploying box {} as attempt {}", box_id, attempt);
        Ok(attempt)
    }

    /// Soft-delete the box, then release its instance. In-flight steps drain against the deleted record.
    pub async fn delete_box(&self, box_id: &str) -> Result<BoxRecord> {
        let before = self.orchestrator.boxes().mark_deleted(box_id).await?;

        if before.status != BoxStatus::Deleted {
            if let Some(instance_id) = before.instance_id.as_deref() {
                match self.orchestrator.provider_for(&before) {
                    Ok(provider) => {
                        if let Err(e) = provider.destroy(instance_id).await {
                            warn!(
                                "Box {} deleted but instance {} could not be destroyed: {}",
                                box_id, instance_id, e
                            );
                        }
                    }
                    Err(e) => warn!("Cannot release instance of box {}: {}", box_id, e),
                }
            }
        }

        Ok(self.orchestrator.boxes().get_box(box_id).await?)
    }

    pub async fn get_box(&self, box_id: &str) -> Result<BoxRecord> {
        Ok(self.orchestrator.boxes().get_box(box_id).await?)
    }

    pub async fn list_boxes(&self) -> Result<Vec<BoxRecord>> {
        Ok(self.orchestrator.boxes().list_boxes(&[]).await?)
    }

    pub async fn get_status(&self, box_id: &str) -> Result<BoxStatus> {
        Ok(self.orchestrator.boxes().get_status(box_id).await?)
    }

    pub async fn get_deploy_progress(&self, box_id: &str) -> Result<DeployProgress> {
        let record = self.orchestrator.boxes().get_box(box_id).await?;
        let steps = self
            .orchestrator
            .ledger()
            .list_by_attempt(box_id, record.current_attempt)
            .await?;

        Ok(DeployProgress {
            box_id: record.id,
            status: record.status,
            attempt: record.current_attempt,
            error_message: record.error_message,
            steps,
        })
    }

    /// Step tree of any past or current attempt
    pub async fn list_attempt_progress(&self, box_id: &str, attempt: i64) -> Result<Vec<StepNode>> {
        let record = self.orchestrator.boxes().get_box(box_id).await?;
        if attempt < 1 || attempt > record.current_attempt {
            return Err(DeployError::InvalidRequest(format!(
                "box {} has no attempt {}",
                box_id, attempt
            )));
        }
        Ok(self
            .orchestrator
            .ledger()
            .list_by_attempt(box_id, attempt)
            .await?)
    }
}

/// DNS label: 3-63 chars of lowercase alphanumerics and '-', no leading or trailing '-'
pub fn validate_subdomain(subdomain: &str) -> Result<()> {
    let valid_chars = subdomain
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');

    if !(3..=63).contains(&subdomain.len())
        || !valid_chars
        || subdomain.starts_with('-')
        || subdomain.ends_with('-')
    {
        return Err(DeployError::InvalidRequest(format!(
            "invalid subdomain '{}': use 3-63 lowercase letters, digits or '-'",
            subdomain
        )));
    }
    Ok(())
}

fn normalize_skills(skills: Vec<String>) -> Result<Vec<String>> {
    let mut normalized: Vec<String> = Vec::with_capacity(skills.len());
    for skill in skills {
        let skill = skill.trim().to_string();
        if skill.is_empty() || skill.contains(char::is_whitespace) {
            return Err(DeployError::InvalidRequest(format!(
                "invalid skill name '{}'",
                skill
            )));
        }
        if !normalized.contains(&skill) {
            normalized.push(skill);
        }
    }
    Ok(normalized)
}
