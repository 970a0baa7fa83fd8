// ABOUTME: Error type for deployment orchestration and box management
// ABOUTME: Classifies failures as retryable or terminal for the job queue

use crate::queue::{JobError, QueueError};
use boxyard_compute::ProviderError;
use boxyard_storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Box not found: {0}")]
    BoxNotFound(String),

    #[error("Box {0} already has a deployment in progress")]
    AlreadyDeploying(String),

    #[error("Subdomain already taken: {0}")]
    DuplicateSubdomain(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Compute provider not registered: {0}")]
    ProviderNotRegistered(String),

    #[error("Box {0} has no recorded instance")]
    MissingInstance(String),

    #[error("Command exited with code {exit_code}: {stderr}")]
    CommandFailed { exit_code: i64, stderr: String },

    #[error("Instance not healthy yet (running: {running}, healthy: {healthy})")]
    Unhealthy { running: bool, healthy: bool },

    #[error("Step {0} is not settled")]
    NotSettled(String),
}

impl From<StorageError> for DeployError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::BoxNotFound(id) => DeployError::BoxNotFound(id),
            StorageError::AlreadyDeploying(id) => DeployError::AlreadyDeploying(id),
            StorageError::DuplicateSubdomain(s) => DeployError::DuplicateSubdomain(s),
            e @ StorageError::InvalidTransition { .. } => {
                DeployError::InvalidTransition(e.to_string())
            }
            other => DeployError::Storage(other),
        }
    }
}

impl DeployError {
    /// Whether a step failing with this error should be tried again
    pub fn is_retryable(&self) -> bool {
        match self {
            DeployError::Storage(e) => e.is_transient(),
            DeployError::Provider(e) => e.is_retryable(),
            DeployError::Queue(_) => true,
            DeployError::CommandFailed { .. } | DeployError::Unhealthy { .. } => true,
            _ => false,
        }
    }
}

impl From<DeployError> for JobError {
    fn from(error: DeployError) -> Self {
        if error.is_retryable() {
            JobError::Retryable(error.to_string())
        } else {
            JobError::Terminal(error.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, DeployError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_conflicts_are_lifted() {
        let err: DeployError = StorageError::AlreadyDeploying("box_1".into()).into();
        assert!(matches!(err, DeployError::AlreadyDeploying(_)));

        let err: DeployError = StorageError::InvalidTransition {
            box_id: "box_1".into(),
            from: "running".into(),
            to: "deploying".into(),
        }
        .into();
        assert!(matches!(err, DeployError::InvalidTransition(m) if m.contains("running")));
    }

    #[test]
    fn test_job_error_classification() {
        let retry: JobError = DeployError::Provider(ProviderError::Unavailable("503".into())).into();
        assert!(retry.is_retryable());

        let quota: JobError =
            DeployError::Provider(ProviderError::QuotaExceeded("cpu".into())).into();
        assert!(!quota.is_retryable());

        let exit: JobError = DeployError::CommandFailed {
            exit_code: 1,
            stderr: "boom".into(),
        }
        .into();
        assert!(exit.is_retryable());
        assert!(exit.to_string().contains("code 1"));
    }
}
