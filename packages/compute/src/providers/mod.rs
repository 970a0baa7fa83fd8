// ABOUTME: Compute provider capability consumed by the deployment pipeline and reconciler
// ABOUTME: Create, inspect, destroy and exec against one box instance; errors carry a retry class

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

pub mod docker;

pub use docker::DockerProvider;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Provider timed out: {0}")]
    Timeout(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Instance not found: {0}")]
    NotFound(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Instance error: {0}")]
    Instance(String),
}

impl ProviderError {
    /// Transient failures the job queue may retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Connection(_)
                | ProviderError::Network(_)
                | ProviderError::Timeout(_)
                | ProviderError::Unavailable(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// What to boot for one deployment attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    /// Provider-side instance name, unique per attempt
    pub name: String,
    pub image: String,
    pub env_vars: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    /// Port the agent runtime listens on inside the instance
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedInstance {
    pub instance_id: String,
    pub url: Option<String>,
}

/// Live state as reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceHealth {
    pub running: bool,
    pub healthy: bool,
}

impl InstanceHealth {
    pub fn is_live_and_healthy(&self) -> bool {
        self.running && self.healthy
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Capability interface to a sandbox backend
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Create and start an instance
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<ProvisionedInstance>;

    /// Current liveness/health. Returns `ProviderError::NotFound` when the instance is gone.
    async fn inspect(&self, instance_id: &str) -> Result<InstanceHealth>;

    /// Remove the instance. Destroying an absent instance succeeds.
    async fn destroy(&self, instance_id: &str) -> Result<()>;

    /// Run a command to completion inside a running instance
    async fn exec_command(&self, instance_id: &str, command: &[String]) -> Result<ExecOutput>;
}
