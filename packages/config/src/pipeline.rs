// ABOUTME: Provisioning pipeline settings: agent image, setup commands, skill and access commands
// ABOUTME: Loaded from an optional JSON file and overridable through environment variables

use crate::constants::{
    BOXYARD_AGENT_IMAGE, BOXYARD_BASE_DOMAIN, BOXYARD_PIPELINE_FILE,
    BOXYARD_RECONCILE_INTERVAL_SECS,
};
use crate::env::{env_string, parse_env_or_default_with_validation};
use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// One independent setup command run inside a freshly created instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupCommand {
    pub key: String,
    pub name: String,
    pub command: Vec<String>,
}

impl SetupCommand {
    pub fn new(key: &str, name: &str, command: &[&str]) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Image every box instance boots from
    pub image: String,
    /// Routable host of a box is `<subdomain>.<base_domain>`
    pub base_domain: String,
    /// Port the agent runtime listens on inside the instance
    pub agent_port: u16,
    pub setup_steps: Vec<SetupCommand>,
    /// `{skill}` is replaced with the skill name
    pub skill_install_command: Vec<String>,
    /// `{host}` and `{subdomain}` are replaced; `None` makes enable-access a bookkeeping step
    pub access_command: Option<Vec<String>>,
    /// How often the attempt watchdog re-reads the box while an attempt is in flight
    pub attempt_poll_interval_ms: u64,
    pub reconcile_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            image: "ghcr.io/boxyard/agent-runtime:latest".to_string(),
            base_domain: "boxes.localhost".to_string(),
            agent_port: 8080,
            setup_steps: vec![
                SetupCommand::new(
                    "prepare-workspace",
                    "Prepare workspace",
                    &["mkdir", "-p", "/workspace/.skills"],
                ),
                SetupCommand::new(
                    "write-agent-env",
                    "Write agent environment",
                    &["sh", "-c", "env | grep '^BOXYARD_' > /workspace/.agent-env"],
                ),
            ],
            skill_install_command: ["agent-runtime", "skills", "install", "{skill}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            access_command: Some(
                ["agent-runtime", "access", "enable", "--host", "{host}"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            ),
            attempt_poll_interval_ms: 2_000,
            reconcile_interval_secs: 30,
        }
    }
}

impl PipelineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_json(&json)
    }

    /// File from `BOXYARD_PIPELINE_FILE` (or defaults), then individual env overrides
    pub fn from_env() -> Result<Self> {
        let mut config = match env_string(BOXYARD_PIPELINE_FILE) {
            Some(path) => {
                info!("Loading pipeline configuration from {}", path);
                Self::load(path)?
            }
            None => Self::default(),
        };

        if let Some(image) = env_string(BOXYARD_AGENT_IMAGE) {
            config.image = image;
        }
        if let Some(domain) = env_string(BOXYARD_BASE_DOMAIN) {
            config.base_domain = domain;
        }
        config.reconcile_interval_secs = parse_env_or_default_with_validation(
            BOXYARD_RECONCILE_INTERVAL_SECS,
            config.reconcile_interval_secs,
            |v| (5..=3600).contains(&v),
        );

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(ConfigError::Invalid("image must not be empty".to_string()));
        }
        if self.skill_install_command.is_empty() {
            return Err(ConfigError::Invalid(
                "skill_install_command must not be empty".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for step in &self.setup_steps {
            if step.command.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "setup step '{}' has an empty command",
                    step.key
                )));
            }
            if !seen.insert(step.key.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate setup step key '{}'",
                    step.key
                )));
            }
        }
        if self.attempt_poll_interval_ms == 0 || self.reconcile_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "poll and reconcile intervals must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn public_host(&self, subdomain: &str) -> String {
        format!("{}.{}", subdomain, self.base_domain)
    }

    pub fn attempt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.attempt_poll_interval_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

/// Substitute `{name}` placeholders in every argument of a command template
pub fn render_command(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (name, value)| {
                acc.replace(&format!("{{{}}}", name), value)
            })
        })
        .collect()
}
