// ABOUTME: Resilience policy table for every deployment step kind
// ABOUTME: Timeouts, attempt limits, backoff and concurrency are data, loaded from JSON over canonical defaults

use crate::constants::BOXYARD_POLICY_FILE;
use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Kind of unit of work in the deployment pipeline. Each kind has its own queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    CreateInstance,
    SetupStep,
    HealthCheck,
    InstallSkill,
    EnableAccess,
    Finalize,
    SkillsGate,
    /// The whole-attempt watchdog task.
    Orchestrator,
}

impl StepKind {
    pub const ALL: [StepKind; 8] = [
        StepKind::CreateInstance,
        StepKind::SetupStep,
        StepKind::HealthCheck,
        StepKind::InstallSkill,
        StepKind::EnableAccess,
        StepKind::Finalize,
        StepKind::SkillsGate,
        StepKind::Orchestrator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateInstance => "create-instance",
            Self::SetupStep => "setup-step",
            Self::HealthCheck => "health-check",
            Self::InstallSkill => "install-skill",
            Self::EnableAccess => "enable-access",
            Self::Finalize => "finalize",
            Self::SkillsGate => "skills-gate",
            Self::Orchestrator => "orchestrator",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        StepKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ConfigError::Invalid(format!("Unknown step kind: {}", s)))
    }
}

/// Delay schedule between attempts of a retryable failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    None,
    Exponential { base_ms: u64 },
}

impl Backoff {
    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential {
            base_ms: base.as_millis() as u64,
        }
    }

    /// Delay before the next try after `attempts_made` failed attempts (1-based).
    /// Exponential backoff doubles from the base: base, 2*base, 4*base, ...
    pub fn delay_after(&self, attempts_made: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Exponential { base_ms } => {
                let exponent = attempts_made.saturating_sub(1).min(20);
                Duration::from_millis(base_ms.saturating_mul(1u64 << exponent))
            }
        }
    }
}

/// Declared resilience behavior of one step kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPolicy {
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub concurrency: usize,
}

impl StepPolicy {
    pub fn new(timeout: Duration, max_attempts: u32, backoff: Backoff, concurrency: usize) -> Self {
        Self {
            timeout_ms: timeout.as_millis() as u64,
            max_attempts,
            backoff,
            concurrency,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retries(&self) -> bool {
        self.max_attempts > 1
    }

    fn validate(&self, kind: StepKind) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid(format!("{}: timeout must be > 0", kind)));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid(format!(
                "{}: max_attempts must be >= 1",
                kind
            )));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid(format!(
                "{}: concurrency must be >= 1",
                kind
            )));
        }
        Ok(())
    }
}

/// The pipeline's single source of truth for retry, timeout and concurrency behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PolicyTable {
    policies: HashMap<StepKind, StepPolicy>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        let secs = Duration::from_secs;
        let exp = |base: u64| Backoff::exponential(secs(base));

        let policies = HashMap::from([
            (StepKind::CreateInstance, StepPolicy::new(secs(120), 3, exp(30), 5)),
            (StepKind::SetupStep, StepPolicy::new(secs(180), 3, exp(10), 10)),
            (StepKind::HealthCheck, StepPolicy::new(secs(120), 5, exp(10), 10)),
            (StepKind::InstallSkill, StepPolicy::new(secs(180), 2, exp(5), 5)),
            (StepKind::EnableAccess, StepPolicy::new(secs(30), 3, exp(10), 10)),
            (StepKind::Finalize, StepPolicy::new(secs(30), 1, Backoff::None, 10)),
            (StepKind::SkillsGate, StepPolicy::new(secs(30), 1, Backoff::None, 10)),
            (StepKind::Orchestrator, StepPolicy::new(secs(900), 1, Backoff::None, 5)),
        ]);

        Self { policies }
    }
}

impl PolicyTable {
    /// Parse a JSON object keyed by step kind. Kinds not mentioned keep their canonical policy.
    pub fn from_json(json: &str) -> Result<Self> {
        let overrides: HashMap<StepKind, StepPolicy> = serde_json::from_str(json)?;
        let mut table = Self::default();
        for (kind, policy) in overrides {
            policy.validate(kind)?;
            debug!("Overriding {} policy: {:?}", kind, policy);
            table.policies.insert(kind, policy);
        }
        Ok(table)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_json(&json)
    }

    /// Load from `BOXYARD_POLICY_FILE` if set, otherwise use the canonical table
    pub fn from_env() -> Result<Self> {
        match crate::env::env_string(BOXYARD_POLICY_FILE) {
            Some(path) => {
                info!("Loading step policies from {}", path);
                Self::load(path)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn get(&self, kind: StepKind) -> StepPolicy {
        // Every kind is populated by Default and overrides only replace entries.
        self.policies
            .get(&kind)
            .copied()
            .unwrap_or_else(|| Self::default().policies[&kind])
    }

    pub fn with_policy(mut self, kind: StepKind, policy: StepPolicy) -> Self {
        self.policies.insert(kind, policy);
        self
    }

    /// Scale every timeout and backoff by the same factor; used to run the pipeline on a short clock
    pub fn scaled(&self, factor: f64) -> Self {
        let scale = |ms: u64| ((ms as f64 * factor).round() as u64).max(1);
        let policies = self
            .policies
            .iter()
            .map(|(kind, policy)| {
                let backoff = match policy.backoff {
                    Backoff::None => Backoff::None,
                    Backoff::Exponential { base_ms } => Backoff::Exponential {
                        base_ms: scale(base_ms),
                    },
                };
                (
                    *kind,
                    StepPolicy {
                        timeout_ms: scale(policy.timeout_ms),
                        backoff,
                        ..*policy
                    },
                )
            })
            .collect();
        Self { policies }
    }
}
