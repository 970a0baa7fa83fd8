// ABOUTME: Data model for boxes and deployment steps
// ABOUTME: Lifecycle status enums with their transition rules, plus the step tree read model

use crate::error::{Result, StorageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BoxStatus {
    Pending,
    Deploying,
    Running,
    Error,
    Deleted,
}

impl BoxStatus {
    pub const ALL: [BoxStatus; 5] = [
        Self::Pending,
        Self::Deploying,
        Self::Running,
        Self::Error,
        Self::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Deploying => "deploying",
            Self::Running => "running",
            Self::Error => "error",
            Self::Deleted => "deleted",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "deploying" => Ok(Self::Deploying),
            "running" => Ok(Self::Running),
            "error" => Ok(Self::Error),
            "deleted" => Ok(Self::Deleted),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }

    /// Lifecycle state machine. `deleted` is terminal; `error` is reachable from every
    /// other non-terminal state and is the only state besides `pending` that may redeploy.
    pub fn can_transition_to(&self, next: BoxStatus) -> bool {
        use BoxStatus::*;
        match (self, next) {
            (Deleted, _) => false,
            (_, Deleted) => true,
            (Pending, Deploying) | (Error, Deploying) => true,
            (Deploying, Running) => true,
            (Pending, Error) | (Deploying, Error) | (Running, Error) => true,
            _ => false,
        }
    }

    /// Whether a live provider instance is expected to exist in this state
    pub fn expects_live_instance(&self) -> bool {
        matches!(self, Self::Deploying | Self::Running)
    }

    /// Whether traffic may be routed to the box
    pub fn is_routable(&self) -> bool {
        matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoxRecord {
    pub id: String,
    pub name: String,
    pub subdomain: String,
    pub provider: String,

    // Provider-assigned identifiers
    pub instance_id: Option<String>,
    pub instance_url: Option<String>,
    /// Attempt that created the recorded instance
    pub instance_attempt: Option<i64>,

    // Lifecycle
    pub status: BoxStatus,
    pub error_message: Option<String>,
    pub current_attempt: i64,
    pub skills: Vec<String>,
    pub last_health_check: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Fields supplied when a box is first recorded; everything else is derived
#[derive(Debug, Clone)]
pub struct NewBox {
    pub name: String,
    pub subdomain: String,
    pub provider: String,
    pub skills: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Satisfies a dependency: the step either finished or was deliberately not run
    pub fn is_settled_ok(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

/// One ledger row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployStep {
    pub id: String,
    pub box_id: String,
    pub attempt: i64,
    pub parent_id: Option<String>,
    pub step_key: String,
    pub step_order: i64,
    pub name: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub metadata: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
}

/// Identity of a step: unique within (box, attempt, parent)
#[derive(Debug, Clone)]
pub struct NewStep {
    pub box_id: String,
    pub attempt: i64,
    pub parent_id: Option<String>,
    pub step_key: String,
    pub step_order: i64,
    pub name: String,
}

/// Top-level step with its (leaf) children, for progress rendering
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepNode {
    #[serde(flatten)]
    pub step: DeployStep,
    pub children: Vec<DeployStep>,
}

/// Result of the finalize transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// The box moved to `running`
    Activated,
    /// The attempt was no longer current; the box was left untouched
    Stale(BoxStatus),
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidTimestamp(format!("{}: {}", value, e)))
}

pub(crate) fn parse_optional_timestamp(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_timestamp).transpose()
}
