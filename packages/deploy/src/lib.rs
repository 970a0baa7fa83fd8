// ABOUTME: Deployment engine for Boxyard boxes
// ABOUTME: Job queue, step workers, deploy orchestrator, box manager and health reconciliation loop

pub mod error;
pub mod manager;
pub mod orchestrator;
pub mod plan;
pub mod queue;
pub mod reconciler;
pub mod workers;

pub use error::{DeployError, Result};
pub use manager::{validate_subdomain, BoxManager, CreateBoxRequest, DeployProgress};
pub use orchestrator::DeployOrchestrator;
pub use plan::{DeployPlan, PlannedStep, StepTask};
pub use queue::{Job, JobError, JobHandler, JobOptions, JobQueue, LocalQueue, QueueError};
pub use reconciler::{HealthReconciler, SweepReport};
pub use workers::StepWorker;
