// ABOUTME: Configuration package for Boxyard
// ABOUTME: Environment variables, step policy table and provisioning pipeline settings

pub mod constants;
pub mod env;
pub mod error;
pub mod pipeline;
pub mod policy;

pub use error::{ConfigError, Result};
pub use pipeline::{render_command, PipelineConfig, SetupCommand};
pub use policy::{Backoff, PolicyTable, StepKind, StepPolicy};
