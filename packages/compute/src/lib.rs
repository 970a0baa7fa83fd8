// ABOUTME: Compute provider abstraction for Boxyard box instances
// ABOUTME: Exposes the provider capability trait, a name-keyed registry and the Docker backend

pub mod providers;
pub mod registry;

pub use providers::{
    ComputeProvider, DockerProvider, ExecOutput, InstanceHealth, InstanceSpec, ProviderError,
    ProvisionedInstance, Result,
};
pub use providers::docker::DOCKER_PROVIDER;
pub use registry::ProviderRegistry;
