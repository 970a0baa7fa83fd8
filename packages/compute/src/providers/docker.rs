// ABOUTME: Docker provider running each box instance as a local container
// ABOUTME: Uses bollard to create, inspect, exec into and remove labelled agent containers

use super::{
    ComputeProvider, ExecOutput, InstanceHealth, InstanceSpec, ProviderError, ProvisionedInstance,
    Result,
};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, LogOutput,
        RemoveContainerOptions, StartContainerOptions,
    },
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    models::{ContainerState, HealthStatusEnum},
    Docker,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

const LABEL_PREFIX: &str = "boxyard.box";

/// Registry name of this backend
pub const DOCKER_PROVIDER: &str = "docker";

pub struct DockerProvider {
    client: Docker,
    /// Timeout for image pull operations
    pull_timeout: Duration,
}

impl DockerProvider {
    /// Connect with the default socket/env settings and a 10 minute pull timeout
    pub fn new() -> Result<Self> {
        let client =
            Docker::connect_with_defaults().map_err(|e| ProviderError::Connection(e.to_string()))?;
        Ok(Self::with_client(client, Duration::from_secs(600)))
    }

    pub fn with_client(client: Docker, pull_timeout: Duration) -> Self {
        Self {
            client,
            pull_timeout,
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        match self.client.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(map_docker_error(e)),
        }

        info!("Pulling image: {} (timeout: {:?})", image, self.pull_timeout);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);

        let pull = async {
            while let Some(result) = stream.next().await {
                let progress = result.map_err(map_docker_error)?;
                if let Some(error) = progress.error {
                    return Err(ProviderError::InvalidConfig(format!(
                        "Failed to pull image {}: {}",
                        image, error
                    )));
                }
                if let Some(status) = progress.status {
                    debug!("Pull status: {}", status);
                }
            }
            Ok(())
        };

        match tokio::time::timeout(self.pull_timeout, pull).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(format!(
                "pulling image {} exceeded {:?}",
                image, self.pull_timeout
            ))),
        }
    }
}

/// Bollard container config for one box instance
fn container_config(spec: &InstanceSpec) -> Config<String> {
    let mut labels = spec.labels.clone();
    labels.insert(format!("{}.managed", LABEL_PREFIX), "true".to_string());
    labels.insert(format!("{}.name", LABEL_PREFIX), spec.name.clone());

    let mut env: Vec<String> = spec
        .env_vars
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    env.sort();

    let exposed_ports = HashMap::from([(format!("{}/tcp", spec.port), HashMap::new())]);

    Config {
        image: Some(spec.image.clone()),
        env: Some(env),
        labels: Some(labels),
        exposed_ports: Some(exposed_ports),
        ..Default::default()
    }
}

/// Running, and either reporting healthy or carrying no healthcheck at all
fn health_from_state(state: &ContainerState) -> InstanceHealth {
    let running = state.running.unwrap_or(false);
    let healthy = match state.health.as_ref().and_then(|h| h.status.clone()) {
        Some(HealthStatusEnum::HEALTHY) => true,
        Some(HealthStatusEnum::STARTING) | Some(HealthStatusEnum::UNHEALTHY) => false,
        Some(HealthStatusEnum::NONE) | Some(HealthStatusEnum::EMPTY) | None => true,
    };

    InstanceHealth {
        running,
        healthy: running && healthy,
    }
}

fn map_docker_error(error: bollard::errors::Error) -> ProviderError {
    use bollard::errors::Error;

    match error {
        Error::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            404 => ProviderError::NotFound(message),
            400 => ProviderError::InvalidConfig(message),
            409 => ProviderError::Instance(message),
            500..=599 => ProviderError::Unavailable(message),
            _ => ProviderError::Instance(format!("{}: {}", status_code, message)),
        },
        Error::RequestTimeoutError => ProviderError::Timeout("Docker request timed out".to_string()),
        Error::IOError { err } => ProviderError::Connection(err.to_string()),
        other => ProviderError::Network(other.to_string()),
    }
}

#[async_trait]
impl ComputeProvider for DockerProvider {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<ProvisionedInstance> {
        info!("Creating container: {}", spec.name);

        self.ensure_image(&spec.image).await?;

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let container = self
            .client
            .create_container(Some(options), container_config(spec))
            .await
            .map_err(map_docker_error)?;

        debug!("Created container: {}", container.id);

        self.client
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(map_docker_error)?;

        let inspect = self
            .client
            .inspect_container(&container.id, None::<InspectContainerOptions>)
            .await
            .map_err(map_docker_error)?;

        let url = inspect
            .network_settings
            .and_then(|ns| ns.ip_address)
            .filter(|ip| !ip.is_empty())
            .map(|ip| format!("http://{}:{}", ip, spec.port));

        Ok(ProvisionedInstance {
            instance_id: container.id,
            url,
        })
    }

    async fn inspect(&self, instance_id: &str) -> Result<InstanceHealth> {
        let inspect = self
            .client
            .inspect_container(instance_id, None::<InspectContainerOptions>)
            .await
            .map_err(map_docker_error)?;

        Ok(inspect
            .state
            .as_ref()
            .map(health_from_state)
            .unwrap_or(InstanceHealth {
                running: false,
                healthy: false,
            }))
    }

    async fn destroy(&self, instance_id: &str) -> Result<()> {
        info!("Removing container: {}", instance_id);

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self
            .client
            .remove_container(instance_id, Some(options))
            .await
            .map_err(map_docker_error)
        {
            Ok(()) => Ok(()),
            Err(ProviderError::NotFound(_)) => {
                warn!("Container {} already gone", instance_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn exec_command(&self, instance_id: &str, command: &[String]) -> Result<ExecOutput> {
        info!("Executing command in container {}: {:?}", instance_id, command);

        let exec_config = CreateExecOptions {
            cmd: Some(command.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(instance_id, exec_config)
            .await
            .map_err(map_docker_error)?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        match self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(map_docker_error)?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(msg) = output.next().await {
                    match msg.map_err(map_docker_error)? {
                        LogOutput::StdOut { message } | LogOutput::Console { message } => {
                            stdout.extend_from_slice(&message)
                        }
                        LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                        LogOutput::StdIn { .. } => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(ProviderError::Instance(
                    "Exec was detached unexpectedly".to_string(),
                ))
            }
        }

        let exec_inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(map_docker_error)?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: exec_inspect.exit_code.unwrap_or(-1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::Health;

    fn state(running: bool, health: Option<HealthStatusEnum>) -> ContainerState {
        ContainerState {
            running: Some(running),
            health: health.map(|status| Health {
                status: Some(status),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_container_config_labels_and_port() {
        let spec = InstanceSpec {
            name: "box-alpha-a1".to_string(),
            image: "agent:latest".to_string(),
            env_vars: HashMap::from([("BOXYARD_SUBDOMAIN".to_string(), "alpha".to_string())]),
            labels: HashMap::new(),
            port: 8080,
        };

        let config = container_config(&spec);

        assert_eq!(config.image.as_deref(), Some("agent:latest"));
        assert_eq!(config.env, Some(vec!["BOXYARD_SUBDOMAIN=alpha".to_string()]));
        let labels = config.labels.unwrap();
        assert_eq!(labels.get("boxyard.box.managed").map(String::as_str), Some("true"));
        assert!(config.exposed_ports.unwrap().contains_key("8080/tcp"));
    }

    #[test]
    fn test_health_mapping() {
        assert_eq!(
            health_from_state(&state(true, None)),
            InstanceHealth { running: true, healthy: true }
        );
        assert_eq!(
            health_from_state(&state(true, Some(HealthStatusEnum::STARTING))),
            InstanceHealth { running: true, healthy: false }
        );
        assert_eq!(
            health_from_state(&state(true, Some(HealthStatusEnum::HEALTHY))),
            InstanceHealth { running: true, healthy: true }
        );
        assert_eq!(
            health_from_state(&state(false, Some(HealthStatusEnum::HEALTHY))),
            InstanceHealth { running: false, healthy: false }
        );
    }

    #[test]
    fn test_docker_errors_are_classified() {
        let not_found = map_docker_error(bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container".to_string(),
        });
        assert!(not_found.is_not_found());

        let server = map_docker_error(bollard::errors::Error::DockerResponseServerError {
            status_code: 503,
            message: "daemon busy".to_string(),
        });
        assert!(server.is_retryable());

        let bad_request = map_docker_error(bollard::errors::Error::DockerResponseServerError {
            status_code: 400,
            message: "bad image".to_string(),
        });
        assert!(!bad_request.is_retryable());
    }
}
