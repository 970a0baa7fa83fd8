// ABOUTME: Server process configuration read from the environment
// ABOUTME: Bind address, CORS origin, database location and provider/reconciler switches

use boxyard_config::constants::{
    BOXYARD_API_HOST, BOXYARD_API_PORT, BOXYARD_CORS_ORIGIN, BOXYARD_DATABASE_URL,
    BOXYARD_DEFAULT_PROVIDER, BOXYARD_DOCKER_ENABLED, BOXYARD_RECONCILE_ENABLED, DATABASE_URL,
    PORT,
};
use boxyard_config::env::{env_string, parse_env_flag, parse_env_with_fallback};
use boxyard_config::ConfigError;
use boxyard_compute::DOCKER_PROVIDER;
use std::path::PathBuf;

const DEFAULT_PORT: u16 = 4100;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub cors_origin: Option<String>,
    pub database_path: PathBuf,
    pub docker_enabled: bool,
    pub default_provider: String,
    pub reconcile_enabled: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = parse_env_with_fallback(BOXYARD_API_PORT, PORT, DEFAULT_PORT);
        if port == 0 {
            return Err(ConfigError::Invalid(
                "port 0 is not a valid listen port".to_string(),
            ));
        }

        let database_path = env_string(BOXYARD_DATABASE_URL)
            .or_else(|| env_string(DATABASE_URL))
            .map(|url| database_path_from(&url))
            .unwrap_or_else(default_database_path);

        Ok(Self {
            host: env_string(BOXYARD_API_HOST).unwrap_or_else(|| "127.0.0.1".to_string()),
            port,
            cors_origin: env_string(BOXYARD_CORS_ORIGIN),
            database_path,
            docker_enabled: parse_env_flag(BOXYARD_DOCKER_ENABLED, true),
            default_provider: env_string(BOXYARD_DEFAULT_PROVIDER)
                .unwrap_or_else(|| DOCKER_PROVIDER.to_string()),
            reconcile_enabled: parse_env_flag(BOXYARD_RECONCILE_ENABLED, true),
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// `~/.boxyard/boxyard.db`, or the working directory when there is no home
fn default_database_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".boxyard"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("boxyard.db")
}

/// Accepts a bare path or a `sqlite:` URL
fn database_path_from(url: &str) -> PathBuf {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    PathBuf::from(path.split('?').next().unwrap_or(path))
}
