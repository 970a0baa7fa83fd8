// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Boxyard

// Server Configuration
pub const BOXYARD_API_PORT: &str = "BOXYARD_API_PORT";
pub const BOXYARD_API_HOST: &str = "BOXYARD_API_HOST";
pub const PORT: &str = "PORT"; // Legacy
pub const BOXYARD_CORS_ORIGIN: &str = "BOXYARD_CORS_ORIGIN";

// Database
pub const BOXYARD_DATABASE_URL: &str = "BOXYARD_DATABASE_URL";
pub const DATABASE_URL: &str = "DATABASE_URL"; // Legacy

// Pipeline Configuration
pub const BOXYARD_POLICY_FILE: &str = "BOXYARD_POLICY_FILE";
pub const BOXYARD_PIPELINE_FILE: &str = "BOXYARD_PIPELINE_FILE";
pub const BOXYARD_AGENT_IMAGE: &str = "BOXYARD_AGENT_IMAGE";
pub const BOXYARD_BASE_DOMAIN: &str = "BOXYARD_BASE_DOMAIN";

// Health Reconciliation
pub const BOXYARD_RECONCILE_ENABLED: &str = "BOXYARD_RECONCILE_ENABLED";
pub const BOXYARD_RECONCILE_INTERVAL_SECS: &str = "BOXYARD_RECONCILE_INTERVAL_SECS";

// Compute Providers
pub const BOXYARD_DOCKER_ENABLED: &str = "BOXYARD_DOCKER_ENABLED";
pub const BOXYARD_DEFAULT_PROVIDER: &str = "BOXYARD_DEFAULT_PROVIDER";
