//! Configuration module
//!
//! Handles loading and validating deployer configuration from TOML files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Main configuration structure for the mlship deployer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Platform connection and scope settings
    pub platform: PlatformSettings,

    /// Managed identity bound to the endpoint
    pub identity: IdentitySettings,

    /// Model registration settings
    pub model: ModelSettings,

    /// Endpoint settings
    #[serde(default)]
    pub endpoint: EndpointSettings,

    /// Deployment compute and request-handling settings
    #[serde(default)]
    pub deployment: DeploymentSettings,
}

/// Platform scope and connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformSettings {
    /// Subscription id the workspace lives in
    pub subscription_id: String,

    /// Resource group of the workspace
    pub resource_group: String,

    /// Workspace name
    pub workspace: String,

    /// Management-plane base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// REST API version sent on every request
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Bearer token; falls back to MLSHIP_TOKEN in the environment
    #[serde(default)]
    pub token: Option<String>,

    /// Poll interval for long-running operations, in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Overall wait deadline per long-running operation, in seconds
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
}

/// Managed identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentitySettings {
    /// Full resource id of the user-assigned managed identity
    pub resource_id: String,

    /// Client id of the managed identity
    pub client_id: String,
}

/// Model registration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Name to register the model under
    pub name: String,

    /// Training job whose output artifact is registered.
    /// The operator copies this from the platform's job history;
    /// the --job flag overrides it.
    #[serde(default)]
    pub training_job: Option<String>,
}

/// Endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSettings {
    /// Endpoint name
    #[serde(default = "default_endpoint_name")]
    pub name: String,

    /// Human-readable description shown in the platform UI
    #[serde(default = "default_endpoint_description")]
    pub description: String,
}

/// Deployment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentSettings {
    /// Deployment name
    #[serde(default = "default_deployment_name")]
    pub name: String,

    /// Compute SKU for each instance
    #[serde(default = "default_instance_type")]
    pub instance_type: String,

    /// Number of instances
    #[serde(default = "default_instance_count")]
    pub instance_count: u32,

    /// Environment variables passed to the serving container
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Request-handling limits
    #[serde(default)]
    pub requests: RequestLimits,

    /// Liveness probe settings
    #[serde(default)]
    pub liveness_probe: ProbeLimits,

    /// Readiness probe settings
    #[serde(default)]
    pub readiness_probe: ProbeLimits,
}

/// Request-handling limits for a deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLimits {
    /// Maximum concurrent requests handled per instance
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests_per_instance: u32,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Maximum time a request may wait in the queue, in milliseconds
    #[serde(default = "default_max_queue_wait_ms")]
    pub max_queue_wait_ms: u64,
}

/// Health-probe limits for a deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeLimits {
    /// Consecutive failures before the instance is considered unhealthy
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive successes before the instance is considered healthy
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Seconds between probe attempts
    #[serde(default = "default_probe_period")]
    pub period_secs: u64,

    /// Seconds to wait before the first probe
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,
}

// Default value functions
fn default_base_url() -> String {
    "https://management.azure.com".to_string()
}

fn default_api_version() -> String {
    "2023-10-01".to_string()
}

fn default_poll_interval() -> u64 {
    5
}

fn default_operation_timeout() -> u64 {
    1200
}

fn default_endpoint_name() -> String {
    "mlship-endpoint".to_string()
}

fn default_endpoint_description() -> String {
    "Online endpoint managed by mlship-deploy".to_string()
}

fn default_deployment_name() -> String {
    "default".to_string()
}

fn default_instance_type() -> String {
    "Standard_DS3_v2".to_string()
}

fn default_instance_count() -> u32 {
    1
}

fn default_max_concurrent() -> u32 {
    1
}

fn default_request_timeout_ms() -> u64 {
    90_000
}

fn default_max_queue_wait_ms() -> u64 {
    500
}

fn default_failure_threshold() -> u32 {
    30
}

fn default_success_threshold() -> u32 {
    1
}

fn default_probe_period() -> u64 {
    10
}

fn default_initial_delay() -> u64 {
    10
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            name: default_endpoint_name(),
            description: default_endpoint_description(),
        }
    }
}

impl Default for DeploymentSettings {
    fn default() -> Self {
        Self {
            name: default_deployment_name(),
            instance_type: default_instance_type(),
            instance_count: default_instance_count(),
            env: BTreeMap::new(),
            requests: RequestLimits::default(),
            liveness_probe: ProbeLimits::default(),
            readiness_probe: ProbeLimits::default(),
        }
    }
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_concurrent_requests_per_instance: default_max_concurrent(),
            request_timeout_ms: default_request_timeout_ms(),
            max_queue_wait_ms: default_max_queue_wait_ms(),
        }
    }
}

impl Default for ProbeLimits {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            period_secs: default_probe_period(),
            initial_delay_secs: default_initial_delay(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Resolve the bearer token: config field first, then MLSHIP_TOKEN
    pub fn platform_token(&self) -> Result<String> {
        if let Some(token) = &self.platform.token {
            return Ok(token.clone());
        }
        std::env::var("MLSHIP_TOKEN")
            .context("No platform token configured. Set platform.token or export MLSHIP_TOKEN.")
    }

    /// Resolve the training job reference: --job flag wins over config
    pub fn training_job<'a>(&'a self, flag: Option<&'a str>) -> Result<&'a str> {
        flag.or(self.model.training_job.as_deref()).context(
            "No training job reference. Pass --job or set model.training_job in the config.",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            [platform]
            subscription_id = "sub-1"
            resource_group = "rg-1"
            workspace = "ws-1"

            [identity]
            resource_id = "/subscriptions/sub-1/resourceGroups/rg-1/providers/Microsoft.ManagedIdentity/userAssignedIdentities/mi-1"
            client_id = "11111111-2222-3333-4444-555555555555"

            [model]
            name = "model-a"
        "#
    }

    #[test]
    fn test_parse_minimal_config() {
        let config: Config = toml::from_str(minimal_toml()).unwrap();
        assert_eq!(config.platform.subscription_id, "sub-1");
        assert_eq!(config.platform.base_url, "https://management.azure.com");
        assert_eq!(config.endpoint.name, "mlship-endpoint");
        assert_eq!(config.deployment.name, "default");
        assert_eq!(config.deployment.instance_count, 1);
        assert_eq!(config.deployment.requests.request_timeout_ms, 90_000);
        assert!(config.model.training_job.is_none());
    }

    #[test]
    fn test_parse_full_deployment_section() {
        let toml_content = r#"
            [platform]
            subscription_id = "sub-1"
            resource_group = "rg-1"
            workspace = "ws-1"
            poll_interval_secs = 2

            [identity]
            resource_id = "/subscriptions/sub-1/rg/mi-1"
            client_id = "abc"

            [model]
            name = "model-a"
            training_job = "job-123"

            [endpoint]
            name = "endpoint-a"

            [deployment]
            name = "dep-a"
            instance_type = "Standard_E4s_v3"
            instance_count = 2

            [deployment.env]
            WORKER_COUNT = "1"

            [deployment.liveness_probe]
            failure_threshold = 50
        "#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.platform.poll_interval_secs, 2);
        assert_eq!(config.endpoint.name, "endpoint-a");
        assert_eq!(config.deployment.instance_type, "Standard_E4s_v3");
        assert_eq!(config.deployment.env.get("WORKER_COUNT").unwrap(), "1");
        assert_eq!(config.deployment.liveness_probe.failure_threshold, 50);
        // Untouched probe fields keep their defaults
        assert_eq!(config.deployment.liveness_probe.period_secs, 10);
        assert_eq!(config.deployment.readiness_probe.failure_threshold, 30);
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.model.training_job = Some("job-123".to_string());
        config.deployment.env.insert("WORKER_COUNT".to_string(), "1".to_string());

        let path = std::env::temp_dir().join(format!("mlship-deploy-{}.toml", std::process::id()));
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(loaded.platform.subscription_id, config.platform.subscription_id);
        assert_eq!(loaded.model.training_job.as_deref(), Some("job-123"));
        assert_eq!(loaded.deployment.env.get("WORKER_COUNT").unwrap(), "1");
        assert_eq!(loaded.endpoint.name, config.endpoint.name);
    }

    #[test]
    fn test_training_job_flag_wins() {
        let config: Config = toml::from_str(minimal_toml()).unwrap();
        assert!(config.training_job(None).is_err());
        assert_eq!(config.training_job(Some("job-9")).unwrap(), "job-9");

        let mut config = config;
        config.model.training_job = Some("job-123".to_string());
        assert_eq!(config.training_job(None).unwrap(), "job-123");
        assert_eq!(config.training_job(Some("job-9")).unwrap(), "job-9");
    }
}
