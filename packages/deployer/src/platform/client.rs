//! Platform Client Trait
//!
//! Defines the common interface for managed ML platform clients.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Mapping from deployment name to the percentage of endpoint requests it
/// receives. Entries sum to 100 on a fully routed endpoint.
pub type TrafficMap = BTreeMap<String, u32>;

/// A versioned, platform-tracked reference to a trained model artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredModel {
    pub id: String,
    pub name: String,
    pub version: u64,
    pub artifact_path: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// A named routable resource fronting one or more deployments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub description: String,
    pub identity_resource_id: String,
    pub scoring_uri: Option<String>,
    pub traffic: TrafficMap,
    pub provisioning_state: ProvisioningState,
}

/// Endpoint creation options
#[derive(Debug, Clone)]
pub struct EndpointSpec {
    pub name: String,
    pub description: String,
    pub identity_resource_id: String,
}

/// Deployment creation options
#[derive(Debug, Clone)]
pub struct DeploymentSpec {
    pub name: String,
    pub endpoint_name: String,
    pub model_id: String,
    pub instance_type: String,
    pub instance_count: u32,
    pub env: BTreeMap<String, String>,
    pub requests: RequestSettings,
    pub liveness_probe: ProbeSettings,
    pub readiness_probe: ProbeSettings,
}

/// A concrete compute allocation serving one registered model version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub name: String,
    pub endpoint_name: String,
    pub model_id: String,
    pub instance_type: String,
    pub instance_count: u32,
    pub provisioning_state: ProvisioningState,
}

/// Request-handling limits submitted with a deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSettings {
    pub max_concurrent_requests_per_instance: u32,
    pub request_timeout_ms: u64,
    pub max_queue_wait_ms: u64,
}

/// Health-probe settings submitted with a deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub period_secs: u64,
    pub initial_delay_secs: u64,
}

/// Terminal and in-flight states of a platform resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisioningState {
    Creating,
    Updating,
    Deleting,
    Succeeded,
    Failed,
    Canceled,
    Unknown,
}

impl ProvisioningState {
    /// Whether the platform has stopped working on the resource
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProvisioningState::Succeeded | ProvisioningState::Failed | ProvisioningState::Canceled
        )
    }
}

impl std::fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisioningState::Creating => write!(f, "creating"),
            ProvisioningState::Updating => write!(f, "updating"),
            ProvisioningState::Deleting => write!(f, "deleting"),
            ProvisioningState::Succeeded => write!(f, "succeeded"),
            ProvisioningState::Failed => write!(f, "failed"),
            ProvisioningState::Canceled => write!(f, "canceled"),
            ProvisioningState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Derive the artifact storage path for a completed training job.
///
/// The path layout is fixed by the platform: job outputs land under
/// `outputs/artifacts/paths/model_output`.
pub fn artifact_path_for_job(job_name: &str) -> String {
    format!("azureml://jobs/{}/outputs/artifacts/paths/model_output", job_name)
}

/// Platform client trait - common interface to the managed ML platform.
///
/// Every method that maps to a long-running platform operation blocks until
/// the operation reaches a terminal state; implementations never return with
/// a create/delete still pending.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Register a model artifact under the given name, creating a new version
    async fn register_model(&self, name: &str, artifact_path: &str) -> Result<RegisteredModel>;

    /// Look up an endpoint by name. Absence is `Ok(None)`, not an error.
    async fn get_endpoint(&self, name: &str) -> Result<Option<Endpoint>>;

    /// Delete an endpoint and wait until it is gone
    async fn delete_endpoint(&self, name: &str) -> Result<()>;

    /// Create an endpoint and wait until it is provisioned
    async fn create_endpoint(&self, spec: EndpointSpec) -> Result<Endpoint>;

    /// Create or update a deployment and wait until it is provisioned
    async fn create_or_update_deployment(&self, spec: DeploymentSpec) -> Result<Deployment>;

    /// Replace the endpoint's traffic allocation and wait for the update
    async fn update_traffic(&self, endpoint_name: &str, traffic: TrafficMap) -> Result<Endpoint>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_path_layout() {
        assert_eq!(
            artifact_path_for_job("job-123"),
            "azureml://jobs/job-123/outputs/artifacts/paths/model_output"
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(ProvisioningState::Succeeded.is_terminal());
        assert!(ProvisioningState::Failed.is_terminal());
        assert!(ProvisioningState::Canceled.is_terminal());
        assert!(!ProvisioningState::Creating.is_terminal());
        assert!(!ProvisioningState::Deleting.is_terminal());
    }
}
