//! REST Platform Client
//!
//! Implementation of PlatformClient against the managed platform's
//! workspace-scoped REST API using reqwest.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::config::PlatformSettings;
use crate::platform::client::{
    Deployment, DeploymentSpec, Endpoint, EndpointSpec, PlatformClient, ProvisioningState,
    RegisteredModel, TrafficMap,
};

/// REST client scoped to one workspace
pub struct RestPlatformClient {
    client: reqwest::Client,
    base_url: String,
    subscription_id: String,
    resource_group: String,
    workspace: String,
    api_version: String,
    poll_interval: Duration,
    operation_timeout: Duration,
}

impl RestPlatformClient {
    /// Create a client from platform settings and an explicit bearer token.
    ///
    /// Credential acquisition (CLI login, token refresh) is the caller's
    /// responsibility; the client never resolves credentials ambiently.
    pub fn new(settings: &PlatformSettings, token: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token))
                .context("Invalid characters in platform token")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            subscription_id: settings.subscription_id.clone(),
            resource_group: settings.resource_group.clone(),
            workspace: settings.workspace.clone(),
            api_version: settings.api_version.clone(),
            poll_interval: Duration::from_secs(settings.poll_interval_secs),
            operation_timeout: Duration::from_secs(settings.operation_timeout_secs),
        })
    }

    /// Build a workspace-scoped resource URL
    fn workspace_url(&self, suffix: &str) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.MachineLearningServices/workspaces/{}/{}?api-version={}",
            self.base_url,
            self.subscription_id,
            self.resource_group,
            self.workspace,
            suffix,
            self.api_version
        )
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;
        Self::read_body(response).await
    }

    async fn put_json<T: DeserializeOwned, B: Serialize>(&self, url: &str, body: &B) -> Result<T> {
        let response = self
            .client
            .put(url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;
        Self::read_body(response).await
    }

    async fn patch_json<T: DeserializeOwned, B: Serialize>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T> {
        let response = self
            .client
            .patch(url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;
        Self::read_body(response).await
    }

    /// Decode a response, surfacing the platform's error envelope on failure
    async fn read_body<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(&text) {
                bail!("[{}] {}", envelope.error.code, envelope.error.message);
            }
            bail!("Platform request failed with status {}", status);
        }
        response
            .json::<T>()
            .await
            .context("Failed to decode platform response")
    }

    /// Convert the platform's provisioning state string to our enum
    fn parse_state(state: Option<&str>) -> ProvisioningState {
        match state.map(str::to_ascii_lowercase).as_deref() {
            Some("creating") => ProvisioningState::Creating,
            Some("updating") => ProvisioningState::Updating,
            Some("deleting") => ProvisioningState::Deleting,
            Some("succeeded") => ProvisioningState::Succeeded,
            Some("failed") => ProvisioningState::Failed,
            Some("canceled") => ProvisioningState::Canceled,
            _ => ProvisioningState::Unknown,
        }
    }

    /// Poll until the endpoint disappears
    async fn wait_for_endpoint_absent(&self, name: &str) -> Result<()> {
        let deadline = Instant::now() + self.operation_timeout;
        loop {
            if self.get_endpoint(name).await?.is_none() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!("Timed out waiting for endpoint '{}' to be deleted", name);
            }
            debug!(endpoint = %name, "Endpoint still present, polling");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Poll until the endpoint reaches a terminal provisioning state
    async fn wait_for_endpoint_ready(&self, name: &str) -> Result<Endpoint> {
        let deadline = Instant::now() + self.operation_timeout;
        loop {
            let endpoint = self
                .get_endpoint(name)
                .await?
                .with_context(|| format!("Endpoint '{}' disappeared while provisioning", name))?;

            if endpoint.provisioning_state.is_terminal() {
                if endpoint.provisioning_state != ProvisioningState::Succeeded {
                    bail!(
                        "Endpoint '{}' provisioning ended in state {}",
                        name,
                        endpoint.provisioning_state
                    );
                }
                return Ok(endpoint);
            }
            if Instant::now() >= deadline {
                bail!("Timed out waiting for endpoint '{}' to provision", name);
            }
            debug!(endpoint = %name, state = %endpoint.provisioning_state, "Endpoint provisioning, polling");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Poll until the deployment reaches a terminal provisioning state
    async fn wait_for_deployment_ready(
        &self,
        endpoint_name: &str,
        deployment_name: &str,
    ) -> Result<Deployment> {
        let url = self.workspace_url(&format!(
            "onlineEndpoints/{}/deployments/{}",
            endpoint_name, deployment_name
        ));
        let deadline = Instant::now() + self.operation_timeout;
        loop {
            let resource: DeploymentResource = self.get_json(&url).await?;
            let deployment = resource.into_deployment(endpoint_name);

            if deployment.provisioning_state.is_terminal() {
                if deployment.provisioning_state != ProvisioningState::Succeeded {
                    bail!(
                        "Deployment '{}' provisioning ended in state {}",
                        deployment_name,
                        deployment.provisioning_state
                    );
                }
                return Ok(deployment);
            }
            if Instant::now() >= deadline {
                bail!(
                    "Timed out waiting for deployment '{}' to provision",
                    deployment_name
                );
            }
            debug!(
                deployment = %deployment_name,
                state = %deployment.provisioning_state,
                "Deployment provisioning, polling"
            );
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Highest registered version of a model, if any
    async fn latest_model_version(&self, name: &str) -> Result<Option<u64>> {
        let url = self.workspace_url(&format!("models/{}/versions", name));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let list: ResourceList<ModelVersionResource> = Self::read_body(response).await?;
        Ok(list
            .value
            .iter()
            .filter_map(|v| v.name.parse::<u64>().ok())
            .max())
    }
}

#[async_trait]
impl PlatformClient for RestPlatformClient {
    async fn register_model(&self, name: &str, artifact_path: &str) -> Result<RegisteredModel> {
        let version = self.latest_model_version(name).await?.unwrap_or(0) + 1;
        let url = self.workspace_url(&format!("models/{}/versions/{}", name, version));

        let body = ModelVersionRequest {
            properties: ModelVersionRequestProperties {
                model_uri: artifact_path.to_string(),
                model_type: "custom_model".to_string(),
            },
        };

        let resource: ModelVersionResource = self.put_json(&url, &body).await?;
        Ok(RegisteredModel {
            id: resource.id.unwrap_or_else(|| {
                format!(
                    "azureml:/subscriptions/{}/resourceGroups/{}/workspaces/{}/models/{}/versions/{}",
                    self.subscription_id, self.resource_group, self.workspace, name, version
                )
            }),
            name: name.to_string(),
            version,
            artifact_path: resource.properties.model_uri,
            created_at: resource.system_data.and_then(|s| s.created_at),
        })
    }

    async fn get_endpoint(&self, name: &str) -> Result<Option<Endpoint>> {
        let url = self.workspace_url(&format!("onlineEndpoints/{}", name));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resource: EndpointResource = Self::read_body(response).await?;
        Ok(Some(resource.into_endpoint(name)))
    }

    async fn delete_endpoint(&self, name: &str) -> Result<()> {
        let url = self.workspace_url(&format!("onlineEndpoints/{}", name));
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;

        let status = response.status();
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            let text = response.text().await.unwrap_or_default();
            if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(&text) {
                bail!("[{}] {}", envelope.error.code, envelope.error.message);
            }
            bail!("Endpoint delete failed with status {}", status);
        }

        self.wait_for_endpoint_absent(name).await
    }

    async fn create_endpoint(&self, spec: EndpointSpec) -> Result<Endpoint> {
        let url = self.workspace_url(&format!("onlineEndpoints/{}", spec.name));

        let mut identities = BTreeMap::new();
        identities.insert(spec.identity_resource_id.clone(), serde_json::json!({}));

        let body = EndpointRequest {
            identity: IdentityRequest {
                identity_type: "UserAssigned".to_string(),
                user_assigned_identities: identities,
            },
            properties: EndpointRequestProperties {
                description: spec.description.clone(),
                auth_mode: "Key".to_string(),
            },
        };

        let _: EndpointResource = self.put_json(&url, &body).await?;
        self.wait_for_endpoint_ready(&spec.name).await
    }

    async fn create_or_update_deployment(&self, spec: DeploymentSpec) -> Result<Deployment> {
        let url = self.workspace_url(&format!(
            "onlineEndpoints/{}/deployments/{}",
            spec.endpoint_name, spec.name
        ));

        let body = DeploymentRequest {
            properties: DeploymentRequestProperties {
                model: spec.model_id.clone(),
                environment_variables: spec.env.clone(),
                request_settings: RequestSettingsBody {
                    max_concurrent_requests_per_instance: spec
                        .requests
                        .max_concurrent_requests_per_instance,
                    request_timeout: iso8601_seconds_from_ms(spec.requests.request_timeout_ms),
                    max_queue_wait: iso8601_seconds_from_ms(spec.requests.max_queue_wait_ms),
                },
                liveness_probe: ProbeBody::from(&spec.liveness_probe),
                readiness_probe: ProbeBody::from(&spec.readiness_probe),
            },
            sku: SkuBody {
                name: spec.instance_type.clone(),
                capacity: spec.instance_count,
            },
        };

        let _: DeploymentResource = self.put_json(&url, &body).await?;
        self.wait_for_deployment_ready(&spec.endpoint_name, &spec.name)
            .await
    }

    async fn update_traffic(&self, endpoint_name: &str, traffic: TrafficMap) -> Result<Endpoint> {
        let url = self.workspace_url(&format!("onlineEndpoints/{}", endpoint_name));

        let body = TrafficPatchRequest {
            properties: TrafficPatchProperties { traffic },
        };

        let _: EndpointResource = self.patch_json(&url, &body).await?;
        self.wait_for_endpoint_ready(endpoint_name).await
    }
}

/// Encode a millisecond limit as an ISO-8601 duration, keeping sub-second
/// precision (500 → "PT0.5S", 90000 → "PT90S")
fn iso8601_seconds_from_ms(ms: u64) -> String {
    if ms % 1000 == 0 {
        format!("PT{}S", ms / 1000)
    } else {
        format!("PT{}S", ms as f64 / 1000.0)
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ResourceList<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModelVersionRequest {
    properties: ModelVersionRequestProperties,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModelVersionRequestProperties {
    model_uri: String,
    model_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelVersionResource {
    id: Option<String>,
    name: String,
    properties: ModelVersionResourceProperties,
    system_data: Option<SystemData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelVersionResourceProperties {
    model_uri: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SystemData {
    created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EndpointRequest {
    identity: IdentityRequest,
    properties: EndpointRequestProperties,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IdentityRequest {
    #[serde(rename = "type")]
    identity_type: String,
    user_assigned_identities: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EndpointRequestProperties {
    description: String,
    auth_mode: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndpointResource {
    identity: Option<IdentityResource>,
    properties: EndpointResourceProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityResource {
    #[serde(default)]
    user_assigned_identities: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndpointResourceProperties {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    scoring_uri: Option<String>,
    #[serde(default)]
    traffic: BTreeMap<String, u32>,
    #[serde(default)]
    provisioning_state: Option<String>,
}

impl EndpointResource {
    fn into_endpoint(self, name: &str) -> Endpoint {
        let identity_resource_id = self
            .identity
            .and_then(|i| i.user_assigned_identities.keys().next().cloned())
            .unwrap_or_default();

        Endpoint {
            name: name.to_string(),
            description: self.properties.description.unwrap_or_default(),
            identity_resource_id,
            scoring_uri: self.properties.scoring_uri,
            traffic: self.properties.traffic,
            provisioning_state: RestPlatformClient::parse_state(
                self.properties.provisioning_state.as_deref(),
            ),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentRequest {
    properties: DeploymentRequestProperties,
    sku: SkuBody,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentRequestProperties {
    model: String,
    environment_variables: BTreeMap<String, String>,
    request_settings: RequestSettingsBody,
    liveness_probe: ProbeBody,
    readiness_probe: ProbeBody,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestSettingsBody {
    max_concurrent_requests_per_instance: u32,
    request_timeout: String,
    max_queue_wait: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProbeBody {
    failure_threshold: u32,
    success_threshold: u32,
    period: String,
    initial_delay: String,
}

impl From<&crate::platform::client::ProbeSettings> for ProbeBody {
    fn from(probe: &crate::platform::client::ProbeSettings) -> Self {
        Self {
            failure_threshold: probe.failure_threshold,
            success_threshold: probe.success_threshold,
            period: format!("PT{}S", probe.period_secs),
            initial_delay: format!("PT{}S", probe.initial_delay_secs),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SkuBody {
    name: String,
    capacity: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentResource {
    name: String,
    properties: DeploymentResourceProperties,
    #[serde(default)]
    sku: Option<SkuResource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentResourceProperties {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    provisioning_state: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SkuResource {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    capacity: Option<u32>,
}

impl DeploymentResource {
    fn into_deployment(self, endpoint_name: &str) -> Deployment {
        Deployment {
            name: self.name,
            endpoint_name: endpoint_name.to_string(),
            model_id: self.properties.model.unwrap_or_default(),
            instance_type: self
                .sku
                .as_ref()
                .and_then(|s| s.name.clone())
                .unwrap_or_default(),
            instance_count: self.sku.as_ref().and_then(|s| s.capacity).unwrap_or(0),
            provisioning_state: RestPlatformClient::parse_state(
                self.properties.provisioning_state.as_deref(),
            ),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TrafficPatchRequest {
    properties: TrafficPatchProperties,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TrafficPatchProperties {
    traffic: TrafficMap,
}
