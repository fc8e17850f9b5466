//! Deployment Orchestrator
//!
//! Runs the four-stage workflow that publishes a trained model as a live
//! inference endpoint: register model, ensure clean endpoint, create the
//! deployment, shift all traffic to it.
//!
//! Every stage converges rather than accumulates, so a failed run is retried
//! from the top by the operator. Stages run strictly in order; a failure
//! aborts the run before the next stage is attempted.

use anyhow::anyhow;
use std::sync::Arc;
use tracing::{error, info};

use crate::config::Config;
use crate::error::DeployError;
use crate::platform::client::{
    artifact_path_for_job, DeploymentSpec, Endpoint, EndpointSpec, PlatformClient, ProbeSettings,
    RegisteredModel, RequestSettings, TrafficMap,
};

/// Outcome of a fully successful deployment run
#[derive(Debug, Clone)]
pub struct DeploymentResult {
    pub model: RegisteredModel,
    pub endpoint_name: String,
    pub deployment_name: String,
    pub scoring_uri: Option<String>,
}

/// Deployment orchestrator, generic over the platform client so the workflow
/// can run against a mock in tests
pub struct Deployer<C: PlatformClient> {
    client: Arc<C>,
    config: Config,
}

impl<C: PlatformClient> Deployer<C> {
    /// Create a new deployer over an already-authenticated client
    pub fn new(client: Arc<C>, config: Config) -> Self {
        Self { client, config }
    }

    /// Run the full workflow for the given training job reference.
    ///
    /// On success exactly one endpoint with the configured name exists, it has
    /// exactly one deployment with the configured name, and that deployment
    /// receives 100% of traffic.
    pub async fn deploy(&self, job_reference: &str) -> Result<DeploymentResult, DeployError> {
        info!(
            job = %job_reference,
            model = %self.config.model.name,
            endpoint = %self.config.endpoint.name,
            deployment = %self.config.deployment.name,
            "Starting deployment run"
        );

        // Step 1: Register the model artifact
        let model = self.register_model(job_reference).await?;

        // Step 2: Ensure a clean endpoint exists
        self.ensure_clean_endpoint().await?;

        // Step 3: Create or update the deployment behind the endpoint
        self.create_deployment(&model).await?;

        // Step 4: Shift all traffic to the new deployment
        let endpoint = self.shift_traffic().await?;

        info!(
            endpoint = %endpoint.name,
            deployment = %self.config.deployment.name,
            model_id = %model.id,
            "Deployment run completed"
        );

        Ok(DeploymentResult {
            model,
            endpoint_name: endpoint.name,
            deployment_name: self.config.deployment.name.clone(),
            scoring_uri: endpoint.scoring_uri,
        })
    }

    /// Register the job's output artifact as a new model version.
    ///
    /// A failure here is a configuration or job-readiness problem and is not
    /// retried automatically.
    async fn register_model(&self, job_reference: &str) -> Result<RegisteredModel, DeployError> {
        let name = &self.config.model.name;
        let artifact_path = artifact_path_for_job(job_reference);

        info!(model = %name, path = %artifact_path, "Registering model");
        let model = self
            .client
            .register_model(name, &artifact_path)
            .await
            .map_err(|e| {
                error!(model = %name, error = %e, "Model registration failed");
                DeployError::Registration(e)
            })?;
        info!(model_id = %model.id, version = model.version, "Model registered");

        Ok(model)
    }

    /// Delete any pre-existing endpoint of the configured name, then create a
    /// fresh one bound to the configured managed identity.
    ///
    /// Endpoints carry routing and identity state; starting from a clean
    /// slate is what guarantees the single-deployment-at-100% invariant.
    /// Absence of the endpoint is the success condition of the cleanup, so a
    /// not-found lookup is logged at INFO and not treated as a failure.
    async fn ensure_clean_endpoint(&self) -> Result<Endpoint, DeployError> {
        let name = &self.config.endpoint.name;

        match self.client.get_endpoint(name).await {
            Ok(Some(existing)) => {
                info!(
                    endpoint = %name,
                    identity = %existing.identity_resource_id,
                    traffic = ?existing.traffic,
                    "Existing endpoint found, deleting"
                );
                self.client.delete_endpoint(name).await.map_err(|e| {
                    error!(endpoint = %name, error = %e, "Endpoint deletion failed");
                    DeployError::EndpointOperation(e)
                })?;
                info!(endpoint = %name, "Existing endpoint deleted");
            }
            Ok(None) => {
                info!(endpoint = %name, "No existing endpoint, already clean");
            }
            Err(e) => {
                error!(endpoint = %name, error = %e, "Endpoint lookup failed");
                return Err(DeployError::EndpointOperation(e));
            }
        }

        info!(
            endpoint = %name,
            identity = %self.config.identity.resource_id,
            "Creating endpoint"
        );
        let endpoint = self
            .client
            .create_endpoint(EndpointSpec {
                name: name.clone(),
                description: self.config.endpoint.description.clone(),
                identity_resource_id: self.config.identity.resource_id.clone(),
            })
            .await
            .map_err(|e| {
                error!(endpoint = %name, error = %e, "Endpoint creation failed");
                DeployError::EndpointOperation(e)
            })?;
        info!(endpoint = %name, state = %endpoint.provisioning_state, "Endpoint created");

        Ok(endpoint)
    }

    /// Submit the deployment definition and wait for it to provision.
    /// Re-submitting the same definition converges to the same state.
    async fn create_deployment(&self, model: &RegisteredModel) -> Result<(), DeployError> {
        let settings = &self.config.deployment;
        let spec = DeploymentSpec {
            name: settings.name.clone(),
            endpoint_name: self.config.endpoint.name.clone(),
            model_id: model.id.clone(),
            instance_type: settings.instance_type.clone(),
            instance_count: settings.instance_count,
            env: settings.env.clone(),
            requests: RequestSettings {
                max_concurrent_requests_per_instance: settings
                    .requests
                    .max_concurrent_requests_per_instance,
                request_timeout_ms: settings.requests.request_timeout_ms,
                max_queue_wait_ms: settings.requests.max_queue_wait_ms,
            },
            liveness_probe: probe_settings(&settings.liveness_probe),
            readiness_probe: probe_settings(&settings.readiness_probe),
        };

        info!(
            deployment = %settings.name,
            endpoint = %self.config.endpoint.name,
            model_id = %model.id,
            instance_type = %settings.instance_type,
            instance_count = settings.instance_count,
            "Creating deployment"
        );
        let deployment = self
            .client
            .create_or_update_deployment(spec)
            .await
            .map_err(|e| {
                error!(deployment = %settings.name, error = %e, "Deployment creation failed");
                DeployError::DeploymentOperation(e)
            })?;
        info!(
            deployment = %deployment.name,
            state = %deployment.provisioning_state,
            "Deployment created"
        );

        Ok(())
    }

    /// Route 100% of endpoint traffic to the configured deployment.
    ///
    /// On failure the deployment is live but receives no traffic; no rollback
    /// of the prior stages is attempted.
    async fn shift_traffic(&self) -> Result<Endpoint, DeployError> {
        let endpoint_name = &self.config.endpoint.name;
        let deployment_name = &self.config.deployment.name;

        let current = self
            .client
            .get_endpoint(endpoint_name)
            .await
            .map_err(DeployError::TrafficUpdate)?
            .ok_or_else(|| {
                DeployError::TrafficUpdate(anyhow!(
                    "endpoint '{}' not found before traffic update",
                    endpoint_name
                ))
            })?;
        info!(
            endpoint = %endpoint_name,
            traffic = ?current.traffic,
            "Traffic allocation before update"
        );

        let mut traffic = TrafficMap::new();
        traffic.insert(deployment_name.clone(), 100);

        let updated = self
            .client
            .update_traffic(endpoint_name, traffic)
            .await
            .map_err(|e| {
                error!(endpoint = %endpoint_name, error = %e, "Traffic update failed");
                DeployError::TrafficUpdate(e)
            })?;
        info!(
            endpoint = %endpoint_name,
            traffic = ?updated.traffic,
            "Traffic allocation after update"
        );

        Ok(updated)
    }
}

fn probe_settings(limits: &crate::config::ProbeLimits) -> ProbeSettings {
    ProbeSettings {
        failure_threshold: limits.failure_threshold,
        success_threshold: limits.success_threshold,
        period_secs: limits.period_secs,
        initial_delay_secs: limits.initial_delay_secs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    use crate::platform::client::{Deployment, ProvisioningState};

    #[derive(Default)]
    struct MockState {
        models: Vec<RegisteredModel>,
        endpoints: BTreeMap<String, Endpoint>,
        deployments: BTreeMap<(String, String), Deployment>,
        calls: Vec<String>,
        fail_register: bool,
        fail_create_endpoint: bool,
        fail_deployment: bool,
        fail_traffic: bool,
    }

    #[derive(Default)]
    struct MockPlatform {
        state: Mutex<MockState>,
    }

    impl MockPlatform {
        fn calls(&self) -> Vec<String> {
            self.state.lock().calls.clone()
        }

        fn seed_endpoint(&self, name: &str, identity: &str, traffic: &[(&str, u32)]) {
            let mut state = self.state.lock();
            state.endpoints.insert(
                name.to_string(),
                Endpoint {
                    name: name.to_string(),
                    description: "pre-existing".to_string(),
                    identity_resource_id: identity.to_string(),
                    scoring_uri: None,
                    traffic: traffic
                        .iter()
                        .map(|(k, v)| (k.to_string(), *v))
                        .collect(),
                    provisioning_state: ProvisioningState::Succeeded,
                },
            );
        }
    }

    #[async_trait]
    impl PlatformClient for MockPlatform {
        async fn register_model(
            &self,
            name: &str,
            artifact_path: &str,
        ) -> Result<RegisteredModel> {
            let mut state = self.state.lock();
            state.calls.push("register_model".to_string());
            if state.fail_register {
                bail!("job artifact not found");
            }
            let version = state.models.iter().filter(|m| m.name == name).count() as u64 + 1;
            let model = RegisteredModel {
                id: format!("azureml://models/{}/versions/{}", name, version),
                name: name.to_string(),
                version,
                artifact_path: artifact_path.to_string(),
                created_at: None,
            };
            state.models.push(model.clone());
            Ok(model)
        }

        async fn get_endpoint(&self, name: &str) -> Result<Option<Endpoint>> {
            let mut state = self.state.lock();
            state.calls.push("get_endpoint".to_string());
            Ok(state.endpoints.get(name).cloned())
        }

        async fn delete_endpoint(&self, name: &str) -> Result<()> {
            let mut state = self.state.lock();
            state.calls.push("delete_endpoint".to_string());
            state.endpoints.remove(name);
            state
                .deployments
                .retain(|(endpoint, _), _| endpoint != name);
            Ok(())
        }

        async fn create_endpoint(&self, spec: EndpointSpec) -> Result<Endpoint> {
            let mut state = self.state.lock();
            state.calls.push("create_endpoint".to_string());
            if state.fail_create_endpoint {
                bail!("quota exceeded");
            }
            let endpoint = Endpoint {
                name: spec.name.clone(),
                description: spec.description,
                identity_resource_id: spec.identity_resource_id,
                scoring_uri: Some(format!("https://{}.inference.test/score", spec.name)),
                traffic: TrafficMap::new(),
                provisioning_state: ProvisioningState::Succeeded,
            };
            state.endpoints.insert(spec.name, endpoint.clone());
            Ok(endpoint)
        }

        async fn create_or_update_deployment(&self, spec: DeploymentSpec) -> Result<Deployment> {
            let mut state = self.state.lock();
            state.calls.push("create_or_update_deployment".to_string());
            if state.fail_deployment {
                bail!("unsupported instance type");
            }
            if !state.endpoints.contains_key(&spec.endpoint_name) {
                bail!("endpoint '{}' does not exist", spec.endpoint_name);
            }
            let deployment = Deployment {
                name: spec.name.clone(),
                endpoint_name: spec.endpoint_name.clone(),
                model_id: spec.model_id,
                instance_type: spec.instance_type,
                instance_count: spec.instance_count,
                provisioning_state: ProvisioningState::Succeeded,
            };
            state
                .deployments
                .insert((spec.endpoint_name, spec.name), deployment.clone());
            Ok(deployment)
        }

        async fn update_traffic(
            &self,
            endpoint_name: &str,
            traffic: TrafficMap,
        ) -> Result<Endpoint> {
            let mut state = self.state.lock();
            state.calls.push("update_traffic".to_string());
            if state.fail_traffic {
                bail!("traffic update rejected");
            }
            let endpoint = state
                .endpoints
                .get_mut(endpoint_name)
                .ok_or_else(|| anyhow!("endpoint '{}' not found", endpoint_name))?;
            endpoint.traffic = traffic;
            Ok(endpoint.clone())
        }
    }

    fn test_config() -> Config {
        toml::from_str(
            r#"
            [platform]
            subscription_id = "sub-1"
            resource_group = "rg-1"
            workspace = "ws-1"

            [identity]
            resource_id = "/subscriptions/sub-1/identities/mi-new"
            client_id = "client-1"

            [model]
            name = "model-a"

            [endpoint]
            name = "endpoint-a"

            [deployment]
            name = "dep-a"
            "#,
        )
        .unwrap()
    }

    fn deployer(platform: Arc<MockPlatform>) -> Deployer<MockPlatform> {
        Deployer::new(platform, test_config())
    }

    #[tokio::test]
    async fn test_deploy_routes_all_traffic_to_new_deployment() {
        let platform = Arc::new(MockPlatform::default());
        let result = deployer(platform.clone()).deploy("job-123").await.unwrap();

        assert_eq!(
            result.model.artifact_path,
            "azureml://jobs/job-123/outputs/artifacts/paths/model_output"
        );
        assert_eq!(result.endpoint_name, "endpoint-a");
        assert_eq!(result.deployment_name, "dep-a");

        let state = platform.state.lock();
        assert_eq!(state.endpoints.len(), 1);
        assert_eq!(state.deployments.len(), 1);
        let endpoint = state.endpoints.get("endpoint-a").unwrap();
        let expected: TrafficMap = [("dep-a".to_string(), 100)].into_iter().collect();
        assert_eq!(endpoint.traffic, expected);
        let deployment = state
            .deployments
            .get(&("endpoint-a".to_string(), "dep-a".to_string()))
            .unwrap();
        assert_eq!(deployment.model_id, result.model.id);
    }

    #[tokio::test]
    async fn test_deploy_twice_converges() {
        let platform = Arc::new(MockPlatform::default());
        let deployer = deployer(platform.clone());

        deployer.deploy("job-123").await.unwrap();
        let second = deployer.deploy("job-123").await.unwrap();

        // Re-registration created a new version
        assert_eq!(second.model.version, 2);

        let state = platform.state.lock();
        assert_eq!(state.endpoints.len(), 1);
        assert_eq!(state.deployments.len(), 1);
        let expected: TrafficMap = [("dep-a".to_string(), 100)].into_iter().collect();
        assert_eq!(state.endpoints.get("endpoint-a").unwrap().traffic, expected);
    }

    #[tokio::test]
    async fn test_stale_endpoint_fully_replaced() {
        let platform = Arc::new(MockPlatform::default());
        platform.seed_endpoint(
            "endpoint-a",
            "/subscriptions/sub-1/identities/mi-old",
            &[("legacy-dep", 100)],
        );

        deployer(platform.clone()).deploy("job-123").await.unwrap();

        let calls = platform.calls();
        let delete_pos = calls.iter().position(|c| c == "delete_endpoint").unwrap();
        let create_pos = calls.iter().position(|c| c == "create_endpoint").unwrap();
        assert!(delete_pos < create_pos);

        let state = platform.state.lock();
        let endpoint = state.endpoints.get("endpoint-a").unwrap();
        assert_eq!(
            endpoint.identity_resource_id,
            "/subscriptions/sub-1/identities/mi-new"
        );
        // No leftover traffic entry for the old deployment
        let expected: TrafficMap = [("dep-a".to_string(), 100)].into_iter().collect();
        assert_eq!(endpoint.traffic, expected);
    }

    #[tokio::test]
    async fn test_registration_failure_stops_run() {
        let platform = Arc::new(MockPlatform::default());
        platform.state.lock().fail_register = true;

        let err = deployer(platform.clone()).deploy("job-123").await.unwrap_err();
        assert!(matches!(err, DeployError::Registration(_)));
        assert_eq!(err.stage(), "register_model");

        // No endpoint work was attempted
        assert_eq!(platform.calls(), vec!["register_model".to_string()]);
    }

    #[tokio::test]
    async fn test_endpoint_failure_stops_before_deployment() {
        let platform = Arc::new(MockPlatform::default());
        platform.state.lock().fail_create_endpoint = true;

        let err = deployer(platform.clone()).deploy("job-123").await.unwrap_err();
        assert!(matches!(err, DeployError::EndpointOperation(_)));

        let calls = platform.calls();
        assert!(!calls.contains(&"create_or_update_deployment".to_string()));
        assert!(!calls.contains(&"update_traffic".to_string()));
    }

    #[tokio::test]
    async fn test_deployment_failure_stops_before_traffic() {
        let platform = Arc::new(MockPlatform::default());
        platform.state.lock().fail_deployment = true;

        let err = deployer(platform.clone()).deploy("job-123").await.unwrap_err();
        assert!(matches!(err, DeployError::DeploymentOperation(_)));
        assert!(!platform.calls().contains(&"update_traffic".to_string()));
    }

    #[tokio::test]
    async fn test_traffic_failure_leaves_deployment_unrouted() {
        let platform = Arc::new(MockPlatform::default());
        platform.state.lock().fail_traffic = true;

        let err = deployer(platform.clone()).deploy("job-123").await.unwrap_err();
        assert!(matches!(err, DeployError::TrafficUpdate(_)));

        // Deployment exists and is queryable, but no traffic routes to it
        let state = platform.state.lock();
        assert!(state
            .deployments
            .contains_key(&("endpoint-a".to_string(), "dep-a".to_string())));
        let endpoint = state.endpoints.get("endpoint-a").unwrap();
        assert!(!endpoint.traffic.contains_key("dep-a"));
    }
}
