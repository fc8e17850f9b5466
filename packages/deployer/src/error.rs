//! Deployment error taxonomy
//!
//! Each variant corresponds to one stage of the deploy workflow, so a failed
//! run tells the operator exactly which stage to inspect before re-running.

use thiserror::Error;

/// Errors surfaced by the deploy workflow.
///
/// Every variant aborts the run at its stage; later stages are never
/// attempted. Re-running after fixing the cause is always safe because each
/// stage converges rather than accumulates.
#[derive(Debug, Error)]
pub enum DeployError {
    /// The job reference did not resolve to a registrable artifact.
    /// Not retried automatically: this is a configuration or job-readiness
    /// problem the operator has to fix.
    #[error("model registration failed: {0}")]
    Registration(#[source] anyhow::Error),

    /// The platform rejected an endpoint delete or create.
    #[error("endpoint operation failed: {0}")]
    EndpointOperation(#[source] anyhow::Error),

    /// The platform rejected the deployment create/update.
    #[error("deployment operation failed: {0}")]
    DeploymentOperation(#[source] anyhow::Error),

    /// Reading or writing the traffic allocation failed. The deployment is
    /// live at this point but receives no traffic.
    #[error("traffic update failed: {0}")]
    TrafficUpdate(#[source] anyhow::Error),
}

impl DeployError {
    /// Stable stage code, used in log lines
    pub fn stage(&self) -> &'static str {
        match self {
            DeployError::Registration(_) => "register_model",
            DeployError::EndpointOperation(_) => "ensure_endpoint",
            DeployError::DeploymentOperation(_) => "create_deployment",
            DeployError::TrafficUpdate(_) => "shift_traffic",
        }
    }
}
