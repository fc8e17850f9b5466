//! mlship Deployer Library
//!
//! This crate provides the deployment workflow that publishes a fine-tuned
//! model as a live inference endpoint on a managed ML platform, including
//! the platform client abstraction and its REST implementation.

pub mod config;
pub mod deploy;
pub mod error;
pub mod platform;

// Re-exports for convenience
pub use config::Config;
pub use deploy::orchestrator::{Deployer, DeploymentResult};
pub use error::DeployError;
pub use platform::client::{artifact_path_for_job, Endpoint, PlatformClient, RegisteredModel};
pub use platform::rest::RestPlatformClient;
