//! mlship Deployer CLI Entry Point
//!
//! This is the main entry point for the mlship-deploy binary.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use mlship_deployer::config::Config;
use mlship_deployer::deploy::orchestrator::Deployer;
use mlship_deployer::platform::client::PlatformClient;
use mlship_deployer::platform::rest::RestPlatformClient;

#[derive(Parser)]
#[command(name = "mlship-deploy")]
#[command(author, version, about = "mlship Deployer - Publish fine-tuned models as inference endpoints")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/deploy.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the deployment workflow against the configured workspace
    Deploy {
        /// Training job whose output artifact is deployed
        /// (overrides model.training_job in the config)
        #[arg(short, long)]
        job: Option<String>,
    },
    /// Show the configured endpoint and its traffic allocation
    Status,
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Deploy { job } => {
            run_deploy(&cli.config, job.as_deref()).await?;
        }
        Commands::Status => {
            show_status(&cli.config).await?;
        }
        Commands::Version => {
            show_version();
        }
    }

    Ok(())
}

async fn run_deploy(config_path: &PathBuf, job_flag: Option<&str>) -> Result<()> {
    let config = Config::load(config_path)?;
    let job = config.training_job(job_flag)?.to_string();
    info!(workspace = %config.platform.workspace, job = %job, "Configuration loaded");

    let token = config.platform_token()?;
    let client = RestPlatformClient::new(&config.platform, &token)
        .context("Failed to initialize platform client")?;

    let deployer = Deployer::new(Arc::new(client), config);
    match deployer.deploy(&job).await {
        Ok(result) => {
            info!(
                model_id = %result.model.id,
                endpoint = %result.endpoint_name,
                deployment = %result.deployment_name,
                "Deployment succeeded"
            );
            if let Some(uri) = result.scoring_uri {
                println!("Scoring URI: {}", uri);
            }
            Ok(())
        }
        Err(e) => {
            error!(stage = e.stage(), error = %e, "Deployment run failed");
            Err(e.into())
        }
    }
}

async fn show_status(config_path: &PathBuf) -> Result<()> {
    let config = Config::load(config_path)?;
    let token = config.platform_token()?;
    let client = RestPlatformClient::new(&config.platform, &token)
        .context("Failed to initialize platform client")?;

    match client.get_endpoint(&config.endpoint.name).await? {
        Some(endpoint) => {
            println!("Endpoint: {}", endpoint.name);
            println!("  State: {}", endpoint.provisioning_state);
            if let Some(uri) = &endpoint.scoring_uri {
                println!("  Scoring URI: {}", uri);
            }
            if endpoint.traffic.is_empty() {
                println!("  Traffic: (none routed)");
            } else {
                println!("  Traffic:");
                for (deployment, percent) in &endpoint.traffic {
                    println!("    {}: {}%", deployment, percent);
                }
            }
        }
        None => {
            println!("Endpoint '{}' does not exist", config.endpoint.name);
        }
    }

    Ok(())
}

fn show_version() {
    println!("mlship-deploy {}", env!("CARGO_PKG_VERSION"));
    println!("Deployment workflow for managed ML inference endpoints");
    println!();
    println!("Stages:");
    println!("  - Model registration from a completed training job");
    println!("  - Clean endpoint recreation with managed identity");
    println!("  - Deployment create/update with health probes");
    println!("  - Full traffic cutover");
}
