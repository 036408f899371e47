//! AWS Lambda collector extension binary.
//!
//! Runs the telemetry collector alongside the function and subscribes it to
//! the Lambda Telemetry API.
//!
//! # Configuration
//!
//! Extension settings are loaded from (in order of priority):
//! 1. Default values
//! 2. Config file: `/opt/otel-lambda-collector.toml`
//! 3. `AWS_LAMBDA_RUNTIME_API` and `OPENTELEMETRY_COLLECTOR_CONFIG_FILE`
//! 4. Environment variables with the `OTEL_LAMBDA_` prefix
//!
//! The collector itself is configured from the URI in
//! `OPENTELEMETRY_COLLECTOR_CONFIG_FILE`, defaulting to
//! `/opt/collector-config/config.yaml`.

use anyhow::{Context, Result};
use opentelemetry_lambda_collector::{BuildInfo, Config, ExtensionRuntime};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing().context("failed to initialise tracing subscriber")?;

    let build_info = BuildInfo::current();
    tracing::info!(%build_info, "Starting extension");

    let config = Config::load().context("failed to load configuration")?;
    tracing::debug!(?config, "Configuration loaded");

    ExtensionRuntime::new(config)
        .with_build_info(build_info)
        .run()
        .await
        .context("extension runtime failed")?;

    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,opentelemetry_lambda_collector=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).without_time())
        .with(filter)
        .try_init()
        .context("failed to initialise tracing registry")?;

    Ok(())
}
