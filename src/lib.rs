//! # ECS Exporter
//!
//! Prometheus exporter for AWS ECS. Wires the configuration, the AWS
//! gatherers and the collector into an HTTP server.

#[macro_use]
extern crate tracing;

pub mod error;
pub mod server;

use color_eyre::Result;
use ecs_exporter_aws::CredentialsProvider;
use ecs_exporter_collector::{
    Exporter,
    ExporterSettings,
};
use ecs_exporter_config::Config;
use eyre::Context as _;
pub use server::{
    create_router,
    AppState,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
    Layer,
};

pub fn init_errors() -> Result<()> {
    color_eyre::install()
}

/// `RUST_LOG` wins over the level picked by `debug`.
pub fn init_logging(debug: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));

    tracing_subscriber::registry()
        .with(fmt::layer().with_filter(filter))
        .with(tracing_error::ErrorLayer::default())
        .try_init()
        .context("Failed to initialize tracing subscriber")
}

pub fn exporter_settings(cfg: &Config) -> ExporterSettings {
    ExporterSettings::new(cfg.aws_region.clone())
        .cluster_filter(cfg.cluster_filter.clone())
        .timeout(cfg.collect_timeout)
        .max_concurrency(cfg.max_concurrency)
        .container_instance_metrics(cfg.container_instance_metrics())
        .instance_cpu_metrics(cfg.instance_cpu_metrics)
}

pub async fn run(cfg: Config) -> Result<()> {
    let credentials = Arc::new(CredentialsProvider::from_env()?);
    info!(source = credentials.source().name(), "Resolved AWS credential source");
    let (gatherer, instance_metrics) = ecs_exporter_aws::gatherers(
        &cfg.aws_region,
        cfg.aws_endpoint.clone(),
        credentials,
        cfg.instance_cpu_metrics && cfg.container_instance_metrics(),
    )?;
    let exporter = Exporter::new(exporter_settings(&cfg), gatherer, instance_metrics)?;
    let app = create_router(Arc::new(exporter), &cfg.telemetry_path)?;

    let address = cfg.socket_addr()?;
    let listener = TcpListener::bind(address)
        .await
        .wrap_err_with(|| format!("Failed to listen on {address}"))?;
    info!(
        region = %cfg.aws_region,
        "Listening on {address}, metrics under {}",
        cfg.telemetry_path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutting down"),
        Err(err) => error!("Failed to listen for the shutdown signal: {err}"),
    }
}
