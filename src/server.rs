use crate::error::AppError;
use axum::{
    extract::State,
    http::header::CONTENT_TYPE,
    response::{
        Html,
        IntoResponse,
        Response,
    },
    routing::get,
    Router,
};
use ecs_exporter_collector::{
    metrics::render,
    Exporter,
};
use eyre::{
    bail,
    Context as _,
    Result,
};
use prometheus::{
    GaugeVec,
    Opts,
    Registry,
};
use std::{
    sync::Arc,
    time::Instant,
};

const BUILD_INFO: &str = "ecs_exporter_build_info";
const HEALTH_PATH: &str = "/healthz";

#[derive(Clone)]
pub struct AppState {
    exporter: Arc<Exporter>,
    build_info: Registry,
    telemetry_path: Arc<str>,
}

/// The version the binary was built from as a constant gauge.
fn build_info_registry() -> Result<Registry> {
    let registry = Registry::new();
    let gauge = GaugeVec::new(
        Opts::new(
            BUILD_INFO,
            "A metric with a constant '1' value labeled by version from which ecs_exporter was built.",
        ),
        &["version"],
    )
    .context("Invalid build info metric")?;
    gauge.with_label_values(&[env!("CARGO_PKG_VERSION")]).set(1.0);
    registry
        .register(Box::new(gauge))
        .context("Failed to register build info metric")?;
    Ok(registry)
}

pub fn create_router(exporter: Arc<Exporter>, telemetry_path: &str) -> Result<Router> {
    if telemetry_path == "/" || telemetry_path == HEALTH_PATH {
        bail!("Telemetry path {telemetry_path} collides with a built-in route");
    }

    let state = AppState {
        exporter,
        build_info: build_info_registry()?,
        telemetry_path: telemetry_path.into(),
    };

    Ok(Router::new()
        .route(telemetry_path, get(metrics))
        .route("/", get(landing))
        .route(HEALTH_PATH, get(healthz))
        .with_state(state))
}

async fn metrics(State(state): State<AppState>) -> Result<Response, AppError> {
    let started = Instant::now();
    let result = state.exporter.scrape().await;

    let mut families = state.exporter.render(&result.samples).map_err(AppError::Render)?;
    families.extend(state.build_info.gather());
    let body = render::encode_text(&families).map_err(AppError::Render)?;

    debug!(
        success = result.success,
        samples = result.samples.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Metrics retrieved"
    );
    Ok(([(CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response())
}

async fn landing(State(state): State<AppState>) -> Html<String> {
    Html(format!(
        "<html>\n\
         <head><title>ECS Exporter</title></head>\n\
         <body>\n\
         <h1>ECS Exporter</h1>\n\
         <p><a href='{}'>Metrics</a></p>\n\
         </body>\n\
         </html>\n",
        state.telemetry_path
    ))
}

async fn healthz() -> &'static str {
    "ok"
}
