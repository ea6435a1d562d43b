// Prometheus metrics and the worker's health endpoint
use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref JOBS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("scriptbox_jobs_total", "Finished jobs by runtime and status"),
        &["runtime", "status"]
    )
    .expect("invalid scriptbox_jobs_total metric");
    pub static ref JOB_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("scriptbox_job_duration_seconds", "Wall-clock job duration")
            .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
        &["runtime"]
    )
    .expect("invalid scriptbox_job_duration_seconds metric");
    pub static ref CLEANUP_DELETED: IntCounter = IntCounter::new(
        "scriptbox_cleanup_deleted_total",
        "Workspaces removed by the cleanup sweep"
    )
    .expect("invalid scriptbox_cleanup_deleted_total metric");
    pub static ref JOBS_IN_FLIGHT: IntGauge =
        IntGauge::new("scriptbox_jobs_in_flight", "Jobs currently executing")
            .expect("invalid scriptbox_jobs_in_flight metric");
}

/// Register all collectors. Safe to call more than once.
pub fn register() {
    let _ = REGISTRY.register(Box::new(JOBS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_DURATION.clone()));
    let _ = REGISTRY.register(Box::new(CLEANUP_DELETED.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_IN_FLIGHT.clone()));
}

pub fn record_job(runtime: &str, status: &str, seconds: f64) {
    JOBS_TOTAL.with_label_values(&[runtime, status]).inc();
    JOB_DURATION.with_label_values(&[runtime]).observe(seconds);
}

/// Decrements the in-flight gauge when the job is done, however it ends.
pub struct InFlight;

impl InFlight {
    pub fn start() -> Self {
        JOBS_IN_FLIGHT.inc();
        InFlight
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        JOBS_IN_FLIGHT.dec();
    }
}

pub fn render() -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

async fn health() -> &'static str {
    "OK"
}

async fn metrics_handler() -> impl IntoResponse {
    match render() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

pub fn router() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
}

pub async fn serve(addr: String) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!("Metrics server listening on {}", addr);
    if let Err(e) = axum::serve(listener, router()).await {
        error!(error = %e, "Metrics server stopped");
        return Err(e.into());
    }
    Ok(())
}
