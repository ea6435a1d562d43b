mod cleanup;
mod config;
mod metrics;
mod pipeline;
mod runtime;
mod sandbox;
mod workspace;

#[cfg(test)]
mod sandbox_tests;

use cleanup::CleanupSweeper;
use config::WorkerConfig;
use pipeline::JobContext;
use runtime::Runtime;
use scriptbox_common::execution_log::ExecutionLogStore;
use scriptbox_common::redis;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::Semaphore;
use tracing::{error, info, instrument, warn};
use workspace::WorkspaceManager;

/// How long shutdown waits for in-flight jobs before giving up on them.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Scriptbox worker booting...");

    let config = WorkerConfig::load_default().map_err(|e| {
        error!("Failed to load worker configuration: {:#}", e);
        error!("Check SCRIPTBOX_CONFIG or config/worker.json");
        e
    })?;

    let workspaces = WorkspaceManager::new(&config.outputs_dir);
    workspaces.ensure_root()?;
    let logs = Arc::new(ExecutionLogStore::open(&config.logs_dir)?);
    info!(
        outputs = %workspaces.root().display(),
        logs = %config.logs_dir.display(),
        "Storage ready"
    );

    // No backend, no service
    let runtime = Runtime::initialize(&config).await.map_err(|e| {
        error!("No execution runtime available: {:#}", e);
        e
    })?;
    info!(runtime = %runtime.kind(), image = %config.runner_image, "Execution runtime ready");

    metrics::register();
    let metrics_addr = config.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = metrics::serve(metrics_addr).await {
            error!(error = %e, "Metrics endpoint unavailable");
        }
    });

    let sweeper = Arc::new(CleanupSweeper::new(
        &config.outputs_dir,
        config.output_retention(),
    ));
    let _sweep_task = sweeper.spawn_periodic(config.cleanup_interval());
    info!(
        interval_secs = config.cleanup_interval_secs,
        retention_minutes = config.output_retention_minutes,
        "Output cleanup scheduled"
    );

    let client = ::redis::Client::open(config.redis_url.as_str())?;
    let redis_conn = ::redis::aio::ConnectionManager::new(client).await?;
    info!("Connected to Redis: {}", config.redis_url);

    let ctx = Arc::new(JobContext {
        runtime,
        workspaces,
        logs,
        default_timeout: config.default_timeout(),
    });
    let slots = Arc::new(Semaphore::new(config.max_concurrent_jobs));

    // Setup graceful shutdown
    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        warn!("Received shutdown signal, draining in-flight jobs...");
    };

    tokio::select! {
        _ = worker_loop(redis_conn, Arc::clone(&ctx), Arc::clone(&slots)) => {},
        _ = shutdown => {},
    }

    let capacity = config.max_concurrent_jobs as u32;
    match tokio::time::timeout(DRAIN_TIMEOUT, slots.acquire_many(capacity)).await {
        Ok(_) => info!("All in-flight jobs finished"),
        Err(_) => warn!(
            in_flight = metrics::JOBS_IN_FLIGHT.get(),
            "Drain timed out, abandoning in-flight jobs"
        ),
    }

    info!("Worker shutdown complete");
    Ok(())
}

/// Pull jobs while a concurrency slot is free. A slot is taken before the
/// pop so a job never leaves the queue unless it can start right away.
#[instrument(skip_all, fields(runtime = %ctx.runtime.kind()))]
async fn worker_loop(
    mut redis_conn: ::redis::aio::ConnectionManager,
    ctx: Arc<JobContext>,
    slots: Arc<Semaphore>,
) -> anyhow::Result<()> {
    loop {
        let permit = Arc::clone(&slots).acquire_owned().await?;

        // BLPOP with 5 second timeout for graceful shutdown
        match redis::pop_job(&mut redis_conn, 5.0).await {
            Ok(Some(job)) => {
                let job_id = job.id;
                info!(
                    job_id = %job_id,
                    timeout_secs = ?job.timeout_secs,
                    has_image = job.input_image.is_some(),
                    code_size = job.code.len(),
                    "Received job"
                );

                let ctx = Arc::clone(&ctx);
                let mut conn = redis_conn.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let _in_flight = metrics::InFlight::start();

                    let response = pipeline::process_job(ctx, job).await;

                    // Persist result to Redis
                    match redis::store_result(&mut conn, &response).await {
                        Ok(()) => info!(job_id = %job_id, "Result persisted to Redis"),
                        Err(e) => {
                            // Non-fatal - worker continues
                            error!(job_id = %job_id, error = %e, "Failed to persist result");
                        }
                    }
                });
            }
            Ok(None) => {
                // Timeout - check for shutdown
                continue;
            }
            Err(e) => {
                error!(error = %e, "Redis error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
