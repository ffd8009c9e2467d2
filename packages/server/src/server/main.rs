// Main entry point for the durable execution server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keel::{Executor, HandlerRegistry, ToolCallResult, ToolDispatcher, ToolInvocationRecord};
use server_core::server::build_app;
use server_core::{
    Config, JobKernel, Reclaimer, RetryPolicy, Scheduler, SchedulerConfig, SignalSweeper, Worker,
    WorkerConfig,
};

/// Placeholder dispatcher: tool implementations are registered by the
/// embedding application.
struct NoTools;

#[async_trait::async_trait]
impl ToolDispatcher for NoTools {
    async fn call(&self, name: &str, _args: &serde_json::Value) -> Result<ToolCallResult> {
        anyhow::bail!("no tool registered: {name}")
    }

    async fn confirm(
        &self,
        _record: &ToolInvocationRecord,
    ) -> Result<Option<serde_json::Value>> {
        Ok(None)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,keel=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting durable execution server");

    let config = Config::from_env().context("Failed to load configuration")?;

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    let kernel = JobKernel::postgres(pool.clone(), config.lease_ttl);

    // Node handlers and planner wiring belong to the embedding application;
    // the bare server boots with an empty registry.
    let executor = Arc::new(Executor::new(
        Arc::new(HandlerRegistry::new()),
        Arc::new(NoTools),
        kernel.ledger.clone(),
    ));

    let worker = Arc::new(Worker::with_config(
        kernel.clone(),
        executor,
        WorkerConfig {
            heartbeat_interval: config.lease_ttl / 2,
            ..WorkerConfig::default()
        },
        RetryPolicy {
            retry_max: config.retry_max,
            backoff: config.retry_backoff,
        },
    ));

    let scheduler = Scheduler::new(
        kernel.clone(),
        worker,
        SchedulerConfig {
            max_concurrency: config.max_concurrency,
            capabilities: config.worker_capabilities.clone(),
            starvation_threshold: config.starvation_threshold,
            ..SchedulerConfig::default()
        },
    );
    let reclaimer = Reclaimer::new(kernel.clone(), config.lease_ttl / 2);
    let sweeper = SignalSweeper::new(kernel.clone(), Duration::from_secs(2));

    let shutdown = CancellationToken::new();
    let mut services = tokio::task::JoinSet::new();
    services.spawn(scheduler.run(shutdown.clone()));
    services.spawn(reclaimer.run(shutdown.clone()));
    services.spawn(sweeper.run(shutdown.clone()));

    let app = build_app(kernel, Some(pool));
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = server_shutdown.cancelled() => {},
            }
        })
        .await
        .context("Server error")?;

    tracing::info!("Shutting down services...");
    shutdown.cancel();
    while services.join_next().await.is_some() {}
    tracing::info!("Shutdown complete");

    Ok(())
}
