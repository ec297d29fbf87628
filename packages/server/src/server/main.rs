// Main entry point for the Conveyor task processor

use std::sync::Arc;

use anyhow::{Context, Result};
use conveyor_core::kernel::handlers::register_builtin_handlers;
use conveyor_core::kernel::jobs::{
    Broker, Dispatcher, DispatcherConfig, HandlerRegistry, JobStore, LifecycleCoordinator,
    MetricsAggregator, PostgresJobStore,
};
use conveyor_core::server::{build_app, AppState};
use conveyor_core::Config;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "{},conveyor_core=debug,sqlx=warn",
                    config.log_level
                ))
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Conveyor task processor");
    tracing::info!(
        redis_host = %config.redis.host,
        "Broker backend: in-memory (Redis settings recognized but inert)"
    );

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.database.pool_size)
        .connect(&config.database.url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    // Wire the kernel
    let mut registry = HandlerRegistry::new();
    register_builtin_handlers(&mut registry, &config.queues);
    let registry = Arc::new(registry);

    let broker = Arc::new(Broker::new(
        registry.configs().map(|c| c.name.clone()).collect::<Vec<_>>(),
    ));
    let store: Arc<dyn JobStore> = Arc::new(PostgresJobStore::new(pool.clone()));
    let lifecycle = Arc::new(
        LifecycleCoordinator::new(store.clone(), broker.clone(), registry.clone()).with_tuning(
            config.engine.backoff_ceiling_ms,
            config.engine.stale_threshold_ms,
        ),
    );
    let metrics = Arc::new(MetricsAggregator::new(store.clone(), broker.clone()));

    // Rebuild broker state from the durable store
    let report = lifecycle
        .recover()
        .await
        .context("Failed to recover durable job state")?;
    tracing::info!(
        requeued = report.requeued,
        parked = report.parked,
        dead = report.dead,
        "Recovery complete"
    );

    // Shutdown wiring: SIGINT / SIGTERM cancel the token
    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    // Start the dispatcher pools
    let dispatcher = Arc::new(Dispatcher::with_config(
        lifecycle.clone(),
        registry.clone(),
        metrics.clone(),
        DispatcherConfig {
            shutdown_grace: std::time::Duration::from_millis(config.engine.shutdown_grace_ms),
            ..DispatcherConfig::default()
        },
    ));
    let dispatcher_handle = tokio::spawn(dispatcher.run(shutdown.clone()));

    // Start the control surface
    let state = AppState {
        lifecycle,
        metrics,
        verbose_errors: config.mode.is_development(),
    };
    let app = build_app(state);

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .context("Server error")?;

    // The HTTP surface is down; make sure the dispatcher drains too
    shutdown.cancel();
    let _ = dispatcher_handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}

fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        tracing::info!("Received shutdown signal");
        shutdown.cancel();
    });
}
