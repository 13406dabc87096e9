//! Relayflow server
//!
//! This binary:
//! - Connects to `PostgreSQL` and applies the outbox schema
//! - Connects to Redis Streams
//! - Runs the outbox relay in the background
//! - Serves the dead-letter admin API, `/metrics` and `/health`
//!
//! # Usage
//!
//! ```bash
//! DATABASE_URL=postgres://... REDIS_URL=redis://... cargo run --bin relayflow-server
//! ```

mod config;

use anyhow::Context;
use config::Config;
use relayflow_core::environment::SystemClock;
use relayflow_postgres::{PostgresOutboxStore, Schema};
use relayflow_redis::RedisStreamTransport;
use relayflow_runtime::{DeadLetterAdmin, OutboxRelay, PipelineMetrics, PrometheusExporter};
use relayflow_web::AppState;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relayflow=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    info!(
        schema = %config.postgres.schema,
        redis = %config.redis.url,
        address = %config.bind_address(),
        "Configuration loaded"
    );

    let schema = Schema::new(config.postgres.schema.clone()).context("invalid OUTBOX_SCHEMA")?;
    let pool = relayflow_postgres::connect(&config.postgres.url, config.postgres.max_connections)
        .await
        .context("connecting to PostgreSQL")?;
    relayflow_postgres::migrate(&pool, &schema)
        .await
        .context("applying migrations")?;

    let transport = Arc::new(
        RedisStreamTransport::new(&config.redis.url)
            .await
            .context("connecting to Redis")?,
    );
    let prometheus = PrometheusExporter::install().context("installing metrics recorder")?;
    let metrics = Arc::new(PipelineMetrics::new());
    let clock = Arc::new(SystemClock);
    let store = Arc::new(PostgresOutboxStore::new(pool, schema));

    let relay_config = config.relay_config();
    let dlq_stream = relay_config.dlq_stream.clone();
    let (relay, shutdown_tx) = OutboxRelay::new(
        store.clone(),
        transport.clone(),
        clock.clone(),
        Arc::clone(&metrics),
        relay_config,
    );
    let relay_handle = tokio::spawn(relay.run());

    let admin = DeadLetterAdmin::new(store.clone(), store, transport, clock, metrics, dlq_stream);
    let app = relayflow_web::router(AppState::new(admin, prometheus));

    let listener = tokio::net::TcpListener::bind(config.bind_address())
        .await
        .with_context(|| format!("binding {}", config.bind_address()))?;
    info!(address = %config.bind_address(), "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("HTTP server stopped, stopping outbox relay");
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(config.shutdown_timeout(), relay_handle).await {
        Ok(Ok(())) => info!("Outbox relay stopped gracefully"),
        Ok(Err(e)) => warn!(error = %e, "Outbox relay task failed"),
        Err(_) => warn!(
            timeout_secs = config.server.shutdown_timeout,
            "Outbox relay shutdown timed out"
        ),
    }

    info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C signal"),
        () = terminate => info!("Received SIGTERM signal"),
    }
}
