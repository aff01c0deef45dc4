//! Application entry point for the `beaconflow` ingest service.
//!
//! Startup sequence:
//! - Load configuration from environment variables or `.env`
//! - Initialize structured logging/tracing
//! - Connect the PostgreSQL pool and create the schema if needed
//! - Start the alarm sweeper and the HTTP listener (health and device views)
//! - Run the MQTT ingest loop until SIGINT or SIGTERM
//!
//! # Environment Variables
//! See [`beaconflow::config::load_from_env`] for service settings, plus:
//! - `BEACONFLOW_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `BEACONFLOW_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! Following EMBP, this binary only uses what the library re-exports from
//! its module gateways.
use std::{env, net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::Router;
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use beaconflow::{config, mqtt, routes, run_sweeper, schema, Pipeline, PgStore, TelemetryStore};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    dotenv().ok();
    init_tracing();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_pool_max)
        .acquire_timeout(cfg.db_acquire_timeout())
        .connect(&cfg.db_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;

    tracing::info!("Successfully connected to database");

    schema::create_schema(&pool).await?;

    let store: Arc<dyn TelemetryStore> = Arc::new(PgStore::new(pool.clone()));
    let pipeline = Arc::new(Pipeline::new(Arc::clone(&store)));

    tokio::spawn(run_sweeper(Arc::clone(&store), cfg.alarm_sweep_interval()));

    // Build app from routes gateway (EMBP)
    let app: Router = routes::router(Arc::clone(&store));
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on {}", addr);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "HTTP server stopped");
        }
    });

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let signal = tokio::select! {
        _ = mqtt::run(cfg.mqtt.clone(), pipeline) => "mqtt loop exited",
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    };

    tracing::warn!(signal, "shutting down");
    pool.close().await;

    Ok(())
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// - Color output: `FORCE_COLOR=1|true|yes` forces it on, `0|false|no`
///   forces it off, otherwise it follows TTY detection.
/// - Span events via `BEACONFLOW_SPAN_EVENTS`:
///   - `"full"`       : ENTER, EXIT and CLOSE with timing
///   - `"enter_exit"` : ENTER and EXIT only
///   - unset or other values: CLOSE only (default)
/// - Level: `RUST_LOG` if set, else `BEACONFLOW_LOG_LEVEL` (default `debug`).
///   sqlx statement logging and rumqttc internals are kept quieter.
fn init_tracing() {
    // ---
    let span_events = match env::var("BEACONFLOW_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("BEACONFLOW_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn,rumqttc=info"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
