mod alarm;
mod config;
mod errors;
mod metrics;
mod model;
mod notify;
mod pipeline;
mod poller;
mod rest;
mod sensor;
mod store;
mod validate;

use crate::alarm::AlarmEngine;
use crate::config::Config;
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::pipeline::Pipeline;
use crate::poller::{Collector, StopOutcome};
use crate::sensor::HttpSensor;
use crate::store::DurableStore;
use anyhow::{Context, Result};
use axum::{routing::get, Router};
use std::sync::Arc;
use tracing::{error, info, warn};

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let config = Config::from_env()?;

    info!("Starting CO collector");
    info!("Sensor: {}{}", config.sensor_address.url(""), config.sensor_path);
    info!(
        "Thresholds: warning={} ppm, danger={} ppm, edge mode {}",
        config.thresholds.warning_level, config.thresholds.danger_level, config.edge_mode
    );
    info!("Measurements: {}", config.measurements_path.display());
    info!("Alarms: {}", config.alarms_path.display());

    metrics::init_metrics();

    let sensor = Arc::new(
        HttpSensor::new(
            config.sensor_address.clone(),
            config.sensor_path.clone(),
            config.sensor_timeout,
        )
        .context("failed to build sensor HTTP client")?,
    );

    let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
        Some(url) => {
            info!("Notifications posted to {}", url);
            Arc::new(WebhookNotifier::new(url.clone())?)
        }
        None => {
            info!("No notification webhook configured, notifications go to the log");
            Arc::new(LogNotifier)
        }
    };

    let pipeline = Arc::new(Pipeline::new(
        sensor.clone(),
        AlarmEngine::new(config.thresholds, config.edge_mode),
        DurableStore::json_lines(
            "measurements",
            config.measurements_path.clone(),
            config.measurement_retention,
        ),
        DurableStore::json_lines("alarms", config.alarms_path.clone(), config.alarm_retention),
        notifier,
        config.notify_recipient.clone(),
    ));

    let collector = Arc::new(Collector::new(pipeline.clone(), config.poll));
    collector.start().await;

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(pipeline, collector.clone(), sensor));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.http_addr))?;
    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    tokio::select! {
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    match collector.stop().await {
        StopOutcome::TimedOut => warn!("Exiting with the collector still finishing its tick"),
        StopOutcome::Stopped | StopOutcome::NotRunning => {}
    }

    info!("Shutting down");
    Ok(())
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
