use crate::alarm::{AlarmState, EdgeMode};
use crate::errors::{Error, StoreError};
use crate::model::{AlarmsResponse, HistoryResponse, Measurement, Thresholds};
use crate::pipeline::{IngestOutcome, Pipeline};
use crate::poller::{Collector, LoopState};
use crate::sensor::{HttpSensor, ReadingSource, SourceAddress};
use crate::validate;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

const MAX_HISTORY_HOURS: i64 = 168;
const MAX_HISTORY_ROWS: usize = 1000;
const DEFAULT_ALARM_LIMIT: usize = 20;
const MAX_ALARM_LIMIT: usize = 100;

#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
    collector: Arc<Collector>,
    sensor: Arc<HttpSensor>,
}

#[derive(Debug, Deserialize)]
pub struct AlarmsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct SettingsRequest {
    source_address: Option<String>,
    warning_level: Option<f64>,
    danger_level: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct SettingsResponse {
    source_address: SourceAddress,
    thresholds: Thresholds,
}

#[derive(Debug, Serialize)]
pub struct ResetAlarmsResponse {
    status: &'static str,
    message: String,
    reset: usize,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    state: LoopState,
    consecutive_failures: u32,
    source: String,
    source_address: SourceAddress,
    thresholds: Thresholds,
    edge_mode: EdgeMode,
    alarm_states: HashMap<String, AlarmState>,
    measurement_count: usize,
    measurement_retention: usize,
    alarm_count: usize,
    alarm_retention: usize,
    measurements_file: String,
    alarms_file: String,
    timestamp: DateTime<Utc>,
}

pub fn create_router(
    pipeline: Arc<Pipeline>,
    collector: Arc<Collector>,
    sensor: Arc<HttpSensor>,
) -> Router {
    let state = AppState {
        pipeline,
        collector,
        sensor,
    };

    Router::new()
        .route("/api/current", get(get_current))
        .route("/api/history/:hours", get(get_history))
        .route("/api/alarms", get(get_alarms))
        .route("/api/manual_read", post(manual_read))
        .route("/api/status", get(get_status))
        .route("/api/settings", post(update_settings))
        .route("/api/reset_alarms", post(reset_alarms))
        .with_state(state)
}

async fn get_current(State(state): State<AppState>) -> Result<Json<Measurement>, AppError> {
    state
        .pipeline
        .measurements()
        .latest()
        .await?
        .map(Json)
        .ok_or_else(|| AppError::new(StatusCode::NOT_FOUND, "No measurements available"))
}

async fn get_history(
    State(state): State<AppState>,
    Path(hours): Path<i64>,
) -> Result<Json<HistoryResponse>, AppError> {
    let hours = hours.clamp(1, MAX_HISTORY_HOURS);
    let cutoff = Utc::now() - chrono::Duration::hours(hours);

    let mut data = state.pipeline.measurements().since(cutoff).await?;
    data.truncate(MAX_HISTORY_ROWS);

    Ok(Json(HistoryResponse {
        total: data.len(),
        data,
        hours,
    }))
}

async fn get_alarms(
    State(state): State<AppState>,
    Query(params): Query<AlarmsQuery>,
) -> Result<Json<AlarmsResponse>, AppError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_ALARM_LIMIT)
        .clamp(1, MAX_ALARM_LIMIT);
    let data = state.pipeline.alarms().recent(limit).await?;

    Ok(Json(AlarmsResponse {
        total: data.len(),
        data,
        limit,
    }))
}

async fn manual_read(State(state): State<AppState>) -> Result<Json<IngestOutcome>, AppError> {
    info!("Manual read requested");
    Ok(Json(state.pipeline.fetch_and_store().await?))
}

async fn get_status(State(state): State<AppState>) -> Result<Json<StatusResponse>, AppError> {
    let measurements = state.pipeline.measurements();
    let alarms = state.pipeline.alarms();

    Ok(Json(StatusResponse {
        state: state.collector.state(),
        consecutive_failures: state.collector.consecutive_failures(),
        source: state.pipeline.sensor().describe(),
        source_address: state.sensor.address(),
        thresholds: state.pipeline.engine().thresholds(),
        edge_mode: state.pipeline.engine().mode(),
        alarm_states: state.pipeline.engine().states(),
        measurement_count: measurements.count().await?,
        measurement_retention: measurements.retention(),
        alarm_count: alarms.count().await?,
        alarm_retention: alarms.retention(),
        measurements_file: measurements.location(),
        alarms_file: alarms.location(),
        timestamp: Utc::now(),
    }))
}

/// Forgets per-source alarm memory so sustained conditions alert again.
async fn reset_alarms(State(state): State<AppState>) -> Json<ResetAlarmsResponse> {
    let reset = state.pipeline.engine().reset_states();
    Json(ResetAlarmsResponse {
        status: "success",
        message: format!("Alarm states reset ({} sources)", reset),
        reset,
        timestamp: Utc::now(),
    })
}

/// Validates every field before applying any of them.
async fn update_settings(
    State(state): State<AppState>,
    Json(request): Json<SettingsRequest>,
) -> Result<Json<SettingsResponse>, AppError> {
    let current_address = state.sensor.address();
    let address = request
        .source_address
        .as_deref()
        .map(|raw| SourceAddress::parse(raw, current_address.port))
        .transpose()?;

    let engine = state.pipeline.engine();
    let thresholds = if request.warning_level.is_some() || request.danger_level.is_some() {
        let current = engine.thresholds();
        Some(validate::thresholds(
            request.warning_level.unwrap_or(current.warning_level),
            request.danger_level.unwrap_or(current.danger_level),
        )?)
    } else {
        None
    };

    if let Some(address) = address {
        info!("Sensor address changed from {} to {}", current_address, address);
        state.sensor.set_address(address);
    }
    if let Some(thresholds) = thresholds {
        engine.set_thresholds(thresholds.warning_level, thresholds.danger_level)?;
    }

    Ok(Json(SettingsResponse {
        source_address: state.sensor.address(),
        thresholds: engine.thresholds(),
    }))
}

struct AppError {
    status: StatusCode,
    error: anyhow::Error,
}

impl AppError {
    fn new(status: StatusCode, message: &str) -> Self {
        Self {
            status,
            error: anyhow::anyhow!(message.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("API error: {}", self.error);
        } else {
            warn!("API request rejected: {}", self.error);
        }
        (self.status, Json(json!({ "error": self.error.to_string() }))).into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Fetch(_) => StatusCode::BAD_GATEWAY,
            Error::Store(StoreError::Unavailable { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
        };
        Self {
            status,
            error: err.into(),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        Error::Store(err).into()
    }
}
