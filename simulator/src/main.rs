mod telemetry;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use clap::Parser;
use rand::Rng;
use std::sync::{Arc, Mutex, PoisonError};
use telemetry::SensorModel;
use tracing::{error, info, warn};

/// Emulates a CO sensor exposing its latest reading over HTTP.
#[derive(Parser, Debug)]
#[command(name = "simulator", version, about = "CO sensor emulator")]
struct Args {
    /// Address to serve `GET /data` on
    #[arg(long, env = "SIM_ADDR", default_value = "0.0.0.0:8081")]
    listen: String,

    /// CO level the random walk hovers around, in ppm
    #[arg(long, env = "SIM_BASELINE", default_value_t = 8.0)]
    baseline: f64,

    /// Probability that a reading jumps into alarm territory
    #[arg(long, env = "SIM_SPIKE_RATE", default_value_t = 0.05)]
    spike_rate: f64,

    /// Probability that a request fails with HTTP 500 or a malformed body
    #[arg(long, env = "SIM_FAULT_RATE", default_value_t = 0.02)]
    fault_rate: f64,
}

#[derive(Clone)]
struct AppState {
    model: Arc<Mutex<SensorModel>>,
    fault_rate: f64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    if !(0.0..=1.0).contains(&args.spike_rate) || !(0.0..=1.0).contains(&args.fault_rate) {
        error!("Rates must be between 0 and 1");
        std::process::exit(2);
    }

    info!("Starting CO sensor simulator");
    info!(
        "Baseline: {} ppm, spike rate: {}, fault rate: {}",
        args.baseline, args.spike_rate, args.fault_rate
    );

    let state = AppState {
        model: Arc::new(Mutex::new(SensorModel::new(args.baseline, args.spike_rate))),
        fault_rate: args.fault_rate,
    };
    let app = Router::new().route("/data", get(get_data)).with_state(state);

    let listener = match tokio::net::TcpListener::bind(&args.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", args.listen, e);
            std::process::exit(1);
        }
    };
    info!("Serving readings on http://{}/data", args.listen);

    if let Err(e) = axum::serve(listener, app).await {
        error!("HTTP server error: {}", e);
    }
}

async fn get_data(State(state): State<AppState>) -> Response {
    let mut rng = rand::thread_rng();

    if rng.gen_bool(state.fault_rate) {
        return if rng.gen_bool(0.5) {
            warn!("Injecting HTTP 500");
            (StatusCode::INTERNAL_SERVER_ERROR, "sensor fault").into_response()
        } else {
            warn!("Injecting malformed payload");
            (StatusCode::OK, "{\"co_ppm\": ").into_response()
        };
    }

    let reading = state
        .model
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .sample(&mut rng);
    info!("Served reading: CO={} ppm", reading.co_ppm);
    Json(reading).into_response()
}
