use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref READINGS_STORED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "collector_readings_stored_total",
        "Total measurements persisted"
    ))
    .unwrap();
    pub static ref FETCH_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "collector_fetch_failures_total",
        "Total failed sensor fetches (timeout, unreachable, invalid payload)"
    ))
    .unwrap();
    pub static ref STORE_RETRIES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "collector_store_retries_total",
        "Total store operations retried because the file was locked"
    ))
    .unwrap();
    pub static ref ALARMS_RAISED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "collector_alarms_raised_total",
        "Total alarm records emitted"
    ))
    .unwrap();
    pub static ref COOLDOWNS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "collector_cooldowns_total",
        "Total times the poller entered the failure cooldown"
    ))
    .unwrap();
    pub static ref CONSECUTIVE_FAILURES: Gauge = Gauge::with_opts(Opts::new(
        "collector_consecutive_failures",
        "Current consecutive failed ticks"
    ))
    .unwrap();
    pub static ref STORE_WRITE_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "collector_store_write_seconds",
            "Time taken to append a record, including lock wait and retries"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0
        ])
    )
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY
        .register(Box::new(READINGS_STORED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(FETCH_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(STORE_RETRIES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(ALARMS_RAISED_TOTAL.clone()))
        .unwrap();
    REGISTRY.register(Box::new(COOLDOWNS_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(CONSECUTIVE_FAILURES.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(STORE_WRITE_SECONDS.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
