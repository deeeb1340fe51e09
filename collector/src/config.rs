use crate::alarm::EdgeMode;
use crate::model::Thresholds;
use crate::poller::PollPolicy;
use crate::sensor::SourceAddress;
use crate::store::{ALARM_RETENTION, MEASUREMENT_RETENTION};
use crate::validate;
use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub sensor_address: SourceAddress,
    pub sensor_path: String,
    pub sensor_timeout: Duration,

    pub http_addr: String,

    pub measurements_path: PathBuf,
    pub alarms_path: PathBuf,
    pub measurement_retention: usize,
    pub alarm_retention: usize,

    pub thresholds: Thresholds,
    pub edge_mode: EdgeMode,
    pub poll: PollPolicy,

    pub notify_webhook_url: Option<String>,
    pub notify_recipient: String,
}

type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&|key| env::var(key).ok())
    }

    fn from_lookup(lookup: Lookup<'_>) -> Result<Self> {
        let sensor_port = u16::try_from(env_u64(lookup, "SENSOR_PORT", 80)?)
            .context("invalid SENSOR_PORT")?;
        let raw_address = env_string(lookup, "SENSOR_ADDR", "192.168.1.100");
        let sensor_address =
            SourceAddress::parse(&raw_address, sensor_port).context("invalid SENSOR_ADDR")?;
        let sensor_path = env_string(lookup, "SENSOR_PATH", "/data");
        if !sensor_path.starts_with('/') {
            return Err(anyhow!("SENSOR_PATH must start with '/'"));
        }
        let sensor_timeout = Duration::from_secs(env_u64(lookup, "SENSOR_TIMEOUT_SECS", 10)?);

        let http_addr = env_string(lookup, "HTTP_ADDR", "0.0.0.0:5000");

        let data_dir = PathBuf::from(env_string(lookup, "DATA_DIR", "."));
        let measurements_path =
            data_dir.join(env_string(lookup, "MEASUREMENTS_FILE", "co_measurements.jsonl"));
        let alarms_path = data_dir.join(env_string(lookup, "ALARMS_FILE", "co_alarms.jsonl"));
        let measurement_retention =
            env_u64(lookup, "MEASUREMENT_RETENTION", MEASUREMENT_RETENTION as u64)? as usize;
        let alarm_retention = env_u64(lookup, "ALARM_RETENTION", ALARM_RETENTION as u64)? as usize;
        if measurement_retention == 0 || alarm_retention == 0 {
            return Err(anyhow!("retention caps must be at least 1"));
        }

        let thresholds = validate::thresholds(
            env_f64(lookup, "WARNING_LEVEL", 30.0)?,
            env_f64(lookup, "DANGER_LEVEL", 50.0)?,
        )
        .context("invalid WARNING_LEVEL/DANGER_LEVEL")?;
        let edge_mode = env_string(lookup, "ALARM_EDGE_MODE", "stored_predecessor")
            .parse::<EdgeMode>()
            .context("invalid ALARM_EDGE_MODE")?;

        let max_consecutive_failures =
            u32::try_from(env_u64(lookup, "MAX_CONSECUTIVE_FAILURES", 10)?)
                .context("invalid MAX_CONSECUTIVE_FAILURES")?;
        if max_consecutive_failures == 0 {
            return Err(anyhow!("MAX_CONSECUTIVE_FAILURES must be at least 1"));
        }
        let poll = PollPolicy {
            interval: Duration::from_secs(env_u64(lookup, "POLL_INTERVAL_SECS", 30)?),
            failure_delay: Duration::from_secs(env_u64(lookup, "FAILURE_DELAY_SECS", 60)?),
            cooldown: Duration::from_secs(env_u64(lookup, "COOLDOWN_SECS", 300)?),
            max_consecutive_failures,
            stop_timeout: Duration::from_secs(env_u64(lookup, "STOP_TIMEOUT_SECS", 5)?),
        };

        let notify_webhook_url = env_optional(lookup, "NOTIFY_WEBHOOK_URL");
        let notify_recipient = env_string(lookup, "NOTIFY_RECIPIENT", "operator");

        Ok(Self {
            sensor_address,
            sensor_path,
            sensor_timeout,
            http_addr,
            measurements_path,
            alarms_path,
            measurement_retention,
            alarm_retention,
            thresholds,
            edge_mode,
            poll,
            notify_webhook_url,
            notify_recipient,
        })
    }
}

fn env_string(lookup: Lookup<'_>, key: &str, default: &str) -> String {
    env_optional(lookup, key).unwrap_or_else(|| default.to_string())
}

fn env_u64(lookup: Lookup<'_>, key: &str, default: u64) -> Result<u64> {
    match env_optional(lookup, key) {
        Some(value) => value.parse::<u64>().with_context(|| format!("invalid {key}")),
        None => Ok(default),
    }
}

fn env_f64(lookup: Lookup<'_>, key: &str, default: f64) -> Result<f64> {
    match env_optional(lookup, key) {
        Some(value) => value.parse::<f64>().with_context(|| format!("invalid {key}")),
        None => Ok(default),
    }
}

fn env_optional(lookup: Lookup<'_>, key: &str) -> Option<String> {
    lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
