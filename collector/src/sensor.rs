use crate::errors::{Error, FetchError, Result};
use crate::model::RawReading;
use crate::validate::sanitize;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

/// Accepted names for the CO concentration field, in lookup order.
const CO_FIELDS: [&str; 2] = ["co_ppm", "co_level"];

/// Host and port of the sensor's HTTP endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceAddress {
    pub host: String,
    pub port: u16,
}

impl SourceAddress {
    /// Parses `host` or `host:port`.
    pub fn parse(raw: &str, default_port: u16) -> Result<Self> {
        let raw = raw.trim();
        let raw = raw.strip_prefix("http://").unwrap_or(raw).trim_end_matches('/');
        if raw.is_empty() {
            return Err(Error::Validation("Sensor address cannot be empty".to_string()));
        }

        let (host, port) = match raw.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::Validation(format!("Invalid sensor port '{}'", port)))?;
                (host, port)
            }
            None => (raw, default_port),
        };

        if host.is_empty() {
            return Err(Error::Validation("Sensor host cannot be empty".to_string()));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.host, self.port, path)
    }
}

impl fmt::Display for SourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Something that yields one validated reading per call. No retries.
#[async_trait]
pub trait ReadingSource: Send + Sync {
    async fn read(&self) -> std::result::Result<RawReading, FetchError>;

    /// Human-readable description of where readings come from.
    fn describe(&self) -> String;
}

/// Polls a sensor exposing its latest reading as JSON over HTTP.
pub struct HttpSensor {
    client: reqwest::Client,
    address: RwLock<SourceAddress>,
    path: String,
    timeout: Duration,
}

impl HttpSensor {
    pub fn new(
        address: SourceAddress,
        path: impl Into<String>,
        timeout: Duration,
    ) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            address: RwLock::new(address),
            path: path.into(),
            timeout,
        })
    }

    pub fn address(&self) -> SourceAddress {
        self.address
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Takes effect from the next fetch.
    pub fn set_address(&self, address: SourceAddress) {
        *self.address.write().unwrap_or_else(PoisonError::into_inner) = address;
    }
}

#[async_trait]
impl ReadingSource for HttpSensor {
    async fn read(&self) -> std::result::Result<RawReading, FetchError> {
        let address = self.address();
        fetch(&self.client, &address, &self.path, self.timeout).await
    }

    fn describe(&self) -> String {
        self.address().url(&self.path)
    }
}

/// Fetches and validates one reading. The reading's source id is the sensor host.
pub async fn fetch(
    client: &reqwest::Client,
    address: &SourceAddress,
    path: &str,
    timeout: Duration,
) -> std::result::Result<RawReading, FetchError> {
    let url = address.url(path);
    debug!("Fetching reading from {}", url);

    let response = client
        .get(&url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| classify(e, timeout))?;

    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::HttpStatus(status.as_u16()));
    }

    let body = response.bytes().await.map_err(|e| classify(e, timeout))?;
    parse_payload(&body, &address.host)
}

fn classify(err: reqwest::Error, timeout: Duration) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout(timeout)
    } else {
        FetchError::Unreachable(err.to_string())
    }
}

/// Parses a sensor body such as `{"co_ppm": 12.5, "temperature": 22.1, "humidity": 40}`.
/// Numeric strings are accepted; `null` optional fields count as absent.
pub fn parse_payload(body: &[u8], source_id: &str) -> std::result::Result<RawReading, FetchError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| FetchError::InvalidFormat(format!("body is not JSON: {}", e)))?;
    let object = value
        .as_object()
        .ok_or_else(|| FetchError::InvalidFormat("expected a JSON object".to_string()))?;

    let (field, raw_co) = CO_FIELDS
        .iter()
        .find_map(|field| {
            object
                .get(*field)
                .filter(|v| !v.is_null())
                .map(|v| (*field, v))
        })
        .ok_or_else(|| FetchError::InvalidFormat("missing co_ppm field".to_string()))?;

    let co_level = number(field, raw_co)?;
    let temperature = optional_number(object, "temperature")?;
    let humidity = optional_number(object, "humidity")?;

    sanitize(source_id, co_level, temperature, humidity)
}

fn optional_number(
    object: &Map<String, Value>,
    field: &str,
) -> std::result::Result<Option<f64>, FetchError> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => number(field, value).map(Some),
    }
}

fn number(field: &str, value: &Value) -> std::result::Result<f64, FetchError> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        FetchError::InvalidFormat(format!("field {} is not numeric: {}", field, value))
    })
}
