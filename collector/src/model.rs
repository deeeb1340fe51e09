use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a CO reading against the configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Normal,
    Warning,
    Danger,
}

impl Status {
    /// Elevated statuses map to the alarm they raise.
    pub fn alarm_type(self) -> Option<AlarmType> {
        match self {
            Status::Normal => None,
            Status::Warning => Some(AlarmType::Warning),
            Status::Danger => Some(AlarmType::Danger),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Normal => f.write_str("NORMAL"),
            Status::Warning => f.write_str("WARNING"),
            Status::Danger => f.write_str("DANGER"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmType {
    Warning,
    Danger,
}

impl From<AlarmType> for Status {
    fn from(alarm_type: AlarmType) -> Self {
        match alarm_type {
            AlarmType::Warning => Status::Warning,
            AlarmType::Danger => Status::Danger,
        }
    }
}

impl fmt::Display for AlarmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Status::from(*self).fmt(f)
    }
}

/// Warning and danger levels in ppm. Construct through
/// [`crate::validate::thresholds`] so that `danger > warning > 0` holds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub warning_level: f64,
    pub danger_level: f64,
}

impl Thresholds {
    pub fn classify(&self, co_level: f64) -> Status {
        if co_level >= self.danger_level {
            Status::Danger
        } else if co_level >= self.warning_level {
            Status::Warning
        } else {
            Status::Normal
        }
    }
}

/// A sanitised reading as returned by the sensor client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawReading {
    pub source_id: String,
    pub co_level: f64,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
}

/// One stored CO measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub timestamp: DateTime<Utc>,
    pub co_level: f64,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub status: Status,
    pub source_id: String,
}

impl Measurement {
    pub fn from_reading(
        reading: RawReading,
        thresholds: &Thresholds,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            timestamp,
            status: thresholds.classify(reading.co_level),
            co_level: reading.co_level,
            temperature: reading.temperature,
            humidity: reading.humidity,
            source_id: reading.source_id,
        }
    }
}

/// One stored alarm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmRecord {
    pub timestamp: DateTime<Utc>,
    pub alarm_type: AlarmType,
    pub co_level: f64,
    pub message: String,
}

/// REST API response wrapper for measurement history
#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub data: Vec<Measurement>,
    pub total: usize,
    pub hours: i64,
}

/// REST API response wrapper for alarm listings
#[derive(Debug, Serialize)]
pub struct AlarmsResponse {
    pub data: Vec<AlarmRecord>,
    pub total: usize,
    pub limit: usize,
}
