use crate::errors::{Error, FetchError, Result};
use crate::model::{RawReading, Thresholds};
use tracing::debug;

const TEMP_MIN: f64 = -50.0;
const TEMP_MAX: f64 = 100.0;
const HUMIDITY_MIN: f64 = 0.0;
const HUMIDITY_MAX: f64 = 100.0;

/// Sanitises a reading: CO is clamped at zero, temperature and
/// humidity outside their plausible ranges are dropped.
pub fn sanitize(
    source_id: &str,
    co_level: f64,
    temperature: Option<f64>,
    humidity: Option<f64>,
) -> std::result::Result<RawReading, FetchError> {
    if !co_level.is_finite() {
        return Err(FetchError::InvalidFormat(format!(
            "CO level {} is not a finite number",
            co_level
        )));
    }

    let co_level = if co_level < 0.0 {
        debug!("Clamping negative CO level {} to 0", co_level);
        0.0
    } else {
        co_level
    };

    let temperature = temperature.filter(|t| {
        let keep = (TEMP_MIN..=TEMP_MAX).contains(t);
        if !keep {
            debug!(
                "Discarding temperature {} outside [{}, {}]",
                t, TEMP_MIN, TEMP_MAX
            );
        }
        keep
    });

    let humidity = humidity.filter(|h| {
        let keep = (HUMIDITY_MIN..=HUMIDITY_MAX).contains(h);
        if !keep {
            debug!(
                "Discarding humidity {} outside [{}, {}]",
                h, HUMIDITY_MIN, HUMIDITY_MAX
            );
        }
        keep
    });

    Ok(RawReading {
        source_id: source_id.to_string(),
        co_level,
        temperature,
        humidity,
    })
}

/// Builds thresholds, enforcing `danger_level > warning_level > 0`.
pub fn thresholds(warning_level: f64, danger_level: f64) -> Result<Thresholds> {
    if !warning_level.is_finite() || !danger_level.is_finite() {
        return Err(Error::Validation(
            "Threshold levels must be finite numbers".to_string(),
        ));
    }

    if warning_level <= 0.0 {
        return Err(Error::Validation(format!(
            "Warning level {} must be greater than 0",
            warning_level
        )));
    }

    if danger_level <= warning_level {
        return Err(Error::Validation(format!(
            "Danger level {} must be greater than warning level {}",
            danger_level, warning_level
        )));
    }

    Ok(Thresholds {
        warning_level,
        danger_level,
    })
}
