use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Body served on `GET /data`, in the format the collector expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub co_ppm: f64,
    pub temperature: f64,
    pub humidity: f64,
    pub timestamp: DateTime<Utc>,
}

/// Random walk around a baseline CO level with occasional spikes.
#[derive(Debug, Clone)]
pub struct SensorModel {
    baseline: f64,
    spike_rate: f64,
    co_ppm: f64,
    temperature: f64,
    humidity: f64,
}

impl SensorModel {
    pub fn new(baseline: f64, spike_rate: f64) -> Self {
        Self {
            baseline,
            spike_rate,
            co_ppm: baseline,
            temperature: 21.0,
            humidity: 45.0,
        }
    }

    pub fn sample(&mut self, rng: &mut impl Rng) -> Reading {
        if rng.gen_bool(self.spike_rate) {
            // Spikes land in WARNING or DANGER territory
            self.co_ppm = rng.gen_range(30.0..90.0);
        } else {
            // Drift, pulled back toward the baseline
            let pull = (self.baseline - self.co_ppm) * 0.2;
            self.co_ppm = (self.co_ppm + pull + rng.gen_range(-2.0..2.0)).max(0.0);
        }
        self.temperature = (self.temperature + rng.gen_range(-0.3..0.3)).clamp(10.0, 35.0);
        self.humidity = (self.humidity + rng.gen_range(-1.0..1.0)).clamp(20.0, 80.0);

        Reading {
            co_ppm: round(self.co_ppm),
            temperature: round(self.temperature),
            humidity: round(self.humidity),
            timestamp: Utc::now(),
        }
    }
}

fn round(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
