use crate::errors::{Error, Result};
use crate::model::{AlarmRecord, AlarmType, Measurement, Status, Thresholds};
use crate::validate;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError, RwLock};
use tracing::{debug, info};

/// What a new elevated status is compared against to decide whether it is an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeMode {
    /// Status of the same source's stored record just before the new one.
    #[default]
    StoredPredecessor,
    /// Last alarm emitted for the source in this process, reset on NORMAL.
    LastEmitted,
}

impl FromStr for EdgeMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "stored_predecessor" => Ok(EdgeMode::StoredPredecessor),
            "last_emitted" => Ok(EdgeMode::LastEmitted),
            other => Err(Error::Validation(format!(
                "Unknown alarm edge mode '{}', expected stored_predecessor or last_emitted",
                other
            ))),
        }
    }
}

impl fmt::Display for EdgeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeMode::StoredPredecessor => f.write_str("stored_predecessor"),
            EdgeMode::LastEmitted => f.write_str("last_emitted"),
        }
    }
}

/// Per-source hysteresis memory. Lives only as long as the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AlarmState {
    pub last_emitted_status: Option<AlarmType>,
    /// Alarm that was raised but could not be stored; raised again on the next
    /// reading with the same status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unpersisted_alarm: Option<AlarmType>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub status: Status,
    /// Set when the measurement is an edge into WARNING or DANGER.
    pub alarm: Option<AlarmRecord>,
    /// Set when the source returned to NORMAL after an emitted alarm.
    pub cleared: bool,
}

/// Classifies measurements and decides which ones raise alarms.
/// Performs no I/O; callers persist the returned records.
pub struct AlarmEngine {
    thresholds: RwLock<Thresholds>,
    mode: EdgeMode,
    states: Mutex<HashMap<String, AlarmState>>,
}

impl AlarmEngine {
    pub fn new(thresholds: Thresholds, mode: EdgeMode) -> Self {
        Self {
            thresholds: RwLock::new(thresholds),
            mode,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> EdgeMode {
        self.mode
    }

    pub fn thresholds(&self) -> Thresholds {
        *self.thresholds.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the thresholds. Invalid levels are rejected and the current ones kept.
    pub fn set_thresholds(&self, warning_level: f64, danger_level: f64) -> Result<Thresholds> {
        let updated = validate::thresholds(warning_level, danger_level)?;
        *self.thresholds.write().unwrap_or_else(PoisonError::into_inner) = updated;
        info!(
            "Thresholds updated: warning={} ppm, danger={} ppm",
            updated.warning_level, updated.danger_level
        );
        Ok(updated)
    }

    pub fn states(&self) -> HashMap<String, AlarmState> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forgets every source's alarm memory. Returns how many sources were tracked.
    pub fn reset_states(&self) -> usize {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let count = states.len();
        states.clear();
        info!("Alarm states reset ({} source(s))", count);
        count
    }

    /// Evaluates a freshly stored measurement without touching `AlarmState`.
    ///
    /// `preceding` is the status of the source's previous stored record and is
    /// only consulted in [`EdgeMode::StoredPredecessor`]. An absent predecessor
    /// differs from any elevated status, so the first elevated reading of a
    /// source raises an alarm.
    pub fn evaluate(&self, measurement: &Measurement, preceding: Option<Status>) -> Evaluation {
        let status = measurement.status;
        let state = self
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&measurement.source_id)
            .copied()
            .unwrap_or_default();

        let previous = match self.mode {
            EdgeMode::StoredPredecessor => preceding,
            EdgeMode::LastEmitted => state.last_emitted_status.map(Status::from),
        };
        let retry =
            status.alarm_type().is_some() && state.unpersisted_alarm == status.alarm_type();

        let alarm = match status.alarm_type() {
            Some(alarm_type) if retry || previous != Some(status) => Some(AlarmRecord {
                timestamp: measurement.timestamp,
                alarm_type,
                co_level: measurement.co_level,
                message: alarm_message(alarm_type, measurement.co_level),
            }),
            Some(_) => {
                debug!(
                    "Source {} still {}, alarm suppressed",
                    measurement.source_id, status
                );
                None
            }
            None => None,
        };

        Evaluation {
            status,
            alarm,
            cleared: status == Status::Normal && state.last_emitted_status.is_some(),
        }
    }

    /// Records the outcome of [`AlarmEngine::evaluate`] in the source's `AlarmState`.
    /// Call only once the evaluation's alarm, if any, has been persisted.
    pub fn commit(&self, source_id: &str, evaluation: &Evaluation) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states.entry(source_id.to_string()).or_default();
        state.unpersisted_alarm = None;

        if let Some(alarm) = &evaluation.alarm {
            state.last_emitted_status = Some(alarm.alarm_type);
        } else if evaluation.status == Status::Normal {
            state.last_emitted_status = None;
        }
    }

    /// Remembers that `alarm` was raised for `source_id` but never stored, so
    /// the edge is not lost once the stored predecessor already shows it.
    pub fn alarm_not_persisted(&self, source_id: &str, alarm: &AlarmRecord) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.entry(source_id.to_string()).or_default().unpersisted_alarm =
            Some(alarm.alarm_type);
    }
}

/// Status of the record stored just before the newest one for `source_id`.
pub fn preceding_status(history: &[Measurement], source_id: &str) -> Option<Status> {
    history
        .iter()
        .rev()
        .filter(|m| m.source_id == source_id)
        .nth(1)
        .map(|m| m.status)
}

pub fn alarm_message(alarm_type: AlarmType, co_level: f64) -> String {
    match alarm_type {
        AlarmType::Danger => format!("DANGER! CO level critical: {} ppm", co_level),
        AlarmType::Warning => format!("WARNING! CO level elevated: {} ppm", co_level),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rand::Rng;

    fn thresholds() -> Thresholds {
        Thresholds {
            warning_level: 30.0,
            danger_level: 50.0,
        }
    }

    fn measurement(engine: &AlarmEngine, source_id: &str, co_level: f64) -> Measurement {
        Measurement {
            timestamp: Utc::now(),
            co_level,
            temperature: None,
            humidity: None,
            status: engine.thresholds().classify(co_level),
            source_id: source_id.to_string(),
        }
    }

    /// Feeds readings the way the pipeline does: store, evaluate, then commit.
    fn run(
        engine: &AlarmEngine,
        history: &mut Vec<Measurement>,
        source_id: &str,
        levels: &[f64],
    ) -> Vec<Evaluation> {
        levels
            .iter()
            .map(|&co_level| {
                let m = measurement(engine, source_id, co_level);
                history.push(m.clone());
                let evaluation = engine.evaluate(&m, preceding_status(history, source_id));
                engine.commit(source_id, &evaluation);
                evaluation
            })
            .collect()
    }

    #[test]
    fn test_scenario_edges_in_both_modes() {
        for mode in [EdgeMode::StoredPredecessor, EdgeMode::LastEmitted] {
            let engine = AlarmEngine::new(thresholds(), mode);
            let mut history = Vec::new();
            let results = run(&engine, &mut history, "S1", &[20.0, 35.0, 40.0, 60.0, 45.0]);

            let statuses: Vec<Status> = results.iter().map(|e| e.status).collect();
            assert_eq!(
                statuses,
                vec![
                    Status::Normal,
                    Status::Warning,
                    Status::Warning,
                    Status::Danger,
                    Status::Warning
                ]
            );

            let alarms: Vec<(usize, AlarmType)> = results
                .iter()
                .enumerate()
                .filter_map(|(i, e)| e.alarm.as_ref().map(|a| (i + 1, a.alarm_type)))
                .collect();
            assert_eq!(
                alarms,
                vec![
                    (2, AlarmType::Warning),
                    (4, AlarmType::Danger),
                    (5, AlarmType::Warning)
                ],
                "mode {}",
                mode
            );
        }
    }

    #[test]
    fn test_sustained_warning_alarms_once() {
        for mode in [EdgeMode::StoredPredecessor, EdgeMode::LastEmitted] {
            let engine = AlarmEngine::new(thresholds(), mode);
            let mut history = Vec::new();
            run(&engine, &mut history, "S1", &[10.0]);
            let results = run(
                &engine,
                &mut history,
                "S1",
                &[31.0, 35.0, 39.0, 44.0, 32.0, 30.0],
            );

            let count = results.iter().filter(|e| e.alarm.is_some()).count();
            assert_eq!(count, 1);
            assert!(results[0].alarm.is_some());
        }
    }

    #[test]
    fn test_first_elevated_reading_raises_alarm() {
        let engine = AlarmEngine::new(thresholds(), EdgeMode::StoredPredecessor);
        let m = measurement(&engine, "S1", 75.0);

        let evaluation = engine.evaluate(&m, preceding_status(&[m.clone()], "S1"));
        let alarm = evaluation.alarm.unwrap();
        assert_eq!(alarm.alarm_type, AlarmType::Danger);
        assert_eq!(alarm.co_level, 75.0);
        assert!(alarm.message.contains("critical"));
        assert!(alarm.message.contains("75"));
    }

    #[test]
    fn test_random_levels_classify_by_band() {
        let engine = AlarmEngine::new(thresholds(), EdgeMode::StoredPredecessor);
        let mut rng = rand::thread_rng();

        for _ in 0..500 {
            let normal = rng.gen_range(0.0..30.0);
            let warning = rng.gen_range(30.0..50.0);
            let danger = rng.gen_range(50.0..1000.0);

            assert_eq!(engine.thresholds().classify(normal), Status::Normal);
            assert_eq!(engine.thresholds().classify(warning), Status::Warning);
            assert_eq!(engine.thresholds().classify(danger), Status::Danger);

            let m = measurement(&engine, "S1", normal);
            assert!(engine.evaluate(&m, Some(Status::Danger)).alarm.is_none());
        }
    }

    #[test]
    fn test_cleared_after_return_to_normal() {
        let engine = AlarmEngine::new(thresholds(), EdgeMode::LastEmitted);
        let mut history = Vec::new();
        let results = run(&engine, &mut history, "S1", &[40.0, 10.0, 5.0, 40.0]);

        assert!(results[0].alarm.is_some());
        assert!(results[1].cleared);
        assert!(!results[2].cleared);
        assert!(results[3].alarm.is_some());
        assert_eq!(
            engine.states()["S1"].last_emitted_status,
            Some(AlarmType::Warning)
        );
    }

    #[test]
    fn test_sources_tracked_independently() {
        let engine = AlarmEngine::new(thresholds(), EdgeMode::LastEmitted);
        let mut history = Vec::new();

        assert!(run(&engine, &mut history, "S1", &[40.0])[0].alarm.is_some());
        assert!(run(&engine, &mut history, "S2", &[40.0])[0].alarm.is_some());
        assert!(run(&engine, &mut history, "S1", &[41.0])[0].alarm.is_none());
    }

    #[test]
    fn test_predecessor_lookup_skips_other_sources() {
        let engine = AlarmEngine::new(thresholds(), EdgeMode::StoredPredecessor);
        let history = vec![
            measurement(&engine, "S1", 40.0),
            measurement(&engine, "S2", 5.0),
            measurement(&engine, "S1", 60.0),
        ];

        assert_eq!(preceding_status(&history, "S1"), Some(Status::Warning));
        assert_eq!(preceding_status(&history, "S2"), None);
        assert_eq!(preceding_status(&history, "S3"), None);
    }

    #[test]
    fn test_fresh_engine_realerts() {
        let first = AlarmEngine::new(thresholds(), EdgeMode::LastEmitted);
        let m = measurement(&first, "S1", 40.0);
        let evaluation = first.evaluate(&m, None);
        assert!(evaluation.alarm.is_some());
        first.commit("S1", &evaluation);
        assert!(first.evaluate(&m, None).alarm.is_none());

        let restarted = AlarmEngine::new(thresholds(), EdgeMode::LastEmitted);
        assert!(restarted.evaluate(&m, None).alarm.is_some());
    }

    #[test]
    fn test_uncommitted_alarm_is_raised_again() {
        let engine = AlarmEngine::new(thresholds(), EdgeMode::LastEmitted);
        let m = measurement(&engine, "S1", 65.0);

        // Persisting the first alarm failed, so it was never committed.
        assert!(engine.evaluate(&m, None).alarm.is_some());
        assert!(engine.states().is_empty());
        assert!(engine.evaluate(&m, None).alarm.is_some());
    }

    #[test]
    fn test_unpersisted_alarm_retried_despite_stored_predecessor() {
        let engine = AlarmEngine::new(thresholds(), EdgeMode::StoredPredecessor);
        let mut history = Vec::new();
        run(&engine, &mut history, "S1", &[10.0]);

        let m = measurement(&engine, "S1", 60.0);
        history.push(m.clone());
        let lost = engine.evaluate(&m, preceding_status(&history, "S1"));
        engine.alarm_not_persisted("S1", lost.alarm.as_ref().unwrap());

        let again = run(&engine, &mut history, "S1", &[62.0, 64.0]);
        assert_eq!(again[0].alarm.as_ref().unwrap().alarm_type, AlarmType::Danger);
        assert!(again[1].alarm.is_none());
        assert_eq!(engine.states()["S1"].unpersisted_alarm, None);
    }

    #[test]
    fn test_reset_states_realerts_sustained_source() {
        let engine = AlarmEngine::new(thresholds(), EdgeMode::LastEmitted);
        let mut history = Vec::new();
        run(&engine, &mut history, "S1", &[40.0]);
        run(&engine, &mut history, "S2", &[55.0]);
        assert!(run(&engine, &mut history, "S1", &[42.0])[0].alarm.is_none());

        assert_eq!(engine.reset_states(), 2);
        assert!(engine.states().is_empty());

        let after = run(&engine, &mut history, "S1", &[42.0]);
        assert_eq!(after[0].alarm.as_ref().unwrap().alarm_type, AlarmType::Warning);
        assert_eq!(engine.reset_states(), 1);
    }

    #[test]
    fn test_invalid_threshold_update_keeps_previous() {
        let engine = AlarmEngine::new(thresholds(), EdgeMode::StoredPredecessor);

        assert!(engine.set_thresholds(60.0, 40.0).is_err());
        assert_eq!(engine.thresholds(), thresholds());

        engine.set_thresholds(20.0, 40.0).unwrap();
        assert_eq!(engine.thresholds().classify(25.0), Status::Warning);
    }

    #[test]
    fn test_edge_mode_parse() {
        assert_eq!(
            "last_emitted".parse::<EdgeMode>().unwrap(),
            EdgeMode::LastEmitted
        );
        assert_eq!(
            " stored_predecessor ".parse::<EdgeMode>().unwrap(),
            EdgeMode::StoredPredecessor
        );
        assert!("sometimes".parse::<EdgeMode>().is_err());
    }
}
