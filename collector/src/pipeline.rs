use crate::alarm::{preceding_status, AlarmEngine};
use crate::errors::Result;
use crate::metrics::{ALARMS_RAISED_TOTAL, FETCH_FAILURES_TOTAL, READINGS_STORED_TOTAL};
use crate::model::{AlarmRecord, Measurement, RawReading};
use crate::notify::{Notification, Notifier};
use crate::sensor::ReadingSource;
use crate::store::DurableStore;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub measurement: Measurement,
    pub alarm: Option<AlarmRecord>,
}

/// Fetch → store → evaluate → store alarm → notify.
///
/// Shared by the background poller and on-demand reads, so both paths
/// classify and deduplicate alarms identically.
pub struct Pipeline {
    sensor: Arc<dyn ReadingSource>,
    engine: AlarmEngine,
    measurements: DurableStore<Measurement>,
    alarms: DurableStore<AlarmRecord>,
    notifier: Arc<dyn Notifier>,
    recipient: String,
}

impl Pipeline {
    pub fn new(
        sensor: Arc<dyn ReadingSource>,
        engine: AlarmEngine,
        measurements: DurableStore<Measurement>,
        alarms: DurableStore<AlarmRecord>,
        notifier: Arc<dyn Notifier>,
        recipient: String,
    ) -> Self {
        Self {
            sensor,
            engine,
            measurements,
            alarms,
            notifier,
            recipient,
        }
    }

    pub fn engine(&self) -> &AlarmEngine {
        &self.engine
    }

    pub fn measurements(&self) -> &DurableStore<Measurement> {
        &self.measurements
    }

    pub fn alarms(&self) -> &DurableStore<AlarmRecord> {
        &self.alarms
    }

    pub fn sensor(&self) -> &dyn ReadingSource {
        self.sensor.as_ref()
    }

    pub async fn fetch_and_store(&self) -> Result<IngestOutcome> {
        let reading = match self.sensor.read().await {
            Ok(reading) => reading,
            Err(e) => {
                FETCH_FAILURES_TOTAL.inc();
                return Err(e.into());
            }
        };

        self.store_reading(reading).await
    }

    /// The predecessor is read in the same locked operation as the append, and
    /// the engine only commits an edge once its alarm record is stored.
    pub async fn store_reading(&self, reading: RawReading) -> Result<IngestOutcome> {
        let thresholds = self.engine.thresholds();
        let measurement = Measurement::from_reading(reading, &thresholds, Utc::now());

        let source_id = measurement.source_id.clone();
        let preceding = self
            .measurements
            .append_and_inspect(measurement.clone(), move |records| {
                preceding_status(records, &source_id)
            })
            .await?;
        READINGS_STORED_TOTAL.inc();
        info!(
            "Measurement stored: CO={}ppm, status={}, source={}",
            measurement.co_level, measurement.status, measurement.source_id
        );

        let evaluation = self.engine.evaluate(&measurement, preceding);

        if let Some(alarm) = &evaluation.alarm {
            if let Err(e) = self.alarms.append(alarm.clone()).await {
                self.engine.alarm_not_persisted(&measurement.source_id, alarm);
                return Err(e.into());
            }
        }
        self.engine.commit(&measurement.source_id, &evaluation);

        if let Some(alarm) = &evaluation.alarm {
            ALARMS_RAISED_TOTAL.inc();
            warn!("{}", alarm.message);
            self.deliver(Notification::raised(alarm, &measurement.source_id, &self.recipient))
                .await;
        } else if evaluation.cleared {
            info!("Source {} back to normal", measurement.source_id);
            self.deliver(Notification::cleared(&measurement, &self.recipient))
                .await;
        }

        Ok(IngestOutcome {
            measurement,
            alarm: evaluation.alarm,
        })
    }

    async fn deliver(&self, notification: Notification) {
        if let Err(e) = self.notifier.notify(&notification).await {
            warn!("Notification '{}' not delivered: {}", notification.subject, e);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::alarm::EdgeMode;
    use crate::errors::FetchError;
    use crate::model::Thresholds;
    use crate::errors::StoreError;
    use crate::notify::NotificationError;
    use crate::store::{Record, StorageBackend};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::time::Instant;

    /// Sensor that replays a fixed list of CO levels, then fails.
    pub struct ScriptedSource {
        script: Mutex<VecDeque<f64>>,
        calls: Mutex<Vec<Instant>>,
        hang: bool,
    }

    impl ScriptedSource {
        pub fn new(levels: &[f64]) -> Self {
            Self {
                script: Mutex::new(levels.iter().copied().collect()),
                calls: Mutex::new(Vec::new()),
                hang: false,
            }
        }

        pub fn failing() -> Self {
            Self::new(&[])
        }

        /// A fetch that never completes.
        pub fn hanging() -> Self {
            Self {
                hang: true,
                ..Self::new(&[])
            }
        }

        pub fn calls(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReadingSource for ScriptedSource {
        async fn read(&self) -> std::result::Result<RawReading, FetchError> {
            self.calls.lock().unwrap().push(Instant::now());
            if self.hang {
                std::future::pending::<()>().await;
            }
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(co_level) => Ok(RawReading {
                    source_id: "S1".to_string(),
                    co_level,
                    temperature: None,
                    humidity: None,
                }),
                None => Err(FetchError::Unreachable("scripted sensor offline".to_string())),
            }
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    #[derive(Default)]
    pub struct RecordingNotifier {
        pub sent: Mutex<Vec<Notification>>,
        pub fail: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(
            &self,
            notification: &Notification,
        ) -> std::result::Result<(), NotificationError> {
            self.sent.lock().unwrap().push(notification.clone());
            if self.fail {
                return Err(NotificationError::SendFailed("smtp down".to_string()));
            }
            Ok(())
        }
    }

    /// In-memory backend whose n-th loads (1-based) fail with an I/O error.
    pub struct ScriptedBackend<R> {
        pub records: Mutex<Vec<R>>,
        failing_loads: Vec<usize>,
        loads: AtomicUsize,
    }

    impl<R> ScriptedBackend<R> {
        pub fn failing_on(failing_loads: &[usize]) -> Self {
            Self {
                records: Mutex::new(Vec::new()),
                failing_loads: failing_loads.to_vec(),
                loads: AtomicUsize::new(0),
            }
        }
    }

    impl<R: Record> StorageBackend<R> for ScriptedBackend<R> {
        fn load(&self) -> std::result::Result<Vec<R>, StoreError> {
            let n = self.loads.fetch_add(1, Ordering::SeqCst) + 1;
            if self.failing_loads.contains(&n) {
                return Err(StoreError::Io(std::io::Error::other("scripted load failure")));
            }
            Ok(self.records.lock().unwrap().clone())
        }

        fn replace(&self, records: &[R]) -> std::result::Result<(), StoreError> {
            *self.records.lock().unwrap() = records.to_vec();
            Ok(())
        }

        fn location(&self) -> String {
            "scripted".to_string()
        }
    }

    pub fn pipeline_with_stores(
        source: Arc<dyn ReadingSource>,
        notifier: Arc<dyn Notifier>,
        mode: EdgeMode,
        measurements: DurableStore<Measurement>,
        alarms: DurableStore<AlarmRecord>,
    ) -> Pipeline {
        let thresholds = Thresholds {
            warning_level: 30.0,
            danger_level: 50.0,
        };
        Pipeline::new(
            source,
            AlarmEngine::new(thresholds, mode),
            measurements,
            alarms,
            notifier,
            "ops".to_string(),
        )
    }

    pub fn pipeline(
        dir: &TempDir,
        source: Arc<dyn ReadingSource>,
        notifier: Arc<dyn Notifier>,
        mode: EdgeMode,
    ) -> Pipeline {
        pipeline_with_stores(
            source,
            notifier,
            mode,
            DurableStore::json_lines("measurements", dir.path().join("m.jsonl"), 100),
            DurableStore::json_lines("alarms", dir.path().join("a.jsonl"), 100),
        )
    }
}
