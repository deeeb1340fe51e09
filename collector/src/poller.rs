use crate::metrics::{CONSECUTIVE_FAILURES, COOLDOWNS_TOTAL};
use crate::pipeline::Pipeline;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopState {
    Running,
    Stopping,
    Stopped,
}

/// Timing of the collector loop.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub failure_delay: Duration,
    pub cooldown: Duration,
    pub max_consecutive_failures: u32,
    pub stop_timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            failure_delay: Duration::from_secs(60),
            cooldown: Duration::from_secs(300),
            max_consecutive_failures: 10,
            stop_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Success,
    Failure,
}

/// Counts consecutive failed ticks and picks the wait before the next one.
#[derive(Debug)]
pub struct FailureTracker {
    policy: PollPolicy,
    consecutive: u32,
}

impl FailureTracker {
    pub fn new(policy: PollPolicy) -> Self {
        Self {
            policy,
            consecutive: 0,
        }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn record(&mut self, outcome: TickOutcome) -> Duration {
        match outcome {
            TickOutcome::Success => {
                self.consecutive = 0;
                self.policy.interval
            }
            TickOutcome::Failure => {
                self.consecutive += 1;
                if self.consecutive >= self.policy.max_consecutive_failures {
                    error!(
                        "{} consecutive failures, cooling down for {:?}",
                        self.consecutive, self.policy.cooldown
                    );
                    COOLDOWNS_TOTAL.inc();
                    self.consecutive = 0;
                    self.policy.cooldown
                } else {
                    self.policy.failure_delay
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    /// The loop did not exit within the stop timeout; it will stop at its next check.
    TimedOut,
    NotRunning,
}

struct Worker {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Background task running the pipeline on a fixed cadence.
pub struct Collector {
    pipeline: Arc<Pipeline>,
    policy: PollPolicy,
    worker: Mutex<Option<Worker>>,
    state: Arc<watch::Sender<LoopState>>,
    failures: Arc<AtomicU32>,
}

impl Collector {
    pub fn new(pipeline: Arc<Pipeline>, policy: PollPolicy) -> Self {
        let (state, _) = watch::channel(LoopState::Stopped);
        Self {
            pipeline,
            policy,
            worker: Mutex::new(None),
            state: Arc::new(state),
            failures: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Spawns the loop. Returns false if a loop is already alive.
    pub async fn start(&self) -> bool {
        let mut worker = self.worker.lock().await;
        if let Some(existing) = worker.as_ref() {
            if !existing.handle.is_finished() {
                debug!("Collector already running");
                return false;
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        self.failures.store(0, Ordering::Relaxed);
        self.state.send_replace(LoopState::Running);

        let handle = tokio::spawn(run_loop(
            self.pipeline.clone(),
            self.policy,
            stop_rx,
            self.state.clone(),
            self.failures.clone(),
        ));
        *worker = Some(Worker { stop_tx, handle });
        true
    }

    /// Signals the loop and waits for it, at most `stop_timeout`.
    pub async fn stop(&self) -> StopOutcome {
        let mut guard = self.worker.lock().await;
        let Some(worker) = guard.as_mut() else {
            return StopOutcome::NotRunning;
        };
        if worker.handle.is_finished() {
            *guard = None;
            self.state.send_replace(LoopState::Stopped);
            return StopOutcome::NotRunning;
        }

        info!("Stopping collector");
        self.state.send_replace(LoopState::Stopping);
        let _ = worker.stop_tx.send(true);

        match tokio::time::timeout(self.policy.stop_timeout, &mut worker.handle).await {
            Ok(joined) => {
                if let Err(e) = joined {
                    error!("Collector task ended abnormally: {}", e);
                }
                *guard = None;
                self.state.send_replace(LoopState::Stopped);
                StopOutcome::Stopped
            }
            Err(_) => {
                warn!(
                    "Collector did not stop within {:?}, leaving it to exit on its own",
                    self.policy.stop_timeout
                );
                StopOutcome::TimedOut
            }
        }
    }
}

async fn run_loop(
    pipeline: Arc<Pipeline>,
    policy: PollPolicy,
    mut stop_rx: watch::Receiver<bool>,
    state: Arc<watch::Sender<LoopState>>,
    failures: Arc<AtomicU32>,
) {
    info!("Collector started, polling every {:?}", policy.interval);
    let mut tracker = FailureTracker::new(policy);

    loop {
        if *stop_rx.borrow() {
            break;
        }

        let outcome = match pipeline.fetch_and_store().await {
            Ok(ingested) => {
                debug!(
                    "Tick stored CO={}ppm ({})",
                    ingested.measurement.co_level, ingested.measurement.status
                );
                TickOutcome::Success
            }
            Err(e) => {
                warn!("Collection tick failed: {}", e);
                TickOutcome::Failure
            }
        };

        let delay = tracker.record(outcome);
        failures.store(tracker.consecutive(), Ordering::Relaxed);
        CONSECUTIVE_FAILURES.set(tracker.consecutive() as f64);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    state.send_replace(LoopState::Stopped);
    info!("Collector stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::EdgeMode;
    use crate::pipeline::test_support::{pipeline, RecordingNotifier, ScriptedSource};
    use tempfile::TempDir;

    fn collector(dir: &TempDir, source: Arc<ScriptedSource>) -> Collector {
        let pipeline = pipeline(
            dir,
            source,
            Arc::new(RecordingNotifier::default()),
            EdgeMode::StoredPredecessor,
        );
        Collector::new(Arc::new(pipeline), PollPolicy::default())
    }

    #[test]
    fn test_tracker_success_uses_interval() {
        let mut tracker = FailureTracker::new(PollPolicy::default());
        assert_eq!(tracker.record(TickOutcome::Success), Duration::from_secs(30));
        assert_eq!(tracker.record(TickOutcome::Failure), Duration::from_secs(60));
        assert_eq!(tracker.consecutive(), 1);
        assert_eq!(tracker.record(TickOutcome::Success), Duration::from_secs(30));
        assert_eq!(tracker.consecutive(), 0);
    }

    #[test]
    fn test_tracker_cooldown_after_max_failures() {
        let mut tracker = FailureTracker::new(PollPolicy::default());
        for n in 1..10 {
            assert_eq!(tracker.record(TickOutcome::Failure), Duration::from_secs(60));
            assert_eq!(tracker.consecutive(), n);
        }
        assert_eq!(tracker.record(TickOutcome::Failure), Duration::from_secs(300));
        assert_eq!(tracker.consecutive(), 0);
        assert_eq!(tracker.record(TickOutcome::Failure), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_sensor_schedule() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(ScriptedSource::failing());
        let collector = collector(&dir, source.clone());

        assert!(collector.start().await);

        tokio::time::sleep(Duration::from_secs(530)).await;
        assert_eq!(collector.consecutive_failures(), 9);
        tokio::time::sleep(Duration::from_secs(70)).await;
        assert_eq!(collector.consecutive_failures(), 0);
        tokio::time::sleep(Duration::from_secs(400)).await;

        assert_eq!(collector.stop().await, StopOutcome::Stopped);

        let calls = source.calls();
        let gaps: Vec<u64> = calls
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).as_secs())
            .collect();
        assert_eq!(
            &gaps[..11],
            &[60, 60, 60, 60, 60, 60, 60, 60, 60, 300, 60]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_ticks_use_interval() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(ScriptedSource::new(&[5.0, 6.0, 7.0]));
        let collector = collector(&dir, source.clone());

        collector.start().await;
        tokio::time::sleep(Duration::from_secs(65)).await;
        collector.stop().await;

        let calls = source.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!((calls[1] - calls[0]).as_secs(), 30);
        assert_eq!((calls[2] - calls[1]).as_secs(), 30);
        assert_eq!(collector.pipeline.measurements().count().await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(ScriptedSource::new(&[5.0]));
        let collector = collector(&dir, source.clone());

        assert_eq!(collector.state(), LoopState::Stopped);
        assert!(collector.start().await);
        assert!(!collector.start().await);
        assert_eq!(collector.state(), LoopState::Running);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(source.calls().len(), 1);

        assert_eq!(collector.stop().await, StopOutcome::Stopped);
        assert_eq!(collector.state(), LoopState::Stopped);
        assert_eq!(collector.stop().await, StopOutcome::NotRunning);

        assert!(collector.start().await);
        assert_eq!(collector.stop().await, StopOutcome::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_bounded() {
        let dir = TempDir::new().unwrap();
        let collector = collector(&dir, Arc::new(ScriptedSource::hanging()));

        collector.start().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = tokio::time::Instant::now();
        assert_eq!(collector.stop().await, StopOutcome::TimedOut);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(6));
        assert_eq!(collector.state(), LoopState::Stopping);

        // The stuck loop still counts as alive.
        assert!(!collector.start().await);
    }
}
