use crate::errors::StoreError;
use crate::metrics::{STORE_RETRIES_TOTAL, STORE_WRITE_SECONDS};
use crate::model::{AlarmRecord, Measurement};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tempfile::NamedTempFile;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub const MEASUREMENT_RETENTION: usize = 10_000;
pub const ALARM_RETENTION: usize = 1_000;

/// Anything that can live in a durable store.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn timestamp(&self) -> DateTime<Utc>;
}

impl Record for Measurement {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl Record for AlarmRecord {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Where a store keeps its records. `replace` must swap the whole content
/// in one step: on error the previous content stays readable.
pub trait StorageBackend<R>: Send + Sync + 'static {
    fn load(&self) -> Result<Vec<R>, StoreError>;
    fn replace(&self, records: &[R]) -> Result<(), StoreError>;
    fn location(&self) -> String;
}

/// Flat file with one JSON record per line.
pub struct JsonLinesFile<R> {
    path: PathBuf,
    _record: PhantomData<fn() -> R>,
}

impl<R> JsonLinesFile<R> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _record: PhantomData,
        }
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }
}

impl<R: Record> StorageBackend<R> for JsonLinesFile<R> {
    fn load(&self) -> Result<Vec<R>, StoreError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(classify_io(err)),
        };

        let mut records = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(classify_io)?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|source| StoreError::Corrupt {
                line: index + 1,
                source,
            })?;
            records.push(record);
        }

        Ok(records)
    }

    /// Writes a uniquely named sibling temp file, fsyncs it and renames it over
    /// the canonical path. A failed write or rename drops the temp file.
    fn replace(&self, records: &[R]) -> Result<(), StoreError> {
        let mut tmp = NamedTempFile::new_in(self.dir()).map_err(classify_io)?;
        write_records(tmp.as_file_mut(), records)?;
        tmp.persist(&self.path).map_err(|err| classify_io(err.error))?;
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

fn write_records<R: Serialize>(file: &mut File, records: &[R]) -> Result<(), StoreError> {
    let mut writer = BufWriter::new(file);

    for record in records {
        let line = serde_json::to_vec(record).map_err(StoreError::Encode)?;
        writer.write_all(&line).map_err(classify_io)?;
        writer.write_all(b"\n").map_err(classify_io)?;
    }

    let file = writer
        .into_inner()
        .map_err(|err| classify_io(err.into_error()))?;
    file.sync_all().map_err(classify_io)?;
    Ok(())
}

/// Lock contention shows up as permission or would-block errors.
fn classify_io(err: std::io::Error) -> StoreError {
    match err.kind() {
        ErrorKind::PermissionDenied | ErrorKind::WouldBlock => StoreError::Locked(err),
        _ => StoreError::Io(err),
    }
}

/// Drops the oldest records so at most `retention` remain. Returns how many were dropped.
pub fn trim_to_retention<R>(records: &mut Vec<R>, retention: usize) -> usize {
    if records.len() <= retention {
        return 0;
    }
    let excess = records.len() - retention;
    records.drain(..excess);
    excess
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

/// Append-only record log with bounded retention.
///
/// Every operation runs inside one mutex, so readers and writers of the same
/// store are fully serialised. The guard travels into the blocking task, so a
/// caller that gives up waiting does not release the store mid-write. Writes
/// rebuild the whole content and hand it to the backend's atomic `replace`.
/// Operations hitting a locked file are retried with exponential backoff; the
/// lock is released while sleeping.
pub struct DurableStore<R> {
    name: &'static str,
    backend: Arc<dyn StorageBackend<R>>,
    lock: Arc<Mutex<()>>,
    retention: usize,
    retry: RetryPolicy,
}

impl<R: Record> DurableStore<R> {
    pub fn new(name: &'static str, backend: Arc<dyn StorageBackend<R>>, retention: usize) -> Self {
        Self {
            name,
            backend,
            lock: Arc::new(Mutex::new(())),
            retention,
            retry: RetryPolicy::default(),
        }
    }

    pub fn json_lines(name: &'static str, path: impl Into<PathBuf>, retention: usize) -> Self {
        Self::new(name, Arc::new(JsonLinesFile::<R>::new(path)), retention)
    }

    pub fn location(&self) -> String {
        self.backend.location()
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    pub async fn append(&self, record: R) -> Result<(), StoreError> {
        self.append_and_inspect(record, |_| ()).await
    }

    /// Appends `record` and runs `inspect` over the full content, new record
    /// last, before retention is applied. Both happen in one locked operation,
    /// so no other writer can slip in between.
    pub async fn append_and_inspect<T, F>(&self, record: R, inspect: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: Fn(&[R]) -> T + Clone + Send + 'static,
    {
        let start = Instant::now();
        let retention = self.retention;

        let result = self
            .run_locked("append", move |backend| {
                let mut records = backend.load()?;
                records.push(record.clone());
                let seen = inspect(&records);
                let evicted = trim_to_retention(&mut records, retention);
                backend.replace(&records)?;
                Ok((seen, evicted))
            })
            .await;

        STORE_WRITE_SECONDS.observe(start.elapsed().as_secs_f64());

        let (seen, evicted) = result?;
        if evicted > 0 {
            debug!(
                "Store {} evicted {} record(s) beyond retention {}",
                self.name, evicted, retention
            );
        }
        Ok(seen)
    }

    /// All records, oldest first. A missing file reads as empty.
    pub async fn read_all(&self) -> Result<Vec<R>, StoreError> {
        self.run_locked("read", |backend| backend.load()).await
    }

    pub async fn latest(&self) -> Result<Option<R>, StoreError> {
        Ok(self.read_all().await?.pop())
    }

    /// Up to `limit` most recent records, newest first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<R>, StoreError> {
        let mut records = self.read_all().await?;
        let skip = records.len().saturating_sub(limit);
        records.drain(..skip);
        records.reverse();
        Ok(records)
    }

    /// Records at or after `cutoff`, newest first.
    pub async fn since(&self, cutoff: DateTime<Utc>) -> Result<Vec<R>, StoreError> {
        let mut records: Vec<R> = self
            .read_all()
            .await?
            .into_iter()
            .filter(|record| record.timestamp() >= cutoff)
            .collect();
        records.reverse();
        Ok(records)
    }

    pub async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.read_all().await?.len())
    }

    async fn run_locked<T, F>(&self, op: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: Fn(&dyn StorageBackend<R>) -> Result<T, StoreError> + Clone + Send + 'static,
    {
        let mut backoff = self.retry.initial_backoff;
        let mut attempt = 0;

        loop {
            attempt += 1;

            let guard = Arc::clone(&self.lock).lock_owned().await;
            let backend = Arc::clone(&self.backend);
            let f = f.clone();
            let result = tokio::task::spawn_blocking(move || {
                let _guard = guard;
                f(backend.as_ref())
            })
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?;

            match result {
                Ok(value) => {
                    if attempt > 1 {
                        info!(
                            "Store {} {} succeeded after {} attempts",
                            self.name, op, attempt
                        );
                    }
                    return Ok(value);
                }
                Err(StoreError::Locked(source)) => {
                    if attempt >= self.retry.max_attempts {
                        error!(
                            "Store {} {} failed after {} attempts: file locked: {}",
                            self.name, op, attempt, source
                        );
                        return Err(StoreError::Unavailable {
                            attempts: attempt,
                            source,
                        });
                    }

                    warn!(
                        "Store {} file locked during {} (attempt {}/{}), retrying in {:?}",
                        self.name, op, attempt, self.retry.max_attempts, backoff
                    );
                    STORE_RETRIES_TOTAL.inc();
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(err) => {
                    error!("Store {} {} failed: {}", self.name, op, err);
                    return Err(err);
                }
            }
        }
    }
}
