//! Append-only run log: every transition of every job, one JSON line each.
//!
//! The log is history, not the source of truth: append failures are logged
//! by the caller and never affect the transition. On startup the log can be
//! replayed into a [`QueueStore`](crate::queue::QueueStore) via `restore`.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use crate::error::RunLogError;
use crate::queue::model::{JobId, JobRecord, JobState};

/// Sink for historical run metadata.
pub trait RunLog: Send + Sync {
    fn append(&self, record: &JobRecord) -> Result<(), RunLogError>;
}

/// Discards every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRunLog;

impl RunLog for NoopRunLog {
    fn append(&self, _record: &JobRecord) -> Result<(), RunLogError> {
        Ok(())
    }
}

/// JSON-lines file opened in append mode.
#[derive(Debug)]
pub struct JsonlRunLog {
    file: Mutex<File>,
}

impl JsonlRunLog {
    /// Open (or create) the log at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RunLogError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Fold the log into the latest known record per job.
    ///
    /// Lines are not guaranteed to be in transition order across writers, so
    /// the furthest-along state wins rather than the last line. Malformed
    /// lines (e.g. a torn final write) are skipped.
    pub fn replay(path: impl AsRef<Path>) -> Result<Vec<JobRecord>, RunLogError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(path)?);
        let mut latest: HashMap<JobId, JobRecord> = HashMap::new();

        // split on raw bytes: a torn write can cut a multi-byte character
        for line in reader.split(b'\n') {
            let line = line?;
            if line.trim_ascii().is_empty() {
                continue;
            }
            let record: JobRecord = match serde_json::from_slice(&line) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping malformed run log line");
                    continue;
                }
            };
            match latest.get(&record.id) {
                Some(existing) if rank(existing.state) >= rank(record.state) => {}
                _ => {
                    latest.insert(record.id, record);
                }
            }
        }

        let mut records: Vec<JobRecord> = latest.into_values().collect();
        records.sort_by_key(|r| r.seq);
        Ok(records)
    }
}

fn rank(state: JobState) -> u8 {
    match state {
        JobState::Todo => 0,
        JobState::Running => 1,
        JobState::Done | JobState::Dead => 2,
    }
}

impl RunLog for JsonlRunLog {
    fn append(&self, record: &JobRecord) -> Result<(), RunLogError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}
