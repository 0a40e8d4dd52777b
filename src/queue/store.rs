//! QueueStore: one job table with per-queue ordered indices.
//!
//! Records live in a single `HashMap`; the four named queues are index
//! sequences over it. Every transition updates the record and moves its id
//! between indices inside one write section, so queue membership and
//! `state` never disagree.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::Notify;
use tracing::{debug, info};

use crate::error::QueueError;
use crate::notify::{self, Notification, NotificationKind, NotificationSink, NoopNotifier};
use crate::queue::model::{JobId, JobRecord, JobResult, JobState, QueueName, Task};

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, JobRecord>,
    todo: VecDeque<JobId>,
    run: Vec<JobId>,
    done: Vec<JobId>,
    dead: Vec<JobId>,
    next_seq: u64,
}

impl Inner {
    fn index(&self, queue: QueueName) -> Box<dyn Iterator<Item = &JobId> + '_> {
        match queue {
            QueueName::Todo => Box::new(self.todo.iter()),
            QueueName::Run => Box::new(self.run.iter()),
            QueueName::Done => Box::new(self.done.iter()),
            QueueName::Dead => Box::new(self.dead.iter()),
        }
    }

    fn push(&mut self, queue: QueueName, id: JobId) {
        match queue {
            QueueName::Todo => self.todo.push_back(id),
            QueueName::Run => self.run.push(id),
            QueueName::Done => self.done.push(id),
            QueueName::Dead => self.dead.push(id),
        }
    }

    fn insert_todo(&mut self, task: Task) -> JobId {
        let record = JobRecord::new(task, self.next_seq);
        self.next_seq += 1;
        let id = record.id;
        self.jobs.insert(id, record);
        self.todo.push_back(id);
        id
    }

    fn start(&mut self, id: JobId) -> Result<JobRecord, QueueError> {
        let record = self.jobs.get_mut(&id).ok_or(QueueError::NotFound { id })?;
        record.start()?;
        let snapshot = record.clone();
        self.run.push(id);
        Ok(snapshot)
    }

    fn finish(
        &mut self,
        id: JobId,
        target: JobState,
        result: JobResult,
    ) -> Result<JobRecord, QueueError> {
        let record = self.jobs.get_mut(&id).ok_or(QueueError::NotFound { id })?;
        record.finish(target, result)?;
        let snapshot = record.clone();
        self.run.retain(|r| *r != id);
        self.push(target.queue(), id);
        Ok(snapshot)
    }

    fn position(&self, id: JobId) -> Option<usize> {
        self.todo.iter().position(|r| *r == id)
    }
}

/// Per-queue record counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct QueueCounts {
    pub todo: usize,
    pub run: usize,
    pub done: usize,
    pub dead: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.todo + self.run + self.done + self.dead
    }
}

/// Durable ordered storage for job records, partitioned into the `todo`,
/// `run`, `done` and `dead` queues.
pub struct QueueStore {
    inner: RwLock<Inner>,
    notifier: Arc<dyn NotificationSink>,
    work_available: Notify,
}

impl QueueStore {
    /// Create an empty store that emits into `notifier`.
    pub fn new(notifier: Arc<dyn NotificationSink>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            notifier,
            work_available: Notify::new(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, kind: NotificationKind, record: &JobRecord, payload: serde_json::Value) {
        notify::emit(
            self.notifier.as_ref(),
            Notification::new(kind, record.id, payload),
        );
    }

    /// Append a new TODO record to the tail of the `todo` queue.
    pub fn enqueue(&self, task: Task) -> JobRecord {
        let record = {
            let mut inner = self.write();
            let id = inner.insert_todo(task);
            let position = inner.todo.len() - 1;
            let record = inner.jobs[&id].clone();
            self.emit(
                NotificationKind::Queued,
                &record,
                serde_json::json!({
                    "project": record.task.project,
                    "queue_position": position,
                }),
            );
            record
        };

        info!(job_id = %record.id, seq = record.seq, project = %record.task.project, "Job enqueued");
        self.work_available.notify_one();
        record
    }

    /// Atomically move the head of `todo` into `run`.
    ///
    /// Returns `None` when `todo` is empty. The pop and the state change
    /// happen in one write section, so no two callers can claim the same
    /// record.
    pub fn claim_next(&self) -> Option<JobRecord> {
        let record = {
            let mut inner = self.write();
            let id = inner.todo.pop_front()?;
            match inner.start(id) {
                Ok(record) => {
                    self.emit(NotificationKind::Started, &record, started_payload(&record));
                    record
                }
                Err(e) => {
                    tracing::error!(job_id = %id, error = %e, "Claimed id was not claimable");
                    return None;
                }
            }
        };

        info!(job_id = %record.id, seq = record.seq, "Job claimed");
        Some(record)
    }

    /// Enqueue and immediately claim a record for a caller that runs it
    /// directly. Both transitions happen in one write section.
    pub fn enqueue_claimed(&self, task: Task) -> Result<JobRecord, QueueError> {
        let record = {
            let mut inner = self.write();
            let id = inner.insert_todo(task);
            inner.todo.pop_back();
            let queued = inner.jobs[&id].clone();
            self.emit(
                NotificationKind::Queued,
                &queued,
                serde_json::json!({ "project": queued.task.project, "queue_position": 0 }),
            );
            let record = inner.start(id)?;
            self.emit(NotificationKind::Started, &record, started_payload(&record));
            record
        };

        info!(job_id = %record.id, seq = record.seq, "Job enqueued and claimed");
        Ok(record)
    }

    /// Move a RUNNING record to `done`.
    pub fn complete(&self, id: JobId, result: JobResult) -> Result<JobRecord, QueueError> {
        self.finish(id, JobState::Done, result)
    }

    /// Move a RUNNING record to `dead`.
    pub fn fail(&self, id: JobId, result: JobResult) -> Result<JobRecord, QueueError> {
        self.finish(id, JobState::Dead, result)
    }

    /// Emit a PROGRESS event for a RUNNING job.
    ///
    /// Holds the read lock while emitting, so progress can never be
    /// delivered after the job's terminal notification. Returns false when
    /// the job is not running.
    pub fn progress(&self, id: JobId, payload: serde_json::Value) -> bool {
        let inner = self.read();
        match inner.jobs.get(&id) {
            Some(record) if record.state == JobState::Running => {
                self.emit(NotificationKind::Progress, record, payload);
                true
            }
            _ => false,
        }
    }

    fn finish(
        &self,
        id: JobId,
        target: JobState,
        result: JobResult,
    ) -> Result<JobRecord, QueueError> {
        let record = {
            let mut inner = self.write();
            let record = inner.finish(id, target, result)?;
            let kind = if target == JobState::Done {
                NotificationKind::Completed
            } else {
                NotificationKind::Failed
            };
            let payload = serde_json::to_value(&record.result).unwrap_or_default();
            self.emit(kind, &record, payload);
            record
        };

        info!(job_id = %id, state = %record.state, "Job finished");
        Ok(record)
    }

    /// Point-in-time snapshot of one queue, in queue order.
    pub fn list(&self, queue: QueueName) -> Vec<JobRecord> {
        let inner = self.read();
        inner
            .index(queue)
            .filter_map(|id| inner.jobs.get(id).cloned())
            .collect()
    }

    pub fn get(&self, id: JobId) -> Option<JobRecord> {
        self.read().jobs.get(&id).cloned()
    }

    /// Zero-based position in `todo`, derived at read time.
    pub fn queue_position(&self, id: JobId) -> Option<usize> {
        self.read().position(id)
    }

    pub fn counts(&self) -> QueueCounts {
        let inner = self.read();
        QueueCounts {
            todo: inner.todo.len(),
            run: inner.run.len(),
            done: inner.done.len(),
            dead: inner.dead.len(),
        }
    }

    /// Rebuild the store from persisted records.
    ///
    /// Records are placed into the queue matching their state, ordered by
    /// `seq`. Stranded RUNNING records stay in `run` until a recovery sweep
    /// decides what to do with them.
    ///
    /// The batch is checked before anything is inserted: on `Duplicate` the
    /// store is left unchanged.
    pub fn restore(&self, mut records: Vec<JobRecord>) -> Result<usize, QueueError> {
        records.sort_by_key(|r| r.seq);
        let mut inner = self.write();

        let mut incoming = HashMap::with_capacity(records.len());
        for record in &records {
            let existing = inner
                .jobs
                .get(&record.id)
                .map(JobRecord::queue)
                .or_else(|| incoming.insert(record.id, record.queue()));
            if let Some(queue) = existing {
                return Err(QueueError::Duplicate {
                    id: record.id,
                    queue,
                });
            }
        }

        let mut restored = 0;
        for record in records {
            inner.next_seq = inner.next_seq.max(record.seq + 1);
            let (id, queue) = (record.id, record.queue());
            inner.jobs.insert(id, record);
            inner.push(queue, id);
            restored += 1;
        }
        debug!(count = restored, "Restored job records");
        drop(inner);

        if restored > 0 {
            self.work_available.notify_one();
        }
        Ok(restored)
    }

    /// Wait until an enqueue signals new work.
    pub async fn wait_for_work(&self) {
        self.work_available.notified().await;
    }
}

impl Default for QueueStore {
    fn default() -> Self {
        Self::new(Arc::new(NoopNotifier))
    }
}

fn started_payload(record: &JobRecord) -> serde_json::Value {
    serde_json::json!({ "mode": record.task.mode })
}
