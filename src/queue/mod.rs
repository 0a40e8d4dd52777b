//! Job queue: records, the four-queue store, and restart recovery.
//!
//! - `model`: JobRecord, Task, JobResult (TODO → RUNNING → DONE/DEAD)
//! - `store`: QueueStore: one table, per-queue ordered indices
//! - `recovery`: startup sweep for records stranded in `run`
//! - `run_log`: append-only JSONL log of every transition

pub mod model;
pub mod recovery;
pub mod run_log;
pub mod store;

pub use model::{
    ExecutionMode, JobId, JobRecord, JobResult, JobState, JobSummary, QueueName, ResultError,
    SessionId, Task,
};
pub use recovery::{RecoveryPolicy, RecoveryReport, recover_stranded};
pub use run_log::{JsonlRunLog, NoopRunLog, RunLog};
pub use store::{QueueCounts, QueueStore};
