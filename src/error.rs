//! Error types for the dispatch core.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::queue::model::{JobId, JobState, QueueName};

/// Top-level error type for the dispatch core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Dispatch task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Unknown queue name: {0}")]
    UnknownQueue(String),
}

/// QueueStore invariant violations.
///
/// The caller is always the core itself, so these indicate a programming
/// error rather than an operational outcome.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Job {id} not found")]
    NotFound { id: JobId },

    #[error("Job {id} is {state}, not running")]
    NotRunning { id: JobId, state: JobState },

    #[error("Job {id} already present in queue {queue}")]
    Duplicate { id: JobId, queue: QueueName },
}

impl QueueError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::NotRunning { .. } => Some(ErrorKind::NotRunning),
            _ => None,
        }
    }
}

/// SessionRegistry errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session already open for job {job_id}")]
    AlreadyOpen { job_id: JobId },
}

/// Errors reported by an executor backend.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Executor I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Executor exited with code {exit_code:?}: {message}")]
    Exited {
        exit_code: Option<i32>,
        message: String,
    },

    #[error("Executor failed: {0}")]
    Failed(String),

    #[error("Executor cancelled")]
    Cancelled,

    #[error("Executor did not terminate within {grace:?}")]
    Zombie { grace: Duration },
}

impl ExecutorError {
    /// Exit code of the backing process, when there was one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exited { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Cancelled => ErrorKind::Interrupted,
            Self::Zombie { .. } => ErrorKind::Zombie,
            Self::Io(_) | Self::Exited { .. } | Self::Failed(_) => ErrorKind::ExecutorFailure,
        }
    }
}

/// Append-only run log errors.
#[derive(Debug, thiserror::Error)]
pub enum RunLogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Notification delivery errors. Never fail a state transition.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Notification channel closed")]
    Closed,
}

/// Tag carried by a failed job's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A session for the job was already open.
    AlreadyOpen,
    /// complete/fail was called on a record that is not running.
    NotRunning,
    /// The job exceeded its `timeout_seconds` budget.
    TimedOut,
    /// The job was interrupted through its session or by shutdown.
    Interrupted,
    /// The backend exited non-zero, returned an error, or panicked.
    ExecutorFailure,
    /// Termination of the backend could not be confirmed.
    Zombie,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AlreadyOpen => "already_open",
            Self::NotRunning => "not_running",
            Self::TimedOut => "timed_out",
            Self::Interrupted => "interrupted",
            Self::ExecutorFailure => "executor_failure",
            Self::Zombie => "zombie",
        };
        write!(f, "{s}")
    }
}

/// Result type alias for the dispatch core.
pub type Result<T> = std::result::Result<T, Error>;
