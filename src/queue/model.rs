//! Job record, task, and result types.

use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConfigError, ErrorKind, QueueError};

/// Default turn cap for interactive jobs.
pub const DEFAULT_MAX_TURNS: u32 = 50;

/// Default wall-clock budget for a job, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 3600;

/// Opaque job identifier, assigned at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier handed to callers for an open interactive session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting in the `todo` queue.
    Todo,
    /// Claimed by a worker and executing.
    Running,
    /// Finished successfully.
    Done,
    /// Failed, timed out, or was interrupted.
    Dead,
}

impl JobState {
    /// Only forward transitions exist: TODO -> RUNNING -> DONE | DEAD.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, target),
            (Todo, Running) | (Running, Done) | (Running, Dead)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Dead)
    }

    /// The queue a record in this state belongs to.
    pub fn queue(&self) -> QueueName {
        match self {
            Self::Todo => QueueName::Todo,
            Self::Running => QueueName::Run,
            Self::Done => QueueName::Done,
            Self::Dead => QueueName::Dead,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Todo => "todo",
            Self::Running => "running",
            Self::Done => "done",
            Self::Dead => "dead",
        };
        write!(f, "{s}")
    }
}

/// The four named queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Todo,
    Run,
    Done,
    Dead,
}

impl QueueName {
    pub const ALL: [QueueName; 4] = [Self::Todo, Self::Run, Self::Done, Self::Dead];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::Run => "run",
            Self::Done => "done",
            Self::Dead => "dead",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(Self::Todo),
            "run" => Ok(Self::Run),
            "done" => Ok(Self::Done),
            "dead" => Ok(Self::Dead),
            other => Err(ConfigError::UnknownQueue(other.to_string())),
        }
    }
}

/// How the executor is invoked for a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Single request/response with no mid-flight control.
    #[default]
    Bounded,
    /// Long-lived invocation controlled through an open session.
    Interactive,
}

/// Opaque description of a unit of work. Immutable after submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub project: String,
    pub prompt: String,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

fn default_max_turns() -> u32 {
    DEFAULT_MAX_TURNS
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Task {
    /// Create a bounded task with default limits.
    pub fn new(project: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            prompt: prompt.into(),
            mode: ExecutionMode::Bounded,
            max_turns: DEFAULT_MAX_TURNS,
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
            working_dir: None,
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_timeout_seconds(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_seconds)
    }
}

/// Error payload of a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome attached to a job when it reaches DONE or DEAD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResultError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub turns: u32,
    /// Always zero: failed jobs are never retried in place.
    #[serde(default)]
    pub retry_count: u32,
}

impl JobResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            session_id: None,
            output: Some(output.into()),
            cost: None,
            duration_ms: None,
            error: None,
            exit_code: None,
            turns: 0,
            retry_count: 0,
        }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            session_id: None,
            output: None,
            cost: None,
            duration_ms: None,
            error: Some(ResultError {
                kind,
                message: message.into(),
            }),
            exit_code: None,
            turns: 0,
            retry_count: 0,
        }
    }

    pub fn with_session(mut self, session_id: Option<SessionId>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_turns(mut self, turns: u32) -> Self {
        self.turns = turns;
        self
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// A unit of queued work and its lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub state: JobState,
    pub task: Task,
    /// Insertion sequence number; the FIFO ordering key.
    pub seq: u64,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
}

impl JobRecord {
    pub(crate) fn new(task: Task, seq: u64) -> Self {
        Self {
            id: JobId::new(),
            state: JobState::Todo,
            task,
            seq,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
        }
    }

    /// TODO -> RUNNING.
    pub(crate) fn start(&mut self) -> Result<(), QueueError> {
        self.check_transition(JobState::Running)?;
        self.state = JobState::Running;
        self.started_at = Some(Utc::now().max(self.submitted_at));
        Ok(())
    }

    /// RUNNING -> DONE | DEAD.
    pub(crate) fn finish(&mut self, target: JobState, result: JobResult) -> Result<(), QueueError> {
        if self.state != JobState::Running || !target.is_terminal() {
            return Err(QueueError::NotRunning {
                id: self.id,
                state: self.state,
            });
        }
        self.check_transition(target)?;
        let started = self.started_at.unwrap_or(self.submitted_at);
        self.state = target;
        self.finished_at = Some(Utc::now().max(started));
        self.result = Some(result);
        Ok(())
    }

    fn check_transition(&self, target: JobState) -> Result<(), QueueError> {
        if self.state.can_transition_to(target) {
            Ok(())
        } else {
            Err(QueueError::NotRunning {
                id: self.id,
                state: self.state,
            })
        }
    }

    pub fn queue(&self) -> QueueName {
        self.state.queue()
    }

    /// Time spent running, if the job has started.
    pub fn elapsed(&self) -> Option<std::time::Duration> {
        self.started_at.map(|start| {
            let end = self.finished_at.unwrap_or_else(Utc::now);
            (end - start).to_std().unwrap_or_default()
        })
    }
}

/// Listing view of a job, with its derived queue position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub state: JobState,
    pub project: String,
    pub mode: ExecutionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
}

impl JobSummary {
    pub fn from_record(record: &JobRecord, queue_position: Option<usize>) -> Self {
        Self {
            id: record.id,
            state: record.state,
            project: record.task.project.clone(),
            mode: record.task.mode,
            queue_position,
            submitted_at: record.submitted_at,
            started_at: record.started_at,
            finished_at: record.finished_at,
            result: record.result.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_valid() {
        assert!(JobState::Todo.can_transition_to(JobState::Running));
        assert!(JobState::Running.can_transition_to(JobState::Done));
        assert!(JobState::Running.can_transition_to(JobState::Dead));
    }

    #[test]
    fn state_transitions_invalid() {
        assert!(!JobState::Todo.can_transition_to(JobState::Done));
        assert!(!JobState::Todo.can_transition_to(JobState::Dead));
        assert!(!JobState::Running.can_transition_to(JobState::Todo));
        assert!(!JobState::Done.can_transition_to(JobState::Dead));
        assert!(!JobState::Dead.can_transition_to(JobState::Running));
        assert!(!JobState::Running.can_transition_to(JobState::Running));
    }

    #[test]
    fn record_lifecycle_sets_timestamps_once_in_order() {
        let mut record = JobRecord::new(Task::new("proj", "do it"), 0);
        assert!(record.started_at.is_none());

        record.start().unwrap();
        assert_eq!(record.state, JobState::Running);
        let started = record.started_at.unwrap();
        assert!(started >= record.submitted_at);

        assert!(record.start().is_err());
        assert_eq!(record.started_at, Some(started));

        record
            .finish(JobState::Done, JobResult::success("ok"))
            .unwrap();
        assert_eq!(record.queue(), QueueName::Done);
        assert!(record.finished_at.unwrap() >= started);

        let err = record
            .finish(JobState::Dead, JobResult::failure(ErrorKind::TimedOut, "late"))
            .unwrap_err();
        assert!(matches!(err, QueueError::NotRunning { state: JobState::Done, .. }));
    }

    #[test]
    fn finish_from_todo_is_rejected() {
        let mut record = JobRecord::new(Task::new("proj", "x"), 0);
        assert!(record
            .finish(JobState::Done, JobResult::success(""))
            .is_err());
        assert_eq!(record.state, JobState::Todo);
        assert!(record.result.is_none());
    }

    #[test]
    fn task_defaults_from_json() {
        let task: Task =
            serde_json::from_str(r#"{"project":"p","prompt":"hello"}"#).unwrap();
        assert_eq!(task.mode, ExecutionMode::Bounded);
        assert_eq!(task.max_turns, 50);
        assert_eq!(task.timeout_seconds, 3600);
        assert!(task.working_dir.is_none());

        let task: Task = serde_json::from_str(
            r#"{"project":"p","prompt":"hello","mode":"interactive","max_turns":3}"#,
        )
        .unwrap();
        assert_eq!(task.mode, ExecutionMode::Interactive);
        assert_eq!(task.max_turns, 3);
    }

    #[test]
    fn queue_name_parse() {
        assert_eq!("dead".parse::<QueueName>().unwrap(), QueueName::Dead);
        assert!("archive".parse::<QueueName>().is_err());
        assert_eq!(JobState::Running.queue(), QueueName::Run);
    }

    #[test]
    fn failure_result_carries_kind() {
        let result = JobResult::failure(ErrorKind::Interrupted, "stopped")
            .with_exit_code(Some(130));
        assert!(!result.success);
        assert_eq!(result.error_kind(), Some(ErrorKind::Interrupted));
        assert_eq!(result.exit_code, Some(130));
        assert_eq!(result.retry_count, 0);
    }

    #[test]
    fn job_state_display() {
        assert_eq!(JobState::Running.to_string(), "running");
        assert_eq!(QueueName::Run.to_string(), "run");
    }
}
