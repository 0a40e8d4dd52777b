//! Executor capability: the external backend that does the actual work.
//!
//! The core treats a unit of work as an opaque [`Task`] and hands it to an
//! [`Executor`] together with an [`Invocation`]: the job's cancellation
//! token, a sink for progress events, and (interactive mode only) the stream
//! of injected messages.

pub mod process;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ExecutorError;
use crate::queue::model::{JobId, Task};

pub use process::{ProcessExecutor, ProcessExecutorConfig};

/// One observable event from a running invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutorEvent {
    /// Unstructured output line.
    Output { text: String },
    /// Structured event from the backend's stream.
    Message { data: serde_json::Value },
    /// The backend finished one exchange.
    TurnCompleted,
}

/// Sending half for executor events. Emission order is delivery order.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ExecutorEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<ExecutorEvent>) -> Self {
        Self { tx }
    }

    /// Returns false once the dispatcher has stopped listening.
    pub fn emit(&self, event: ExecutorEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Everything an executor receives besides the task itself.
#[derive(Debug)]
pub struct Invocation {
    pub job_id: JobId,
    /// Cancelled on interrupt, timeout, or shutdown. Executors should stop
    /// promptly and return [`ExecutorError::Cancelled`].
    pub cancel: CancellationToken,
    pub events: EventSink,
    /// Injected messages; present only for interactive invocations.
    pub injected: Option<mpsc::UnboundedReceiver<String>>,
}

impl Invocation {
    pub fn is_interactive(&self) -> bool {
        self.injected.is_some()
    }
}

/// Successful outcome of an invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutorOutput {
    pub output: String,
    pub cost: Option<Decimal>,
    pub duration_ms: Option<u64>,
    pub exit_code: Option<i32>,
}

impl ExecutorOutput {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Default::default()
        }
    }
}

/// Pluggable execution backend.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Run `task` to completion, cancellation, or failure.
    async fn invoke(
        &self,
        task: &Task,
        invocation: Invocation,
    ) -> Result<ExecutorOutput, ExecutorError>;

    /// Best-effort termination after the invocation future was abandoned.
    /// Returns true when the backend confirms nothing is left running.
    async fn terminate(&self, _job_id: JobId) -> bool {
        true
    }
}
