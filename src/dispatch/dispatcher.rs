//! Dispatcher: claims jobs, runs them through the executor, and settles
//! them into `done` or `dead`.
//!
//! Each claimed job is owned by its own watch task from the moment it is
//! claimed: the task opens the session, spawns the invocation outside every
//! store and registry lock, forwards executor events, enforces the timeout
//! budget, and settles the record. Callers only await the settled result, so
//! a caller that goes away never strands a job in `run`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ErrorKind, ExecutorError, Result};
use crate::executor::{EventSink, Executor, ExecutorEvent, ExecutorOutput, Invocation};
use crate::queue::model::{ExecutionMode, JobId, JobRecord, JobResult, SessionId, Task};
use crate::queue::{QueueStore, RunLog};
use crate::session::{Session, SessionRegistry};

/// Caller-supplied observer for interactive executor events.
pub type MessageSink = Arc<dyn Fn(&ExecutorEvent) + Send + Sync>;

/// How a claimed job is invoked.
#[derive(Clone)]
pub enum InvocationMode {
    /// Single request/response. No session is opened.
    Bounded,
    /// Session-backed invocation; every executor event is passed to the sink
    /// in emission order, and never after the invocation ends.
    Interactive(MessageSink),
}

impl InvocationMode {
    /// Interactive mode whose events only reach the notification sink.
    pub fn detached() -> Self {
        Self::Interactive(Arc::new(|_| {}))
    }

    fn for_task(task: &Task) -> Self {
        match task.mode {
            ExecutionMode::Bounded => Self::Bounded,
            ExecutionMode::Interactive => Self::detached(),
        }
    }
}

impl std::fmt::Debug for InvocationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bounded => f.write_str("Bounded"),
            Self::Interactive(_) => f.write_str("Interactive"),
        }
    }
}

/// Receipt for a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Submission {
    pub job_id: JobId,
    pub queue_position: Option<usize>,
}

/// Collaborators the dispatcher is built from.
pub struct DispatcherDeps {
    pub store: Arc<QueueStore>,
    pub sessions: Arc<SessionRegistry>,
    pub executor: Arc<dyn Executor>,
    pub run_log: Arc<dyn RunLog>,
}

impl DispatcherDeps {
    /// Fresh session registry and no run log.
    pub fn new(store: Arc<QueueStore>, executor: Arc<dyn Executor>) -> Self {
        Self {
            store,
            sessions: Arc::new(SessionRegistry::new()),
            executor,
            run_log: Arc::new(crate::queue::NoopRunLog),
        }
    }

    pub fn with_run_log(mut self, run_log: Arc<dyn RunLog>) -> Self {
        self.run_log = run_log;
        self
    }
}

/// How the watch loop over a running invocation ended.
enum Outcome {
    Finished(std::result::Result<std::result::Result<ExecutorOutput, ExecutorError>, JoinError>),
    Cancelled,
    TimedOut,
}

/// State shared by the dispatcher and every watch task it spawns.
struct Shared {
    store: Arc<QueueStore>,
    sessions: Arc<SessionRegistry>,
    executor: Arc<dyn Executor>,
    run_log: Arc<dyn RunLog>,
    grace_period: Duration,
}

/// Routes jobs from the queue store to the executor.
pub struct Dispatcher {
    shared: Arc<Shared>,
    /// Parent of every job's cancellation token.
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(deps: DispatcherDeps, grace_period: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                store: deps.store,
                sessions: deps.sessions,
                executor: deps.executor,
                run_log: deps.run_log,
                grace_period,
            }),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &Arc<QueueStore> {
        &self.shared.store
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.shared.sessions
    }

    /// Token cancelled by [`shutdown`](Self::shutdown).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Enqueue a task for the worker pool.
    pub fn submit(&self, task: Task) -> Submission {
        let record = self.shared.store.enqueue(task);
        self.shared.append(&record);
        Submission {
            job_id: record.id,
            queue_position: self.shared.store.queue_position(record.id),
        }
    }

    /// Run a task in BOUNDED mode and wait for its result.
    ///
    /// Executor failures, timeouts and interruptions all come back as a
    /// failed [`JobResult`]; `Err` means a queue invariant was violated.
    /// Dropping the returned future does not cancel the job.
    pub async fn dispatch(&self, task: Task) -> Result<JobResult> {
        let record = self
            .shared
            .store
            .enqueue_claimed(task.with_mode(ExecutionMode::Bounded))?;
        self.execute(record, InvocationMode::Bounded).await
    }

    /// Run a task in INTERACTIVE mode, passing every executor event to
    /// `on_message`, and wait for its result.
    pub async fn dispatch_interactive<F>(&self, task: Task, on_message: F) -> Result<JobResult>
    where
        F: Fn(&ExecutorEvent) + Send + Sync + 'static,
    {
        let record = self
            .shared
            .store
            .enqueue_claimed(task.with_mode(ExecutionMode::Interactive))?;
        self.execute(record, InvocationMode::Interactive(Arc::new(on_message)))
            .await
    }

    /// Claim the head of `todo` and run it in the mode its task declares.
    /// Returns `Ok(None)` when there was nothing to claim.
    pub async fn run_next(&self) -> Result<Option<JobResult>> {
        let Some(record) = self.shared.store.claim_next() else {
            return Ok(None);
        };
        let mode = InvocationMode::for_task(&record.task);
        self.execute(record, mode).await.map(Some)
    }

    /// Forward a message into a live session. False if the session is
    /// unknown, closed, out of turns, or no longer reading input.
    pub fn inject(&self, session_id: SessionId, message: impl Into<String>) -> bool {
        self.shared
            .sessions
            .lookup_session(session_id)
            .is_some_and(|session| session.inject(message))
    }

    /// Request cooperative cancellation of a live session.
    pub fn interrupt(&self, session_id: SessionId) -> bool {
        self.shared
            .sessions
            .lookup_session(session_id)
            .is_some_and(|session| session.interrupt())
    }

    pub fn get_active_sessions(&self) -> HashSet<SessionId> {
        self.shared.sessions.active()
    }

    /// Cancel every running invocation. Running jobs end as `Interrupted`.
    pub fn shutdown(&self) {
        info!("Dispatcher shutting down");
        self.shutdown.cancel();
    }

    /// Hand a claimed record to its watch task and wait for the outcome.
    ///
    /// The watch task runs under a supervisor so that a panic inside it
    /// (for instance in a caller's `on_message`) still settles the job.
    async fn execute(&self, record: JobRecord, mode: InvocationMode) -> Result<JobResult> {
        let job_id = record.id;
        let cancel = self.shutdown.child_token();
        let shared = Arc::clone(&self.shared);

        let supervisor = tokio::spawn(async move {
            let watch = {
                let shared = Arc::clone(&shared);
                let cancel = cancel.clone();
                tokio::spawn(async move { shared.run(record, mode, cancel).await })
            };
            match watch.await {
                Ok(result) => result,
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "Watch task failed");
                    cancel.cancel();
                    shared.sessions.close(job_id);
                    shared.settle(
                        job_id,
                        JobResult::failure(ErrorKind::ExecutorFailure, "dispatch task panicked"),
                    )
                }
            }
        });

        supervisor.await?
    }
}

impl Shared {
    async fn run(
        &self,
        record: JobRecord,
        mode: InvocationMode,
        cancel: CancellationToken,
    ) -> Result<JobResult> {
        self.append(&record);
        let job_id = record.id;

        let (session, injected, on_message) = match mode {
            InvocationMode::Bounded => (None, None, None),
            InvocationMode::Interactive(sink) => {
                match self
                    .sessions
                    .open(job_id, record.task.max_turns, cancel.clone())
                {
                    Ok((session, rx)) => (Some(session), Some(rx), Some(sink)),
                    Err(e) => {
                        error!(job_id = %job_id, error = %e, "Could not open session");
                        let result = JobResult::failure(ErrorKind::AlreadyOpen, e.to_string());
                        return self.settle(job_id, result);
                    }
                }
            }
        };
        let session_id = session.as_ref().map(|s| s.session_id());

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let invocation = Invocation {
            job_id,
            cancel: cancel.clone(),
            events: EventSink::new(events_tx),
            injected,
        };

        info!(
            job_id = %job_id,
            executor = self.executor.name(),
            mode = ?record.task.mode,
            "Invoking executor"
        );
        let started = Instant::now();
        let executor = Arc::clone(&self.executor);
        let task = record.task.clone();
        let mut handle = tokio::spawn(async move { executor.invoke(&task, invocation).await });

        let budget = record
            .task
            .timeout()
            .saturating_sub(record.elapsed().unwrap_or_default());
        let deadline = tokio::time::sleep(budget);
        tokio::pin!(deadline);

        // deadline and cancellation are polled before events so a chatty
        // executor cannot starve them
        let mut turns = 0u32;
        let outcome = loop {
            let finished = handle.is_finished();
            tokio::select! {
                biased;
                _ = &mut deadline, if !finished => break Outcome::TimedOut,
                _ = cancel.cancelled(), if !finished => break Outcome::Cancelled,
                joined = &mut handle => break Outcome::Finished(joined),
                Some(event) = events_rx.recv() => {
                    self.observe(job_id, session.as_deref(), on_message.as_ref(), &event, &mut turns);
                }
            }
        };

        let result = match outcome {
            Outcome::Finished(joined) => {
                while let Ok(event) = events_rx.try_recv() {
                    self.observe(job_id, session.as_deref(), on_message.as_ref(), &event, &mut turns);
                }
                finished_result(job_id, joined)
            }
            Outcome::Cancelled => {
                drop(events_rx);
                let message = if session.as_ref().is_some_and(|s| s.was_interrupted()) {
                    "interrupted by session control"
                } else {
                    "interrupted by dispatcher shutdown"
                };
                self.stop(job_id, &cancel, handle, ErrorKind::Interrupted, message.to_string())
                    .await
            }
            Outcome::TimedOut => {
                drop(events_rx);
                warn!(job_id = %job_id, timeout_seconds = record.task.timeout_seconds, "Job timed out");
                let message = format!("exceeded timeout of {}s", record.task.timeout_seconds);
                self.stop(job_id, &cancel, handle, ErrorKind::TimedOut, message)
                    .await
            }
        };

        self.sessions.close(job_id);

        let mut result = result.with_session(session_id).with_turns(turns);
        if result.duration_ms.is_none() {
            result = result.with_duration_ms(started.elapsed().as_millis() as u64);
        }
        self.settle(job_id, result)
    }

    /// Forward one executor event to the session, the caller, and the
    /// notification sink.
    fn observe(
        &self,
        job_id: JobId,
        session: Option<&Session>,
        on_message: Option<&MessageSink>,
        event: &ExecutorEvent,
        turns: &mut u32,
    ) {
        if matches!(event, ExecutorEvent::TurnCompleted) {
            *turns = match session {
                Some(session) => session.record_turn(),
                None => turns.saturating_add(1),
            };
            debug!(job_id = %job_id, turns = *turns, "Turn completed");
        }
        if let Some(sink) = on_message {
            sink(event);
        }
        let payload = serde_json::to_value(event).unwrap_or_default();
        self.store.progress(job_id, payload);
    }

    /// Cooperative cancel, then forced abort after the grace period. The
    /// returned failure records an unconfirmed termination in its message.
    async fn stop(
        &self,
        job_id: JobId,
        cancel: &CancellationToken,
        mut handle: JoinHandle<std::result::Result<ExecutorOutput, ExecutorError>>,
        kind: ErrorKind,
        message: String,
    ) -> JobResult {
        cancel.cancel();
        if tokio::time::timeout(self.grace_period, &mut handle)
            .await
            .is_ok()
        {
            debug!(job_id = %job_id, "Executor stopped within grace period");
            return JobResult::failure(kind, message);
        }

        handle.abort();
        if self.executor.terminate(job_id).await {
            return JobResult::failure(kind, message);
        }
        let zombie = ExecutorError::Zombie {
            grace: self.grace_period,
        };
        warn!(job_id = %job_id, error = %zombie, "Executor termination not confirmed");
        JobResult::failure(kind, format!("{message}; {zombie}"))
    }

    /// Move the job to `done` or `dead` and record it.
    fn settle(&self, job_id: JobId, result: JobResult) -> Result<JobResult> {
        let settled = if result.success {
            self.store.complete(job_id, result.clone())
        } else {
            self.store.fail(job_id, result.clone())
        };

        match settled {
            Ok(record) => {
                self.append(&record);
                match result.error_kind() {
                    None => info!(job_id = %job_id, turns = result.turns, "Job completed"),
                    Some(kind) => info!(job_id = %job_id, kind = %kind, "Job failed"),
                }
                Ok(result)
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Could not settle job");
                Err(e.into())
            }
        }
    }

    fn append(&self, record: &JobRecord) {
        if let Err(e) = self.run_log.append(record) {
            warn!(job_id = %record.id, error = %e, "Failed to append to run log");
        }
    }
}

fn finished_result(
    job_id: JobId,
    joined: std::result::Result<std::result::Result<ExecutorOutput, ExecutorError>, JoinError>,
) -> JobResult {
    match joined {
        Ok(Ok(output)) => {
            let mut result = JobResult::success(output.output).with_exit_code(output.exit_code);
            result.cost = output.cost;
            result.duration_ms = output.duration_ms;
            result
        }
        Ok(Err(e)) => {
            warn!(job_id = %job_id, error = %e, "Executor failed");
            JobResult::failure(e.kind(), e.to_string()).with_exit_code(e.exit_code())
        }
        Err(e) if e.is_panic() => {
            error!(job_id = %job_id, "Executor panicked");
            JobResult::failure(ErrorKind::ExecutorFailure, "executor panicked")
        }
        Err(_) => JobResult::failure(ErrorKind::Interrupted, "executor task was cancelled"),
    }
}
