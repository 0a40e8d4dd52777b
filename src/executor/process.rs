//! Executor backed by an external CLI process.
//!
//! The task prompt is passed as the final argument. Stdout is read line by
//! line: JSON lines become [`ExecutorEvent::Message`], anything else
//! [`ExecutorEvent::Output`]. A `{"type":"result", ...}` line marks the end
//! of a turn and carries the final output, cost and duration.
//!
//! Interactive invocations keep stdin open. The backend only reads input
//! between turns, so injection means "queue for next turn": messages are
//! written to stdin as lines, and when a turn completes with nothing queued
//! stdin is closed so the backend can finish. From then on the injection
//! channel is closed too, so the session refuses further messages.

use std::collections::HashSet;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{EventSink, Executor, ExecutorEvent, ExecutorOutput, Invocation};
use crate::error::ExecutorError;
use crate::queue::model::{JobId, Task};

/// Maximum captured output before truncation (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// How long `terminate` waits for an abandoned child to be reaped.
const TERMINATE_WAIT: Duration = Duration::from_millis(500);

/// Command line for the backend.
#[derive(Debug, Clone)]
pub struct ProcessExecutorConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl ProcessExecutorConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

type LiveSet = Arc<Mutex<HashSet<JobId>>>;

/// Removes the job from the live set when the invocation ends or is dropped.
struct LiveGuard {
    live: LiveSet,
    job_id: JobId,
}

impl LiveGuard {
    fn register(live: &LiveSet, job_id: JobId) -> Self {
        live.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id);
        Self {
            live: Arc::clone(live),
            job_id,
        }
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.job_id);
    }
}

/// Final `result` line of a turn.
#[derive(Debug, Default)]
struct TurnResult {
    text: Option<String>,
    cost: Option<Decimal>,
    duration_ms: Option<u64>,
}

/// Runs each task as a child process.
#[derive(Debug)]
pub struct ProcessExecutor {
    config: ProcessExecutorConfig,
    live: LiveSet,
}

impl ProcessExecutor {
    pub fn new(config: ProcessExecutorConfig) -> Self {
        Self {
            config,
            live: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn is_live(&self, job_id: JobId) -> bool {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&job_id)
    }

    fn build_command(&self, task: &Task, interactive: bool) -> Command {
        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .arg(&task.prompt)
            .stdin(if interactive {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &task.working_dir {
            command.current_dir(dir);
        }
        command
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    fn name(&self) -> &str {
        &self.config.program
    }

    async fn invoke(
        &self,
        task: &Task,
        mut invocation: Invocation,
    ) -> Result<ExecutorOutput, ExecutorError> {
        let start = Instant::now();
        let job_id = invocation.job_id;
        let interactive = invocation.is_interactive();

        let mut child = self.build_command(task, interactive).spawn()?;
        let _guard = LiveGuard::register(&self.live, job_id);
        info!(job_id = %job_id, program = %self.config.program, interactive, "Executor process spawned");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutorError::Failed("stdout not captured".to_string()))?;
        let stderr_task = child.stderr.take().map(|err| tokio::spawn(read_capped(err)));
        let mut stdin = child.stdin.take();

        let (mut inject_rx, mut inject_open) = match invocation.injected.take() {
            Some(rx) => (rx, true),
            None => (mpsc::unbounded_channel().1, false),
        };

        let mut lines = BufReader::new(stdout).lines();
        let mut transcript = String::new();
        let mut turn = TurnResult::default();

        loop {
            tokio::select! {
                _ = invocation.cancel.cancelled() => {
                    debug!(job_id = %job_id, "Cancellation requested, killing executor process");
                    let _ = child.kill().await;
                    return Err(ExecutorError::Cancelled);
                }
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    if handle_line(&line, &invocation.events, &mut transcript, &mut turn) && interactive {
                        // queued injections go to the next turn, otherwise let the backend finish
                        let mut forwarded = false;
                        while let Ok(message) = inject_rx.try_recv() {
                            forwarded |= write_line(&mut stdin, &message, job_id).await;
                        }
                        if !forwarded {
                            stdin = None;
                            inject_open = false;
                            // later injections fail at the session instead of vanishing
                            inject_rx.close();
                            while let Ok(message) = inject_rx.try_recv() {
                                write_line(&mut stdin, &message, job_id).await;
                            }
                        }
                    }
                }
                message = inject_rx.recv(), if inject_open => match message {
                    Some(message) => {
                        write_line(&mut stdin, &message, job_id).await;
                    }
                    None => {
                        stdin = None;
                        inject_open = false;
                    }
                },
            }
        }

        drop(stdin);
        let status = child.wait().await?;
        let stderr = match stderr_task {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            let message = if stderr.trim().is_empty() {
                truncate_output(transcript.trim())
            } else {
                stderr.trim().to_string()
            };
            return Err(ExecutorError::Exited {
                exit_code: status.code(),
                message,
            });
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;
        Ok(ExecutorOutput {
            output: turn
                .text
                .unwrap_or_else(|| truncate_output(transcript.trim_end())),
            cost: turn.cost,
            duration_ms: Some(turn.duration_ms.unwrap_or(elapsed_ms)),
            exit_code: status.code(),
        })
    }

    async fn terminate(&self, job_id: JobId) -> bool {
        let deadline = Instant::now() + TERMINATE_WAIT;
        while self.is_live(job_id) {
            if Instant::now() >= deadline {
                warn!(job_id = %job_id, "Executor process still registered after termination wait");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        true
    }
}

/// Parse one stdout line into events. Returns true for a turn-ending
/// `result` line.
fn handle_line(
    line: &str,
    events: &EventSink,
    transcript: &mut String,
    turn: &mut TurnResult,
) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return false;
    }

    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(data @ serde_json::Value::Object(_)) => {
            let is_result = data.get("type").and_then(|t| t.as_str()) == Some("result");
            if is_result {
                turn.text = data
                    .get("result")
                    .and_then(|r| r.as_str())
                    .map(truncate_output);
                turn.cost = data
                    .get("total_cost_usd")
                    .or_else(|| data.get("cost_usd"))
                    .and_then(|c| c.as_f64())
                    .and_then(|c| Decimal::try_from(c).ok());
                turn.duration_ms = data.get("duration_ms").and_then(|d| d.as_u64());
            }
            events.emit(ExecutorEvent::Message { data });
            if is_result {
                events.emit(ExecutorEvent::TurnCompleted);
            }
            is_result
        }
        _ => {
            if transcript.len() < MAX_OUTPUT_SIZE {
                transcript.push_str(line);
                transcript.push('\n');
            }
            events.emit(ExecutorEvent::Output {
                text: line.to_string(),
            });
            false
        }
    }
}

async fn write_line(stdin: &mut Option<ChildStdin>, message: &str, job_id: JobId) -> bool {
    let Some(pipe) = stdin.as_mut() else {
        debug!(job_id = %job_id, "Stdin closed, dropping injected message");
        return false;
    };
    let mut line = message.to_string();
    line.push('\n');
    match pipe.write_all(line.as_bytes()).await {
        Ok(()) => pipe.flush().await.is_ok(),
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "Failed to forward injected message");
            false
        }
    }
}

async fn read_capped<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    let _ = (&mut reader)
        .take(MAX_OUTPUT_SIZE as u64)
        .read_to_end(&mut buf)
        .await;
    // drain the rest so the child never blocks on a full pipe
    let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
    String::from_utf8_lossy(&buf).to_string()
}

/// Truncate output to MAX_OUTPUT_SIZE on a char boundary.
fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        return s.to_string();
    }
    let mut end = MAX_OUTPUT_SIZE;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... (truncated)", &s[..end])
}
