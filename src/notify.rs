//! Lifecycle notifications: the narrow interface the core emits into.
//!
//! The delivery transport (WebSocket, voice channel, ...) lives outside the
//! core. A failed delivery is logged and dropped; it never fails or rolls
//! back the transition that produced it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::NotifyError;
use crate::queue::model::JobId;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Kind of lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Queued,
    Started,
    Progress,
    Completed,
    Failed,
}

/// A lifecycle event for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub job_id: JobId,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(kind: NotificationKind, job_id: JobId, payload: serde_json::Value) -> Self {
        Self {
            kind,
            job_id,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Consumer of lifecycle events.
///
/// Implementations must return quickly: the QueueStore emits transition
/// events from inside its critical section so per-job order is preserved.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl NotificationSink for NoopNotifier {
    fn notify(&self, _notification: Notification) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Fans events out to any number of subscribers over a broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to live events. Each WS client calls this.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationSink for BroadcastNotifier {
    fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        // ok if no receivers are listening yet
        let _ = self.tx.send(notification);
        Ok(())
    }
}

/// Deliver an event, logging and swallowing any delivery failure.
pub(crate) fn emit(sink: &dyn NotificationSink, notification: Notification) {
    let kind = notification.kind;
    let job_id = notification.job_id;
    if let Err(e) = sink.notify(notification) {
        tracing::warn!(job_id = %job_id, kind = ?kind, error = %e, "Failed to deliver notification");
    }
}
