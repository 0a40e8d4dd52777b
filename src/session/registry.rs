//! Registry of live interactive sessions.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::SessionError;
use crate::queue::model::{JobId, SessionId};

/// Control handle for one running interactive invocation.
///
/// Exists only while its job is RUNNING. Both control operations are
/// non-blocking: injections go onto an unbounded channel the executor
/// drains, interruption cancels the job's token.
#[derive(Debug)]
pub struct Session {
    session_id: SessionId,
    job_id: JobId,
    max_turns: u32,
    turn_count: AtomicU32,
    closed: AtomicBool,
    interrupted: AtomicBool,
    inject_tx: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl Session {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn turn_count(&self) -> u32 {
        self.turn_count.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    pub fn was_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Whether the session can still take another exchange.
    pub fn has_turns_left(&self) -> bool {
        self.turn_count() < self.max_turns
    }

    /// Forward a message into the live invocation.
    ///
    /// Returns false when the session is closed, its turn budget is spent,
    /// or the executor has dropped its receiver.
    pub fn inject(&self, message: impl Into<String>) -> bool {
        if !self.is_open() {
            return false;
        }
        if !self.has_turns_left() {
            debug!(session_id = %self.session_id, "Turn budget exhausted, injection refused");
            return false;
        }
        self.inject_tx.send(message.into()).is_ok()
    }

    /// Request cooperative cancellation.
    pub fn interrupt(&self) -> bool {
        if !self.is_open() {
            return false;
        }
        self.interrupted.store(true, Ordering::Release);
        self.cancel.cancel();
        info!(session_id = %self.session_id, job_id = %self.job_id, "Session interrupted");
        true
    }

    /// Count one exchange. Saturates at `max_turns`.
    pub fn record_turn(&self) -> u32 {
        let max = self.max_turns;
        match self
            .turn_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            }) {
            Ok(prev) => prev + 1,
            Err(current) => current,
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[derive(Default)]
struct Inner {
    by_job: HashMap<JobId, Arc<Session>>,
    by_session: HashMap<SessionId, JobId>,
}

/// Tracks live INTERACTIVE sessions keyed by job id.
///
/// Every operation holds the lock for a single map operation, so lookups
/// never wait behind anything longer than another map operation.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the session for `job_id`. At most one live session per job.
    ///
    /// `cancel` is the job's cancellation token; interrupting the session
    /// cancels it. The returned receiver yields injected messages.
    pub fn open(
        &self,
        job_id: JobId,
        max_turns: u32,
        cancel: CancellationToken,
    ) -> Result<(Arc<Session>, mpsc::UnboundedReceiver<String>), SessionError> {
        let (inject_tx, inject_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Session {
            session_id: SessionId::new(),
            job_id,
            max_turns,
            turn_count: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            inject_tx,
            cancel,
        });

        {
            let mut inner = self.write();
            if inner.by_job.contains_key(&job_id) {
                return Err(SessionError::AlreadyOpen { job_id });
            }
            inner.by_job.insert(job_id, Arc::clone(&session));
            inner.by_session.insert(session.session_id, job_id);
        }

        info!(job_id = %job_id, session_id = %session.session_id, "Session opened");
        Ok((session, inject_rx))
    }

    /// Close the session for `job_id`. Closing twice, or closing a job that
    /// never had a session, is a no-op.
    pub fn close(&self, job_id: JobId) {
        let removed = {
            let mut inner = self.write();
            let removed = inner.by_job.remove(&job_id);
            if let Some(session) = &removed {
                inner.by_session.remove(&session.session_id);
            }
            removed
        };

        if let Some(session) = removed {
            session.close();
            info!(job_id = %job_id, session_id = %session.session_id, "Session closed");
        }
    }

    pub fn lookup(&self, job_id: JobId) -> Option<Arc<Session>> {
        self.read().by_job.get(&job_id).cloned()
    }

    pub fn lookup_session(&self, session_id: SessionId) -> Option<Arc<Session>> {
        let inner = self.read();
        let job_id = inner.by_session.get(&session_id)?;
        inner.by_job.get(job_id).cloned()
    }

    /// Snapshot of currently open session ids.
    pub fn active(&self) -> HashSet<SessionId> {
        self.read().by_session.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.read().by_job.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
