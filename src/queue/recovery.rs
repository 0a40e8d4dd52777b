//! Startup sweep for records stranded in `run` by a process restart.
//!
//! Nothing survives a restart mid-execution: a restored RUNNING record has no
//! executor behind it. Transitions only move forward, so stranded records are
//! failed into `dead`. Under [`RecoveryPolicy::Resubmit`] the same task is also
//! enqueued again as a fresh job with a new id.

use std::str::FromStr;

use tracing::{info, warn};

use crate::error::{ConfigError, ErrorKind};
use crate::queue::model::{JobId, JobResult, QueueName};
use crate::queue::store::QueueStore;

/// What to do with records found RUNNING at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecoveryPolicy {
    /// Fail them into `dead`.
    #[default]
    Fail,
    /// Fail them into `dead`, then enqueue their task as a new job.
    Resubmit,
}

impl FromStr for RecoveryPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "resubmit" => Ok(Self::Resubmit),
            other => Err(ConfigError::InvalidValue {
                key: "AGENT_DISPATCH_RECOVERY".to_string(),
                message: format!("expected 'fail' or 'resubmit', got '{other}'"),
            }),
        }
    }
}

/// Outcome of a recovery sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Stranded jobs moved to `dead`.
    pub failed: Vec<JobId>,
    /// `(stranded, replacement)` pairs enqueued under `Resubmit`.
    pub resubmitted: Vec<(JobId, JobId)>,
}

/// Sweep every record currently in `run`.
///
/// Only call this before any worker starts; afterwards `run` holds live jobs.
pub fn recover_stranded(store: &QueueStore, policy: RecoveryPolicy) -> RecoveryReport {
    let stranded = store.list(QueueName::Run);
    let mut report = RecoveryReport::default();

    if stranded.is_empty() {
        return report;
    }

    info!(count = stranded.len(), ?policy, "Recovering stranded running jobs");

    for record in stranded {
        let result = JobResult::failure(
            ErrorKind::Zombie,
            "job was running when the process stopped; termination not confirmed",
        );
        if let Err(e) = store.fail(record.id, result) {
            warn!(job_id = %record.id, error = %e, "Failed to mark stranded job dead");
            continue;
        }
        report.failed.push(record.id);

        if policy == RecoveryPolicy::Resubmit {
            let replacement = store.enqueue(record.task.clone());
            info!(
                job_id = %record.id,
                replacement = %replacement.id,
                "Resubmitted stranded job"
            );
            report.resubmitted.push((record.id, replacement.id));
        }
    }

    report
}
