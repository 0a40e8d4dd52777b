//! Worker pool: background loops that drain `todo` through the dispatcher.
//!
//! Each worker claims one job at a time. When `todo` is empty it parks until
//! an enqueue wakes it, the idle poll fires, or the dispatcher shuts down.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::dispatch::Dispatcher;

/// Fallback wake-up for idle workers.
const IDLE_POLL_SECS: u64 = 5;

/// Spawn `count` workers over `dispatcher`.
///
/// Workers exit after [`Dispatcher::shutdown`]; a job in flight at that
/// point ends as `Interrupted`.
pub fn spawn_workers(dispatcher: Arc<Dispatcher>, count: usize) -> Vec<JoinHandle<()>> {
    info!(workers = count, "Starting worker pool");
    (0..count)
        .map(|worker| tokio::spawn(run_worker(Arc::clone(&dispatcher), worker)))
        .collect()
}

async fn run_worker(dispatcher: Arc<Dispatcher>, worker: usize) {
    let shutdown = dispatcher.shutdown_token();
    debug!(worker, "Worker started");

    while !shutdown.is_cancelled() {
        match dispatcher.run_next().await {
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(e) => error!(worker, error = %e, "Dispatch failed"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = dispatcher.store().wait_for_work() => {}
            _ = tokio::time::sleep(Duration::from_secs(IDLE_POLL_SECS)) => {}
        }
    }

    debug!(worker, "Worker stopped");
}
