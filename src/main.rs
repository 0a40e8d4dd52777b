use std::sync::Arc;

use anyhow::Context;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use agent_dispatch::api::dispatch_routes;
use agent_dispatch::config::DispatchConfig;
use agent_dispatch::dispatch::{Dispatcher, DispatcherDeps, spawn_workers};
use agent_dispatch::executor::{ProcessExecutor, ProcessExecutorConfig};
use agent_dispatch::notify::BroadcastNotifier;
use agent_dispatch::queue::{JsonlRunLog, NoopRunLog, QueueStore, RunLog, recover_stranded};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = DispatchConfig::from_env().context("Invalid configuration")?;
    let _log_guard = init_tracing(&config);

    eprintln!("🛰  Agent Dispatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Executor: {} {}", config.executor_program, config.executor_args.join(" "));
    eprintln!("   Workers: {}", config.workers);
    eprintln!("   Jobs API: http://0.0.0.0:{}/api/jobs", config.port);
    eprintln!("   Events WS: ws://0.0.0.0:{}/ws/events", config.port);

    let notifier = BroadcastNotifier::new();
    let store = Arc::new(QueueStore::new(Arc::new(notifier.clone())));

    // ── Run log + crash recovery ─────────────────────────────────────────
    let run_log: Arc<dyn RunLog> = match &config.run_log_path {
        Some(path) => {
            let records = JsonlRunLog::replay(path)
                .with_context(|| format!("Failed to replay run log {}", path.display()))?;
            let restored = store.restore(records).context("Corrupt run log")?;
            eprintln!("   Run log: {} ({} jobs restored)", path.display(), restored);
            Arc::new(
                JsonlRunLog::open(path)
                    .with_context(|| format!("Failed to open run log {}", path.display()))?,
            )
        }
        None => {
            eprintln!("   Run log: disabled");
            Arc::new(NoopRunLog)
        }
    };

    let report = recover_stranded(&store, config.recovery);
    let touched = report
        .failed
        .iter()
        .chain(report.resubmitted.iter().map(|(_, replacement)| replacement));
    for id in touched {
        if let Some(record) = store.get(*id) {
            if let Err(e) = run_log.append(&record) {
                tracing::warn!(job_id = %id, error = %e, "Failed to append recovered job");
            }
        }
    }
    if !report.failed.is_empty() {
        eprintln!(
            "   Recovered {} stranded jobs ({} resubmitted)",
            report.failed.len(),
            report.resubmitted.len()
        );
    }

    // ── Dispatcher + workers ─────────────────────────────────────────────
    let executor = ProcessExecutor::new(
        ProcessExecutorConfig::new(&config.executor_program)
            .with_args(config.executor_args.iter().cloned()),
    );
    let deps = DispatcherDeps::new(Arc::clone(&store), Arc::new(executor)).with_run_log(run_log);
    let dispatcher = Arc::new(Dispatcher::new(deps, config.grace_period));
    let workers = spawn_workers(Arc::clone(&dispatcher), config.workers);

    // ── HTTP/WS server ───────────────────────────────────────────────────
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = dispatch_routes(Arc::clone(&dispatcher), notifier).layer(cors);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "Dispatch server started");

    let shutdown = dispatcher.shutdown_token();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    eprintln!("\n   Shutting down...");
    dispatcher.shutdown();

    futures::future::join_all(workers).await;
    server.await?.context("Server error")?;
    Ok(())
}

/// Stderr logging, plus a daily rolling file when a log directory is set.
///
/// The returned guard must stay alive for file logs to be flushed.
fn init_tracing(config: &DispatchConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "agent-dispatch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();

    guard
}
