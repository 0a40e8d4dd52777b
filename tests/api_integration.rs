//! Integration tests for the dispatch REST + WebSocket surface.
//!
//! Each test spins up an Axum server on a random port and exercises the real
//! HTTP / WS contract with reqwest and tokio-tungstenite.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use agent_dispatch::api::dispatch_routes;
use agent_dispatch::dispatch::{Dispatcher, DispatcherDeps};
use agent_dispatch::error::{ErrorKind, ExecutorError};
use agent_dispatch::executor::{Executor, ExecutorOutput, Invocation};
use agent_dispatch::notify::BroadcastNotifier;
use agent_dispatch::queue::QueueStore;
use agent_dispatch::queue::model::{QueueName, Task};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Stub executor: runs until cancelled.
struct UntilCancelled;

#[async_trait]
impl Executor for UntilCancelled {
    fn name(&self) -> &str {
        "until-cancelled"
    }

    async fn invoke(&self, _task: &Task, invocation: Invocation) -> Result<ExecutorOutput, ExecutorError> {
        invocation.cancel.cancelled().await;
        Err(ExecutorError::Cancelled)
    }
}

/// Start an Axum server on a random port, return (port, dispatcher).
async fn start_server() -> (u16, Arc<Dispatcher>) {
    let notifier = BroadcastNotifier::new();
    let store = Arc::new(QueueStore::new(Arc::new(notifier.clone())));
    let dispatcher = Arc::new(Dispatcher::new(
        DispatcherDeps::new(store, Arc::new(UntilCancelled)),
        Duration::from_millis(200),
    ));
    let app = dispatch_routes(Arc::clone(&dispatcher), notifier);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (port, dispatcher)
}

/// Parse a WS text frame into a serde_json::Value.
fn parse_ws_json(msg: &Message) -> Value {
    match msg {
        Message::Text(txt) => serde_json::from_str(txt).expect("invalid JSON from server"),
        other => panic!("expected Text frame, got {:?}", other),
    }
}

/// Start an interactive job in the background and wait for its session.
async fn start_interactive(dispatcher: &Arc<Dispatcher>) -> tokio::task::JoinHandle<()> {
    let handle = {
        let dispatcher = Arc::clone(dispatcher);
        tokio::spawn(async move {
            dispatcher
                .dispatch_interactive(Task::new("proj", "chat"), |_| {})
                .await
                .unwrap();
        })
    };
    while dispatcher.get_active_sessions().is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle
}

// ── REST Endpoint Tests ──────────────────────────────────────────────

#[tokio::test]
async fn rest_health_endpoint() {
    timeout(TEST_TIMEOUT, async {
        let (port, _dispatcher) = start_server().await;

        let resp = reqwest::get(format!("http://127.0.0.1:{port}/health"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "agent-dispatch");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn rest_submit_then_list_todo() {
    timeout(TEST_TIMEOUT, async {
        let (port, _dispatcher) = start_server().await;
        let client = reqwest::Client::new();

        for prompt in ["first", "second"] {
            let resp = client
                .post(format!("http://127.0.0.1:{port}/api/jobs"))
                .json(&serde_json::json!({
                    "project": "proj",
                    "prompt": prompt,
                    "mode": "interactive",
                    "max_turns": 3
                }))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 201);
        }

        let resp = reqwest::get(format!("http://127.0.0.1:{port}/api/queues/todo"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let jobs: Vec<Value> = resp.json().await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0]["queue_position"], 0);
        assert_eq!(jobs[1]["queue_position"], 1);
        assert_eq!(jobs[0]["mode"], "interactive");

        let resp = reqwest::get(format!("http://127.0.0.1:{port}/api/queues/dead"))
            .await
            .unwrap();
        let dead: Vec<Value> = resp.json().await.unwrap();
        assert!(dead.is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn rest_sessions_and_interrupt() {
    timeout(TEST_TIMEOUT, async {
        let (port, dispatcher) = start_server().await;
        let running = start_interactive(&dispatcher).await;
        let client = reqwest::Client::new();

        let sessions: Vec<String> = reqwest::get(format!("http://127.0.0.1:{port}/api/sessions"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(sessions.len(), 1);
        let session_id = &sessions[0];

        let resp = client
            .post(format!("http://127.0.0.1:{port}/api/sessions/{session_id}/inject"))
            .json(&serde_json::json!({"text": "keep going"}))
            .send()
            .await
            .unwrap();
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["ok"], true);

        let resp = client
            .post(format!("http://127.0.0.1:{port}/api/sessions/{session_id}/interrupt"))
            .send()
            .await
            .unwrap();
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["ok"], true);

        running.await.unwrap();

        let dead = dispatcher.store().list(QueueName::Dead);
        assert_eq!(dead.len(), 1);
        assert_eq!(
            dead[0].result.as_ref().unwrap().error_kind(),
            Some(ErrorKind::Interrupted)
        );

        // Session is gone: a second interrupt is a normal `false`.
        let resp = client
            .post(format!("http://127.0.0.1:{port}/api/sessions/{session_id}/interrupt"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["ok"], false);
    })
    .await
    .expect("test timed out");
}

// ── WebSocket Tests ──────────────────────────────────────────────────

#[tokio::test]
async fn ws_connect_receives_sync() {
    timeout(TEST_TIMEOUT, async {
        let (port, dispatcher) = start_server().await;
        dispatcher.submit(Task::new("proj", "waiting"));

        let (mut ws, _resp) = connect_async(format!("ws://127.0.0.1:{port}/ws/events"))
            .await
            .expect("WS connect failed");

        let msg = ws.next().await.unwrap().unwrap();
        let json = parse_ws_json(&msg);

        assert_eq!(json["type"], "sync");
        assert_eq!(json["counts"]["todo"], 1);
        assert!(json["sessions"].as_array().unwrap().is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_receives_queued_notification() {
    timeout(TEST_TIMEOUT, async {
        let (port, dispatcher) = start_server().await;

        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws/events"))
            .await
            .unwrap();

        // Consume the initial sync.
        let _ = ws.next().await.unwrap().unwrap();

        let submission = dispatcher.submit(Task::new("proj", "new work"));

        let msg = ws.next().await.unwrap().unwrap();
        let json = parse_ws_json(&msg);

        assert_eq!(json["type"], "notification");
        assert_eq!(json["kind"], "queued");
        assert_eq!(json["job_id"], submission.job_id.to_string());
        assert_eq!(json["payload"]["queue_position"], 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_interrupt_action() {
    timeout(TEST_TIMEOUT, async {
        let (port, dispatcher) = start_server().await;
        let running = start_interactive(&dispatcher).await;
        let session_id = *dispatcher.get_active_sessions().iter().next().unwrap();

        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws/events"))
            .await
            .unwrap();

        let sync = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(sync["sessions"][0], session_id.to_string());

        let action = serde_json::json!({
            "action": "interrupt",
            "session_id": session_id,
        });
        ws.send(Message::Text(action.to_string().into())).await.unwrap();

        // The failure notification arrives once the job lands in `dead`.
        loop {
            let json = parse_ws_json(&ws.next().await.unwrap().unwrap());
            if json["kind"] == "failed" {
                assert_eq!(json["payload"]["error"]["kind"], "interrupted");
                break;
            }
        }

        running.await.unwrap();
        assert!(dispatcher.get_active_sessions().is_empty());
    })
    .await
    .expect("test timed out");
}
