//! REST endpoints + WebSocket event feed for the dispatcher.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::notify::{BroadcastNotifier, Notification};
use crate::queue::model::{JobSummary, QueueName, SessionId, Task};
use crate::queue::QueueCounts;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Arc<Dispatcher>,
    /// Same notifier the dispatcher's store emits into.
    pub notifier: BroadcastNotifier,
}

/// Build the Axum router with job, session and event routes.
pub fn dispatch_routes(dispatcher: Arc<Dispatcher>, notifier: BroadcastNotifier) -> Router {
    let state = ApiState {
        dispatcher,
        notifier,
    };

    Router::new()
        .route("/health", get(health))
        .route("/ws/events", get(ws_handler))
        .route("/api/jobs", post(submit_job))
        .route("/api/queues/{name}", get(list_queue))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{id}/inject", post(inject))
        .route("/api/sessions/{id}/interrupt", post(interrupt))
        .with_state(state)
}

/// Server → client frames on `/ws/events`.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum EventFrame<'a> {
    /// Sent on connect and after the client lagged behind the broadcast.
    Sync {
        counts: QueueCounts,
        sessions: Vec<SessionId>,
    },
    Notification(&'a Notification),
}

/// Client → server control frames on `/ws/events`.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum SessionAction {
    Inject { session_id: SessionId, text: String },
    Interrupt { session_id: SessionId },
}

#[derive(Debug, Deserialize)]
struct InjectRequest {
    text: String,
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "agent-dispatch"
    }))
}

// ── Jobs ────────────────────────────────────────────────────────────────

async fn submit_job(State(state): State<ApiState>, Json(task): Json<Task>) -> impl IntoResponse {
    if task.prompt.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Prompt must not be empty"})),
        );
    }

    let submission = state.dispatcher.submit(task);
    info!(job_id = %submission.job_id, "Job submitted via API");
    (StatusCode::CREATED, Json(serde_json::json!(submission)))
}

async fn list_queue(State(state): State<ApiState>, Path(name): Path<String>) -> impl IntoResponse {
    let queue: QueueName = match name.parse() {
        Ok(queue) => queue,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": e.to_string()})),
            );
        }
    };

    let records = state.dispatcher.store().list(queue);
    let summaries: Vec<JobSummary> = records
        .iter()
        .enumerate()
        .map(|(i, record)| {
            let position = (queue == QueueName::Todo).then_some(i);
            JobSummary::from_record(record, position)
        })
        .collect();
    (StatusCode::OK, Json(serde_json::json!(summaries)))
}

// ── Sessions ────────────────────────────────────────────────────────────

async fn list_sessions(State(state): State<ApiState>) -> impl IntoResponse {
    let mut sessions: Vec<SessionId> = state.dispatcher.get_active_sessions().into_iter().collect();
    sessions.sort();
    Json(sessions)
}

async fn inject(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<InjectRequest>,
) -> impl IntoResponse {
    let Ok(session_id) = id.parse::<SessionId>() else {
        return invalid_session_id();
    };

    let ok = state.dispatcher.inject(session_id, body.text);
    debug!(session_id = %session_id, ok, "Inject via API");
    (StatusCode::OK, Json(serde_json::json!({ "ok": ok })))
}

async fn interrupt(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    let Ok(session_id) = id.parse::<SessionId>() else {
        return invalid_session_id();
    };

    let ok = state.dispatcher.interrupt(session_id);
    info!(session_id = %session_id, ok, "Interrupt via API");
    (StatusCode::OK, Json(serde_json::json!({ "ok": ok })))
}

fn invalid_session_id() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({"error": "Invalid session ID"})),
    )
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ApiState>) -> impl IntoResponse {
    info!("Event WebSocket client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: ApiState) {
    // Subscribe before the sync frame so nothing falls between the two.
    let mut rx = state.notifier.subscribe();

    if !send_sync(&mut socket, &state.dispatcher).await {
        warn!("Failed to send initial sync, client disconnected");
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(notification) => {
                        if !send_frame(&mut socket, &EventFrame::Notification(&notification)).await {
                            debug!("Client disconnected during send");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "Event WS client lagged behind broadcast");
                        if !send_sync(&mut socket, &state.dispatcher).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Notification channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&text, &state.dispatcher);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Event WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("Event WebSocket connection closed");
}

fn handle_client_message(text: &str, dispatcher: &Dispatcher) {
    match serde_json::from_str::<SessionAction>(text) {
        Ok(SessionAction::Inject { session_id, text }) => {
            if !dispatcher.inject(session_id, text) {
                warn!(session_id = %session_id, "Inject failed: session not found or closed");
            }
        }
        Ok(SessionAction::Interrupt { session_id }) => {
            if !dispatcher.interrupt(session_id) {
                warn!(session_id = %session_id, "Interrupt failed: session not found or closed");
            }
        }
        Err(e) => {
            debug!(error = %e, text = text, "Unrecognized WS message from client");
        }
    }
}

async fn send_sync(socket: &mut WebSocket, dispatcher: &Dispatcher) -> bool {
    let mut sessions: Vec<SessionId> = dispatcher.get_active_sessions().into_iter().collect();
    sessions.sort();
    let frame = EventFrame::Sync {
        counts: dispatcher.store().counts(),
        sessions,
    };
    send_frame(socket, &frame).await
}

/// Returns false once the client is gone.
async fn send_frame(socket: &mut WebSocket, frame: &EventFrame<'_>) -> bool {
    match serde_json::to_string(frame) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize event frame");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::dispatch::DispatcherDeps;
    use crate::error::ExecutorError;
    use crate::executor::{Executor, ExecutorOutput, Invocation};
    use crate::queue::QueueStore;

    struct Idle;

    #[async_trait::async_trait]
    impl Executor for Idle {
        fn name(&self) -> &str {
            "idle"
        }

        async fn invoke(
            &self,
            _task: &Task,
            _invocation: Invocation,
        ) -> Result<ExecutorOutput, ExecutorError> {
            Ok(ExecutorOutput::default())
        }
    }

    fn router() -> (Router, Arc<Dispatcher>) {
        let notifier = BroadcastNotifier::new();
        let store = Arc::new(QueueStore::new(Arc::new(notifier.clone())));
        let dispatcher = Arc::new(Dispatcher::new(
            DispatcherDeps::new(store, Arc::new(Idle)),
            Duration::from_millis(100),
        ));
        (dispatch_routes(Arc::clone(&dispatcher), notifier), dispatcher)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn submit_returns_job_id_and_position() {
        let (app, dispatcher) = router();
        let response = app
            .oneshot(post_json(
                "/api/jobs",
                serde_json::json!({"project": "proj", "prompt": "do it"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["queue_position"], 0);

        let todo = dispatcher.store().list(QueueName::Todo);
        assert_eq!(todo.len(), 1);
        assert_eq!(body["job_id"], todo[0].id.to_string());
        assert_eq!(todo[0].task.max_turns, 50);
        assert_eq!(todo[0].task.timeout_seconds, 3600);
    }

    #[tokio::test]
    async fn submit_rejects_blank_prompt() {
        let (app, _) = router();
        let response = app
            .oneshot(post_json(
                "/api/jobs",
                serde_json::json!({"project": "proj", "prompt": "  "}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_queue_is_bad_request() {
        let (app, _) = router();
        let response = app
            .oneshot(Request::get("/api/queues/archive").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn todo_listing_carries_positions() {
        let (app, dispatcher) = router();
        dispatcher.submit(Task::new("proj", "first"));
        dispatcher.submit(Task::new("proj", "second"));

        let response = app
            .oneshot(Request::get("/api/queues/todo").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        let jobs = body.as_array().unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0]["queue_position"], 0);
        assert_eq!(jobs[1]["queue_position"], 1);
        assert_eq!(jobs[1]["state"], "todo");
    }

    #[tokio::test]
    async fn session_control_on_unknown_session_is_false() {
        let (app, _) = router();
        let id = SessionId::new();

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/api/sessions/{id}/inject"),
                serde_json::json!({"text": "hello"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["ok"], false);

        let response = app
            .oneshot(
                Request::post(format!("/api/sessions/{id}/interrupt"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(response).await["ok"], false);
    }

    #[tokio::test]
    async fn malformed_session_id_is_bad_request() {
        let (app, _) = router();
        let response = app
            .oneshot(
                Request::post("/api/sessions/not-a-uuid/interrupt")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "Invalid session ID");
    }
}
