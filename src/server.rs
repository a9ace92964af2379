//! HTTP and WebSocket surface.
//!
//! A thin axum adapter over the bridge and the supervision engine. Sessions
//! are created over REST and attached over a WebSocket; the socket's writer
//! half is driven by the unbounded channel behind [`ChannelTransport`], so
//! the bridge never waits on a slow client.

use std::net::SocketAddr;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::HttpBody;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequest, Json, Path, State};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Json as ResponseJson, Response};
use axum::routing::{delete, get, post};
use axum::{BoxError, Router, async_trait};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bridge::transport::{ChannelTransport, ClientMessage, ServerMessage, Transport};
use crate::bridge::{SessionBridge, SessionId};
use crate::commands::EnhancedCommands;
use crate::config::ProjectConfig;
use crate::context::ContextCache;
use crate::error::{BridgeError, InterventionError, WorkflowError};
use crate::events::EventBus;
use crate::intervention::{ApprovalDecision, InterventionManager};
use crate::log::{self, SupervisionLog};
use crate::supervisor::{SupervisionToggles, Supervisor};
use crate::workflow::{WorkflowId, WorkflowKind, WorkflowTracker};

/// Everything a running server shares between handlers.
pub struct AppState {
    pub bridge: Arc<SessionBridge>,
    pub tracker: Arc<WorkflowTracker>,
    pub context: Arc<ContextCache>,
    pub interventions: Arc<InterventionManager>,
    pub toggles: Arc<SupervisionToggles>,
    pub project_root: PathBuf,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wire the engine for `root`: bus, bridge, tracker, cache, interventions
    /// and the enhanced command interceptor. Background threads are started
    /// separately by [`start_background`].
    pub fn new(config: &ProjectConfig, root: &FsPath, events: EventBus) -> Self {
        let bridge = Arc::new(SessionBridge::new(config.bridge.clone(), events.clone()));
        let tracker = Arc::new(WorkflowTracker::new(
            Duration::from_secs(config.supervision.default_step_timeout_secs),
            events.clone(),
        ));
        let context = Arc::new(ContextCache::new(root, config.context.clone()));
        let interventions = Arc::new(InterventionManager::new(
            context.clone(),
            events,
            config.interventions.history_cap,
        ));
        let toggles = Arc::new(SupervisionToggles::new(config.supervision.enabled));
        bridge.set_interceptor(Arc::new(EnhancedCommands::new(
            tracker.clone(),
            context.clone(),
            interventions.clone(),
            toggles.clone(),
        )));

        Self {
            bridge,
            tracker,
            context,
            interventions,
            toggles,
            project_root: root.to_path_buf(),
        }
    }
}

/// Start the supervisor and the supervision log writer.
pub fn start_background(config: &ProjectConfig, state: &AppState) -> Result<()> {
    let events = state.bridge.events().clone();

    let log_path = config.log_path(&state.project_root);
    let supervision_log = SupervisionLog::new(&log_path)?;
    log::spawn_writer(supervision_log, events.subscribe());
    info!(path = %log_path.display(), "supervision log open");

    Supervisor::new(
        &config.supervision,
        state.bridge.clone(),
        state.tracker.clone(),
        state.interventions.clone(),
        state.toggles.clone(),
    )
    .spawn(events.subscribe());
    Ok(())
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, ResponseJson(json!({ "error": message }))).into_response()
    }
}

/// JSON body extractor whose rejections are answered as [`ApiError::BadRequest`].
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S, B> FromRequest<S, B> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
    B: HttpBody + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    type Rejection = ApiError;

    async fn from_request(req: Request<B>, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiError::BadRequest(rejection.body_text())),
        }
    }
}

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::SessionNotFound(_) => ApiError::NotFound(err.to_string()),
            BridgeError::SessionLimit(_) => ApiError::Unavailable(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<WorkflowError> for ApiError {
    fn from(err: WorkflowError) -> Self {
        ApiError::NotFound(err.to_string())
    }
}

impl From<InterventionError> for ApiError {
    fn from(err: InterventionError) -> Self {
        ApiError::NotFound(err.to_string())
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:id", delete(terminate_session))
        .route("/api/sessions/:id/ws", get(attach_session))
        .route("/api/workflows", post(start_workflow).get(list_workflows))
        .route("/api/workflows/:id/steps", post(complete_step))
        .route("/api/workflows/:id/failures", post(report_failure))
        .route("/api/approvals/:id", post(resolve_approval))
        .route("/api/stats", get(stats))
        .with_state(state)
}

/// Serve until ctrl-c, reaping idle sessions in the background.
pub async fn serve(addr: SocketAddr, state: SharedState, cleanup_every: Duration, idle: Duration) -> Result<()> {
    let reaper = tokio::spawn(reap_idle(state.bridge.clone(), cleanup_every, idle));

    info!(addr = %addr, "starting HTTP server");
    axum::Server::try_bind(&addr)
        .with_context(|| format!("failed to bind {addr}"))?
        .serve(router(state.clone()).into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
        .context("HTTP server error")?;

    reaper.abort();
    let bridge = state.bridge.clone();
    tokio::task::spawn_blocking(move || bridge.terminate_all()).await?;
    Ok(())
}

async fn reap_idle(bridge: Arc<SessionBridge>, every: Duration, idle: Duration) {
    let mut tick = tokio::time::interval(every);
    tick.tick().await;
    loop {
        tick.tick().await;
        let bridge = bridge.clone();
        match tokio::task::spawn_blocking(move || bridge.cleanup_idle(idle)).await {
            Ok(reaped) if !reaped.is_empty() => info!(count = reaped.len(), "reaped idle sessions"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "idle cleanup task failed"),
        }
    }
}

// ── Sessions ──

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub rows: Option<u16>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

async fn create_session(
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let dir = req.working_dir.unwrap_or_else(|| state.project_root.clone());
    if !dir.is_dir() {
        return Err(ApiError::BadRequest(format!(
            "working directory does not exist: {}",
            dir.display()
        )));
    }
    let bridge = state.bridge.clone();
    let (cols, rows) = (req.cols.unwrap_or(80), req.rows.unwrap_or(24));
    let info = tokio::task::spawn_blocking(move || bridge.create_session(cols, rows, &dir)).await??;
    Ok((StatusCode::CREATED, ResponseJson(info)))
}

async fn terminate_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = SessionId::from(id);
    let bridge = state.bridge.clone();
    let terminated = {
        let id = id.clone();
        tokio::task::spawn_blocking(move || bridge.terminate(&id)).await?
    };
    if terminated {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(BridgeError::SessionNotFound(id).into())
    }
}

async fn attach_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let id = SessionId::from(id);
    if state.bridge.registry().get(&id).is_none() {
        return Err(BridgeError::SessionNotFound(id).into());
    }
    Ok(ws.on_upgrade(move |socket| handle_socket(state, id, socket)))
}

async fn handle_socket(state: SharedState, id: SessionId, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let transport: Arc<dyn Transport> = Arc::new(ChannelTransport::new(tx));

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "failed to encode frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
            if matches!(message, ServerMessage::Exit { .. }) {
                break;
            }
        }
        let _ = sink.close().await;
    });

    if let Err(e) = state.bridge.attach(&id, &transport) {
        warn!(session = %id, error = %e, "attach failed");
        let _ = transport.send(ServerMessage::Error {
            message: e.to_string(),
        });
        transport.close();
        let _ = writer.await;
        return;
    }
    info!(session = %id, "websocket attached");

    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let result = match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Input { data }) => {
                let bridge = state.bridge.clone();
                let id = id.clone();
                tokio::task::spawn_blocking(move || bridge.submit_input(&id, data.as_bytes()))
                    .await
                    .unwrap_or_else(|e| Err(BridgeError::Pty(e.to_string())))
            }
            Ok(ClientMessage::Resize { cols, rows }) => {
                let bridge = state.bridge.clone();
                let id = id.clone();
                tokio::task::spawn_blocking(move || bridge.resize(&id, cols, rows))
                    .await
                    .unwrap_or_else(|e| Err(BridgeError::Pty(e.to_string())))
            }
            Err(e) => {
                debug!(session = %id, error = %e, "malformed client frame");
                let _ = transport.send(ServerMessage::Error {
                    message: format!("invalid message: {e}"),
                });
                continue;
            }
        };
        if let Err(e) = result {
            let _ = transport.send(ServerMessage::Error {
                message: e.to_string(),
            });
            if matches!(e, BridgeError::SessionNotFound(_)) {
                break;
            }
        }
    }

    if state.bridge.release(&id, &transport) {
        info!(session = %id, "websocket closed; session detached");
    }
    transport.close();
    let _ = writer.await;
}

// ── Workflows ──

#[derive(Debug, Deserialize)]
pub struct StartWorkflowRequest {
    pub kind: WorkflowKind,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub metadata: Value,
}

async fn start_workflow(
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<StartWorkflowRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(session) = &req.session_id {
        if state.bridge.registry().get(session).is_none() {
            return Err(BridgeError::SessionNotFound(session.clone()).into());
        }
    }
    let id = state
        .tracker
        .start_workflow(req.kind, req.session_id, req.metadata);
    Ok((
        StatusCode::CREATED,
        ResponseJson(json!({ "workflow_id": id })),
    ))
}

async fn list_workflows(State(state): State<SharedState>) -> impl IntoResponse {
    ResponseJson(json!({ "workflows": state.tracker.list() }))
}

#[derive(Debug, Deserialize)]
pub struct CompleteStepRequest {
    pub step: String,
    #[serde(default)]
    pub data: Value,
}

async fn complete_step(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<CompleteStepRequest>,
) -> Result<ResponseJson<Value>, ApiError> {
    let id = WorkflowId::from(id);
    let accepted = state.tracker.complete_step(&id, &req.step, req.data)?;
    let status = state.tracker.get(&id).map(|wf| wf.status);
    Ok(ResponseJson(json!({ "accepted": accepted, "status": status })))
}

#[derive(Debug, Deserialize)]
pub struct ReportFailureRequest {
    pub step: String,
    pub error: String,
    #[serde(default)]
    pub context: Value,
}

async fn report_failure(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<ReportFailureRequest>,
) -> Result<ResponseJson<Value>, ApiError> {
    let id = WorkflowId::from(id);
    let escalation = state
        .tracker
        .report_failure(&id, &req.step, &req.error, req.context)?;
    Ok(ResponseJson(json!({
        "escalated": escalation.is_some(),
        "suggested": escalation.and_then(|e| e.suggested_intervention()),
    })))
}

// ── Approvals and stats ──

#[derive(Debug, Deserialize)]
pub struct ApprovalRequest {
    pub decision: ApprovalDecision,
}

async fn resolve_approval(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<ApprovalRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let resolution = state.interventions.resolve_approval(&id, req.decision)?;
    Ok(ResponseJson(resolution))
}

async fn stats(State(state): State<SharedState>) -> Result<ResponseJson<Value>, ApiError> {
    // A stale context snapshot is rebuilt on read, which walks the project.
    let body = tokio::task::spawn_blocking(move || {
        json!({
            "bridge": state.bridge.stats(),
            "workflows": state.tracker.stats(),
            "interventions": state.interventions.stats(),
            "pending_approvals": state.interventions.pending_approvals(),
            "supervision_enabled": state.toggles.global(),
            "context_generation": state.context.snapshot().generation,
        })
    })
    .await?;
    Ok(ResponseJson(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intervention::{InterventionKind, InterventionRequest};
    use axum::body::Body;
    use tower::ServiceExt;

    fn state_for(root: &FsPath) -> SharedState {
        let mut config = ProjectConfig::default();
        config.bridge.shell = Some("/bin/sh".to_string());
        Arc::new(AppState::new(&config, root, EventBus::new()))
    }

    async fn call(state: &SharedState, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state_for(tmp.path());
        let (status, body) = call(&state, "DELETE", "/api/sessions/nope", Value::Null).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn create_session_rejects_missing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state_for(tmp.path());
        let (status, _) = call(
            &state,
            "POST",
            "/api/sessions",
            json!({ "working_dir": "/definitely/not/here" }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn session_lifecycle_over_http() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state_for(tmp.path());

        let (status, body) = call(&state, "POST", "/api/sessions", json!({ "cols": 100, "rows": 30 })).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["session_id"].as_str().unwrap().to_string();
        assert_eq!(body["shell"], "/bin/sh");

        let (status, stats) = call(&state, "GET", "/api/stats", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["bridge"]["active_sessions"], 1);

        let (status, _) = call(&state, "DELETE", &format!("/api/sessions/{id}"), Value::Null).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&state, "DELETE", &format!("/api/sessions/{id}"), Value::Null).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn workflow_endpoints_drive_the_tracker() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state_for(tmp.path());

        let (status, body) = call(&state, "POST", "/api/workflows", json!({ "kind": "prd_generation" })).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["workflow_id"].as_str().unwrap().to_string();

        let (_, body) = call(
            &state,
            "POST",
            &format!("/api/workflows/{id}/steps"),
            json!({ "step": "questions_answered" }),
        )
        .await;
        assert_eq!(body["accepted"], true);
        assert_eq!(body["status"], "active");

        let (_, body) = call(
            &state,
            "POST",
            &format!("/api/workflows/{id}/steps"),
            json!({ "step": "no_such_step" }),
        )
        .await;
        assert_eq!(body["accepted"], false);

        let (_, body) = call(
            &state,
            "POST",
            &format!("/api/workflows/{id}/failures"),
            json!({ "step": "prd_generated", "error": "PRD.md: no such file" }),
        )
        .await;
        assert_eq!(body["escalated"], true);
        assert_eq!(body["suggested"], "file_confusion");

        let (status, _) = call(
            &state,
            "POST",
            "/api/workflows/missing/steps",
            json!({ "step": "questions_answered" }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_bodies_are_bad_requests() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state_for(tmp.path());

        let (status, body) = call(&state, "POST", "/api/workflows", json!({ "kind": "bogus" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (status, _) = call(
            &state,
            "POST",
            "/api/approvals/any",
            json!({ "decision": "maybe" }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let request = Request::builder()
            .method("POST")
            .uri("/api/sessions")
            .header("content-type", "application/json")
            .body(Body::from("{ not json"))
            .unwrap();
        let response = router(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn workflow_for_unknown_session_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state_for(tmp.path());
        let (status, _) = call(
            &state,
            "POST",
            "/api/workflows",
            json!({ "kind": "project_setup", "session_id": "ghost" }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn approval_endpoint_resolves_pending_request() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state_for(tmp.path());
        let response = state.interventions.process(
            InterventionRequest::new(InterventionKind::PermissionRequired)
                .action("rm -rf dist", vec!["dist/".to_string()]),
        );
        let approval = response.approval_id().unwrap().to_string();

        let (status, body) = call(
            &state,
            "POST",
            &format!("/api/approvals/{approval}"),
            json!({ "decision": "approve" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["approved"], true);

        let (status, _) = call(
            &state,
            "POST",
            &format!("/api/approvals/{approval}"),
            json!({ "decision": "reject" }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
