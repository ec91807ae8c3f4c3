//! Endpoints for the local operator.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use cluster_core::context::Cancelled;
use cluster_core::coordinator::{CoordinatorError, JoinEvent, JoinReport, PeerTarget};
use cluster_core::gateway::Gateway;
use cluster_core::handler::StatusReport;
use cluster_core::protocol::{SessionRole, SessionStop};
use cluster_core::session::SESSION_TIMEOUT_CAUSE;
use futures::{SinkExt, StreamExt, stream};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{ApiError, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    /// Session lifetime in seconds
    #[serde(default)]
    pub timeout: u64,
}

/// Handler for `GET /1.0/session/initiating`
pub async fn initiating(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    open_session(state, SessionRole::Initiating, query, ws)
}

/// Handler for `GET /1.0/session/joining`
pub async fn joining(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    open_session(state, SessionRole::Joining, query, ws)
}

fn open_session(
    state: Arc<AppState>,
    role: SessionRole,
    query: SessionQuery,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let timeout = state.session.timeout(query.timeout).ok_or_else(|| {
        ApiError::bad_request(format!(
            "Session timeout exceeds maximum of {} seconds",
            state.session.max_timeout_secs
        ))
    })?;

    Ok(ws.on_upgrade(move |socket| run_session(state, role, timeout, socket)))
}

async fn run_session(state: Arc<AppState>, role: SessionRole, timeout: Duration, socket: WebSocket) {
    info!(%role, ?timeout, "Session websocket connected");
    let (ctx, _cancel) = state.ctx.with_timeout(timeout, SESSION_TIMEOUT_CAUSE);

    let (sink, stream) = socket.split();
    let sink = sink.with(|text: String| async move { Ok::<_, axum::Error>(Message::Text(text.into())) });
    let stream = stream.filter_map(|msg| async move {
        match msg {
            Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        }
    });

    let gw = Gateway::new(&ctx, sink, stream);
    state.pairing.serve(role, &gw).await;
}

/// Handler for `PUT /1.0/session/stop`
pub async fn stop_session(
    State(state): State<Arc<AppState>>,
    Json(stop): Json<SessionStop>,
) -> Result<StatusCode, ApiError> {
    let cause = (!stop.reason.is_empty()).then(|| Cancelled::new(stop.reason));
    state.pairing.slot.stop(cause)?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Default, Deserialize)]
pub struct ClusterPost {
    /// Form a new cluster from this machine first
    #[serde(default)]
    pub bootstrap: bool,
    #[serde(default)]
    pub peers: Vec<PeerTarget>,
}

/// Last line of the `POST /1.0/cluster` stream.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Outcome {
    Done { report: JoinReport },
    Error { error: String },
}

const NDJSON: &str = "application/x-ndjson";

type JoinTask = JoinHandle<Result<JoinReport, CoordinatorError>>;

/// Handler for `POST /1.0/cluster`
///
/// Answers with newline delimited JSON: one [`JoinEvent`] per step, then a
/// `done` line carrying the report or an `error` line. Requests rejected
/// before any peer is contacted get a plain error status instead.
pub async fn add_members(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ClusterPost>,
) -> Result<Response, ApiError> {
    if request.bootstrap {
        state.handler.bootstrap(&state.ctx).await?;
        info!("Bootstrapped cluster");
    }

    let (tx, mut events) = mpsc::unbounded_channel();
    let task: JoinTask = tokio::spawn(async move {
        state
            .coordinator
            .add_peers_with_progress(&state.ctx, &request.peers, tx)
            .await
    });

    // Hold the status line back until the first step, so validation errors
    // still map to a status code.
    let Some(first) = events.recv().await else {
        let report = task.await.map_err(|e| ApiError::internal(e.to_string()))??;
        let line = ndjson(&Outcome::Done { report }).map_err(|e| ApiError::internal(e.to_string()))?;
        return Ok(([(header::CONTENT_TYPE, NDJSON)], line).into_response());
    };

    let body = progress_body(first, events, task);
    Ok(([(header::CONTENT_TYPE, NDJSON)], body).into_response())
}

fn ndjson(value: &impl Serialize) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    Ok(line)
}

fn progress_body(
    first: JoinEvent,
    events: mpsc::UnboundedReceiver<JoinEvent>,
    task: JoinTask,
) -> Body {
    let rest = stream::unfold(Some((events, task)), |state| async move {
        let (mut events, task) = state?;
        match events.recv().await {
            Some(event) => Some((ndjson(&event), Some((events, task)))),
            None => {
                let outcome = match task.await {
                    Ok(Ok(report)) => Outcome::Done { report },
                    Ok(Err(e)) => {
                        warn!("Failed to add cluster members: {}", e);
                        Outcome::Error { error: e.to_string() }
                    }
                    Err(e) => Outcome::Error { error: e.to_string() },
                };
                Some((ndjson(&outcome), None))
            }
        }
    });

    let first = stream::iter([ndjson(&first)]);
    Body::from_stream(first.chain(rest))
}

#[derive(Debug, Default, Deserialize)]
pub struct RemoveQuery {
    pub force: Option<String>,
}

/// Handler for `DELETE /1.0/cluster/{name}`
pub async fn remove_member(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<RemoveQuery>,
) -> Result<StatusCode, ApiError> {
    let force = matches!(query.force.as_deref(), Some("1" | "true"));
    state.handler.remove_member(&state.ctx, &name, force).await?;
    info!(%name, force, "Removed cluster member");
    Ok(StatusCode::OK)
}

/// Handler for `GET /1.0/status`
pub async fn status(State(state): State<Arc<AppState>>) -> Result<Json<StatusReport>, ApiError> {
    Ok(Json(state.handler.status(&state.ctx).await?))
}
