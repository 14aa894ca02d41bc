use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use assistant_session_error::SessionError;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::approval::Decision;
use crate::manager::SessionManager;
use crate::turns::StartTurnInput;

const DEFAULT_FAILURE_REASON: &str = "approval failed by operator";

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

#[derive(Debug, Deserialize)]
struct DecisionBody {
    decision: String,
}

#[derive(Debug, Default, Deserialize)]
struct FailureBody {
    #[serde(default)]
    reason: Option<String>,
}

pub fn build_router(manager: Arc<SessionManager>) -> Router {
    Router::new()
        .route("/v1/health", get(get_health))
        .route(
            "/v1/session",
            post(post_session).get(get_session).delete(delete_session),
        )
        .route("/v1/turns", post(post_turn).get(get_turns))
        .route("/v1/turns/:turn_id", get(get_turn))
        .route("/v1/turns/:turn_id/events", get(get_turn_events))
        .route("/v1/turns/:turn_id/cancel", post(post_cancel_turn))
        .route("/v1/approvals/:token", post(post_approval))
        .route("/v1/approvals/:token/fail", post(post_approval_failure))
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}

async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

async fn post_session(State(manager): State<Arc<SessionManager>>) -> Response {
    match manager.ensure_session().await {
        Ok(session) => ok(json!({ "session": session })),
        Err(err) => problem(&err),
    }
}

async fn get_session(State(manager): State<Arc<SessionManager>>) -> Response {
    let status = manager.status().await;
    (StatusCode::OK, Json(status)).into_response()
}

async fn delete_session(State(manager): State<Arc<SessionManager>>) -> Response {
    let stopped = manager.stop().await;
    ok(json!({ "stopped": stopped }))
}

async fn post_turn(
    State(manager): State<Arc<SessionManager>>,
    Json(input): Json<StartTurnInput>,
) -> Response {
    match manager.start_turn(input).await {
        Ok(turn) => ok(json!({ "turn": turn })),
        Err(err) => problem(&err),
    }
}

async fn get_turns(State(manager): State<Arc<SessionManager>>) -> Response {
    let turns = manager.list_turns().await;
    ok(json!({ "turns": turns }))
}

async fn get_turn(
    State(manager): State<Arc<SessionManager>>,
    Path(turn_id): Path<String>,
) -> Response {
    match manager.get_turn(&turn_id).await {
        Ok(turn) => ok(json!({ "turn": turn })),
        Err(err) => problem(&err),
    }
}

async fn get_turn_events(
    State(manager): State<Arc<SessionManager>>,
    Path(turn_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !wants_event_stream(&headers) {
        return match manager.snapshot_turn_events(&turn_id).await {
            Ok(events) => ok(json!({ "events": events })),
            Err(err) => problem(&err),
        };
    }

    let last_event_id = headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok());

    match manager.turn_event_stream(&turn_id, last_event_id).await {
        Ok(events) => {
            let stream = events.map(|event| {
                let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
                Ok::<_, Infallible>(
                    Event::default()
                        .event("turn")
                        .id(event.sequence.to_string())
                        .data(data),
                )
            });
            Sse::new(stream)
                .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
                .into_response()
        }
        Err(err) => problem(&err),
    }
}

async fn post_cancel_turn(
    State(manager): State<Arc<SessionManager>>,
    Path(turn_id): Path<String>,
) -> Response {
    match manager.cancel_turn(&turn_id).await {
        Ok(turn) => ok(json!({ "turn": turn })),
        Err(err) => problem(&err),
    }
}

async fn post_approval(
    State(manager): State<Arc<SessionManager>>,
    Path(token): Path<String>,
    Json(body): Json<DecisionBody>,
) -> Response {
    let decision = match body.decision.parse::<Decision>() {
        Ok(decision) => decision,
        Err(err) => return problem(&err),
    };
    match manager.resolve_approval(&token, decision).await {
        Ok(outcome) => ok(json!({ "approval": outcome })),
        Err(err) => problem(&err),
    }
}

async fn post_approval_failure(
    State(manager): State<Arc<SessionManager>>,
    Path(token): Path<String>,
    body: Option<Json<FailureBody>>,
) -> Response {
    let reason = body
        .and_then(|Json(body)| body.reason)
        .map(|reason| reason.trim().to_string())
        .filter(|reason| !reason.is_empty())
        .unwrap_or_else(|| DEFAULT_FAILURE_REASON.to_string());
    match manager.reject_approval_with_failure(&token, &reason).await {
        Ok(outcome) => ok(json!({ "approval": outcome })),
        Err(err) => problem(&err),
    }
}

fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.contains("text/event-stream"))
        .unwrap_or(false)
}

fn ok(mut body: Value) -> Response {
    if let Value::Object(map) = &mut body {
        map.insert("ok".to_string(), Value::Bool(true));
    }
    (StatusCode::OK, Json(body)).into_response()
}

/// `{ok: false, message, ...problem details}` with the mapped status.
fn problem(err: &SessionError) -> Response {
    let details = err.to_problem_details();
    let status = StatusCode::from_u16(details.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut body = serde_json::to_value(&details).unwrap_or_else(|_| json!({}));
    if let Value::Object(map) = &mut body {
        map.insert("ok".to_string(), Value::Bool(false));
        map.insert("message".to_string(), Value::String(err.to_string()));
    }
    (status, Json(body)).into_response()
}
