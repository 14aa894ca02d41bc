mod common;

use assistant_session::app::build_router;
use assistant_session::{TransportKind, TurnStatus};
use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use common::{wait_for_status, FakeAgent, Harness, THREAD_ID};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;

async fn send_json(app: &Router, method: Method, path: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let request = builder.body(body).expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };
    (status, value)
}

async fn send_event_stream(
    app: &Router,
    path: &str,
    last_event_id: Option<&str>,
) -> (StatusCode, HeaderMap, String) {
    let mut builder = Request::builder()
        .method(Method::GET)
        .uri(path)
        .header(header::ACCEPT, "text/event-stream");
    if let Some(id) = last_event_id {
        builder = builder.header("last-event-id", id);
    }
    let request = builder.body(Body::empty()).expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = tokio::time::timeout(std::time::Duration::from_secs(5), response.into_body().collect())
        .await
        .expect("event stream ends")
        .expect("read body")
        .to_bytes();
    (status, headers, String::from_utf8_lossy(&bytes).to_string())
}

fn event_ids(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("id:"))
        .map(|id| id.trim().to_string())
        .collect()
}

/// Posts a turn and answers its `turn/start` with `protocol_turn_id`.
async fn post_turn(app: &Router, agent: &mut FakeAgent, prompt: &str, protocol_turn_id: &str) -> Value {
    let request_app = app.clone();
    let body = json!({"prompt": prompt, "target": {"editorTarget": "main.rs", "loopId": "loop-1"}});
    let task = tokio::spawn(async move {
        send_json(&request_app, Method::POST, "/v1/turns", Some(body)).await
    });
    let request = agent.expect_method("turn/start").await;
    assert_eq!(request["params"]["metadata"]["editorTarget"], "main.rs");
    agent
        .respond(&request, json!({"turn": {"id": protocol_turn_id}}))
        .await;
    let (status, body) = task.await.expect("join");
    assert_eq!(status, StatusCode::OK, "{body}");
    body
}

#[tokio::test]
async fn health_and_idle_status() {
    let harness = Harness::new();
    let app = build_router(harness.manager.clone());

    let (status, body) = send_json(&app, Method::GET, "/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ok": true}));

    let (status, body) = send_json(&app, Method::GET, "/v1/session", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["running"], false);
    assert_eq!(body["session"], Value::Null);
    assert_eq!(body["readiness"]["readiness"]["skipped"], true);

    let (status, body) = send_json(&app, Method::GET, "/v1/turns", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["turns"], json!([]));

    let (status, body) = send_json(&app, Method::DELETE, "/v1/session", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stopped"], false);
}

#[tokio::test]
async fn session_lifecycle_over_http() {
    let mut harness = Harness::new();
    let app = build_router(harness.manager.clone());

    let (status, body) = send_json(&app, Method::POST, "/v1/session", None).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["ok"], true);
    assert_eq!(body["session"]["threadId"], THREAD_ID);
    assert_eq!(body["session"]["initialized"], true);
    harness.next_agent().await;

    let (_, body) = send_json(&app, Method::GET, "/v1/session", None).await;
    assert_eq!(body["running"], true);
    assert_eq!(body["threadId"], THREAD_ID);
    assert_eq!(body["transport"], "app-server");

    let (status, body) = send_json(&app, Method::DELETE, "/v1/session", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stopped"], true);

    let (_, body) = send_json(&app, Method::GET, "/v1/session", None).await;
    assert_eq!(body["running"], false);
    assert_eq!(body["ok"], true);
}

#[tokio::test]
async fn turn_routes_report_progress_and_errors() {
    let mut harness = Harness::new();
    let app = build_router(harness.manager.clone());
    let mut agent = harness.start().await;

    let (status, body) = send_json(&app, Method::POST, "/v1/turns", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["ok"], false);
    assert_eq!(body["type"], "urn:assistant-session:error:invalid_request");
    assert_eq!(body["message"], "invalid request: prompt is required");

    let body = post_turn(&app, &mut agent, "write tests", "srv-http-1").await;
    let turn_id = body["turn"]["turnId"].as_str().expect("turn id").to_string();
    assert_eq!(body["turn"]["status"], "running");
    assert_eq!(body["turn"]["protocolTurnId"], "srv-http-1");
    assert_eq!(body["turn"]["target"]["loopId"], "loop-1");

    agent
        .send(json!({"method": "item/agentMessage/delta", "params": {"turnId": "srv-http-1", "delta": "ok"}}))
        .await;
    agent
        .send(json!({"method": "turn/completed", "params": {"turnId": "srv-http-1"}}))
        .await;
    wait_for_status(&harness.manager, &turn_id, TurnStatus::Completed).await;

    let (status, body) = send_json(&app, Method::GET, &format!("/v1/turns/{turn_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["turn"]["status"], "completed");
    assert_eq!(body["turn"]["text"], "ok");

    let (status, body) = send_json(&app, Method::GET, "/v1/turns", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["turns"].as_array().map(Vec::len), Some(1));

    let (status, body) =
        send_json(&app, Method::GET, &format!("/v1/turns/{turn_id}/events"), None).await;
    assert_eq!(status, StatusCode::OK);
    let types = body["events"]
        .as_array()
        .expect("events")
        .iter()
        .map(|event| event["type"].clone())
        .collect::<Vec<_>>();
    assert_eq!(
        types,
        vec!["started", "started", "protocol", "text-delta", "protocol", "finished"]
    );

    let (status, body) =
        send_json(&app, Method::POST, &format!("/v1/turns/{turn_id}/cancel"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["turnId"], turn_id);

    let (status, body) = send_json(&app, Method::GET, "/v1/turns/turn_unknown", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["type"], "urn:assistant-session:error:turn_not_found");
}

#[tokio::test]
async fn turn_events_stream_as_sse_and_resume() {
    let mut harness = Harness::new();
    let app = build_router(harness.manager.clone());
    let mut agent = harness.start().await;

    let body = post_turn(&app, &mut agent, "stream me", "srv-http-2").await;
    let turn_id = body["turn"]["turnId"].as_str().expect("turn id").to_string();
    agent
        .send(json!({"method": "turn/completed", "params": {"turnId": "srv-http-2", "message": "fin"}}))
        .await;
    wait_for_status(&harness.manager, &turn_id, TurnStatus::Completed).await;

    let path = format!("/v1/turns/{turn_id}/events");
    let (status, headers, body) = send_event_stream(&app, &path, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream")));
    assert!(body.contains("event: turn"));
    assert_eq!(event_ids(&body), vec!["1", "2", "3", "4"]);
    assert!(body.contains(r#""type":"finished""#));

    let (_, _, body) = send_event_stream(&app, &path, Some("2")).await;
    assert_eq!(event_ids(&body), vec!["3", "4"]);
}

#[tokio::test]
async fn approval_routes_validate_and_resolve() {
    let mut harness = Harness::new();
    let app = build_router(harness.manager.clone());
    let mut agent = harness.start().await;
    post_turn(&app, &mut agent, "patch it", "srv-http-3").await;

    for id in ["ap-1", "ap-2"] {
        agent
            .send(json!({
                "id": id,
                "method": "item/fileChange/requestApproval",
                "params": {"turnId": "srv-http-3", "files": ["README.md"], "reason": "docs"},
            }))
            .await;
    }
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while harness.store.list().len() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "approvals never registered");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let (status, body) = send_json(
        &app,
        Method::POST,
        "/v1/approvals/ap-1",
        Some(json!({"decision": "maybe"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["ok"], false);

    let (status, body) = send_json(
        &app,
        Method::POST,
        "/v1/approvals/ap-1",
        Some(json!({"decision": "approve"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["approval"]["decision"], "approved");
    assert_eq!(body["approval"]["proposal"]["status"], "applied");
    let reply = agent.expect_reply(&json!("ap-1")).await;
    assert_eq!(reply["result"]["approved"], true);

    let (status, body) = send_json(
        &app,
        Method::POST,
        "/v1/approvals/ap-1",
        Some(json!({"decision": "approve"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["token"], "ap-1");

    let (status, body) = send_json(&app, Method::POST, "/v1/approvals/ap-2/fail", None).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["approval"]["decision"], "failed");
    assert_eq!(
        body["approval"]["proposal"]["failureReason"],
        "approval failed by operator"
    );
    let reply = agent.expect_reply(&json!("ap-2")).await;
    assert_eq!(reply["result"]["reason"], "approval failed by operator");
}

#[tokio::test]
async fn session_errors_map_to_problem_details() {
    let harness = Harness::with(Default::default(), |config| {
        config.transport = TransportKind::Exec;
    });
    let app = build_router(harness.manager.clone());

    let (status, body) = send_json(&app, Method::POST, "/v1/session", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["ok"], false);
    assert_eq!(body["type"], "urn:assistant-session:error:unsupported_transport");
    assert_eq!(body["title"], "Unsupported Transport");

    let (status, body) = send_json(&app, Method::GET, "/v1/turns/turn_1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["type"], "urn:assistant-session:error:session_not_found");
}
