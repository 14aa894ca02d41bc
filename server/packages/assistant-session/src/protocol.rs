//! Wire envelopes and classification for the newline-delimited JSON protocol
//! spoken by the assistant subprocess.

use serde_json::{json, Value};

pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INTERNAL_ERROR: i64 = -32603;

const DIAGNOSTIC_PREVIEW_CHARS: usize = 320;

#[derive(Debug, Clone, PartialEq)]
pub struct RpcErrorBody {
    pub code: Option<i64>,
    pub message: Option<String>,
    pub data: Option<Value>,
}

impl RpcErrorBody {
    fn from_value(value: &Value) -> Self {
        Self {
            code: value.get("code").and_then(Value::as_i64),
            message: value
                .get("message")
                .and_then(Value::as_str)
                .filter(|message| !message.trim().is_empty())
                .map(ToOwned::to_owned),
            data: value.get("data").cloned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Response {
        id: Value,
        outcome: Result<Value, RpcErrorBody>,
    },
    ServerRequest {
        id: Value,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineIssue {
    Empty,
    NonJson { preview: String, error: String },
    UnknownShape { preview: String },
}

impl LineIssue {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Empty => "empty-line",
            Self::NonJson { .. } => "non-json-line",
            Self::UnknownShape { .. } => "unknown-message-shape",
        }
    }
}

pub fn classify_line(line: &str) -> Result<InboundMessage, LineIssue> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(LineIssue::Empty);
    }

    let payload = serde_json::from_str::<Value>(trimmed).map_err(|err| LineIssue::NonJson {
        preview: preview(trimmed),
        error: err.to_string(),
    })?;

    classify(payload).map_err(|payload| LineIssue::UnknownShape {
        preview: preview(&payload.to_string()),
    })
}

/// Responses win over requests when a message carries both `result` and
/// `method`, matching the order the checks are listed in the protocol notes.
pub fn classify(payload: Value) -> Result<InboundMessage, Value> {
    let Value::Object(mut object) = payload else {
        return Err(payload);
    };

    let has_id = object.get("id").is_some_and(|id| !id.is_null());
    let has_outcome = object.contains_key("result") || object.contains_key("error");
    let method = object
        .get("method")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned);

    if has_id && has_outcome {
        let id = object.remove("id").unwrap_or(Value::Null);
        let outcome = match object.remove("error").filter(|error| !error.is_null()) {
            Some(error) => Err(RpcErrorBody::from_value(&error)),
            None => Ok(object.remove("result").unwrap_or(Value::Null)),
        };
        return Ok(InboundMessage::Response { id, outcome });
    }

    match (has_id, method) {
        (true, Some(method)) => Ok(InboundMessage::ServerRequest {
            id: object.remove("id").unwrap_or(Value::Null),
            method,
            params: object.remove("params").unwrap_or(Value::Null),
        }),
        (false, Some(method)) => Ok(InboundMessage::Notification {
            method,
            params: object.remove("params").unwrap_or(Value::Null),
        }),
        _ => Err(Value::Object(object)),
    }
}

/// Server requests that need a human decision. The protocol names these with
/// a `requestApproval` suffix (`item/commandExecution/requestApproval`); the
/// comparison ignores case and separators.
pub fn is_approval_request(method: &str) -> bool {
    let normalized: String = method
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .map(|ch| ch.to_ascii_lowercase())
        .collect();
    normalized.contains("requestapproval")
}

/// Stable table key for a wire id: strings as-is, numbers in decimal.
pub fn id_key(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        other => serde_json::to_string(other).unwrap_or_else(|_| "null".to_string()),
    }
}

pub fn request_envelope(id: &str, method: &str, params: Value) -> Value {
    json!({
        "id": id,
        "method": method,
        "params": params,
    })
}

pub fn notification_envelope(method: &str, params: Value) -> Value {
    json!({
        "method": method,
        "params": params,
    })
}

pub fn result_envelope(id: Value, result: Value) -> Value {
    json!({
        "id": id,
        "result": result,
    })
}

pub fn error_envelope(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "id": id,
        "error": {
            "code": code,
            "message": message.into(),
        }
    })
}

pub fn preview(text: &str) -> String {
    if text.chars().count() <= DIAGNOSTIC_PREVIEW_CHARS {
        return text.to_string();
    }
    let head: String = text.chars().take(DIAGNOSTIC_PREVIEW_CHARS).collect();
    format!("{head}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_responses_requests_and_notifications() {
        let response = classify_line(r#"{"id":"3","result":{"ok":true}}"#).expect("response");
        assert_eq!(
            response,
            InboundMessage::Response {
                id: json!("3"),
                outcome: Ok(json!({"ok": true})),
            }
        );

        let failure = classify_line(r#"{"id":4,"error":{"code":-1,"message":"nope"}}"#)
            .expect("error response");
        match failure {
            InboundMessage::Response { id, outcome } => {
                assert_eq!(id, json!(4));
                let body = outcome.expect_err("error outcome");
                assert_eq!(body.code, Some(-1));
                assert_eq!(body.message.as_deref(), Some("nope"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let request =
            classify_line(r#"{"id":"42","method":"item/fileChange/requestApproval","params":{}}"#)
                .expect("server request");
        assert!(matches!(request, InboundMessage::ServerRequest { ref method, .. } if method == "item/fileChange/requestApproval"));

        let notification = classify_line(r#"{"method":"turn/completed","params":{"turnId":"T1"}}"#)
            .expect("notification");
        assert_eq!(
            notification,
            InboundMessage::Notification {
                method: "turn/completed".to_string(),
                params: json!({"turnId": "T1"}),
            }
        );
    }

    #[test]
    fn malformed_lines_degrade_to_issues() {
        assert_eq!(classify_line("   "), Err(LineIssue::Empty));

        let long = format!("not json {}", "x".repeat(1000));
        match classify_line(&long) {
            Err(LineIssue::NonJson { preview, .. }) => {
                assert!(preview.ends_with("..."));
                assert_eq!(preview.chars().count(), DIAGNOSTIC_PREVIEW_CHARS + 3);
            }
            other => panic!("unexpected {other:?}"),
        }

        let unknown = classify_line(r#"{"id":"9"}"#).expect_err("shape");
        assert_eq!(unknown.tag(), "unknown-message-shape");
        assert_eq!(classify_line("[1,2]").expect_err("array").tag(), "unknown-message-shape");
    }

    #[test]
    fn approval_predicate_matches_request_approval_methods() {
        assert!(is_approval_request("item/commandExecution/requestApproval"));
        assert!(is_approval_request("applyPatch/REQUEST_APPROVAL"));
        assert!(is_approval_request("request approval"));
        assert!(!is_approval_request("item/agentMessage/delta"));
        assert!(!is_approval_request("approval/resolved"));
    }

    #[test]
    fn id_keys_match_across_string_and_number_forms() {
        assert_eq!(id_key(&json!("7")), "7");
        assert_eq!(id_key(&json!(7)), "7");
        assert_eq!(id_key(&json!({"a": 1})), r#"{"a":1}"#);
    }
}
