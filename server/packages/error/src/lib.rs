use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    Conflict,
    SessionNotFound,
    NotReady,
    UnsupportedTransport,
    SpawnFailed,
    HandshakeFailed,
    SessionClosed,
    StreamError,
    RpcError,
    Timeout,
    TurnNotFound,
    ApprovalNotFound,
    ProposalStoreFailed,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:assistant-session:error:invalid_request",
            Self::Conflict => "urn:assistant-session:error:conflict",
            Self::SessionNotFound => "urn:assistant-session:error:session_not_found",
            Self::NotReady => "urn:assistant-session:error:not_ready",
            Self::UnsupportedTransport => "urn:assistant-session:error:unsupported_transport",
            Self::SpawnFailed => "urn:assistant-session:error:spawn_failed",
            Self::HandshakeFailed => "urn:assistant-session:error:handshake_failed",
            Self::SessionClosed => "urn:assistant-session:error:session_closed",
            Self::StreamError => "urn:assistant-session:error:stream_error",
            Self::RpcError => "urn:assistant-session:error:rpc_error",
            Self::Timeout => "urn:assistant-session:error:timeout",
            Self::TurnNotFound => "urn:assistant-session:error:turn_not_found",
            Self::ApprovalNotFound => "urn:assistant-session:error:approval_not_found",
            Self::ProposalStoreFailed => "urn:assistant-session:error:proposal_store_failed",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::Conflict => "Conflict",
            Self::SessionNotFound => "Session Not Found",
            Self::NotReady => "Not Ready",
            Self::UnsupportedTransport => "Unsupported Transport",
            Self::SpawnFailed => "Spawn Failed",
            Self::HandshakeFailed => "Handshake Failed",
            Self::SessionClosed => "Session Closed",
            Self::StreamError => "Stream Error",
            Self::RpcError => "RPC Error",
            Self::Timeout => "Timeout",
            Self::TurnNotFound => "Turn Not Found",
            Self::ApprovalNotFound => "Approval Not Found",
            Self::ProposalStoreFailed => "Proposal Store Failed",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::Conflict => 409,
            Self::SessionNotFound => 404,
            Self::NotReady => 503,
            Self::UnsupportedTransport => 400,
            Self::SpawnFailed => 502,
            Self::HandshakeFailed => 502,
            Self::SessionClosed => 502,
            Self::StreamError => 502,
            Self::RpcError => 502,
            Self::Timeout => 504,
            Self::TurnNotFound => 404,
            Self::ApprovalNotFound => 404,
            Self::ProposalStoreFailed => 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

/// Errors surfaced by the session manager. Variants carry rendered strings so
/// one failure (a teardown reason, say) can be fanned out to many waiters.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("no active assistant session")]
    NoActiveSession,
    #[error("assistant is not ready: {message}")]
    NotReady { message: String },
    #[error("transport `{transport}` is not supported by the session manager")]
    UnsupportedTransport { transport: String },
    #[error("failed to spawn subprocess `{command}`: {message}")]
    Spawn { command: String, message: String },
    #[error("failed to capture subprocess {pipe}")]
    MissingPipe { pipe: String },
    #[error("failed to write subprocess stdin: {message}")]
    Write { message: String },
    #[error("failed to serialize json-rpc message: {message}")]
    Serialize { message: String },
    #[error("{method} timed out after {elapsed_ms}ms")]
    Timeout { method: String, elapsed_ms: u64 },
    #[error("{message}")]
    Rpc {
        method: String,
        code: Option<i64>,
        message: String,
    },
    #[error("session closed: {reason}")]
    SessionClosed { reason: String },
    #[error("handshake failed during {stage}: {message}")]
    Handshake { stage: String, message: String },
    #[error("turn not found: {turn_id}")]
    TurnNotFound { turn_id: String },
    #[error("turn {turn_id} is {status}, expected running")]
    TurnNotRunning { turn_id: String, status: String },
    #[error("unknown approval token: {token}")]
    ApprovalNotFound { token: String },
    #[error("proposal store failed: {message}")]
    ProposalStore { message: String },
}

impl SessionError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn closed(reason: impl Into<String>) -> Self {
        Self::SessionClosed {
            reason: reason.into(),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::NoActiveSession => ErrorType::SessionNotFound,
            Self::NotReady { .. } => ErrorType::NotReady,
            Self::UnsupportedTransport { .. } => ErrorType::UnsupportedTransport,
            Self::Spawn { .. } => ErrorType::SpawnFailed,
            Self::MissingPipe { .. } | Self::Write { .. } | Self::Serialize { .. } => {
                ErrorType::StreamError
            }
            Self::Timeout { .. } => ErrorType::Timeout,
            Self::Rpc { .. } => ErrorType::RpcError,
            Self::SessionClosed { .. } => ErrorType::SessionClosed,
            Self::Handshake { .. } => ErrorType::HandshakeFailed,
            Self::TurnNotFound { .. } => ErrorType::TurnNotFound,
            Self::TurnNotRunning { .. } => ErrorType::Conflict,
            Self::ApprovalNotFound { .. } => ErrorType::ApprovalNotFound,
            Self::ProposalStore { .. } => ErrorType::ProposalStoreFailed,
        }
    }

    fn extensions(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match self {
            Self::Spawn { command, .. } => {
                map.insert("command".to_string(), Value::String(command.clone()));
            }
            Self::Timeout { method, elapsed_ms } => {
                map.insert("method".to_string(), Value::String(method.clone()));
                map.insert("elapsedMs".to_string(), Value::from(*elapsed_ms));
            }
            Self::Rpc { method, code, .. } => {
                map.insert("method".to_string(), Value::String(method.clone()));
                if let Some(code) = code {
                    map.insert("code".to_string(), Value::from(*code));
                }
            }
            Self::Handshake { stage, .. } => {
                map.insert("stage".to_string(), Value::String(stage.clone()));
            }
            Self::TurnNotFound { turn_id } | Self::TurnNotRunning { turn_id, .. } => {
                map.insert("turnId".to_string(), Value::String(turn_id.clone()));
            }
            Self::ApprovalNotFound { token } => {
                map.insert("token".to_string(), Value::String(token.clone()));
            }
            _ => {}
        }
        map
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        problem.extensions = self.extensions();
        problem
    }
}

impl From<SessionError> for ProblemDetails {
    fn from(value: SessionError) -> Self {
        value.to_problem_details()
    }
}

impl From<&SessionError> for ProblemDetails {
    fn from(value: &SessionError) -> Self {
        value.to_problem_details()
    }
}
