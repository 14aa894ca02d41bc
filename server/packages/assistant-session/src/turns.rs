use std::collections::HashMap;

use assistant_session_error::SessionError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::approval::Proposal;
use crate::now_ms;
use crate::router::Routing;

const TURN_EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TurnStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Editor-side context a turn was started from. Carried into `turn/start`
/// and into proposals raised by the turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editor_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scope_roots: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTurnInput {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub messages: Vec<Value>,
    #[serde(default)]
    pub target: TurnTarget,
}

impl StartTurnInput {
    pub fn with_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TurnRecord {
    pub turn_id: String,
    pub protocol_turn_id: Option<String>,
    pub target: TurnTarget,
    pub prompt: String,
    pub status: TurnStatus,
    pub created_at: i64,
    pub completed_at: Option<i64>,
    pub text: String,
    pub error: Option<String>,
    pub event_count: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TurnEvent {
    pub sequence: u64,
    pub turn_id: String,
    pub at: i64,
    #[serde(flatten)]
    pub kind: TurnEventKind,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum TurnEventKind {
    #[serde(rename = "started")]
    Started {
        #[serde(rename = "protocolTurnId")]
        protocol_turn_id: Option<String>,
    },
    #[serde(rename = "text-delta")]
    TextDelta { delta: String },
    /// A routed protocol message, kept opaque.
    #[serde(rename = "protocol")]
    Protocol {
        method: String,
        params: Value,
        routing: Routing,
    },
    #[serde(rename = "approval-request")]
    ApprovalRequest { proposal: Proposal },
    #[serde(rename = "approval/resolved")]
    ApprovalResolved {
        token: String,
        decision: String,
        #[serde(rename = "proposalId")]
        proposal_id: String,
    },
    #[serde(rename = "finished")]
    Finished {
        status: TurnStatus,
        message: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TurnCounts {
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl TurnCounts {
    pub fn total(&self) -> usize {
        self.running + self.completed + self.failed + self.cancelled
    }
}

/// One turn: its record, the full ordered event log, and a live tap.
/// The log is authoritative; the broadcast channel may lag.
#[derive(Debug)]
pub(crate) struct TurnEntry {
    record: TurnRecord,
    created_seq: u64,
    events: Vec<TurnEvent>,
    sender: broadcast::Sender<TurnEvent>,
}

impl TurnEntry {
    fn new(turn_id: String, prompt: String, target: TurnTarget, created_seq: u64) -> Self {
        let (sender, _rx) = broadcast::channel(TURN_EVENT_CHANNEL_CAPACITY);
        Self {
            record: TurnRecord {
                turn_id,
                protocol_turn_id: None,
                target,
                prompt,
                status: TurnStatus::Running,
                created_at: now_ms(),
                completed_at: None,
                text: String::new(),
                error: None,
                event_count: 0,
            },
            created_seq,
            events: Vec::new(),
            sender,
        }
    }

    pub(crate) fn record(&self) -> TurnRecord {
        self.record.clone()
    }

    pub(crate) fn turn_id(&self) -> &str {
        &self.record.turn_id
    }

    pub(crate) fn status(&self) -> TurnStatus {
        self.record.status
    }

    pub(crate) fn protocol_turn_id(&self) -> Option<&str> {
        self.record.protocol_turn_id.as_deref()
    }

    pub(crate) fn target(&self) -> &TurnTarget {
        &self.record.target
    }

    pub(crate) fn created_seq(&self) -> u64 {
        self.created_seq
    }

    pub(crate) fn events(&self) -> &[TurnEvent] {
        &self.events
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<TurnEvent> {
        self.sender.subscribe()
    }

    pub(crate) fn emit(&mut self, kind: TurnEventKind) -> TurnEvent {
        let event = TurnEvent {
            sequence: self.events.len() as u64 + 1,
            turn_id: self.record.turn_id.clone(),
            at: now_ms(),
            kind,
        };
        self.events.push(event.clone());
        self.record.event_count = self.events.len();
        // No receivers is not an error; lagging receivers drop oldest.
        let _ = self.sender.send(event.clone());
        event
    }

    /// The first protocol id wins; later values are ignored.
    pub(crate) fn set_protocol_turn_id(&mut self, protocol_turn_id: String) -> bool {
        if self.record.protocol_turn_id.is_some() {
            return false;
        }
        self.record.protocol_turn_id = Some(protocol_turn_id);
        true
    }

    pub(crate) fn append_text(&mut self, delta: String) {
        if self.record.status.is_terminal() || delta.is_empty() {
            return;
        }
        self.record.text.push_str(&delta);
        self.emit(TurnEventKind::TextDelta { delta });
    }

    /// Moves a running turn to a terminal status and emits `finished`.
    /// Returns false, touching nothing, if the turn is already terminal.
    pub(crate) fn finish(&mut self, status: TurnStatus, message: Option<String>) -> bool {
        if self.record.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.record.status = status;
        self.record.completed_at = Some(now_ms());
        if status != TurnStatus::Completed {
            self.record.error = Some(
                message
                    .clone()
                    .unwrap_or_else(|| format!("turn {}", status.as_str())),
            );
        }
        self.emit(TurnEventKind::Finished { status, message });
        true
    }
}

#[derive(Debug, Default)]
pub(crate) struct TurnTable {
    turns: HashMap<String, TurnEntry>,
    by_protocol_id: HashMap<String, String>,
    next_seq: u64,
}

impl TurnTable {
    pub(crate) fn create(
        &mut self,
        turn_id: String,
        prompt: String,
        target: TurnTarget,
    ) -> &mut TurnEntry {
        self.next_seq += 1;
        let entry = TurnEntry::new(turn_id.clone(), prompt, target, self.next_seq);
        self.turns.entry(turn_id).or_insert(entry)
    }

    pub(crate) fn get(&self, turn_id: &str) -> Option<&TurnEntry> {
        self.turns.get(turn_id)
    }

    pub(crate) fn get_mut(&mut self, turn_id: &str) -> Option<&mut TurnEntry> {
        self.turns.get_mut(turn_id)
    }

    pub(crate) fn contains(&self, turn_id: &str) -> bool {
        self.turns.contains_key(turn_id)
    }

    pub(crate) fn turn_for_protocol_id(&self, protocol_turn_id: &str) -> Option<&str> {
        self.by_protocol_id.get(protocol_turn_id).map(String::as_str)
    }

    pub(crate) fn assign_protocol_id(&mut self, turn_id: &str, protocol_turn_id: String) -> bool {
        let Some(entry) = self.turns.get_mut(turn_id) else {
            return false;
        };
        if !entry.set_protocol_turn_id(protocol_turn_id.clone()) {
            return false;
        }
        self.by_protocol_id
            .insert(protocol_turn_id, turn_id.to_string());
        true
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &TurnEntry> {
        self.turns.values()
    }

    pub(crate) fn running_ids(&self) -> Vec<String> {
        let mut running = self
            .turns
            .values()
            .filter(|entry| entry.status() == TurnStatus::Running)
            .collect::<Vec<_>>();
        running.sort_by_key(|entry| entry.created_seq());
        running
            .into_iter()
            .map(|entry| entry.turn_id().to_string())
            .collect()
    }

    pub(crate) fn records(&self) -> Vec<TurnRecord> {
        let mut entries = self.turns.values().collect::<Vec<_>>();
        entries.sort_by_key(|entry| entry.created_seq());
        entries.into_iter().map(TurnEntry::record).collect()
    }

    pub(crate) fn counts(&self) -> TurnCounts {
        let mut counts = TurnCounts::default();
        for entry in self.turns.values() {
            match entry.status() {
                TurnStatus::Running => counts.running += 1,
                TurnStatus::Completed => counts.completed += 1,
                TurnStatus::Failed => counts.failed += 1,
                TurnStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }
}

/// Explicit prompt first, else the newest user message with text.
pub fn resolve_prompt(input: &StartTurnInput) -> Result<String, SessionError> {
    if let Some(prompt) = input
        .prompt
        .as_deref()
        .map(str::trim)
        .filter(|prompt| !prompt.is_empty())
    {
        return Ok(prompt.to_string());
    }

    input
        .messages
        .iter()
        .rev()
        .filter(|message| message.get("role").and_then(Value::as_str) == Some("user"))
        .find_map(message_text)
        .ok_or_else(|| SessionError::invalid("prompt is required"))
}

fn message_text(message: &Value) -> Option<String> {
    let text = match message.get("content") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => join_text_parts(parts),
        _ => message
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    };
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn join_text_parts(parts: &[Value]) -> String {
    parts
        .iter()
        .filter_map(|part| match part {
            Value::String(text) => Some(text.as_str()),
            other => other.get("text").and_then(Value::as_str),
        })
        .collect::<Vec<_>>()
        .join("")
}

const TEXT_KEYS: [&str; 4] = ["delta", "text", "message", "content"];
const NESTED_TEXT_KEYS: [&str; 2] = ["item", "msg"];

/// Text carried by a notification, if any.
pub fn extract_text(params: &Value) -> Option<String> {
    direct_text(params).or_else(|| {
        NESTED_TEXT_KEYS
            .iter()
            .filter_map(|key| params.get(*key))
            .find_map(direct_text)
    })
}

fn direct_text(value: &Value) -> Option<String> {
    let object = value.as_object()?;
    TEXT_KEYS.iter().find_map(|key| match object.get(*key) {
        Some(Value::String(text)) if !text.is_empty() => Some(text.clone()),
        Some(Value::Array(parts)) => {
            let joined = join_text_parts(parts);
            (!joined.is_empty()).then_some(joined)
        }
        _ => None,
    })
}

/// Message for a terminal notification: its text, else its error.
pub(crate) fn terminal_message(params: &Value) -> Option<String> {
    extract_text(params).or_else(|| match params.get("error") {
        Some(Value::String(text)) if !text.is_empty() => Some(text.clone()),
        Some(error) => error
            .get("message")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned),
        None => None,
    })
}

pub(crate) fn terminal_status_for(method: &str) -> Option<TurnStatus> {
    match method {
        "turn/completed" => Some(TurnStatus::Completed),
        "turn/failed" | "turn/error" => Some(TurnStatus::Failed),
        "turn/cancelled" | "turn/interrupted" => Some(TurnStatus::Cancelled),
        _ => None,
    }
}
