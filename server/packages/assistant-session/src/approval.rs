use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use assistant_session_error::SessionError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::now_ms;
use crate::turns::TurnTarget;

const MAX_SCAN_NODES: usize = 4096;
const MAX_SCAN_DEPTH: usize = 32;
const MAX_SUMMARY_CHARS: usize = 160;
const PATH_KEYS: [&str; 4] = ["path", "filePath", "targetPath", "file"];
const PATCH_KEYS: [&str; 3] = ["diff", "patch", "unifiedDiff"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    #[serde(alias = "approved", alias = "accept")]
    Approve,
    #[serde(alias = "rejected", alias = "deny", alias = "decline")]
    Reject,
}

impl Decision {
    pub fn approved(self) -> bool {
        matches!(self, Self::Approve)
    }

    /// The past-tense form written onto the wire.
    pub fn wire_value(self) -> &'static str {
        match self {
            Self::Approve => "approved",
            Self::Reject => "rejected",
        }
    }
}

impl FromStr for Decision {
    type Err = SessionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "approve" | "approved" | "accept" => Ok(Self::Approve),
            "reject" | "rejected" | "deny" | "decline" => Ok(Self::Reject),
            other => Err(SessionError::invalid(format!(
                "unknown approval decision '{other}'"
            ))),
        }
    }
}

pub(crate) fn decision_result(decision: Decision) -> Value {
    json!({
        "approved": decision.approved(),
        "decision": decision.wire_value(),
    })
}

pub(crate) fn failure_result(reason: &str) -> Value {
    json!({
        "approved": false,
        "decision": Decision::Reject.wire_value(),
        "reason": reason,
    })
}

/// An approval request that is still open on the wire. `token` is the
/// stringified server request id; `request_id` is the id as received, used
/// verbatim for the reply.
#[derive(Debug, Clone)]
pub(crate) struct PendingApproval {
    pub(crate) token: String,
    pub(crate) request_id: Value,
    pub(crate) turn_id: Option<String>,
    pub(crate) proposal_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    Pending,
    Applied,
    Rejected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalDraft {
    pub approval_token: String,
    pub method: String,
    #[serde(default)]
    pub turn_id: Option<String>,
    #[serde(default)]
    pub target: TurnTarget,
    pub summary: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub patch: Option<String>,
}

impl ProposalDraft {
    pub fn from_request(
        method: &str,
        params: &Value,
        approval_token: String,
        turn_id: Option<String>,
        target: TurnTarget,
    ) -> Self {
        let files = collect_file_paths(params);
        Self {
            summary: summarize(method, params, &files),
            patch: find_patch(params),
            files,
            approval_token,
            method: method.to_string(),
            turn_id,
            target,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub id: String,
    pub status: ProposalStatus,
    #[serde(flatten)]
    pub draft: ProposalDraft,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// Durable home for proposals awaiting a human decision.
pub trait ProposalStore: Send + Sync + fmt::Debug {
    /// Creates a pending proposal, or refreshes the pending one already
    /// holding the same approval token.
    fn upsert_pending(&self, draft: ProposalDraft) -> Result<Proposal, SessionError>;
    fn mark_applied(&self, id: &str) -> Result<Proposal, SessionError>;
    fn mark_rejected(&self, id: &str) -> Result<Proposal, SessionError>;
    fn mark_failed(&self, id: &str, reason: &str) -> Result<Proposal, SessionError>;
    fn get(&self, id: &str) -> Option<Proposal>;
}

#[derive(Debug, Default, Clone)]
struct ProposalBook {
    proposals: HashMap<String, Proposal>,
    next_id: u64,
}

impl ProposalBook {
    fn upsert_pending(&mut self, draft: ProposalDraft) -> Proposal {
        let now = now_ms();
        let existing = self.proposals.values_mut().find(|proposal| {
            proposal.status == ProposalStatus::Pending
                && proposal.draft.approval_token == draft.approval_token
        });
        if let Some(proposal) = existing {
            proposal.draft = draft;
            proposal.updated_at = now;
            return proposal.clone();
        }

        self.next_id += 1;
        let proposal = Proposal {
            id: format!("proposal_{}", self.next_id),
            status: ProposalStatus::Pending,
            draft,
            created_at: now,
            updated_at: now,
            failure_reason: None,
        };
        self.proposals
            .insert(proposal.id.clone(), proposal.clone());
        proposal
    }

    fn transition(
        &mut self,
        id: &str,
        status: ProposalStatus,
        reason: Option<&str>,
    ) -> Result<Proposal, SessionError> {
        let proposal = self
            .proposals
            .get_mut(id)
            .ok_or_else(|| SessionError::ProposalStore {
                message: format!("proposal not found: {id}"),
            })?;
        proposal.status = status;
        proposal.updated_at = now_ms();
        proposal.failure_reason = reason.map(ToOwned::to_owned);
        Ok(proposal.clone())
    }

    fn insert_loaded(&mut self, proposal: Proposal) {
        if let Some(num) = proposal
            .id
            .strip_prefix("proposal_")
            .and_then(|suffix| suffix.parse::<u64>().ok())
        {
            self.next_id = self.next_id.max(num);
        }
        self.proposals.insert(proposal.id.clone(), proposal);
    }
}

fn poisoned() -> SessionError {
    SessionError::ProposalStore {
        message: "proposal store lock poisoned".to_string(),
    }
}

#[derive(Debug, Default)]
pub struct InMemoryProposalStore {
    book: Mutex<ProposalBook>,
}

impl InMemoryProposalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self) -> Vec<Proposal> {
        let Ok(book) = self.book.lock() else {
            return Vec::new();
        };
        let mut proposals = book.proposals.values().cloned().collect::<Vec<_>>();
        proposals.sort_by(|left, right| left.created_at.cmp(&right.created_at).then(left.id.cmp(&right.id)));
        proposals
    }
}

impl ProposalStore for InMemoryProposalStore {
    fn upsert_pending(&self, draft: ProposalDraft) -> Result<Proposal, SessionError> {
        Ok(self.book.lock().map_err(|_| poisoned())?.upsert_pending(draft))
    }

    fn mark_applied(&self, id: &str) -> Result<Proposal, SessionError> {
        self.book
            .lock()
            .map_err(|_| poisoned())?
            .transition(id, ProposalStatus::Applied, None)
    }

    fn mark_rejected(&self, id: &str) -> Result<Proposal, SessionError> {
        self.book
            .lock()
            .map_err(|_| poisoned())?
            .transition(id, ProposalStatus::Rejected, None)
    }

    fn mark_failed(&self, id: &str, reason: &str) -> Result<Proposal, SessionError> {
        self.book
            .lock()
            .map_err(|_| poisoned())?
            .transition(id, ProposalStatus::Failed, Some(reason))
    }

    fn get(&self, id: &str) -> Option<Proposal> {
        self.book.lock().ok()?.proposals.get(id).cloned()
    }
}

/// Keeps one pretty-printed JSON file per proposal under `dir`.
#[derive(Debug)]
pub struct JsonFileProposalStore {
    dir: PathBuf,
    book: Mutex<ProposalBook>,
}

impl JsonFileProposalStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, SessionError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| SessionError::ProposalStore {
            message: format!("failed to create proposal dir {}: {err}", dir.display()),
        })?;

        let mut book = ProposalBook::default();
        let entries = fs::read_dir(&dir).map_err(|err| SessionError::ProposalStore {
            message: format!("failed to read proposal dir {}: {err}", dir.display()),
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path)
                .ok()
                .and_then(|raw| serde_json::from_str::<Proposal>(&raw).ok())
            {
                Some(proposal) => book.insert_loaded(proposal),
                None => tracing::warn!(path = %path.display(), "skipping unreadable proposal file"),
            }
        }

        Ok(Self {
            dir,
            book: Mutex::new(book),
        })
    }

    fn proposal_path(&self, id: &str) -> PathBuf {
        proposal_file(&self.dir, id)
    }

    fn persist(&self, proposal: &Proposal) -> Result<(), SessionError> {
        let content =
            serde_json::to_string_pretty(proposal).map_err(|err| SessionError::ProposalStore {
                message: err.to_string(),
            })?;
        fs::write(self.proposal_path(&proposal.id), content).map_err(|err| {
            SessionError::ProposalStore {
                message: format!("failed to write proposal {}: {err}", proposal.id),
            }
        })
    }

    fn update<F>(&self, apply: F) -> Result<Proposal, SessionError>
    where
        F: FnOnce(&mut ProposalBook) -> Result<Proposal, SessionError>,
    {
        let mut book = self.book.lock().map_err(|_| poisoned())?;
        // Memory only moves once the file write has landed.
        let mut staged = book.clone();
        let proposal = apply(&mut staged)?;
        self.persist(&proposal)?;
        *book = staged;
        Ok(proposal)
    }
}

fn proposal_file(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{}.json", id.replace(['/', '\\'], "_")))
}

impl ProposalStore for JsonFileProposalStore {
    fn upsert_pending(&self, draft: ProposalDraft) -> Result<Proposal, SessionError> {
        self.update(|book| Ok(book.upsert_pending(draft)))
    }

    fn mark_applied(&self, id: &str) -> Result<Proposal, SessionError> {
        self.update(|book| book.transition(id, ProposalStatus::Applied, None))
    }

    fn mark_rejected(&self, id: &str) -> Result<Proposal, SessionError> {
        self.update(|book| book.transition(id, ProposalStatus::Rejected, None))
    }

    fn mark_failed(&self, id: &str, reason: &str) -> Result<Proposal, SessionError> {
        self.update(|book| book.transition(id, ProposalStatus::Failed, Some(reason)))
    }

    fn get(&self, id: &str) -> Option<Proposal> {
        self.book.lock().ok()?.proposals.get(id).cloned()
    }
}

/// Breadth-first walk over an untyped payload, yielding string values stored
/// under any of `keys`. Bounded by node count and depth.
fn scan_string_values<'a>(payload: &'a Value, keys: &[&str]) -> Vec<&'a str> {
    let mut found = Vec::new();
    let mut queue = VecDeque::from([(payload, 0usize)]);
    let mut visited = 0usize;

    while let Some((value, depth)) = queue.pop_front() {
        visited += 1;
        if visited > MAX_SCAN_NODES {
            tracing::debug!(visited, "payload scan stopped at node limit");
            break;
        }
        if depth >= MAX_SCAN_DEPTH {
            continue;
        }
        match value {
            Value::Object(object) => {
                for (key, child) in object {
                    if keys.contains(&key.as_str()) {
                        if let Value::String(text) = child {
                            found.push(text.as_str());
                            continue;
                        }
                    }
                    queue.push_back((child, depth + 1));
                }
            }
            Value::Array(items) => {
                queue.extend(items.iter().map(|item| (item, depth + 1)));
            }
            _ => {}
        }
    }

    found
}

pub fn collect_file_paths(payload: &Value) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    for path in scan_string_values(payload, &PATH_KEYS) {
        let trimmed = path.trim();
        if !trimmed.is_empty() && !paths.iter().any(|existing| existing == trimmed) {
            paths.push(trimmed.to_string());
        }
    }
    paths
}

pub fn find_patch(payload: &Value) -> Option<String> {
    scan_string_values(payload, &PATCH_KEYS)
        .into_iter()
        .find(|patch| !patch.trim().is_empty())
        .map(ToOwned::to_owned)
}

pub fn summarize(method: &str, params: &Value, files: &[String]) -> String {
    let reason = params
        .get("reason")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|reason| !reason.is_empty());
    let command = match params.get("command") {
        Some(Value::String(command)) => Some(command.trim().to_string()),
        Some(Value::Array(parts)) => Some(
            parts
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(" "),
        ),
        _ => None,
    }
    .filter(|command| !command.is_empty());

    let headline = if let Some(command) = command {
        format!("Run command: {command}")
    } else if !files.is_empty() {
        let noun = if files.len() == 1 { "file" } else { "files" };
        format!("Change {} {noun}: {}", files.len(), files.join(", "))
    } else {
        format!("Approval requested: {method}")
    };

    let summary = match reason {
        Some(reason) => format!("{headline} ({reason})"),
        None => headline,
    };
    truncate_chars(&summary, MAX_SUMMARY_CHARS)
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let head: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{head}...")
}
