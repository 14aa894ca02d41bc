use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use assistant_session_error::SessionError;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::process::Child;
use tokio::sync::{broadcast, oneshot, Mutex};

use crate::approval::{
    decision_result, failure_result, Decision, PendingApproval, Proposal, ProposalDraft,
    ProposalStore,
};
use crate::config::SessionConfig;
use crate::correlator::RequestCorrelator;
use crate::protocol::{
    classify_line, error_envelope, id_key, is_approval_request, preview, result_envelope,
    InboundMessage, LineIssue, INTERNAL_ERROR, METHOD_NOT_FOUND,
};
use crate::router;
use crate::snapshot::{write_snapshot, SessionSnapshot};
use crate::transport::{AgentConnection, BoxedReader, LineReader, LineWriter, ReadLine};
use crate::turns::{
    extract_text, resolve_prompt, terminal_message, terminal_status_for, StartTurnInput,
    TurnCounts, TurnEvent, TurnEventKind, TurnRecord, TurnStatus, TurnTable,
};

const CLIENT_NAME: &str = "assistant-session";
const PROTOCOL_VERSION: u32 = 1;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);
static TURN_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub at: i64,
    pub source: &'static str,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub pid: Option<u32>,
    pub started_at: i64,
    pub initialized: bool,
    pub thread_id: Option<String>,
    pub turns: TurnCounts,
    pub pending_approvals: usize,
}

/// Result of answering an approval request. `proposal` is absent when the
/// wire reply went out but the store could not record the outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalOutcome {
    pub token: String,
    pub decision: String,
    pub proposal: Option<Proposal>,
}

/// Holder of the one live session. Replaced, never mutated in place.
#[derive(Default)]
pub(crate) struct SlotState {
    pub(crate) current: Option<Arc<Session>>,
    pub(crate) last_error: Option<String>,
    pub(crate) last_diagnostics: Vec<Diagnostic>,
}

pub(crate) type SessionSlot = Arc<Mutex<SlotState>>;

#[derive(Debug, Default)]
struct SessionTables {
    turns: TurnTable,
    approvals: HashMap<String, PendingApproval>,
    diagnostics: VecDeque<Diagnostic>,
    thread_id: Option<String>,
    initialized: bool,
}

impl SessionTables {
    fn push_diagnostic(&mut self, limit: usize, source: &'static str, kind: &str, message: String) {
        self.diagnostics.push_back(Diagnostic {
            at: crate::now_ms(),
            source,
            kind: kind.to_string(),
            message,
        });
        while self.diagnostics.len() > limit {
            self.diagnostics.pop_front();
        }
    }
}

pub(crate) struct Session {
    id: String,
    config: Arc<SessionConfig>,
    store: Arc<dyn ProposalStore>,
    slot: SessionSlot,
    correlator: RequestCorrelator,
    tables: Mutex<SessionTables>,
    pid: Option<u32>,
    started_at: i64,
    spawned_at: Instant,
    torn_down: AtomicBool,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("torn_down", &self.torn_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Wires the reader loops and the exit watcher. The handshake is run
    /// separately so the caller decides what to do on failure.
    pub(crate) fn start(
        config: Arc<SessionConfig>,
        store: Arc<dyn ProposalStore>,
        slot: SessionSlot,
        connection: AgentConnection,
    ) -> Arc<Self> {
        let AgentConnection {
            stdin,
            stdout,
            stderr,
            child,
        } = connection;
        let (stop_tx, stop_rx) = oneshot::channel();
        let has_child = child.is_some();

        let session = Arc::new(Self {
            id: format!("session_{}", SESSION_COUNTER.fetch_add(1, Ordering::SeqCst)),
            pid: child.as_ref().and_then(Child::id),
            config,
            store,
            slot,
            correlator: RequestCorrelator::new(LineWriter::new(stdin)),
            tables: Mutex::new(SessionTables::default()),
            started_at: crate::now_ms(),
            spawned_at: Instant::now(),
            torn_down: AtomicBool::new(false),
            stop_tx: Mutex::new(Some(stop_tx)),
        });

        tracing::info!(session_id = %session.id, pid = ?session.pid, "session: started");

        tokio::spawn(session.clone().run_stdout_loop(stdout, has_child));
        if let Some(stderr) = stderr {
            tokio::spawn(session.clone().run_stderr_loop(stderr));
        }
        if let Some(child) = child {
            tokio::spawn(session.clone().watch_exit(child, stop_rx));
        }
        session
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    pub(crate) async fn is_initialized(&self) -> bool {
        !self.is_torn_down() && self.tables.lock().await.initialized
    }

    pub(crate) async fn handshake(&self) -> Result<(), SessionError> {
        let started = Instant::now();
        let timeout = self.config.request_timeout;

        self.correlator
            .send(
                "initialize",
                json!({
                    "clientInfo": {
                        "name": CLIENT_NAME,
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                    "protocolVersion": PROTOCOL_VERSION,
                }),
                timeout,
            )
            .await
            .map_err(|err| handshake_error("initialize", err))?;

        self.correlator
            .notify("initialized", json!({}))
            .await
            .map_err(|err| handshake_error("initialized", err))?;

        let result = self
            .correlator
            .send(
                "thread/start",
                json!({
                    "cwd": self.config.workspace_root,
                    "model": self.config.model,
                }),
                timeout,
            )
            .await
            .map_err(|err| handshake_error("thread/start", err))?;

        let thread_id = first_string(&result, &[&["thread", "id"], &["threadId"], &["id"]])
            .ok_or_else(|| SessionError::Handshake {
                stage: "thread/start".to_string(),
                message: "response carried no thread id".to_string(),
            })?;

        {
            let mut tables = self.tables.lock().await;
            tables.thread_id = Some(thread_id.clone());
            tables.initialized = true;
        }

        tracing::info!(
            session_id = %self.id,
            thread_id = %thread_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "session: handshake complete"
        );
        Ok(())
    }

    pub(crate) async fn info(&self) -> SessionInfo {
        let tables = self.tables.lock().await;
        SessionInfo {
            session_id: self.id.clone(),
            pid: self.pid,
            started_at: self.started_at,
            initialized: tables.initialized && !self.is_torn_down(),
            thread_id: tables.thread_id.clone(),
            turns: tables.turns.counts(),
            pending_approvals: tables.approvals.len(),
        }
    }

    pub(crate) async fn diagnostics(&self) -> Vec<Diagnostic> {
        self.tables.lock().await.diagnostics.iter().cloned().collect()
    }

    async fn record_diagnostic(&self, source: &'static str, kind: &str, message: String) {
        let limit = self.config.diagnostics_limit;
        self.tables
            .lock()
            .await
            .push_diagnostic(limit, source, kind, message);
    }

    pub(crate) async fn persist_snapshot(&self) {
        let Some(path) = self.config.snapshot_path.as_deref() else {
            return;
        };
        // Teardown owns the final write.
        if self.is_torn_down() {
            return;
        }
        let snapshot = {
            let tables = self.tables.lock().await;
            SessionSnapshot {
                session_id: Some(self.id.clone()),
                pid: self.pid,
                started_at: Some(self.started_at),
                initialized: Some(tables.initialized),
                thread_id: tables.thread_id.clone(),
                active_threads: Some(usize::from(tables.thread_id.is_some())),
                active_turns: Some(tables.turns.counts().running),
                pending_approvals: Some(tables.approvals.len()),
                workspace_root: Some(self.config.workspace_root.clone()),
                updated_at: crate::now_ms(),
            }
        };
        write_snapshot(path, &snapshot);
    }

    // -- turns -------------------------------------------------------------

    pub(crate) async fn start_turn(
        self: &Arc<Self>,
        input: StartTurnInput,
    ) -> Result<TurnRecord, SessionError> {
        let prompt = resolve_prompt(&input)?;
        let turn_id = format!("turn_{}", TURN_COUNTER.fetch_add(1, Ordering::SeqCst));

        let thread_id = {
            let mut tables = self.tables.lock().await;
            if !tables.initialized || self.is_torn_down() {
                return Err(SessionError::NoActiveSession);
            }
            let thread_id = tables.thread_id.clone();
            let entry = tables
                .turns
                .create(turn_id.clone(), prompt.clone(), input.target.clone());
            entry.emit(TurnEventKind::Started {
                protocol_turn_id: None,
            });
            thread_id
        };

        tracing::info!(session_id = %self.id, turn_id = %turn_id, "turn: starting");

        let params = json!({
            "threadId": thread_id,
            "input": [{"type": "text", "text": prompt}],
            "prompt": prompt,
            "cwd": self.config.workspace_root,
            "model": self.config.model,
            "metadata": input.target,
        });
        // Spawned before the next await point; the turn settles even when the
        // caller is dropped.
        let session = Arc::clone(self);
        let exchange = tokio::spawn(async move { session.run_turn_start(turn_id, params).await });
        exchange.await.map_err(|err| {
            tracing::error!(error = %err, "turn: turn/start task failed");
            SessionError::closed(format!("turn/start task failed: {err}"))
        })?
    }

    async fn run_turn_start(&self, turn_id: String, params: Value) -> Result<TurnRecord, SessionError> {
        self.persist_snapshot().await;
        let outcome = self
            .correlator
            .send("turn/start", params, self.config.turn_start_timeout)
            .await;

        let record = {
            let mut tables = self.tables.lock().await;
            match outcome {
                Ok(result) => {
                    if let Some(protocol_id) =
                        first_string(&result, &[&["turn", "id"], &["turnId"], &["id"]])
                    {
                        if tables.turns.assign_protocol_id(&turn_id, protocol_id.clone()) {
                            if let Some(entry) = tables
                                .turns
                                .get_mut(&turn_id)
                                .filter(|entry| entry.status() == TurnStatus::Running)
                            {
                                entry.emit(TurnEventKind::Started {
                                    protocol_turn_id: Some(protocol_id),
                                });
                            }
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(turn_id = %turn_id, error = %err, "turn: turn/start failed");
                    if let Some(entry) = tables.turns.get_mut(&turn_id) {
                        entry.finish(TurnStatus::Failed, Some(err.to_string()));
                    }
                }
            }
            tables
                .turns
                .get(&turn_id)
                .map(|entry| entry.record())
                .ok_or_else(|| SessionError::TurnNotFound {
                    turn_id: turn_id.clone(),
                })?
        };
        self.persist_snapshot().await;
        Ok(record)
    }

    pub(crate) async fn cancel_turn(&self, turn_id: &str) -> Result<TurnRecord, SessionError> {
        let (thread_id, protocol_id) = {
            let tables = self.tables.lock().await;
            let entry = tables
                .turns
                .get(turn_id)
                .ok_or_else(|| turn_not_found(turn_id))?;
            if entry.status().is_terminal() {
                return Err(SessionError::TurnNotRunning {
                    turn_id: turn_id.to_string(),
                    status: entry.status().as_str().to_string(),
                });
            }
            let protocol_id = entry.protocol_turn_id().ok_or_else(|| SessionError::NotReady {
                message: format!("turn {turn_id} has no protocol turn id yet"),
            })?;
            (tables.thread_id.clone(), protocol_id.to_string())
        };

        self.correlator
            .send(
                "turn/interrupt",
                json!({"threadId": thread_id, "turnId": protocol_id}),
                self.config.request_timeout,
            )
            .await?;

        let record = {
            let mut tables = self.tables.lock().await;
            let entry = tables
                .turns
                .get_mut(turn_id)
                .ok_or_else(|| turn_not_found(turn_id))?;
            entry.finish(TurnStatus::Cancelled, Some("turn cancelled".to_string()));
            entry.record()
        };
        self.persist_snapshot().await;
        Ok(record)
    }

    pub(crate) async fn turn(&self, turn_id: &str) -> Option<TurnRecord> {
        self.tables
            .lock()
            .await
            .turns
            .get(turn_id)
            .map(|entry| entry.record())
    }

    pub(crate) async fn turns(&self) -> Vec<TurnRecord> {
        self.tables.lock().await.turns.records()
    }

    pub(crate) async fn turn_events(&self, turn_id: &str) -> Option<Vec<TurnEvent>> {
        self.tables
            .lock()
            .await
            .turns
            .get(turn_id)
            .map(|entry| entry.events().to_vec())
    }

    /// History and live receiver taken under one lock, so nothing emitted in
    /// between is lost or duplicated.
    pub(crate) async fn subscribe(
        &self,
        turn_id: &str,
    ) -> Option<(Vec<TurnEvent>, broadcast::Receiver<TurnEvent>)> {
        let tables = self.tables.lock().await;
        let entry = tables.turns.get(turn_id)?;
        Some((entry.events().to_vec(), entry.subscribe()))
    }

    // -- approvals ---------------------------------------------------------

    pub(crate) async fn resolve_approval(
        &self,
        token: &str,
        decision: Decision,
    ) -> Result<ApprovalOutcome, SessionError> {
        let reply = decision_result(decision);
        let outcome = self
            .answer_approval(token, reply, decision.wire_value(), |store, id| match decision {
                Decision::Approve => store.mark_applied(id),
                Decision::Reject => store.mark_rejected(id),
            })
            .await?;
        tracing::info!(
            session_id = %self.id,
            token = %token,
            decision = decision.wire_value(),
            "approval: resolved"
        );
        Ok(outcome)
    }

    pub(crate) async fn reject_with_failure(
        &self,
        token: &str,
        reason: &str,
    ) -> Result<ApprovalOutcome, SessionError> {
        let outcome = self
            .answer_approval(token, failure_result(reason), "failed", |store, id| {
                store.mark_failed(id, reason)
            })
            .await?;
        tracing::info!(session_id = %self.id, token = %token, reason = %reason, "approval: force-failed");
        Ok(outcome)
    }

    async fn answer_approval<F>(
        &self,
        token: &str,
        reply: Value,
        decision: &str,
        mark: F,
    ) -> Result<ApprovalOutcome, SessionError>
    where
        F: FnOnce(&dyn ProposalStore, &str) -> Result<Proposal, SessionError>,
    {
        if self.is_torn_down() {
            return Err(approval_not_found(token));
        }
        let pending = self
            .tables
            .lock()
            .await
            .approvals
            .remove(token)
            .ok_or_else(|| approval_not_found(token))?;

        let payload = result_envelope(pending.request_id.clone(), reply);
        if let Err(err) = self.correlator.write(&payload).await {
            tracing::warn!(token = %token, error = %err, "approval: write-back failed");
            if !self.is_torn_down() {
                self.tables
                    .lock()
                    .await
                    .approvals
                    .insert(token.to_string(), pending);
            }
            return Err(err);
        }

        let proposal = match mark(self.store.as_ref(), &pending.proposal_id) {
            Ok(proposal) => Some(proposal),
            Err(err) => {
                tracing::error!(
                    token = %token,
                    proposal_id = %pending.proposal_id,
                    error = %err,
                    "approval: proposal store update failed"
                );
                self.record_diagnostic("approval", "proposal-store-failed", err.to_string())
                    .await;
                None
            }
        };

        {
            let mut tables = self.tables.lock().await;
            if let Some(entry) = pending
                .turn_id
                .as_deref()
                .and_then(|turn_id| tables.turns.get_mut(turn_id))
            {
                entry.emit(TurnEventKind::ApprovalResolved {
                    token: token.to_string(),
                    decision: decision.to_string(),
                    proposal_id: pending.proposal_id.clone(),
                });
            }
        }

        self.persist_snapshot().await;

        Ok(ApprovalOutcome {
            token: token.to_string(),
            decision: decision.to_string(),
            proposal,
        })
    }

    async fn handle_approval_request(&self, id: Value, method: String, params: Value) {
        let token = id_key(&id);
        let (turn_id, target) = {
            let tables = self.tables.lock().await;
            let owner = router::route(&tables.turns, &params)
                .and_then(|route| tables.turns.get(&route.turn_id))
                .map(|entry| (Some(entry.turn_id().to_string()), entry.target().clone()));
            owner.unwrap_or_default()
        };

        let draft =
            ProposalDraft::from_request(&method, &params, token.clone(), turn_id.clone(), target);
        let store = Arc::clone(&self.store);
        let stored = tokio::task::spawn_blocking(move || store.upsert_pending(draft))
            .await
            .unwrap_or_else(|err| {
                Err(SessionError::ProposalStore {
                    message: format!("proposal store task failed: {err}"),
                })
            });

        let proposal = match stored {
            Ok(proposal) => proposal,
            Err(err) => {
                tracing::error!(token = %token, method = %method, error = %err, "approval: store rejected request");
                self.record_diagnostic(
                    "approval",
                    "proposal-store-failed",
                    format!("{method} ({token}): {err}"),
                )
                .await;
                let reply = error_envelope(id, INTERNAL_ERROR, err.to_string());
                if let Err(err) = self.correlator.write(&reply).await {
                    tracing::warn!(token = %token, error = %err, "approval: error reply failed");
                }
                return;
            }
        };

        {
            let mut tables = self.tables.lock().await;
            // Teardown drains approvals under this lock after raising the flag.
            if self.is_torn_down() {
                drop(tables);
                tracing::warn!(token = %token, "approval: request arrived during teardown");
                if let Err(err) = self.store.mark_failed(&proposal.id, "session closed") {
                    tracing::warn!(proposal_id = %proposal.id, error = %err, "approval: failed to mark proposal failed");
                }
                return;
            }
            tracing::info!(
                token = %token,
                method = %method,
                turn_id = ?turn_id,
                proposal_id = %proposal.id,
                "approval: request registered"
            );
            tables.approvals.insert(
                token.clone(),
                PendingApproval {
                    token: token.clone(),
                    request_id: id,
                    turn_id: turn_id.clone(),
                    proposal_id: proposal.id.clone(),
                },
            );
            if let Some(entry) = turn_id.as_deref().and_then(|id| tables.turns.get_mut(id)) {
                entry.emit(TurnEventKind::ApprovalRequest { proposal });
            }
        }
        self.persist_snapshot().await;
    }

    // -- dispatch ----------------------------------------------------------

    async fn run_stdout_loop(self: Arc<Self>, stdout: BoxedReader, has_child: bool) {
        let mut reader = LineReader::new(stdout);
        let mut line_count: u64 = 0;

        loop {
            if self.is_torn_down() {
                break;
            }
            match reader.next_line().await {
                Ok(Some(ReadLine::Text(line))) => {
                    line_count += 1;
                    self.dispatch_line(&line).await;
                }
                Ok(Some(ReadLine::Oversized { bytes })) => {
                    tracing::warn!(bytes, "assistant stdout: oversized line dropped");
                    self.record_diagnostic(
                        "stdout",
                        "oversized-line",
                        format!("dropped line of {bytes} bytes"),
                    )
                    .await;
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "assistant stdout: read failed");
                    break;
                }
            }
        }

        tracing::info!(
            session_id = %self.id,
            total_lines = line_count,
            age_ms = self.spawned_at.elapsed().as_millis() as u64,
            "assistant stdout: stream ended"
        );
        if !has_child {
            self.teardown("assistant output closed").await;
        }
    }

    async fn run_stderr_loop(self: Arc<Self>, stderr: BoxedReader) {
        let mut reader = LineReader::new(stderr);
        while let Ok(Some(line)) = reader.next_line().await {
            let ReadLine::Text(line) = line else {
                continue;
            };
            tracing::debug!(session_id = %self.id, "assistant stderr: {}", line);
            self.record_diagnostic("stderr", "stderr", line).await;
        }
    }

    pub(crate) async fn dispatch_line(&self, line: &str) {
        match classify_line(line) {
            Err(LineIssue::Empty) => {}
            Err(issue) => {
                let detail = match &issue {
                    LineIssue::NonJson { preview, error } => format!("{error}: {preview}"),
                    LineIssue::UnknownShape { preview } => preview.clone(),
                    LineIssue::Empty => String::new(),
                };
                tracing::warn!(kind = issue.tag(), "assistant stdout: {}", detail);
                self.record_diagnostic("stdout", issue.tag(), detail).await;
            }
            Ok(InboundMessage::Response { id, outcome }) => {
                self.correlator.resolve(&id, outcome).await;
            }
            Ok(InboundMessage::ServerRequest { id, method, params }) => {
                if is_approval_request(&method) {
                    self.handle_approval_request(id, method, params).await;
                } else {
                    self.reject_unsupported(id, &method).await;
                }
            }
            Ok(InboundMessage::Notification { method, params }) => {
                self.handle_notification(method, params).await;
            }
        }
    }

    async fn reject_unsupported(&self, id: Value, method: &str) {
        tracing::warn!(method = method, id = %id_key(&id), "assistant stdout: unsupported server request");
        self.record_diagnostic(
            "stdout",
            "unsupported-server-request",
            preview(method),
        )
        .await;
        let reply = error_envelope(id, METHOD_NOT_FOUND, format!("method not supported: {method}"));
        if let Err(err) = self.correlator.write(&reply).await {
            tracing::warn!(method = method, error = %err, "stdin: failed to answer server request");
        }
    }

    async fn handle_notification(&self, method: String, params: Value) {
        let finished = {
            let mut tables = self.tables.lock().await;
            let Some(route) = router::route(&tables.turns, &params) else {
                tracing::debug!(method = %method, "assistant stdout: notification matched no turn");
                let limit = self.config.diagnostics_limit;
                tables.push_diagnostic(limit, "stdout", "unrouted-notification", method);
                return;
            };
            let Some(entry) = tables.turns.get_mut(&route.turn_id) else {
                return;
            };

            let terminal = terminal_status_for(&method);
            let message = terminal.and_then(|_| terminal_message(&params));
            let text = match terminal {
                Some(_) => None,
                None => extract_text(&params),
            };
            entry.emit(TurnEventKind::Protocol {
                method: method.clone(),
                params,
                routing: route.routing,
            });

            match terminal {
                Some(status) => {
                    let changed = entry.finish(status, message);
                    if changed {
                        tracing::info!(
                            turn_id = %route.turn_id,
                            status = status.as_str(),
                            "turn: finished"
                        );
                    }
                    changed
                }
                None => {
                    if let Some(text) = text {
                        entry.append_text(text);
                    }
                    false
                }
            }
        };
        if finished {
            self.persist_snapshot().await;
        }
    }

    // -- teardown ----------------------------------------------------------

    async fn watch_exit(self: Arc<Self>, mut child: Child, mut stop_rx: oneshot::Receiver<()>) {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = &mut stop_rx => terminate(&mut child, self.config.close_grace).await,
        };
        let reason = exit_reason(&status);
        tracing::warn!(
            session_id = %self.id,
            age_ms = self.spawned_at.elapsed().as_millis() as u64,
            reason = %reason,
            "assistant process exited"
        );
        self.teardown(&reason).await;
    }

    /// Cascades `reason` to every in-flight request, approval and running
    /// turn, then clears the slot. Runs once; later calls return immediately.
    pub(crate) async fn teardown(&self, reason: &str) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(session_id = %self.id, reason = %reason, "session: tearing down");

        let rejected = self.correlator.clear_all_pending(reason).await;

        let approvals = {
            let mut tables = self.tables.lock().await;
            tables.approvals.drain().map(|(_, approval)| approval).collect::<Vec<_>>()
        };
        for approval in &approvals {
            if let Err(err) = self.store.mark_failed(&approval.proposal_id, reason) {
                tracing::warn!(
                    proposal_id = %approval.proposal_id,
                    error = %err,
                    "teardown: failed to mark proposal failed"
                );
            }
        }

        let diagnostics = {
            let mut tables = self.tables.lock().await;
            for approval in &approvals {
                if let Some(entry) = approval
                    .turn_id
                    .as_deref()
                    .and_then(|turn_id| tables.turns.get_mut(turn_id))
                {
                    entry.emit(TurnEventKind::ApprovalResolved {
                        token: approval.token.clone(),
                        decision: "failed".to_string(),
                        proposal_id: approval.proposal_id.clone(),
                    });
                }
            }
            let running = tables.turns.running_ids();
            for turn_id in &running {
                if let Some(entry) = tables.turns.get_mut(turn_id) {
                    entry.finish(TurnStatus::Failed, Some(reason.to_string()));
                }
            }
            tables.initialized = false;
            let limit = self.config.diagnostics_limit;
            tables.push_diagnostic(limit, "session", "teardown", reason.to_string());
            tracing::info!(
                session_id = %self.id,
                rejected_requests = rejected,
                failed_approvals = approvals.len(),
                failed_turns = running.len(),
                "session: in-flight work failed"
            );
            tables.diagnostics.iter().cloned().collect::<Vec<_>>()
        };

        if let Some(stop) = self.stop_tx.lock().await.take() {
            let _ = stop.send(());
        }
        let _ = tokio::time::timeout(self.config.close_grace, self.correlator.shutdown_writer()).await;

        let mut slot = self.slot.lock().await;
        if slot
            .current
            .as_ref()
            .is_some_and(|current| current.id == self.id)
        {
            slot.current = None;
        }
        slot.last_error = Some(reason.to_string());
        slot.last_diagnostics = diagnostics;
        // A cleared slot always has the empty snapshot on disk.
        if slot.current.is_none() {
            if let Some(path) = self.config.snapshot_path.as_deref() {
                write_snapshot(path, &SessionSnapshot::empty());
            }
        }
    }
}

#[cfg(unix)]
async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return status;
        }
        tracing::warn!(pid, "assistant process ignored SIGTERM, killing");
    }
    child.kill().await?;
    child.wait().await
}

#[cfg(not(unix))]
async fn terminate(child: &mut Child, _grace: Duration) -> std::io::Result<ExitStatus> {
    child.kill().await?;
    child.wait().await
}

fn exit_reason(status: &std::io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => match status.code() {
            Some(code) => format!("assistant process exited (code {code})"),
            None => "assistant process exited (signal)".to_string(),
        },
        Err(err) => format!("assistant process wait failed: {err}"),
    }
}

fn handshake_error(stage: &str, err: SessionError) -> SessionError {
    SessionError::Handshake {
        stage: stage.to_string(),
        message: err.to_string(),
    }
}

fn turn_not_found(turn_id: &str) -> SessionError {
    SessionError::TurnNotFound {
        turn_id: turn_id.to_string(),
    }
}

fn approval_not_found(token: &str) -> SessionError {
    SessionError::ApprovalNotFound {
        token: token.to_string(),
    }
}

/// First non-empty string (or number) found along any of `paths`.
fn first_string(value: &Value, paths: &[&[&str]]) -> Option<String> {
    paths.iter().find_map(|path| {
        let found = path
            .iter()
            .try_fold(value, |current, key| current.get(*key))?;
        match found {
            Value::String(text) if !text.is_empty() => Some(text.clone()),
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        }
    })
}
