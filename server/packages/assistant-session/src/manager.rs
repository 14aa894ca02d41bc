use std::sync::Arc;

use assistant_session_error::SessionError;
use futures::future::{self, Either};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::approval::{Decision, InMemoryProposalStore, JsonFileProposalStore, ProposalStore};
use crate::config::{SessionConfig, TransportKind};
use crate::probe::{CommandReadinessProbe, ProbeReport, ReadinessProbe, StaticReadinessProbe};
use crate::session::{ApprovalOutcome, Diagnostic, Session, SessionInfo, SessionSlot, SlotState};
use crate::transport::{AgentLauncher, ProcessLauncher};
use crate::turns::{StartTurnInput, TurnCounts, TurnEvent, TurnEventKind, TurnRecord};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub ok: bool,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub session: Option<SessionInfo>,
    pub thread_id: Option<String>,
    pub turns: TurnCounts,
    pub diagnostics: Vec<Diagnostic>,
    pub readiness: ProbeReport,
    pub transport: String,
    pub last_error: Option<String>,
}

/// Live tap on one turn. `history` holds every event emitted before the
/// subscription; the callback sees everything after. Dropping the handle
/// unsubscribes.
#[derive(Debug)]
pub struct TurnSubscription {
    history: Vec<TurnEvent>,
    task: JoinHandle<()>,
}

impl TurnSubscription {
    pub fn history(&self) -> &[TurnEvent] {
        &self.history
    }

    pub fn unsubscribe(self) {}
}

impl Drop for TurnSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Owns the single live session and exposes the public operations on it.
pub struct SessionManager {
    config: Arc<SessionConfig>,
    launcher: Arc<dyn AgentLauncher>,
    probe: Arc<dyn ReadinessProbe>,
    store: Arc<dyn ProposalStore>,
    slot: SessionSlot,
    ensure_lock: Mutex<()>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("launch", &self.config.launch)
            .field("transport", &self.config.transport)
            .field("launcher", &self.launcher)
            .field("probe", &self.probe)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        let probe: Arc<dyn ReadinessProbe> = match &config.probe {
            Some(launch) => Arc::new(
                CommandReadinessProbe::new(launch.clone())
                    .with_cwd(&config.workspace_root)
                    .with_timeout(config.probe_timeout),
            ),
            None => Arc::new(StaticReadinessProbe::skipped()),
        };
        let store: Arc<dyn ProposalStore> = match &config.proposal_dir {
            Some(dir) => Arc::new(JsonFileProposalStore::open(dir)?),
            None => Arc::new(InMemoryProposalStore::new()),
        };
        Ok(Self {
            config: Arc::new(config),
            launcher: Arc::new(ProcessLauncher),
            probe,
            store,
            slot: Arc::new(Mutex::new(SlotState::default())),
            ensure_lock: Mutex::new(()),
        })
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn AgentLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ProposalStore>) -> Self {
        self.store = store;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn ProposalStore> {
        self.store.clone()
    }

    async fn current(&self) -> Option<Arc<Session>> {
        self.slot.lock().await.current.clone()
    }

    async fn require_session(&self) -> Result<Arc<Session>, SessionError> {
        self.current().await.ok_or(SessionError::NoActiveSession)
    }

    /// Reuses the live session, or probes, spawns and handshakes a new one.
    /// A failed handshake tears the half-built session down before returning.
    pub async fn ensure_session(&self) -> Result<SessionInfo, SessionError> {
        let _guard = self.ensure_lock.lock().await;

        if let Some(session) = self.current().await {
            if session.is_initialized().await {
                return Ok(session.info().await);
            }
        }

        let result = self.spawn_session().await;
        if let Err(err) = &result {
            tracing::error!(error = %err, "session: ensure failed");
            self.slot.lock().await.last_error = Some(err.to_string());
        }
        result
    }

    async fn spawn_session(&self) -> Result<SessionInfo, SessionError> {
        if self.config.transport != TransportKind::AppServer {
            return Err(SessionError::UnsupportedTransport {
                transport: self.config.transport.to_string(),
            });
        }

        let report = self.probe.check().await;
        if !report.ok {
            return Err(SessionError::NotReady {
                message: report
                    .message
                    .unwrap_or_else(|| "readiness probe reported not ready".to_string()),
            });
        }

        let connection = self
            .launcher
            .launch(&self.config.launch, &self.config.workspace_root)?;
        let session = Session::start(
            self.config.clone(),
            self.store.clone(),
            self.slot.clone(),
            connection,
        );

        if let Err(err) = session.handshake().await {
            session.teardown(&err.to_string()).await;
            return Err(err);
        }

        {
            let mut slot = self.slot.lock().await;
            if session.is_torn_down() {
                let reason = slot
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "session closed during startup".to_string());
                return Err(SessionError::closed(reason));
            }
            slot.current = Some(session.clone());
            slot.last_error = None;
            slot.last_diagnostics.clear();
        }
        session.persist_snapshot().await;
        Ok(session.info().await)
    }

    pub async fn status(&self) -> SessionStatus {
        let readiness = self.probe.check().await;
        let (current, last_error, last_diagnostics) = {
            let slot = self.slot.lock().await;
            (
                slot.current.clone(),
                slot.last_error.clone(),
                slot.last_diagnostics.clone(),
            )
        };

        let (session, diagnostics) = match &current {
            Some(session) => (Some(session.info().await), session.diagnostics().await),
            None => (None, last_diagnostics),
        };
        let running = session.as_ref().is_some_and(|info| info.initialized);
        let message = if !readiness.ok {
            readiness
                .message
                .clone()
                .or_else(|| Some("assistant is not ready".to_string()))
        } else if !running {
            last_error.clone()
        } else {
            None
        };

        SessionStatus {
            ok: readiness.ok && (running || last_error.is_none()),
            running,
            message,
            thread_id: session.as_ref().and_then(|info| info.thread_id.clone()),
            turns: session.as_ref().map(|info| info.turns).unwrap_or_default(),
            session,
            diagnostics,
            readiness,
            transport: self.config.transport.to_string(),
            last_error,
        }
    }

    /// Returns false when nothing was running.
    pub async fn stop(&self) -> bool {
        let Some(session) = self.current().await else {
            return false;
        };
        tracing::info!(session_id = %session.id(), "session: stop requested");
        session.teardown("session stopped").await;
        // A requested stop leaves no error behind.
        self.slot.lock().await.last_error = None;
        true
    }

    pub async fn start_turn(&self, input: StartTurnInput) -> Result<TurnRecord, SessionError> {
        crate::turns::resolve_prompt(&input)?;
        self.ensure_session().await?;
        self.require_session().await?.start_turn(input).await
    }

    pub async fn get_turn(&self, turn_id: &str) -> Result<TurnRecord, SessionError> {
        let session = self.require_session().await?;
        session.turn(turn_id).await.ok_or_else(|| SessionError::TurnNotFound {
            turn_id: turn_id.to_string(),
        })
    }

    pub async fn list_turns(&self) -> Vec<TurnRecord> {
        match self.current().await {
            Some(session) => session.turns().await,
            None => Vec::new(),
        }
    }

    pub async fn snapshot_turn_events(&self, turn_id: &str) -> Result<Vec<TurnEvent>, SessionError> {
        let session = self.require_session().await?;
        session
            .turn_events(turn_id)
            .await
            .ok_or_else(|| SessionError::TurnNotFound {
                turn_id: turn_id.to_string(),
            })
    }

    pub async fn subscribe_turn_events<F>(
        &self,
        turn_id: &str,
        callback: F,
    ) -> Result<TurnSubscription, SessionError>
    where
        F: Fn(TurnEvent) + Send + Sync + 'static,
    {
        let session = self.require_session().await?;
        let (history, rx) = session
            .subscribe(turn_id)
            .await
            .ok_or_else(|| SessionError::TurnNotFound {
                turn_id: turn_id.to_string(),
            })?;
        let seen = history.last().map(|event| event.sequence).unwrap_or(0);
        let mut live = until_finished(live_events(rx, seen)).boxed();
        let task = tokio::spawn(async move {
            while let Some(event) = live.next().await {
                callback(event);
            }
        });
        Ok(TurnSubscription { history, task })
    }

    /// History followed by live events, ending after `finished`. Events with
    /// a sequence at or below `after` are skipped.
    pub async fn turn_event_stream(
        &self,
        turn_id: &str,
        after: Option<u64>,
    ) -> Result<BoxStream<'static, TurnEvent>, SessionError> {
        let session = self.require_session().await?;
        let (history, rx) = session
            .subscribe(turn_id)
            .await
            .ok_or_else(|| SessionError::TurnNotFound {
                turn_id: turn_id.to_string(),
            })?;

        let after = after.unwrap_or(0);
        let seen = history.last().map(|event| event.sequence).unwrap_or(0);
        let done = history.iter().any(is_finished);
        let replay = stream::iter(
            history
                .into_iter()
                .filter(move |event| event.sequence > after),
        );

        let live = if done {
            Either::Left(stream::empty())
        } else {
            Either::Right(live_events(rx, seen.max(after)))
        };
        Ok(until_finished(replay.chain(live)).boxed())
    }

    pub async fn resolve_approval(
        &self,
        token: &str,
        decision: Decision,
    ) -> Result<ApprovalOutcome, SessionError> {
        let session = self.current().await.ok_or_else(|| SessionError::ApprovalNotFound {
            token: token.to_string(),
        })?;
        session.resolve_approval(token, decision).await
    }

    pub async fn reject_approval_with_failure(
        &self,
        token: &str,
        reason: &str,
    ) -> Result<ApprovalOutcome, SessionError> {
        let session = self.current().await.ok_or_else(|| SessionError::ApprovalNotFound {
            token: token.to_string(),
        })?;
        session.reject_with_failure(token, reason).await
    }

    pub async fn cancel_turn(&self, turn_id: &str) -> Result<TurnRecord, SessionError> {
        self.require_session().await?.cancel_turn(turn_id).await
    }
}

fn is_finished(event: &TurnEvent) -> bool {
    matches!(event.kind, TurnEventKind::Finished { .. })
}

/// Lagged receivers skip what they missed rather than erroring out.
fn live_events(
    rx: tokio::sync::broadcast::Receiver<TurnEvent>,
    seen: u64,
) -> impl futures::Stream<Item = TurnEvent> + Send + 'static {
    BroadcastStream::new(rx).filter_map(move |item| {
        future::ready(match item {
            Ok(event) if event.sequence > seen => Some(event),
            Ok(_) => None,
            Err(err) => {
                tracing::debug!(error = %err, "turn events: subscriber lagged");
                None
            }
        })
    })
}

fn until_finished<S>(events: S) -> impl futures::Stream<Item = TurnEvent> + Send + 'static
where
    S: futures::Stream<Item = TurnEvent> + Send + 'static,
{
    // Stops without polling the inner stream again once `finished` is out;
    // the live side never closes on its own.
    stream::unfold((events.boxed(), false), |(mut events, done)| async move {
        if done {
            return None;
        }
        let event = events.next().await?;
        let done = is_finished(&event);
        Some((event, (events, done)))
    })
}
