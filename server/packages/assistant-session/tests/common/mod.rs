#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use assistant_session::{
    AgentConnection, AgentLauncher, InMemoryProposalStore, LaunchSpec, SessionConfig,
    SessionError, SessionManager, StartTurnInput, TurnEvent, TurnRecord, TurnStatus,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{mpsc, Mutex};

pub const THREAD_ID: &str = "thread_1";
const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct FakeOptions {
    /// Answer `initialize` and `thread/start` without test involvement.
    pub answer_handshake: bool,
    pub initialize_error: Option<String>,
}

impl Default for FakeOptions {
    fn default() -> Self {
        Self {
            answer_handshake: true,
            initialize_error: None,
        }
    }
}

type SharedPipe = Arc<Mutex<Option<DuplexStream>>>;

/// Test-side end of one fake assistant connection. Every message the session
/// writes is forwarded here, including the auto-answered handshake.
pub struct FakeAgent {
    inbound: mpsc::UnboundedReceiver<Value>,
    stdout: SharedPipe,
    stderr: SharedPipe,
}

impl FakeAgent {
    pub async fn next_message(&mut self) -> Value {
        tokio::time::timeout(WAIT, self.inbound.recv())
            .await
            .expect("timed out waiting for a message from the session")
            .expect("fake agent inbound channel closed")
    }

    pub async fn expect_method(&mut self, method: &str) -> Value {
        loop {
            let message = self.next_message().await;
            if message["method"] == method {
                return message;
            }
        }
    }

    /// Next reply (no `method`) carrying `id`.
    pub async fn expect_reply(&mut self, id: &Value) -> Value {
        loop {
            let message = self.next_message().await;
            if message.get("method").is_none() && &message["id"] == id {
                return message;
            }
        }
    }

    pub fn try_next_message(&mut self) -> Option<Value> {
        self.inbound.try_recv().ok()
    }

    pub async fn send(&self, message: Value) {
        write_line(&self.stdout, &message.to_string()).await;
    }

    pub async fn send_raw(&self, line: &str) {
        write_line(&self.stdout, line).await;
    }

    pub async fn respond(&self, request: &Value, result: Value) {
        self.send(json!({"id": request["id"], "result": result})).await;
    }

    pub async fn respond_error(&self, request: &Value, message: &str) {
        self.send(json!({
            "id": request["id"],
            "error": {"code": -32000, "message": message},
        }))
        .await;
    }

    pub async fn log_stderr(&self, line: &str) {
        write_line(&self.stderr, line).await;
    }

    /// Closes the session's stdout, which the session treats as the
    /// assistant going away.
    pub async fn close_stdout(&self) {
        self.stdout.lock().await.take();
    }
}

async fn write_line(pipe: &SharedPipe, line: &str) {
    let mut guard = pipe.lock().await;
    if let Some(stream) = guard.as_mut() {
        stream
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("write to session");
        stream.flush().await.expect("flush to session");
    }
}

#[derive(Debug)]
pub struct FakeLauncher {
    options: FakeOptions,
    agents: mpsc::UnboundedSender<FakeAgent>,
    launches: AtomicUsize,
}

impl FakeLauncher {
    pub fn new(options: FakeOptions) -> (Arc<Self>, mpsc::UnboundedReceiver<FakeAgent>) {
        let (agents, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                options,
                agents,
                launches: AtomicUsize::new(0),
            }),
            rx,
        )
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

impl AgentLauncher for FakeLauncher {
    fn launch(
        &self,
        _launch: &LaunchSpec,
        _workspace_root: &Path,
    ) -> Result<AgentConnection, SessionError> {
        self.launches.fetch_add(1, Ordering::SeqCst);

        let (session_stdin, agent_stdin) = tokio::io::duplex(1 << 20);
        let (agent_stdout, session_stdout) = tokio::io::duplex(1 << 20);
        let (agent_stderr, session_stderr) = tokio::io::duplex(64 * 1024);

        let stdout: SharedPipe = Arc::new(Mutex::new(Some(agent_stdout)));
        let stderr: SharedPipe = Arc::new(Mutex::new(Some(agent_stderr)));
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        tokio::spawn(serve(
            agent_stdin,
            stdout.clone(),
            inbound_tx,
            self.options.clone(),
        ));

        let _ = self.agents.send(FakeAgent {
            inbound,
            stdout,
            stderr,
        });

        Ok(AgentConnection {
            stdin: Box::new(session_stdin),
            stdout: Box::new(session_stdout),
            stderr: Some(Box::new(session_stderr)),
            child: None,
        })
    }
}

async fn serve(
    stdin: DuplexStream,
    stdout: SharedPipe,
    inbound: mpsc::UnboundedSender<Value>,
    options: FakeOptions,
) {
    let mut lines = BufReader::new(stdin).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let method = message["method"].as_str().unwrap_or_default().to_string();
        if options.answer_handshake && message.get("id").is_some() {
            let reply = match (method.as_str(), options.initialize_error.as_deref()) {
                ("initialize", Some(error)) => Some(json!({
                    "id": message["id"],
                    "error": {"code": -32000, "message": error},
                })),
                ("initialize", None) => Some(json!({
                    "id": message["id"],
                    "result": {"serverInfo": {"name": "fake-agent"}},
                })),
                ("thread/start", _) => Some(json!({
                    "id": message["id"],
                    "result": {"thread": {"id": THREAD_ID}},
                })),
                _ => None,
            };
            if let Some(reply) = reply {
                write_line(&stdout, &reply.to_string()).await;
            }
        }
        let _ = inbound.send(message);
    }
}

pub struct Harness {
    pub manager: Arc<SessionManager>,
    pub launcher: Arc<FakeLauncher>,
    pub store: Arc<InMemoryProposalStore>,
    agents: mpsc::UnboundedReceiver<FakeAgent>,
    dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(FakeOptions::default(), |_| {})
    }

    pub fn with(options: FakeOptions, configure: impl FnOnce(&mut SessionConfig)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = SessionConfig::new(LaunchSpec::new("fake-assistant"), dir.path());
        config.model = Some("test-model".to_string());
        config.snapshot_path = Some(dir.path().join("session-status.json"));
        config.close_grace = Duration::from_millis(50);
        configure(&mut config);

        let (launcher, agents) = FakeLauncher::new(options);
        let store = Arc::new(InMemoryProposalStore::new());
        let manager = SessionManager::new(config)
            .expect("manager")
            .with_launcher(launcher.clone())
            .with_store(store.clone());
        Self {
            manager: Arc::new(manager),
            launcher,
            store,
            agents,
            dir,
        }
    }

    pub fn workspace(&self) -> &Path {
        self.dir.path()
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.path().join("session-status.json")
    }

    /// Ensures a session and returns the agent behind it.
    pub async fn start(&mut self) -> FakeAgent {
        self.manager.ensure_session().await.expect("ensure session");
        self.next_agent().await
    }

    pub async fn next_agent(&mut self) -> FakeAgent {
        tokio::time::timeout(WAIT, self.agents.recv())
            .await
            .expect("timed out waiting for launch")
            .expect("launcher dropped")
    }

    /// Starts a turn and answers its `turn/start` with `protocol_turn_id`.
    pub async fn start_turn(
        &self,
        agent: &mut FakeAgent,
        prompt: &str,
        protocol_turn_id: Option<&str>,
    ) -> TurnRecord {
        let manager = self.manager.clone();
        let input = StartTurnInput::with_prompt(prompt);
        let task = tokio::spawn(async move { manager.start_turn(input).await });
        let request = agent.expect_method("turn/start").await;
        let result = match protocol_turn_id {
            Some(id) => json!({"turn": {"id": id}}),
            None => json!({}),
        };
        agent.respond(&request, result).await;
        task.await.expect("join start_turn").expect("start turn")
    }
}

pub async fn wait_for_status(
    manager: &SessionManager,
    turn_id: &str,
    status: TurnStatus,
) -> TurnRecord {
    let deadline = Instant::now() + WAIT;
    loop {
        if let Ok(turn) = manager.get_turn(turn_id).await {
            if turn.status == status {
                return turn;
            }
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {turn_id} to become {}",
            status.as_str()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_event<F>(manager: &SessionManager, turn_id: &str, matches: F) -> TurnEvent
where
    F: Fn(&TurnEvent) -> bool,
{
    let deadline = Instant::now() + WAIT;
    loop {
        if let Ok(events) = manager.snapshot_turn_events(turn_id).await {
            if let Some(event) = events.into_iter().find(|event| matches(event)) {
                return event;
            }
        }
        assert!(Instant::now() < deadline, "timed out waiting for event on {turn_id}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_no_session(manager: &SessionManager) {
    let deadline = Instant::now() + WAIT;
    while manager.status().await.session.is_some() {
        assert!(Instant::now() < deadline, "session never went away");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
