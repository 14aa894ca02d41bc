use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_TURN_START_TIMEOUT_MS: u64 = 45_000;
pub const DEFAULT_CLOSE_GRACE_MS: u64 = 2_000;
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_DIAGNOSTICS_LIMIT: usize = 80;

const REQUEST_TIMEOUT_ENV: &str = "ASSISTANT_SESSION_REQUEST_TIMEOUT_MS";
const TURN_START_TIMEOUT_ENV: &str = "ASSISTANT_SESSION_TURN_START_TIMEOUT_MS";
const CLOSE_GRACE_ENV: &str = "ASSISTANT_SESSION_CLOSE_GRACE_MS";
const PROBE_TIMEOUT_ENV: &str = "ASSISTANT_SESSION_PROBE_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn display_command(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(shell_quote(self.program.to_string_lossy().as_ref()));
        for arg in &self.args {
            parts.push(shell_quote(arg));
        }
        parts.join(" ")
    }
}

/// How the assistant is driven. Only the long-lived stdio protocol is
/// supported; `Exec` exists so configurations naming it are rejected loudly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    AppServer,
    Exec,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AppServer => "app-server",
            Self::Exec => "exec",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "app-server" | "app_server" | "appserver" => Ok(Self::AppServer),
            "exec" => Ok(Self::Exec),
            other => Err(format!("unknown transport '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub launch: LaunchSpec,
    pub workspace_root: PathBuf,
    pub model: Option<String>,
    pub transport: TransportKind,
    pub request_timeout: Duration,
    pub turn_start_timeout: Duration,
    pub close_grace: Duration,
    pub diagnostics_limit: usize,
    pub probe: Option<LaunchSpec>,
    pub probe_timeout: Duration,
    pub snapshot_path: Option<PathBuf>,
    pub proposal_dir: Option<PathBuf>,
}

impl SessionConfig {
    /// Builds a config with defaults, honouring the timeout env overrides.
    pub fn new(launch: LaunchSpec, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            launch,
            workspace_root: workspace_root.into(),
            model: None,
            transport: TransportKind::AppServer,
            request_timeout: duration_from_env_ms(
                REQUEST_TIMEOUT_ENV,
                Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            ),
            turn_start_timeout: duration_from_env_ms(
                TURN_START_TIMEOUT_ENV,
                Duration::from_millis(DEFAULT_TURN_START_TIMEOUT_MS),
            ),
            close_grace: duration_from_env_ms(
                CLOSE_GRACE_ENV,
                Duration::from_millis(DEFAULT_CLOSE_GRACE_MS),
            ),
            diagnostics_limit: DEFAULT_DIAGNOSTICS_LIMIT,
            probe: None,
            probe_timeout: duration_from_env_ms(
                PROBE_TIMEOUT_ENV,
                Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
            ),
            snapshot_path: Some(default_snapshot_path()),
            proposal_dir: None,
        }
    }
}

pub fn default_snapshot_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("assistant-session")
        .join("session-status.json")
}

pub(crate) fn duration_from_env_ms(var_name: &str, default: Duration) -> Duration {
    parse_positive_ms(std::env::var(var_name).ok().as_deref()).unwrap_or(default)
}

fn parse_positive_ms(raw: Option<&str>) -> Option<Duration> {
    raw.and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .map(Duration::from_millis)
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}
