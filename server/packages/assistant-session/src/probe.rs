use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::config::{LaunchSpec, DEFAULT_PROBE_TIMEOUT_MS};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeReport {
    pub ok: bool,
    pub readiness: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProbeReport {
    pub fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            ok: false,
            readiness: json!({"ok": false}),
            message: Some(message),
        }
    }

    /// Reads `{ok, readiness, message}` out of whatever the probe printed.
    /// A missing `ok` falls back to `readiness.ok`.
    fn from_payload(payload: Value) -> Self {
        let readiness = payload.get("readiness").cloned().unwrap_or(Value::Null);
        let ok = payload
            .get("ok")
            .and_then(Value::as_bool)
            .or_else(|| readiness.get("ok").and_then(Value::as_bool))
            .unwrap_or(false);
        let message = payload
            .get("message")
            .or_else(|| payload.get("error"))
            .and_then(Value::as_str)
            .map(ToOwned::to_owned);
        Self {
            ok,
            readiness: if readiness.is_null() { payload } else { readiness },
            message,
        }
    }
}

/// External "is the assistant usable right now" check. Run before every spawn
/// and on every status call.
pub trait ReadinessProbe: Send + Sync + fmt::Debug {
    fn check(&self) -> BoxFuture<'_, ProbeReport>;
}

#[derive(Debug, Clone)]
pub struct StaticReadinessProbe {
    report: ProbeReport,
}

impl StaticReadinessProbe {
    pub fn ready() -> Self {
        Self {
            report: ProbeReport {
                ok: true,
                readiness: json!({"ok": true}),
                message: None,
            },
        }
    }

    /// Used when no probe command is configured.
    pub fn skipped() -> Self {
        Self {
            report: ProbeReport {
                ok: true,
                readiness: json!({"ok": true, "skipped": true}),
                message: None,
            },
        }
    }

    pub fn not_ready(message: impl Into<String>) -> Self {
        Self {
            report: ProbeReport::failed(message),
        }
    }
}

impl ReadinessProbe for StaticReadinessProbe {
    fn check(&self) -> BoxFuture<'_, ProbeReport> {
        Box::pin(async move { self.report.clone() })
    }
}

#[derive(Debug, Clone)]
pub struct CommandReadinessProbe {
    launch: LaunchSpec,
    cwd: Option<PathBuf>,
    timeout: Duration,
}

impl CommandReadinessProbe {
    pub fn new(launch: LaunchSpec) -> Self {
        Self {
            launch,
            cwd: None,
            timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
        }
    }

    /// A probe still running after `timeout` is killed and reported not ready.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    async fn run(&self) -> ProbeReport {
        let mut command = Command::new(&self.launch.program);
        command
            .args(&self.launch.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        for (key, value) in &self.launch.env {
            command.env(key, value);
        }
        if let Some(cwd) = self.cwd.as_ref().filter(|cwd| cwd.is_dir()) {
            command.current_dir(cwd);
        }

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Err(_) => {
                let timeout_ms = self.timeout.as_millis() as u64;
                tracing::warn!(
                    program = ?self.launch.program,
                    timeout_ms,
                    "readiness probe: timed out"
                );
                return ProbeReport::failed(format!(
                    "readiness probe timed out after {timeout_ms}ms"
                ));
            }
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                tracing::warn!(
                    program = ?self.launch.program,
                    error = %err,
                    "readiness probe: failed to run"
                );
                return ProbeReport::failed(format!(
                    "failed to run readiness probe {}: {err}",
                    self.launch.display_command()
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        match first_json_object(&stdout).or_else(|| first_json_object(&stderr)) {
            Some(payload) => {
                let report = ProbeReport::from_payload(payload);
                tracing::debug!(
                    ok = report.ok,
                    code = output.status.code(),
                    "readiness probe: report parsed"
                );
                report
            }
            None => ProbeReport::failed(format!(
                "readiness probe produced no JSON report (exit code {})",
                output
                    .status
                    .code()
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            )),
        }
    }
}

impl ReadinessProbe for CommandReadinessProbe {
    fn check(&self) -> BoxFuture<'_, ProbeReport> {
        Box::pin(self.run())
    }
}

/// First JSON object in `text`. Probes often print log noise around the
/// report, so each `{` is tried as the start of a value.
pub(crate) fn first_json_object(text: &str) -> Option<Value> {
    text.match_indices('{').find_map(|(start, _)| {
        serde_json::Deserializer::from_str(&text[start..])
            .into_iter::<Value>()
            .next()
            .and_then(Result::ok)
            .filter(Value::is_object)
    })
}
