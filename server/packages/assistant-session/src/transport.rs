use std::fmt;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use assistant_session_error::SessionError;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::config::LaunchSpec;

const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The pipes of one assistant connection. `child` is absent for in-memory
/// connections; end of stdout is then the only exit signal.
pub struct AgentConnection {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
    pub child: Option<Child>,
}

impl fmt::Debug for AgentConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConnection")
            .field("has_stderr", &self.stderr.is_some())
            .field("pid", &self.child.as_ref().and_then(Child::id))
            .finish()
    }
}

pub trait AgentLauncher: Send + Sync + fmt::Debug {
    fn launch(
        &self,
        launch: &LaunchSpec,
        workspace_root: &Path,
    ) -> Result<AgentConnection, SessionError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

impl AgentLauncher for ProcessLauncher {
    fn launch(
        &self,
        launch: &LaunchSpec,
        workspace_root: &Path,
    ) -> Result<AgentConnection, SessionError> {
        let spawn_start = Instant::now();

        let mut command = Command::new(&launch.program);
        command
            .args(&launch.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if workspace_root.is_dir() {
            command.current_dir(workspace_root);
        }
        for (key, value) in &launch.env {
            command.env(key, value);
        }

        tracing::info!(
            program = ?launch.program,
            args = ?launch.args,
            "spawning assistant process"
        );

        let mut child = command.spawn().map_err(|err| {
            tracing::error!(
                program = ?launch.program,
                error = %err,
                "failed to spawn assistant process"
            );
            SessionError::Spawn {
                command: launch.display_command(),
                message: err.to_string(),
            }
        })?;

        tracing::info!(
            pid = child.id().unwrap_or(0),
            elapsed_ms = spawn_start.elapsed().as_millis() as u64,
            "assistant process spawned"
        );

        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

        Ok(AgentConnection {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Some(Box::new(stderr)),
            child: Some(child),
        })
    }
}

fn missing_pipe(pipe: &str) -> SessionError {
    SessionError::MissingPipe {
        pipe: pipe.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReadLine {
    Text(String),
    Oversized { bytes: usize },
}

/// Splits a byte stream into newline-delimited lines. Invalid UTF-8 is
/// replaced rather than rejected; lines over the size cap are skipped whole.
pub(crate) struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    max_line_bytes: usize,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self::with_limit(reader, MAX_LINE_BYTES)
    }

    pub(crate) fn with_limit(reader: R, max_line_bytes: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::new(),
            max_line_bytes,
        }
    }

    pub(crate) async fn next_line(&mut self) -> io::Result<Option<ReadLine>> {
        self.buf.clear();
        let mut discarded = 0usize;
        let mut saw_bytes = false;

        loop {
            let (consumed, found_newline) = {
                let available = self.inner.fill_buf().await?;
                if available.is_empty() {
                    break;
                }
                saw_bytes = true;
                let newline = available.iter().position(|byte| *byte == b'\n');
                let chunk = match newline {
                    Some(idx) => &available[..idx],
                    None => available,
                };
                if discarded > 0 || self.buf.len() + chunk.len() > self.max_line_bytes {
                    discarded += self.buf.len() + chunk.len();
                    self.buf.clear();
                } else {
                    self.buf.extend_from_slice(chunk);
                }
                (chunk.len() + usize::from(newline.is_some()), newline.is_some())
            };
            self.inner.consume(consumed);
            if found_newline {
                break;
            }
        }

        if !saw_bytes {
            return Ok(None);
        }
        if discarded > 0 {
            return Ok(Some(ReadLine::Oversized { bytes: discarded }));
        }
        if self.buf.last() == Some(&b'\r') {
            self.buf.pop();
        }
        Ok(Some(ReadLine::Text(
            String::from_utf8_lossy(&self.buf).into_owned(),
        )))
    }
}

/// Single writer for the subprocess stdin. Each message goes out as one
/// `write_all` under the lock, so lines never interleave.
pub(crate) struct LineWriter {
    inner: Mutex<BoxedWriter>,
}

impl fmt::Debug for LineWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineWriter").finish_non_exhaustive()
    }
}

impl LineWriter {
    pub(crate) fn new(writer: BoxedWriter) -> Self {
        Self {
            inner: Mutex::new(writer),
        }
    }

    pub(crate) async fn write_message(&self, payload: &Value) -> Result<(), SessionError> {
        let method = payload
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("<none>");
        let id = payload.get("id").map(|v| v.to_string()).unwrap_or_default();

        let mut bytes = serde_json::to_vec(payload).map_err(|err| SessionError::Serialize {
            message: err.to_string(),
        })?;
        bytes.push(b'\n');

        tracing::debug!(
            method = method,
            id = %id,
            bytes = bytes.len(),
            "stdin: writing message to assistant"
        );

        let mut writer = self.inner.lock().await;
        writer.write_all(&bytes).await.map_err(|err| {
            tracing::error!(method = method, id = %id, error = %err, "stdin: write_all failed");
            SessionError::Write {
                message: err.to_string(),
            }
        })?;
        writer.flush().await.map_err(|err| {
            tracing::error!(method = method, id = %id, error = %err, "stdin: flush failed");
            SessionError::Write {
                message: err.to_string(),
            }
        })?;

        tracing::debug!(method = method, id = %id, "stdin: write+flush complete");
        Ok(())
    }

    pub(crate) async fn shutdown(&self) {
        let mut writer = self.inner.lock().await;
        let _ = writer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect_lines(input: &'static [u8], limit: usize) -> Vec<ReadLine> {
        let mut reader = LineReader::with_limit(input, limit);
        let mut lines = Vec::new();
        while let Some(line) = reader.next_line().await.expect("read line") {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn splits_lines_and_keeps_unterminated_tail() {
        let lines = collect_lines(b"one\r\ntwo\n\nthree", 1024).await;
        assert_eq!(
            lines,
            vec![
                ReadLine::Text("one".to_string()),
                ReadLine::Text("two".to_string()),
                ReadLine::Text(String::new()),
                ReadLine::Text("three".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced_not_rejected() {
        let lines = collect_lines(b"ok\xff\xfe\nnext\n", 1024).await;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], ReadLine::Text("ok\u{fffd}\u{fffd}".to_string()));
        assert_eq!(lines[1], ReadLine::Text("next".to_string()));
    }

    #[tokio::test]
    async fn oversized_lines_are_skipped_whole() {
        let lines = collect_lines(b"0123456789abcdef\nshort\n", 8).await;
        assert_eq!(
            lines,
            vec![
                ReadLine::Oversized { bytes: 16 },
                ReadLine::Text("short".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn writer_emits_one_line_per_message() {
        let (client, server) = tokio::io::duplex(4096);
        let writer = LineWriter::new(Box::new(client));
        writer
            .write_message(&serde_json::json!({"id": "1", "method": "ping"}))
            .await
            .expect("write");
        writer.shutdown().await;

        let mut reader = LineReader::new(server);
        let line = reader.next_line().await.expect("read").expect("line");
        match line {
            ReadLine::Text(text) => {
                let value: Value = serde_json::from_str(&text).expect("json");
                assert_eq!(value["method"], "ping");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(reader.next_line().await.expect("read"), None);
    }
}
