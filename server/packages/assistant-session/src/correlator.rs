use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use assistant_session_error::SessionError;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio::task::AbortHandle;

use crate::protocol::{id_key, notification_envelope, request_envelope, RpcErrorBody};
use crate::transport::LineWriter;

#[derive(Debug)]
struct PendingRequest {
    method: String,
    started: Instant,
    sender: oneshot::Sender<Result<Value, SessionError>>,
    /// Expiry task; it removes the entry even when the caller went away.
    timer: AbortHandle,
}

#[derive(Debug, Default)]
struct PendingTable {
    entries: HashMap<String, PendingRequest>,
    /// Set once by teardown; later sends fail immediately.
    closed: Option<String>,
}

type SharedTable = Arc<Mutex<PendingTable>>;

/// Outbound request/response pairing. Ids come from a monotonic counter and
/// are never reused within a session.
#[derive(Debug)]
pub(crate) struct RequestCorrelator {
    writer: LineWriter,
    next_id: AtomicU64,
    pending: SharedTable,
}

impl RequestCorrelator {
    pub(crate) fn new(writer: LineWriter) -> Self {
        Self {
            writer,
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(PendingTable::default())),
        }
    }

    pub(crate) async fn send(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, SessionError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let (tx, rx) = oneshot::channel();

        {
            let mut table = self.pending.lock().await;
            if let Some(reason) = &table.closed {
                return Err(SessionError::closed(reason.clone()));
            }
            let timer = tokio::spawn(expire(self.pending.clone(), id.clone(), timeout));
            table.entries.insert(
                id.clone(),
                PendingRequest {
                    method: method.to_string(),
                    started: Instant::now(),
                    sender: tx,
                    timer: timer.abort_handle(),
                },
            );
            tracing::debug!(
                method = method,
                id = %id,
                pending_count = table.entries.len(),
                "send: request → assistant (awaiting response)"
            );
        }

        if let Err(err) = self
            .writer
            .write_message(&request_envelope(&id, method, params))
            .await
        {
            if let Some(pending) = self.pending.lock().await.entries.remove(&id) {
                pending.timer.abort();
            }
            return Err(err);
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(SessionError::closed("response channel dropped")),
        }
    }

    pub(crate) async fn notify(&self, method: &str, params: Value) -> Result<(), SessionError> {
        tracing::debug!(method = method, "notify: notification → assistant (fire-and-forget)");
        self.writer
            .write_message(&notification_envelope(method, params))
            .await
    }

    /// Writes a prebuilt envelope, used for answering server requests.
    pub(crate) async fn write(&self, payload: &Value) -> Result<(), SessionError> {
        self.writer.write_message(payload).await
    }

    /// Returns false when no request is waiting on `id`; such responses are
    /// dropped.
    pub(crate) async fn resolve(&self, id: &Value, outcome: Result<Value, RpcErrorBody>) -> bool {
        let key = id_key(id);
        let Some(pending) = self.pending.lock().await.entries.remove(&key) else {
            tracing::warn!(
                id = %key,
                "assistant stdout: response has no matching pending request (orphan)"
            );
            return false;
        };
        pending.timer.abort();

        tracing::debug!(
            id = %key,
            method = %pending.method,
            has_error = outcome.is_err(),
            response_ms = pending.started.elapsed().as_millis() as u64,
            "assistant stdout: response matched to pending request"
        );

        let result = outcome.map_err(|body| SessionError::Rpc {
            method: pending.method.clone(),
            code: body.code,
            message: body
                .message
                .unwrap_or_else(|| format!("{} failed", pending.method)),
        });
        let _ = pending.sender.send(result);
        true
    }

    pub(crate) async fn clear_all_pending(&self, reason: &str) -> usize {
        let drained = {
            let mut table = self.pending.lock().await;
            table.closed.get_or_insert_with(|| reason.to_string());
            table.entries.drain().collect::<Vec<_>>()
        };
        let count = drained.len();
        for (id, pending) in drained {
            tracing::debug!(id = %id, method = %pending.method, "rejecting pending request");
            pending.timer.abort();
            let _ = pending.sender.send(Err(SessionError::closed(reason)));
        }
        count
    }

    pub(crate) async fn pending_count(&self) -> usize {
        self.pending.lock().await.entries.len()
    }

    pub(crate) async fn shutdown_writer(&self) {
        self.writer.shutdown().await;
    }
}

async fn expire(pending: SharedTable, id: String, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    let Some(request) = pending.lock().await.entries.remove(&id) else {
        return;
    };
    let elapsed_ms = timeout.as_millis() as u64;
    tracing::warn!(
        method = %request.method,
        id = %id,
        timeout_ms = elapsed_ms,
        "send: TIMEOUT waiting for assistant response"
    );
    let _ = request.sender.send(Err(SessionError::Timeout {
        method: request.method,
        elapsed_ms,
    }));
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use serde_json::json;
    use tokio::io::DuplexStream;

    use super::*;
    use crate::transport::{LineReader, ReadLine};

    fn correlator() -> (Arc<RequestCorrelator>, LineReader<DuplexStream>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let correlator = Arc::new(RequestCorrelator::new(LineWriter::new(Box::new(client))));
        (correlator, LineReader::new(server))
    }

    async fn next_request(reader: &mut LineReader<DuplexStream>) -> Value {
        match reader.next_line().await.expect("read").expect("line") {
            ReadLine::Text(text) => serde_json::from_str(&text).expect("json"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unanswered_request_times_out_with_method_and_elapsed() {
        let (correlator, _reader) = correlator();
        let err = correlator
            .send("ping", json!({}), Duration::from_millis(10))
            .await
            .expect_err("timeout");
        let message = err.to_string();
        assert!(message.contains("ping"), "{message}");
        assert!(message.contains("10ms"), "{message}");
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn response_resolves_the_matching_request() {
        let (correlator, mut reader) = correlator();
        let task = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .send("thread/start", json!({"cwd": "/tmp"}), Duration::from_secs(5))
                    .await
            })
        };

        let request = next_request(&mut reader).await;
        assert_eq!(request["method"], "thread/start");
        assert_eq!(request["params"]["cwd"], "/tmp");
        assert!(request["id"].is_string());

        // Numeric echo of a string id still matches.
        let numeric_id = json!(request["id"]
            .as_str()
            .and_then(|id| id.parse::<u64>().ok())
            .expect("decimal id"));
        assert!(correlator.resolve(&numeric_id, Ok(json!({"threadId": "th_1"}))).await);
        assert!(!correlator.resolve(&numeric_id, Ok(json!({}))).await);

        let result = task.await.expect("join").expect("result");
        assert_eq!(result["threadId"], "th_1");
    }

    #[tokio::test]
    async fn error_without_message_defaults_to_method_failed() {
        let (correlator, mut reader) = correlator();
        let task = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .send("turn/start", json!({}), Duration::from_secs(5))
                    .await
            })
        };
        let request = next_request(&mut reader).await;
        correlator
            .resolve(
                &request["id"],
                Err(RpcErrorBody {
                    code: Some(-32000),
                    message: None,
                    data: None,
                }),
            )
            .await;
        let err = task.await.expect("join").expect_err("rpc error");
        assert_eq!(err.to_string(), "turn/start failed");
    }

    #[tokio::test]
    async fn ids_are_unique_across_concurrent_sends() {
        let (correlator, mut reader) = correlator();
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let correlator = correlator.clone();
            tasks.push(tokio::spawn(async move {
                correlator
                    .send("ping", json!({}), Duration::from_secs(5))
                    .await
            }));
        }

        let mut seen = HashSet::new();
        for _ in 0..16 {
            let request = next_request(&mut reader).await;
            let id = request["id"].as_str().expect("id").to_string();
            assert!(seen.insert(id.clone()), "duplicate id {id}");
            correlator.resolve(&request["id"], Ok(json!(id))).await;
        }
        for task in tasks {
            task.await.expect("join").expect("resolved");
        }
    }

    #[tokio::test]
    async fn clearing_rejects_waiters_and_closes_the_table() {
        let (correlator, mut reader) = correlator();
        let task = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .send("turn/start", json!({}), Duration::from_secs(5))
                    .await
            })
        };
        let request = next_request(&mut reader).await;

        assert_eq!(correlator.clear_all_pending("assistant process exited").await, 1);
        let err = task.await.expect("join").expect_err("rejected");
        assert_eq!(err, SessionError::closed("assistant process exited"));

        // The late response finds nothing to resolve.
        assert!(!correlator.resolve(&request["id"], Ok(json!({}))).await);

        let late = correlator
            .send("ping", json!({}), Duration::from_secs(5))
            .await
            .expect_err("closed");
        assert!(matches!(late, SessionError::SessionClosed { .. }));
    }

    #[tokio::test]
    async fn abandoned_request_is_still_expired() {
        let (correlator, mut reader) = correlator();
        let task = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .send("ping", json!({}), Duration::from_millis(50))
                    .await
            })
        };
        let request = next_request(&mut reader).await;
        assert_eq!(correlator.pending_count().await, 1);

        task.abort();
        let _ = task.await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(correlator.pending_count().await, 0);
        assert!(!correlator.resolve(&request["id"], Ok(json!({}))).await);
    }
}
