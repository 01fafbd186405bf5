use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use capa_shared::error::CommonError;
use capa_supervisor::ManagedProcess;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{Mutex, OnceCell, oneshot};

/// Concrete transport behind a cached [`crate::ConnectionKey`]: `Stdio` for
/// subprocess servers, `Http` for remote ones. Mirrors the ambient-detail enum shape —
/// a connection is `Ready` the moment this value exists in the cache; establishment
/// itself happens under the cache's `OnceCell`, never racing a second handshake.
pub enum Transport {
    Stdio(StdioTransport),
    Http(HttpTransport),
}

type PendingReplies = Arc<Mutex<HashMap<i64, oneshot::Sender<Value>>>>;

pub struct StdioTransport {
    // Kept alive so the child isn't reaped while this transport is cached.
    _process: Arc<ManagedProcess>,
    stdin: Mutex<ChildStdin>,
    next_id: AtomicI64,
    pending: PendingReplies,
    closed: Arc<AtomicBool>,
}

impl StdioTransport {
    /// Spawns a single background reader demultiplexing every line on `stdout` by its
    /// JSON-RPC `id` into the matching caller's oneshot — two concurrent `send` calls
    /// never contend over who gets to read which line, so one call can't steal and
    /// discard the response another call is waiting on.
    pub fn new(process: Arc<ManagedProcess>, stdin: ChildStdin, stdout: ChildStdout) -> Self {
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader_pending = pending.clone();
        let reader_closed = closed.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        let Ok(response) = serde_json::from_str::<Value>(trimmed) else {
                            continue;
                        };
                        let Some(id) = response.get("id").and_then(Value::as_i64) else {
                            // Server-initiated notification — no caller is waiting on it.
                            continue;
                        };
                        if let Some(tx) = reader_pending.lock().await.remove(&id) {
                            let _ = tx.send(response);
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
            // Drop every still-waiting sender so its `send` call gets a RecvError
            // instead of hanging forever on a response that will never arrive.
            reader_pending.lock().await.clear();
        });

        Self {
            _process: process,
            stdin: Mutex::new(stdin),
            next_id: AtomicI64::new(1),
            pending,
            closed,
        }
    }

    /// Newline-delimited JSON-RPC over stdio.
    pub async fn send(&self, method: &str, params: Value) -> Result<Value, CommonError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CommonError::Upstream {
                    msg: "mcp subprocess closed stdout".to_string(),
                    source: None,
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
        });
        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let mut stdin = self.stdin.lock().await;
        let write_result = async {
            stdin.write_all(&line).await?;
            stdin.flush().await
        }
            .await;
        drop(stdin);

        if let Err(e) = write_result {
            self.pending.lock().await.remove(&id);
            return Err(CommonError::from(e));
        }

        let response = rx.await.map_err(CommonError::from)?;
        extract_result(response)
    }
}

pub struct HttpTransport {
    pub client: reqwest::Client,
    pub base_url: String,
    pub headers: HashMap<String, String>,
    pub session_id: OnceCell<String>,
    next_id: AtomicI64,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, base_url: String, headers: HashMap<String, String>) -> Self {
        Self {
            client,
            base_url,
            headers,
            session_id: OnceCell::new(),
            next_id: AtomicI64::new(1),
        }
    }

    /// Sends one JSON-RPC request, returning the raw HTTP response so the caller can
    /// apply the OAuth 401-retry policy before interpreting the body.
    pub async fn send_raw(
        &self,
        method: &str,
        params: Value,
        bearer_token: Option<&str>,
    ) -> Result<reqwest::Response, CommonError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
        });

        let mut request = self
            .client
            .post(&self.base_url)
            .header("content-type", "application/json")
            .header("accept", "application/json, text/event-stream");

        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        if let Some(session_id) = self.session_id.get() {
            request = request.header("mcp-session-id", session_id.clone());
        }
        if let Some(token) = bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.json(&body).send().await.map_err(|e| CommonError::Upstream {
                msg: format!("request to mcp server failed: {e}"),
                source: Some(e.into()),
        })?;

        if let Some(session_id) = response
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
        {
            let _ = self.session_id.set(session_id.to_string());
        }

        Ok(response)
    }

    /// Parses a successful response body as JSON or single-line SSE ("SSE parsing").
    pub async fn parse_response(response: reqwest::Response) -> Result<Value, CommonError> {
        let status = response.status();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            let preview: String = body.chars().take(500).collect();
            return Err(CommonError::Upstream {
                    msg: format!("mcp server returned HTTP {status}: {preview}"),
                    source: None,
            });
        }

        let json_body = if content_type.contains("text/event-stream") {
            body.lines()
                .find_map(|line| line.strip_prefix("data:"))
                .map(str::trim)
                .ok_or_else(|| CommonError::Upstream {
                    msg: "no data: line in SSE response".to_string(),
                    source: None,
            })?
                .to_string()
        } else {
            body
        };

        let response: Value = serde_json::from_str(&json_body)?;
        extract_result(response)
    }
}

fn extract_result(response: Value) -> Result<Value, CommonError> {
    if let Some(error) = response.get("error") {
        return Err(CommonError::Upstream {
                msg: format!("mcp server returned an error: {error}"),
                source: None,
        });
    }
    Ok(response.get("result").cloned().unwrap_or(Value::Null))
}
