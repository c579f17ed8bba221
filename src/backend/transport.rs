//! JSON-RPC transports to backend servers.
//!
//! Two transports are supported:
//! - **stdio**: a long-lived child process, one JSON object per line on
//!   stdin/stdout, stderr drained into the log.
//! - **http**: a network service receiving JSON-RPC via POST and answering
//!   with either a JSON body or a single-response SSE stream.
//!
//! A transport is never shared: the server registry hands it out only to the
//! holder of the backend's mutex, so every method takes `&mut self` and one
//! request is in flight at a time.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use super::errors::ConnectorError;
use super::types::{error_codes, BackendConfig, JsonRpcRequest, JsonRpcResponse};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for graceful shutdown before force-killing a child.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for the stderr drain to finish after a failed start.
const STDERR_SETTLE_TIMEOUT: Duration = Duration::from_millis(500);

/// Number of trailing stderr lines kept for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// Cap on the stderr excerpt appended to error messages.
const STDERR_EXCERPT_CHARS: usize = 2000;

/// TCP connection timeout for HTTP backends.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const SESSION_HEADER: &str = "mcp-session-id";
const PROTOCOL_HEADER: &str = "mcp-protocol-version";

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Inbound Classification ──────────────────────────────────────────────────

/// A line read from a backend, classified by shape.
#[derive(Debug)]
pub(crate) enum InboundMessage {
    /// Reply to one of our requests.
    Response(JsonRpcResponse),
    /// The backend is asking us something and expects an answer.
    Request {
        id: serde_json::Value,
        method: String,
    },
    /// Fire-and-forget message from the backend (logging, progress, ...).
    Notification { method: String },
    /// Not JSON-RPC (stray log output, blank line).
    Other,
}

/// Classify one line of backend output.
pub(crate) fn classify_line(line: &str) -> InboundMessage {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
        return InboundMessage::Other;
    };

    if let Some(method) = value.get("method").and_then(|m| m.as_str()) {
        let method = method.to_string();
        return match value.get("id") {
            Some(id) if !id.is_null() => InboundMessage::Request {
                id: id.clone(),
                method,
            },
            _ => InboundMessage::Notification { method },
        };
    }

    if value.get("result").is_none() && value.get("error").is_none() {
        return InboundMessage::Other;
    }

    match serde_json::from_value::<JsonRpcResponse>(value) {
        Ok(resp) => InboundMessage::Response(resp),
        Err(_) => InboundMessage::Other,
    }
}

/// Build our answer to a backend-initiated request.
///
/// The gateway offers no client capabilities, so only `ping` succeeds.
fn reply_to_backend_request(id: serde_json::Value, method: &str) -> serde_json::Value {
    if method == "ping" {
        serde_json::json!({"jsonrpc": "2.0", "id": id, "result": {}})
    } else {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {
                "code": error_codes::METHOD_NOT_FOUND,
                "message": format!("method '{method}' is not supported by the gateway"),
            },
        })
    }
}

// ─── Stderr Capture ──────────────────────────────────────────────────────────

type StderrTail = Arc<Mutex<VecDeque<String>>>;

/// Drain a child's stderr into the log, keeping the last lines around.
///
/// Draining continuously keeps a chatty backend from blocking on a full pipe.
fn spawn_stderr_drain(server: &str, stderr: ChildStderr) -> (StderrTail, JoinHandle<()>) {
    let tail: StderrTail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
    let sink = Arc::clone(&tail);
    let server = server.to_string();

    let task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(server = %server, line = %line, "backend stderr");
            let mut buf = sink.lock().unwrap_or_else(PoisonError::into_inner);
            if buf.len() == STDERR_TAIL_LINES {
                buf.pop_front();
            }
            buf.push_back(line);
        }
    });

    (tail, task)
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(lines: &VecDeque<String>) -> String {
    if lines.is_empty() {
        return String::new();
    }
    let mut joined = lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n");
    if joined.len() > STDERR_EXCERPT_CHARS {
        let mut cut = STDERR_EXCERPT_CHARS;
        while !joined.is_char_boundary(cut) {
            cut -= 1;
        }
        joined.truncate(cut);
        joined.push_str("...(truncated)");
    }
    format!(" | stderr: {}", joined.trim())
}

// ─── Stdio Transport ─────────────────────────────────────────────────────────

/// JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    child: Child,
    /// `None` once shutdown has closed stdin.
    writer: Option<ChildStdin>,
    reader: BufReader<ChildStdout>,
    /// Set while a message is being written. Still set afterwards means the
    /// write was cancelled mid-line and the stream is no longer framed.
    write_interrupted: bool,
    stderr_tail: StderrTail,
    stderr_task: Option<JoinHandle<()>>,
}

impl StdioTransport {
    /// Spawn `command` as configured and wire its stdio.
    pub fn spawn(
        server_name: &str,
        command: &str,
        config: &BackendConfig,
    ) -> Result<Self, ConnectorError> {
        let mut cmd = Command::new(command);
        cmd.args(&config.args);
        cmd.envs(&config.env);
        if let Some(dir) = config.cwd.as_deref() {
            cmd.current_dir(dir);
        }

        // Windows: prevent a console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| ConnectorError::SpawnFailed {
            name: server_name.to_string(),
            reason: format!("{command}: {e}"),
        })?;

        let stdin = child.stdin.take().ok_or(ConnectorError::SpawnFailed {
            name: server_name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(ConnectorError::SpawnFailed {
            name: server_name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;

        let (stderr_tail, stderr_task) = match child.stderr.take() {
            Some(stderr) => {
                let (tail, task) = spawn_stderr_drain(server_name, stderr);
                (tail, Some(task))
            }
            None => (Arc::new(Mutex::new(VecDeque::new())), None),
        };

        tracing::debug!(
            server = server_name,
            command,
            pid = child.id(),
            "spawned backend process"
        );

        Ok(Self {
            server_name: server_name.to_string(),
            child,
            writer: Some(stdin),
            reader: BufReader::new(stdout),
            write_interrupted: false,
            stderr_tail,
            stderr_task,
        })
    }

    /// Send a request and read lines until the response with the same id.
    ///
    /// Responses to other ids (late answers to calls that already timed
    /// out), notifications and non-JSON output are skipped. Requests the
    /// backend sends us are answered inline.
    pub async fn request(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, ConnectorError> {
        let id = next_request_id();
        self.write_message(&JsonRpcRequest::new(id, method, params))
            .await?;

        let mut line_buf = String::new();
        loop {
            line_buf.clear();
            let bytes_read = self
                .reader
                .read_line(&mut line_buf)
                .await
                .map_err(|e| ConnectorError::TransportError {
                    server: self.server_name.clone(),
                    reason: format!("failed to read from stdout: {e}"),
                })?;

            if bytes_read == 0 {
                return Err(ConnectorError::ConnectionClosed {
                    server: self.server_name.clone(),
                    reason: "server stdout closed (process may have exited)".into(),
                });
            }

            let trimmed = line_buf.trim();
            if trimmed.is_empty() {
                continue;
            }

            match classify_line(trimmed) {
                InboundMessage::Response(resp) if resp.id == Some(id) => return Ok(resp),
                InboundMessage::Response(resp) => {
                    tracing::debug!(
                        server = %self.server_name,
                        expected = id,
                        got = ?resp.id,
                        "discarding response for another request"
                    );
                }
                InboundMessage::Request { id: req_id, method } => {
                    tracing::debug!(
                        server = %self.server_name,
                        method = %method,
                        "answering backend-initiated request"
                    );
                    self.write_message(&reply_to_backend_request(req_id, &method))
                        .await?;
                }
                InboundMessage::Notification { method } => {
                    tracing::trace!(server = %self.server_name, method = %method, "backend notification");
                }
                InboundMessage::Other => {
                    tracing::trace!(server = %self.server_name, line = trimmed, "non JSON-RPC output");
                }
            }
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), ConnectorError> {
        let mut notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let Some(params) = params {
            notification["params"] = params;
        }
        self.write_message(&notification).await
    }

    async fn write_message<T: Serialize>(&mut self, message: &T) -> Result<(), ConnectorError> {
        let mut json = serde_json::to_string(message).map_err(|e| ConnectorError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to serialize message: {e}"),
        })?;
        json.push('\n');

        if self.write_interrupted {
            return Err(ConnectorError::ConnectionClosed {
                server: self.server_name.clone(),
                reason: "an earlier write was interrupted mid-message".into(),
            });
        }
        self.write_interrupted = true;

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| ConnectorError::ConnectionClosed {
                server: self.server_name.clone(),
                reason: "stdin already closed".into(),
            })?;
        writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| ConnectorError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        writer
            .flush()
            .await
            .map_err(|e| ConnectorError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to flush stdin: {e}"),
            })?;
        self.write_interrupted = false;
        Ok(())
    }

    /// Whether a cancelled write left a partial message in the pipe.
    pub fn is_broken(&self) -> bool {
        self.write_interrupted
    }

    /// Close stdin, give the process time to exit, then kill it.
    pub async fn shutdown(&mut self) {
        self.writer = None;
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.server_name, %status, "backend exited");
            }
            _ => {
                tracing::warn!(server = %self.server_name, "backend did not exit, killing");
                let _ = self.child.kill().await;
            }
        }
    }

    /// Last stderr lines as an error-message suffix.
    ///
    /// Waits briefly for the drain task so output written just before the
    /// process died is included.
    pub async fn stderr_context(&mut self) -> String {
        if let Some(task) = self.stderr_task.take() {
            let _ = tokio::time::timeout(STDERR_SETTLE_TIMEOUT, task).await;
        }
        let tail = self.stderr_tail.lock().unwrap_or_else(PoisonError::into_inner);
        format_stderr_suffix(&tail)
    }
}

// ─── HTTP Transport ──────────────────────────────────────────────────────────

/// JSON-RPC transport over HTTP POST (streamable-HTTP style).
pub struct HttpTransport {
    server_name: String,
    http: reqwest::Client,
    url: String,
    headers: HeaderMap,
    /// Session id assigned by the backend during `initialize`.
    session_id: Option<String>,
    protocol_version: Option<String>,
}

impl HttpTransport {
    /// Build a client for `url` with the configured extra headers.
    pub fn new(
        server_name: &str,
        url: &str,
        extra_headers: &HashMap<String, String>,
    ) -> Result<Self, ConnectorError> {
        let mut headers = HeaderMap::new();
        for (key, value) in extra_headers {
            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
                ConnectorError::ConfigError {
                    reason: format!("invalid header name '{key}' for '{server_name}': {e}"),
                }
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| ConnectorError::ConfigError {
                reason: format!("invalid value for header '{key}' for '{server_name}': {e}"),
            })?;
            headers.insert(name, value);
        }

        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ConnectorError::SpawnFailed {
                name: server_name.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            server_name: server_name.to_string(),
            http,
            url: url.to_string(),
            headers,
            session_id: None,
            protocol_version: None,
        })
    }

    /// Remember the negotiated protocol version; it is sent on every later request.
    pub fn set_protocol_version(&mut self, version: &str) {
        self.protocol_version = Some(version.to_string());
    }

    fn post<T: Serialize>(&self, body: &T) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .post(&self.url)
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(session) = &self.session_id {
            req = req.header(SESSION_HEADER, session);
        }
        if let Some(version) = &self.protocol_version {
            req = req.header(PROTOCOL_HEADER, version);
        }
        req
    }

    fn transport_error(&self, reason: String) -> ConnectorError {
        ConnectorError::TransportError {
            server: self.server_name.clone(),
            reason,
        }
    }

    /// POST a request and decode the matching response.
    pub async fn request(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, ConnectorError> {
        let id = next_request_id();
        let response = self
            .post(&JsonRpcRequest::new(id, method, params))
            .send()
            .await
            .map_err(|e| self.transport_error(format!("request failed: {e}")))?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.session_id = Some(session.to_string());
        }

        let status = response.status();
        let is_sse = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        let body = response
            .text()
            .await
            .map_err(|e| self.transport_error(format!("failed to read response body: {e}")))?;

        if status == reqwest::StatusCode::NOT_FOUND && self.session_id.is_some() {
            return Err(ConnectorError::ConnectionClosed {
                server: self.server_name.clone(),
                reason: "session expired (HTTP 404)".into(),
            });
        }
        if !status.is_success() {
            return Err(self.transport_error(format!("HTTP {status}: {}", body.trim())));
        }

        if is_sse {
            parse_sse_response(&body, id).ok_or_else(|| {
                self.transport_error(format!("event stream ended without a response to request {id}"))
            })
        } else {
            serde_json::from_str::<JsonRpcResponse>(&body)
                .map_err(|e| self.transport_error(format!("malformed JSON-RPC response: {e}")))
        }
    }

    /// POST a notification; the backend acknowledges with 202.
    pub async fn notify(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), ConnectorError> {
        let mut notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let Some(params) = params {
            notification["params"] = params;
        }

        let response = self
            .post(&notification)
            .send()
            .await
            .map_err(|e| self.transport_error(format!("notification failed: {e}")))?;
        if !response.status().is_success() {
            return Err(self.transport_error(format!(
                "notification '{method}' rejected with HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Terminate the backend session, if one was assigned (best-effort).
    pub async fn shutdown(&mut self) {
        let Some(session) = self.session_id.take() else {
            return;
        };
        let result = self
            .http
            .delete(&self.url)
            .headers(self.headers.clone())
            .header(SESSION_HEADER, session)
            .timeout(SHUTDOWN_TIMEOUT)
            .send()
            .await;
        if let Err(e) = result {
            tracing::debug!(server = %self.server_name, error = %e, "session delete failed");
        }
    }
}

/// Find the JSON-RPC response for `id` in a server-sent-events body.
///
/// Events are separated by blank lines; multiple `data:` lines in one event
/// are joined with newlines.
pub(crate) fn parse_sse_response(body: &str, id: u64) -> Option<JsonRpcResponse> {
    let mut data = String::new();

    // The trailing "" flushes an event that is not followed by a blank line.
    for line in body.lines().chain(std::iter::once("")) {
        if line.is_empty() {
            if !data.is_empty() {
                if let InboundMessage::Response(resp) = classify_line(&data) {
                    if resp.id == Some(id) {
                        return Some(resp);
                    }
                }
                data.clear();
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    None
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Either transport, behind one request/notify interface.
pub enum Transport {
    Stdio(StdioTransport),
    Http(HttpTransport),
}

impl Transport {
    pub async fn request(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, ConnectorError> {
        match self {
            Transport::Stdio(t) => t.request(method, params).await,
            Transport::Http(t) => t.request(method, params).await,
        }
    }

    pub async fn notify(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), ConnectorError> {
        match self {
            Transport::Stdio(t) => t.notify(method, params).await,
            Transport::Http(t) => t.notify(method, params).await,
        }
    }

    pub fn set_protocol_version(&mut self, version: &str) {
        if let Transport::Http(t) = self {
            t.set_protocol_version(version);
        }
    }

    pub async fn shutdown(&mut self) {
        match self {
            Transport::Stdio(t) => t.shutdown().await,
            Transport::Http(t) => t.shutdown().await,
        }
    }

    /// Shut down and return whatever diagnostics the backend left behind.
    pub async fn close_with_context(&mut self) -> String {
        self.shutdown().await;
        match self {
            Transport::Stdio(t) => t.stderr_context().await,
            Transport::Http(_) => String::new(),
        }
    }

    /// Whether the transport can no longer carry requests.
    pub fn is_broken(&self) -> bool {
        match self {
            Transport::Stdio(t) => t.is_broken(),
            // A dropped HTTP request is aborted as a whole.
            Transport::Http(_) => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Transport::Stdio(_) => "stdio",
            Transport::Http(_) => "http",
        }
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `ConnectorError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, ConnectorError> {
    if let Some(err) = response.error {
        return Err(ConnectorError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(ConnectorError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::types::JsonRpcError;

    #[test]
    fn test_next_request_id_is_monotonic() {
        let id1 = next_request_id();
        let id2 = next_request_id();
        assert!(id2 > id1);
    }

    #[test]
    fn test_classify_response() {
        match classify_line(r#"{"jsonrpc":"2.0","id":7,"result":{"ok":true}}"#) {
            InboundMessage::Response(resp) => {
                assert_eq!(resp.id, Some(7));
                assert_eq!(resp.result.unwrap()["ok"], true);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_backend_request_and_notification() {
        assert!(matches!(
            classify_line(r#"{"jsonrpc":"2.0","id":"srv-1","method":"roots/list"}"#),
            InboundMessage::Request { ref method, .. } if method == "roots/list"
        ));
        assert!(matches!(
            classify_line(r#"{"jsonrpc":"2.0","method":"notifications/message","params":{}}"#),
            InboundMessage::Notification { ref method } if method == "notifications/message"
        ));
    }

    #[test]
    fn test_classify_log_noise() {
        assert!(matches!(classify_line("Starting server on stdio..."), InboundMessage::Other));
        assert!(matches!(classify_line(r#"{"level":"info"}"#), InboundMessage::Other));
    }

    #[test]
    fn test_reply_to_ping_and_unknown() {
        let ping = reply_to_backend_request(serde_json::json!(3), "ping");
        assert_eq!(ping["id"], 3);
        assert!(ping["result"].is_object());

        let other = reply_to_backend_request(serde_json::json!("x"), "sampling/createMessage");
        assert_eq!(other["error"]["code"], error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_stderr_suffix_truncates_on_char_boundary() {
        let mut lines = VecDeque::new();
        assert_eq!(format_stderr_suffix(&lines), "");

        lines.push_back("é".repeat(1500));
        let suffix = format_stderr_suffix(&lines);
        assert!(suffix.starts_with(" | stderr: "));
        assert!(suffix.ends_with("...(truncated)"));
    }

    #[test]
    fn test_parse_sse_response_picks_matching_id() {
        let body = "event: message\n\
                    data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{}}\n\
                    \n\
                    event: message\n\
                    data: {\"jsonrpc\":\"2.0\",\"id\":41,\"result\":{\"content\":[]}}\n";
        let resp = parse_sse_response(body, 41).unwrap();
        assert_eq!(resp.id, Some(41));
        assert!(parse_sse_response(body, 42).is_none());
    }

    #[test]
    fn test_parse_sse_multiline_data() {
        let body = "data: {\"jsonrpc\":\"2.0\",\ndata: \"id\":5,\"result\":{}}\n\n";
        assert!(parse_sse_response(body, 5).is_some());
    }

    #[test]
    fn test_extract_result_success() {
        let resp = JsonRpcResponse {
            id: Some(1),
            result: Some(serde_json::json!({"text": "hello"})),
            error: None,
        };
        assert_eq!(extract_result(resp).unwrap()["text"], "hello");
    }

    #[test]
    fn test_extract_result_error() {
        let resp = JsonRpcResponse {
            id: Some(1),
            result: None,
            error: Some(JsonRpcError {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            }),
        };
        match extract_result(resp).unwrap_err() {
            ConnectorError::ServerError { code, message, .. } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected ServerError, got {other:?}"),
        }
    }

    #[test]
    fn test_extract_result_missing_both() {
        let resp = JsonRpcResponse {
            id: Some(1),
            result: None,
            error: None,
        };
        assert!(matches!(
            extract_result(resp).unwrap_err(),
            ConnectorError::ServerError { .. }
        ));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let config = BackendConfig::default();
        let err = StdioTransport::spawn("ghost", "/nonexistent/definitely-not-a-binary", &config)
            .err()
            .unwrap();
        assert!(matches!(err, ConnectorError::SpawnFailed { ref name, .. } if name == "ghost"));
    }

    #[test]
    fn test_http_rejects_bad_header() {
        let mut headers = HashMap::new();
        headers.insert("bad header".to_string(), "x".to_string());
        let err = HttpTransport::new("remote", "http://localhost:1/mcp", &headers)
            .err()
            .unwrap();
        assert!(matches!(err, ConnectorError::ConfigError { .. }));
    }
}
