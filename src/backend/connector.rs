//! Backend connector — establishes connections and forwards tool calls.
//!
//! [`BackendConnector::start`] creates the transport for one named backend
//! and performs the MCP handshake; the returned [`ConnectionHandle`] is
//! owned by that backend's registry entry. [`call`] forwards a single tool
//! invocation with a deadline and never retries: tool calls may have side
//! effects, so a failed call is reported, not repeated.

use std::time::Duration;

use async_trait::async_trait;

use super::errors::ConnectorError;
use super::transport::{extract_result, HttpTransport, StdioTransport, Transport};
use super::types::{
    BackendConfig, InitializeResult, ListToolsResult, TransportKind, PROTOCOL_VERSION,
};

/// Upper bound on `tools/list` pages, guarding against a cursor loop.
const MAX_TOOL_PAGES: usize = 100;

// ─── Traits ──────────────────────────────────────────────────────────────────

/// A live connection to one backend.
#[async_trait]
pub trait BackendConnection: Send {
    /// Forward one `tools/call` and return the backend's result unchanged.
    async fn call_tool(
        &mut self,
        tool_id: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ConnectorError>;

    /// Tool names the backend advertised at start, if they were fetched.
    fn advertised_tools(&self) -> Option<&[String]> {
        None
    }

    /// Whether an interrupted call left the connection unusable.
    fn is_broken(&self) -> bool {
        false
    }

    /// Release the transport (close pipes, end the session).
    async fn shutdown(&mut self);
}

/// Owned handle to a live connection.
pub type ConnectionHandle = Box<dyn BackendConnection>;

/// Creates connections from backend configuration.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn start(
        &self,
        name: &str,
        config: &BackendConfig,
    ) -> Result<ConnectionHandle, ConnectorError>;
}

/// Forward one tool call, bounded by `timeout`.
///
/// On expiry the in-flight future is dropped and `Timeout` is returned;
/// the caller keeps the connection.
pub async fn call(
    connection: &mut dyn BackendConnection,
    tool_id: &str,
    arguments: serde_json::Value,
    timeout: Duration,
) -> Result<serde_json::Value, ConnectorError> {
    tokio::time::timeout(timeout, connection.call_tool(tool_id, arguments))
        .await
        .map_err(|_| ConnectorError::Timeout {
            tool: tool_id.to_string(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        })?
}

// ─── MCP Connector ───────────────────────────────────────────────────────────

/// Connector for MCP servers over stdio or HTTP.
#[derive(Debug, Clone)]
pub struct McpConnector {
    /// Deadline for transport creation plus handshake.
    init_timeout: Duration,
    /// Fetch `tools/list` after the handshake.
    list_tools: bool,
}

impl McpConnector {
    pub fn new(init_timeout: Duration, list_tools: bool) -> Self {
        Self {
            init_timeout,
            list_tools,
        }
    }
}

#[async_trait]
impl BackendConnector for McpConnector {
    async fn start(
        &self,
        name: &str,
        config: &BackendConfig,
    ) -> Result<ConnectionHandle, ConnectorError> {
        let mut transport = match config.transport_kind()? {
            TransportKind::Stdio { command } => {
                Transport::Stdio(StdioTransport::spawn(name, command, config)?)
            }
            TransportKind::Http { url } => {
                Transport::Http(HttpTransport::new(name, url, &config.headers)?)
            }
        };

        let handshake = tokio::time::timeout(
            self.init_timeout,
            initialize(&mut transport, name, self.list_tools),
        )
        .await;

        match handshake {
            Ok(Ok((init, tools))) => {
                let server_info = init.server_info.as_ref();
                tracing::info!(
                    server = name,
                    transport = transport.kind(),
                    protocol = init.protocol_version.as_deref().unwrap_or("unknown"),
                    backend_name = server_info.and_then(|i| i.name.as_deref()).unwrap_or(""),
                    backend_version = server_info.and_then(|i| i.version.as_deref()).unwrap_or(""),
                    advertised_tools = tools.as_ref().map(Vec::len),
                    "backend connected"
                );
                Ok(Box::new(McpConnection {
                    name: name.to_string(),
                    transport,
                    tools,
                }))
            }
            Ok(Err(e)) => {
                let stderr_ctx = transport.close_with_context().await;
                Err(ConnectorError::InitFailed {
                    name: name.to_string(),
                    reason: format!("{e}{stderr_ctx}"),
                })
            }
            Err(_) => {
                let stderr_ctx = transport.close_with_context().await;
                Err(ConnectorError::InitFailed {
                    name: name.to_string(),
                    reason: format!(
                        "initialization timed out after {}s{stderr_ctx}",
                        self.init_timeout.as_secs()
                    ),
                })
            }
        }
    }
}

/// Perform the MCP initialization handshake.
async fn initialize(
    transport: &mut Transport,
    server_name: &str,
    list_tools: bool,
) -> Result<(InitializeResult, Option<Vec<String>>), ConnectorError> {
    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    });
    let result = extract_result(transport.request("initialize", Some(params)).await?)?;

    let init: InitializeResult =
        serde_json::from_value(result).map_err(|e| ConnectorError::InitFailed {
            name: server_name.to_string(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    if let Some(version) = init.protocol_version.as_deref() {
        transport.set_protocol_version(version);
    }
    transport.notify("notifications/initialized", None).await?;

    let tools = if list_tools {
        Some(list_all_tools(transport, server_name).await?)
    } else {
        None
    };

    Ok((init, tools))
}

/// Collect every advertised tool name, following `nextCursor`.
async fn list_all_tools(
    transport: &mut Transport,
    server_name: &str,
) -> Result<Vec<String>, ConnectorError> {
    let mut names = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_TOOL_PAGES {
        let params = cursor
            .as_ref()
            .map(|c| serde_json::json!({ "cursor": c }));
        let result = extract_result(transport.request("tools/list", params).await?)?;
        let page: ListToolsResult =
            serde_json::from_value(result).map_err(|e| ConnectorError::InitFailed {
                name: server_name.to_string(),
                reason: format!("failed to parse tools/list response: {e}"),
            })?;

        names.extend(page.tools.into_iter().map(|t| t.name));
        match page.next_cursor {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => return Ok(names),
        }
    }

    tracing::warn!(
        server = server_name,
        pages = MAX_TOOL_PAGES,
        "tools/list pagination did not terminate, using partial list"
    );
    Ok(names)
}

// ─── MCP Connection ──────────────────────────────────────────────────────────

/// A handshaken MCP backend.
struct McpConnection {
    name: String,
    transport: Transport,
    tools: Option<Vec<String>>,
}

#[async_trait]
impl BackendConnection for McpConnection {
    async fn call_tool(
        &mut self,
        tool_id: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ConnectorError> {
        let params = serde_json::json!({
            "name": tool_id,
            "arguments": arguments,
        });
        let response = self.transport.request("tools/call", Some(params)).await?;
        extract_result(response)
    }

    fn advertised_tools(&self) -> Option<&[String]> {
        self.tools.as_deref()
    }

    fn is_broken(&self) -> bool {
        self.transport.is_broken()
    }

    async fn shutdown(&mut self) {
        tracing::debug!(server = %self.name, "shutting down backend connection");
        self.transport.shutdown().await;
    }
}

// ─── Scripted Connector (tests) ──────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory connector that records spawns and measures concurrency.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{BackendConnection, BackendConnector, ConnectionHandle};
    use crate::backend::errors::ConnectorError;
    use crate::backend::types::BackendConfig;

    /// What a scripted connection does when called.
    #[derive(Debug, Clone, Copy)]
    pub(crate) enum CallBehavior {
        /// Return a result naming the server and tool, echoing arguments.
        Echo,
        /// Return a JSON-RPC error from the backend.
        Fail,
        /// Never answer.
        Hang,
        /// Report a dropped connection.
        Disconnect,
        /// Panic inside the call.
        Panic,
        /// Hang after leaving the connection unusable, like a write cut off
        /// by the call deadline.
        TornWrite,
    }

    /// Tracks how many calls are inside a critical section at once.
    #[derive(Debug, Default)]
    pub(crate) struct ConcurrencyGauge {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ConcurrencyGauge {
        pub(crate) fn enter(self: &Arc<Self>) -> GaugeGuard {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            GaugeGuard(Arc::clone(self))
        }

        pub(crate) fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    pub(crate) struct GaugeGuard(Arc<ConcurrencyGauge>);

    impl Drop for GaugeGuard {
        fn drop(&mut self) {
            self.0.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub(crate) struct ScriptedConnector {
        spawns: AtomicUsize,
        calls: Arc<AtomicUsize>,
        failing_spawns: AtomicUsize,
        spawn_delay: Duration,
        call_delay: Duration,
        behaviors: HashMap<String, CallBehavior>,
        advertised: Option<Vec<String>>,
        pub(crate) gauge: Arc<ConcurrencyGauge>,
    }

    impl ScriptedConnector {
        pub(crate) fn new() -> Self {
            Self {
                spawns: AtomicUsize::new(0),
                calls: Arc::new(AtomicUsize::new(0)),
                failing_spawns: AtomicUsize::new(0),
                spawn_delay: Duration::ZERO,
                call_delay: Duration::ZERO,
                behaviors: HashMap::new(),
                advertised: None,
                gauge: Arc::new(ConcurrencyGauge::default()),
            }
        }

        /// Fail the next `n` start attempts.
        pub(crate) fn failing_spawns(self, n: usize) -> Self {
            self.failing_spawns.store(n, Ordering::SeqCst);
            self
        }

        pub(crate) fn spawn_delay(mut self, delay: Duration) -> Self {
            self.spawn_delay = delay;
            self
        }

        pub(crate) fn call_delay(mut self, delay: Duration) -> Self {
            self.call_delay = delay;
            self
        }

        pub(crate) fn behavior(mut self, server: &str, behavior: CallBehavior) -> Self {
            self.behaviors.insert(server.to_string(), behavior);
            self
        }

        pub(crate) fn advertising(mut self, tools: &[&str]) -> Self {
            self.advertised = Some(tools.iter().map(|t| t.to_string()).collect());
            self
        }

        pub(crate) fn spawn_count(&self) -> usize {
            self.spawns.load(Ordering::SeqCst)
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BackendConnector for ScriptedConnector {
        async fn start(
            &self,
            name: &str,
            _config: &BackendConfig,
        ) -> Result<ConnectionHandle, ConnectorError> {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            if !self.spawn_delay.is_zero() {
                tokio::time::sleep(self.spawn_delay).await;
            }

            let should_fail = self
                .failing_spawns
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if should_fail {
                return Err(ConnectorError::SpawnFailed {
                    name: name.to_string(),
                    reason: "scripted spawn failure".into(),
                });
            }

            Ok(Box::new(ScriptedConnection {
                server: name.to_string(),
                behavior: self
                    .behaviors
                    .get(name)
                    .copied()
                    .unwrap_or(CallBehavior::Echo),
                call_delay: self.call_delay,
                calls: Arc::clone(&self.calls),
                gauge: Arc::clone(&self.gauge),
                advertised: self.advertised.clone(),
                broken: false,
            }))
        }
    }

    struct ScriptedConnection {
        server: String,
        behavior: CallBehavior,
        call_delay: Duration,
        calls: Arc<AtomicUsize>,
        gauge: Arc<ConcurrencyGauge>,
        advertised: Option<Vec<String>>,
        broken: bool,
    }

    #[async_trait]
    impl BackendConnection for ScriptedConnection {
        async fn call_tool(
            &mut self,
            tool_id: &str,
            arguments: serde_json::Value,
        ) -> Result<serde_json::Value, ConnectorError> {
            let _inside = self.gauge.enter();
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.call_delay.is_zero() {
                tokio::time::sleep(self.call_delay).await;
            }

            match self.behavior {
                CallBehavior::Echo => Ok(serde_json::json!({
                    "content": [{"type": "text", "text": format!("{}:{tool_id}", self.server)}],
                    "arguments": arguments,
                })),
                CallBehavior::Fail => Err(ConnectorError::ServerError {
                    code: -32000,
                    message: format!("{tool_id} failed"),
                    data: Some(serde_json::json!({"tool": tool_id})),
                }),
                CallBehavior::Hang => std::future::pending().await,
                CallBehavior::Disconnect => Err(ConnectorError::ConnectionClosed {
                    server: self.server.clone(),
                    reason: "scripted disconnect".into(),
                }),
                CallBehavior::Panic => panic!("scripted panic in {tool_id}"),
                CallBehavior::TornWrite => {
                    self.broken = true;
                    std::future::pending().await
                }
            }
        }

        fn advertised_tools(&self) -> Option<&[String]> {
            self.advertised.as_deref()
        }

        fn is_broken(&self) -> bool {
            self.broken
        }

        async fn shutdown(&mut self) {}
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::testing::{CallBehavior, ScriptedConnector};
    use super::*;

    #[tokio::test]
    async fn test_call_times_out() {
        let connector = ScriptedConnector::new().behavior("slow", CallBehavior::Hang);
        let mut conn = connector
            .start("slow", &BackendConfig::default())
            .await
            .unwrap();

        let err = call(
            conn.as_mut(),
            "crunch",
            serde_json::json!({}),
            Duration::from_millis(20),
        )
        .await
        .unwrap_err();

        match err {
            ConnectorError::Timeout { tool, timeout_ms } => {
                assert_eq!(tool, "crunch");
                assert_eq!(timeout_ms, 20);
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_call_passes_result_through() {
        let connector = ScriptedConnector::new();
        let mut conn = connector
            .start("github", &BackendConfig::default())
            .await
            .unwrap();

        let result = call(
            conn.as_mut(),
            "search_repositories",
            serde_json::json!({"query": "tokio"}),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert_eq!(result["content"][0]["text"], "github:search_repositories");
        assert_eq!(result["arguments"]["query"], "tokio");
    }

    #[tokio::test]
    async fn test_mcp_connector_rejects_invalid_config() {
        let connector = McpConnector::new(Duration::from_secs(1), false);
        let err = connector
            .start("broken", &BackendConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConnectorError::ConfigError { .. }));
    }

    #[tokio::test]
    async fn test_mcp_connector_spawn_failure() {
        let connector = McpConnector::new(Duration::from_secs(1), false);
        let config = BackendConfig {
            command: Some("/nonexistent/mcp-server-binary".into()),
            ..Default::default()
        };
        let err = connector.start("ghost", &config).await.err().unwrap();
        assert!(matches!(err, ConnectorError::SpawnFailed { .. }));
    }

    // ─── Stdio backend ───────────────────────────────────────────────────────

    /// A line-oriented MCP server in plain sh. Tools:
    /// `handshake` reports whether `notifications/initialized` arrived,
    /// `fast` answers after some log noise, `slow` answers after 1s,
    /// `ping_me` pings the gateway first, `stall` stops reading stdin,
    /// `exit` terminates the process.
    const FAKE_BACKEND: &str = r#"
reply() {
  printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"%s"}]}}\n' "$1" "$2"
}
initialized=no
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9]*\),.*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2025-06-18","capabilities":{"tools":{}},"serverInfo":{"name":"fake","version":"0.0.1"}}}\n' "$id" ;;
    *'"method":"notifications/initialized"'*)
      initialized=yes ;;
    *'"method":"tools/list"'*'"cursor":"page-2"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"slow"},{"name":"exit"}]}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"fast"},{"name":"handshake"}],"nextCursor":"page-2"}}\n' "$id" ;;
    *'"name":"handshake"'*)
      reply "$id" "$initialized" ;;
    *'"name":"fast"'*)
      echo 'fake backend: handling fast'
      printf '{"jsonrpc":"2.0","method":"notifications/message","params":{"level":"info"}}\n'
      reply "$id" fast ;;
    *'"name":"slow"'*)
      sleep 1
      reply "$id" slow ;;
    *'"name":"ping_me"'*)
      printf '{"jsonrpc":"2.0","id":"srv-1","method":"ping"}\n'
      IFS= read -r answer
      case "$answer" in
        *'"id":"srv-1"'*'"result"'*) reply "$id" pong ;;
        *) reply "$id" no-pong ;;
      esac ;;
    *'"name":"stall"'*)
      sleep 30 ;;
    *'"name":"exit"'*)
      echo 'fake backend exiting' >&2
      exit 0 ;;
    *)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"unknown"}}\n' "$id" ;;
  esac
done
"#;

    async fn start_fake(list_tools: bool) -> ConnectionHandle {
        let config = BackendConfig {
            command: Some("sh".into()),
            args: vec!["-c".into(), FAKE_BACKEND.into()],
            ..Default::default()
        };
        McpConnector::new(Duration::from_secs(5), list_tools)
            .start("fake", &config)
            .await
            .unwrap()
    }

    async fn text_of(
        conn: &mut ConnectionHandle,
        tool: &str,
        timeout: Duration,
    ) -> Result<String, ConnectorError> {
        let result = call(conn.as_mut(), tool, serde_json::json!({}), timeout).await?;
        Ok(result["content"][0]["text"].as_str().unwrap().to_string())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_handshake_and_paginated_tools() {
        let mut conn = start_fake(true).await;

        let tools: Vec<&str> = conn
            .advertised_tools()
            .unwrap()
            .iter()
            .map(String::as_str)
            .collect();
        assert_eq!(tools, vec!["fast", "handshake", "slow", "exit"]);

        let initialized = text_of(&mut conn, "handshake", Duration::from_secs(5)).await.unwrap();
        assert_eq!(initialized, "yes");
        conn.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_skips_noise_and_late_responses() {
        let mut conn = start_fake(false).await;
        assert!(conn.advertised_tools().is_none());

        let err = text_of(&mut conn, "slow", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Timeout { .. }));
        assert!(!conn.is_broken());

        // The answer to `slow` arrives first and must not be taken for this one.
        let fast = text_of(&mut conn, "fast", Duration::from_secs(5)).await.unwrap();
        assert_eq!(fast, "fast");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_answers_backend_ping() {
        let mut conn = start_fake(false).await;
        let answer = text_of(&mut conn, "ping_me", Duration::from_secs(5)).await.unwrap();
        assert_eq!(answer, "pong");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_backend_exit_closes_connection() {
        let mut conn = start_fake(false).await;
        let err = text_of(&mut conn, "exit", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::ConnectionClosed { .. }), "{err:?}");
        assert!(err.is_connection_lost());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_interrupted_write_breaks_connection() {
        let mut conn = start_fake(false).await;

        let err = text_of(&mut conn, "stall", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Timeout { .. }));
        assert!(!conn.is_broken());

        // The backend no longer reads, so a payload larger than the pipe
        // buffer cannot be written in full before the deadline.
        let big = serde_json::json!({"blob": "x".repeat(1024 * 1024)});
        let err = call(conn.as_mut(), "stall", big, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Timeout { .. }));
        assert!(conn.is_broken());

        let err = text_of(&mut conn, "fast", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_connection_lost(), "{err:?}");
    }
}
