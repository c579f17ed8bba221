//! Agent-facing MCP host over stdio.
//!
//! Exposes exactly two tools, `get_tools_in_category` and `execute_tool`,
//! as line-delimited JSON-RPC 2.0 on stdin/stdout. Every request runs on its
//! own task; responses go through a single writer task and may leave out of
//! order (the agent matches them by id).

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::backend::types::{error_codes, JsonRpcError, PROTOCOL_VERSION};
use crate::dispatcher::Dispatcher;
use crate::errors::GatewayError;
use crate::policy::{PolicyDecision, PolicyHook, ToolInvocation};

pub const GET_TOOLS_IN_CATEGORY: &str = "get_tools_in_category";
pub const EXECUTE_TOOL: &str = "execute_tool";

/// Outbound messages buffered between request tasks and the writer.
const OUTBOUND_CAPACITY: usize = 64;

const INSTRUCTIONS: &str = "Tools are organized in a hierarchy of categories. \
Call get_tools_in_category with path \"\" to see the top-level categories, then \
descend with dot-separated paths (e.g. \"coding_tools.serena\"). Run a tool with \
execute_tool, passing its full path and the arguments described in its listing.";

// ─── Wire types ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct InboundMessage {
    /// Absent for notifications. Any JSON value is echoed back unchanged.
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

fn rpc_error(code: i32, message: impl Into<String>) -> JsonRpcError {
    JsonRpcError {
        code,
        message: message.into(),
        data: None,
    }
}

fn success_response(id: Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn error_response(id: Value, error: JsonRpcError) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": error})
}

/// `tools/call` result carrying a gateway error.
fn error_result(err: &GatewayError) -> Value {
    json!({
        "content": [{"type": "text", "text": format!("{}: {err}", err.kind())}],
        "isError": true,
    })
}

/// The two meta-tools advertised by `tools/list`.
pub fn meta_tools() -> Value {
    json!([
        {
            "name": GET_TOOLS_IN_CATEGORY,
            "description": "Browse the tool hierarchy. Returns the sub-categories and tools \
                directly under a category, each with a description. Use \"\" for the root.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Dot-separated category path, \"\" for the root"
                    }
                },
                "required": ["path"]
            }
        },
        {
            "name": EXECUTE_TOOL,
            "description": "Execute a tool by its full hierarchy path. Arguments are passed \
                to the tool unchanged; the tool's own result is returned.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "tool_path": {
                        "type": "string",
                        "description": "Full dot-separated path of the tool"
                    },
                    "arguments": {
                        "type": "object",
                        "description": "Arguments for the tool, as described in its listing"
                    }
                },
                "required": ["tool_path"]
            }
        }
    ])
}

// ─── GatewayServer ───────────────────────────────────────────────────────────

pub struct GatewayServer {
    dispatcher: Dispatcher,
    policy: Arc<dyn PolicyHook>,
}

impl GatewayServer {
    pub fn new(dispatcher: Dispatcher, policy: Arc<dyn PolicyHook>) -> Self {
        Self { dispatcher, policy }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Serve requests from `reader` until EOF, writing responses to `writer`.
    ///
    /// After EOF or a read error, in-flight requests are awaited and every
    /// backend is shut down before returning. Lines that are not valid UTF-8
    /// get a parse error like any other malformed message.
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, writer: W) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Value>(OUTBOUND_CAPACITY);

        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(message) = rx.recv().await {
                let mut line = serde_json::to_vec(&message).map_err(std::io::Error::other)?;
                line.push(b'\n');
                writer.write_all(&line).await?;
                writer.flush().await?;
            }
            Ok::<(), std::io::Error>(())
        });

        let mut reader = BufReader::new(reader);
        // Bytes of a cancelled `read_until` stay in `buf` and the next call
        // continues the same line, so it is only cleared once a line is taken.
        let mut buf = Vec::new();
        let mut tasks = JoinSet::new();
        let mut read_error = None;

        loop {
            tokio::select! {
                read = reader.read_until(b'\n', &mut buf) => {
                    let eof = match read {
                        Ok(n) => n == 0,
                        Err(e) => {
                            tracing::error!(error = %e, "failed to read from stdin, stopping");
                            read_error = Some(e);
                            break;
                        }
                    };
                    let raw = std::mem::take(&mut buf);
                    if !raw.iter().all(u8::is_ascii_whitespace) {
                        let server = Arc::clone(&self);
                        let tx = tx.clone();
                        tasks.spawn(async move {
                            let response = match String::from_utf8(raw) {
                                Ok(line) => server.handle_message(&line).await,
                                Err(e) => Some(error_response(
                                    Value::Null,
                                    rpc_error(error_codes::PARSE_ERROR, format!("parse error: {e}")),
                                )),
                            };
                            if let Some(response) = response {
                                // The writer only stops once every sender is gone.
                                let _ = tx.send(response).await;
                            }
                        });
                    }
                    if eof {
                        break;
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    log_task_failure(joined);
                }
            }
        }

        tracing::info!(in_flight = tasks.len(), "stdin closed, draining requests");
        while let Some(joined) = tasks.join_next().await {
            log_task_failure(joined);
        }
        drop(tx);

        let written = match writer_task.await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::other(e)),
        };

        self.dispatcher.registry().shutdown().await;
        tracing::info!("gateway stopped");
        match read_error {
            Some(e) => Err(e),
            None => written,
        }
    }

    /// Handle one inbound line; `None` for notifications.
    pub async fn handle_message(&self, line: &str) -> Option<Value> {
        let raw: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                return Some(error_response(
                    Value::Null,
                    rpc_error(error_codes::PARSE_ERROR, format!("parse error: {e}")),
                ))
            }
        };

        let message: InboundMessage = match serde_json::from_value(raw) {
            Ok(message) => message,
            Err(e) => {
                return Some(error_response(
                    Value::Null,
                    rpc_error(error_codes::INVALID_REQUEST, format!("invalid request: {e}")),
                ))
            }
        };

        let Some(id) = message.id else {
            tracing::debug!(method = %message.method, "notification received");
            return None;
        };

        let outcome = match message.method.as_str() {
            "initialize" => Ok(self.initialize_result()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({"tools": meta_tools()})),
            "tools/call" => self.handle_tool_call(message.params).await,
            other => Err(rpc_error(
                error_codes::METHOD_NOT_FOUND,
                format!("method not found: {other}"),
            )),
        };

        Some(match outcome {
            Ok(result) => success_response(id, result),
            Err(error) => error_response(id, error),
        })
    }

    fn initialize_result(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {"listChanged": false}},
            "serverInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "instructions": INSTRUCTIONS,
        })
    }

    async fn handle_tool_call(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: ToolCallParams = params
            .map(serde_json::from_value::<ToolCallParams>)
            .transpose()
            .map_err(|e| rpc_error(error_codes::INVALID_PARAMS, format!("invalid params: {e}")))?
            .ok_or_else(|| rpc_error(error_codes::INVALID_PARAMS, "missing params"))?;
        let arguments = params.arguments.unwrap_or_else(|| json!({}));

        match params.name.as_str() {
            GET_TOOLS_IN_CATEGORY => {
                let path = string_arg(&arguments, "path")?;
                Ok(self.browse(path))
            }
            EXECUTE_TOOL => {
                let tool_path = string_arg(&arguments, "tool_path")?.to_string();
                let tool_arguments = arguments
                    .get("arguments")
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                Ok(self.execute(tool_path, tool_arguments).await)
            }
            other => Err(rpc_error(
                error_codes::INVALID_PARAMS,
                format!("unknown tool: {other}"),
            )),
        }
    }

    fn browse(&self, path: &str) -> Value {
        match self.dispatcher.get_tools_in_category(path) {
            Ok(listing) => {
                let structured = json!(listing);
                json!({
                    "content": [{"type": "text", "text": structured.to_string()}],
                    "structuredContent": structured,
                    "isError": false,
                })
            }
            Err(e) => {
                tracing::debug!(path = %path, kind = e.kind(), "browse failed");
                error_result(&e)
            }
        }
    }

    async fn execute(&self, tool_path: String, arguments: Value) -> Value {
        let invocation = ToolInvocation {
            call_id: uuid::Uuid::new_v4().to_string(),
            tool_path,
            arguments,
        };
        let span = tracing::info_span!(
            "execute_tool",
            call_id = %invocation.call_id,
            tool_path = %invocation.tool_path
        );

        async {
            let denied = match self.policy.before_execute(&invocation).await {
                PolicyDecision::Allow => None,
                PolicyDecision::Deny { reason } => Some(reason),
                PolicyDecision::Ask { reason } => Some(if reason.is_empty() {
                    "confirmation required".to_string()
                } else {
                    format!("confirmation required: {reason}")
                }),
            };
            if let Some(reason) = denied {
                tracing::info!(reason = %reason, "execution denied by policy");
                return error_result(&GatewayError::PolicyDenied {
                    tool_path: invocation.tool_path.clone(),
                    reason,
                });
            }

            let outcome = self
                .dispatcher
                .execute_tool(&invocation.tool_path, invocation.arguments.clone())
                .await;
            self.policy.after_execute(&invocation, &outcome).await;

            match outcome {
                Ok(result) => result,
                Err(e) => error_result(&e),
            }
        }
        .instrument(span)
        .await
    }
}

fn string_arg<'a>(arguments: &'a Value, key: &str) -> Result<&'a str, JsonRpcError> {
    arguments.get(key).and_then(Value::as_str).ok_or_else(|| {
        rpc_error(
            error_codes::INVALID_PARAMS,
            format!("'{key}' must be a string"),
        )
    })
}

fn log_task_failure(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            tracing::error!(error = %e, "request task panicked");
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
