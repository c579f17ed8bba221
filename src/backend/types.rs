//! Shared types for backend connections.
//!
//! JSON-RPC 2.0 message types, the subset of MCP protocol structures the
//! connector needs, and the per-backend launch configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::errors::ConnectorError;

/// MCP protocol revision requested during the handshake.
pub const PROTOCOL_VERSION: &str = "2025-06-18";

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
///
/// `id` is optional because a backend may answer an unparseable request
/// with `"id": null`.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// MCP `initialize` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// One page of a `tools/list` response.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<AdvertisedTool>,
    #[serde(default, alias = "nextCursor")]
    pub next_cursor: Option<String>,
}

/// A tool as advertised by a backend. Only the name matters to the gateway;
/// descriptions and schemas come from the persisted hierarchy.
#[derive(Debug, Clone, Deserialize)]
pub struct AdvertisedTool {
    pub name: String,
}

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Backend Configuration ───────────────────────────────────────────────────

/// Launch/connection parameters for one backend.
///
/// A stdio backend sets `command` (plus optional `args`, `env`, `cwd`);
/// a network backend sets `url` (plus optional `headers`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the child process.
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Which transport a backend uses, borrowed from its config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind<'a> {
    /// Long-lived child process speaking line-delimited JSON-RPC on stdio.
    Stdio { command: &'a str },
    /// Network service speaking JSON-RPC over HTTP POST.
    Http { url: &'a str },
}

impl BackendConfig {
    /// Resolve the transport kind, rejecting ambiguous or empty entries.
    pub fn transport_kind(&self) -> Result<TransportKind<'_>, ConnectorError> {
        match (self.command.as_deref(), self.url.as_deref()) {
            (Some(command), None) if !command.trim().is_empty() => {
                Ok(TransportKind::Stdio { command })
            }
            (None, Some(url)) if !url.trim().is_empty() => Ok(TransportKind::Http { url }),
            (Some(_), Some(_)) => Err(ConnectorError::ConfigError {
                reason: "both 'command' and 'url' are set".into(),
            }),
            _ => Err(ConnectorError::ConfigError {
                reason: "one of 'command' or 'url' is required".into(),
            }),
        }
    }
}

/// Top-level backend configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendsConfig {
    #[serde(default)]
    pub servers: HashMap<String, BackendConfig>,
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_request_omits_missing_params() {
        let req = JsonRpcRequest::new(1, "initialize", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_json_rpc_error_response() {
        let json = r#"{
            "jsonrpc": "2.0",
            "id": 2,
            "error": {"code": -32601, "message": "Method not found"}
        }"#;
        let resp: JsonRpcResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.id, Some(2));
        assert!(resp.result.is_none());
        assert_eq!(resp.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_null_id_response() {
        let json = r#"{"jsonrpc": "2.0", "id": null, "error": {"code": -32700, "message": "Parse error"}}"#;
        let resp: JsonRpcResponse = serde_json::from_str(json).unwrap();
        assert!(resp.id.is_none());
    }

    #[test]
    fn test_list_tools_camel_case_cursor() {
        let json = r#"{"tools": [{"name": "find_symbol", "inputSchema": {}}], "nextCursor": "p2"}"#;
        let page: ListToolsResult = serde_json::from_str(json).unwrap();
        assert_eq!(page.tools[0].name, "find_symbol");
        assert_eq!(page.next_cursor.as_deref(), Some("p2"));
    }

    #[test]
    fn test_transport_kind_stdio() {
        let cfg: BackendConfig =
            serde_json::from_str(r#"{"command": "npx", "args": ["-y", "server-github"]}"#)
                .unwrap();
        assert_eq!(
            cfg.transport_kind().unwrap(),
            TransportKind::Stdio { command: "npx" }
        );
    }

    #[test]
    fn test_transport_kind_http() {
        let cfg: BackendConfig =
            serde_json::from_str(r#"{"url": "http://localhost:8931/mcp"}"#).unwrap();
        assert_eq!(
            cfg.transport_kind().unwrap(),
            TransportKind::Http {
                url: "http://localhost:8931/mcp"
            }
        );
    }

    #[test]
    fn test_transport_kind_rejects_ambiguous_and_empty() {
        let both: BackendConfig =
            serde_json::from_str(r#"{"command": "x", "url": "http://y"}"#).unwrap();
        assert!(both.transport_kind().is_err());

        let neither = BackendConfig::default();
        assert!(neither.transport_kind().is_err());

        let blank: BackendConfig = serde_json::from_str(r#"{"command": "  "}"#).unwrap();
        assert!(blank.transport_kind().is_err());
    }
}
