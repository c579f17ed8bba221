//! Gateway error taxonomy.
//!
//! Every error an agent can observe from the two meta-operations is a
//! `GatewayError`. Routing errors are produced by the hierarchy store,
//! lifecycle errors by the server registry, and call errors by the
//! dispatcher when it translates a `ConnectorError` from a backend.

use thiserror::Error;

use crate::backend::errors::ConnectorError;

/// Errors surfaced by the dispatcher and its collaborators.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A path segment does not exist in the hierarchy.
    #[error("path not found: '{path}' (no entry named '{segment}')")]
    PathNotFound { path: String, segment: String },

    /// Browsing was requested on a tool node.
    #[error("'{path}' is a tool, not a category")]
    NotACategory { path: String },

    /// Execution was requested on a category node.
    #[error("'{path}' is a category, not a tool")]
    NotATool { path: String },

    /// The backend transport could not be established.
    #[error("failed to start server '{server}': {reason}")]
    ServerSpawnFailed { server: String, reason: String },

    /// The backend failed recently and is cooling down (or needs a reset).
    #[error("server '{server}' is unavailable: {reason}")]
    ServerUnavailable {
        server: String,
        reason: String,
        retry_after_ms: Option<u64>,
    },

    /// The backend reported a failure, or the transport broke mid-call.
    ///
    /// `code` is the backend's JSON-RPC error code; it is `None` when the
    /// failure happened at the transport level.
    #[error("server '{server}' error{}: {message}", code.map(|c| format!(" [{c}]")).unwrap_or_default())]
    BackendError {
        server: String,
        code: Option<i32>,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A tool call exceeded its deadline.
    #[error("tool '{tool}' on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        tool: String,
        timeout_ms: u64,
    },

    /// Invalid or unreadable configuration.
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// The persisted hierarchy could not be loaded.
    #[error("hierarchy error: {reason}")]
    HierarchyLoad { reason: String },

    /// The host's policy hook refused the invocation.
    #[error("execution of '{tool_path}' denied: {reason}")]
    PolicyDenied { tool_path: String, reason: String },
}

impl GatewayError {
    /// Stable snake_case tag for logs and agent-visible error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::PathNotFound { .. } => "path_not_found",
            GatewayError::NotACategory { .. } => "not_a_category",
            GatewayError::NotATool { .. } => "not_a_tool",
            GatewayError::ServerSpawnFailed { .. } => "server_spawn_failed",
            GatewayError::ServerUnavailable { .. } => "server_unavailable",
            GatewayError::BackendError { .. } => "backend_error",
            GatewayError::Timeout { .. } => "timeout",
            GatewayError::ConfigError { .. } => "config_error",
            GatewayError::HierarchyLoad { .. } => "hierarchy_load",
            GatewayError::PolicyDenied { .. } => "policy_denied",
        }
    }

    /// Translate a connector error raised while talking to `server`.
    ///
    /// Establishment failures become `ServerSpawnFailed`; everything that
    /// happens on a live connection becomes `BackendError` or `Timeout`.
    pub fn from_connector(server: &str, err: ConnectorError) -> Self {
        match err {
            ConnectorError::SpawnFailed { reason, .. }
            | ConnectorError::InitFailed { reason, .. } => GatewayError::ServerSpawnFailed {
                server: server.to_string(),
                reason,
            },
            ConnectorError::ConfigError { reason } => GatewayError::ServerSpawnFailed {
                server: server.to_string(),
                reason: format!("config error: {reason}"),
            },
            ConnectorError::ServerError {
                code,
                message,
                data,
            } => GatewayError::BackendError {
                server: server.to_string(),
                code: Some(code),
                message,
                data,
            },
            ConnectorError::Timeout { tool, timeout_ms } => GatewayError::Timeout {
                server: server.to_string(),
                tool,
                timeout_ms,
            },
            ConnectorError::TransportError { reason, .. }
            | ConnectorError::ConnectionClosed { reason, .. } => GatewayError::BackendError {
                server: server.to_string(),
                code: None,
                message: reason,
                data: None,
            },
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
