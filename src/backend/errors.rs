//! Backend connector error types.

use thiserror::Error;

/// Errors raised while establishing or using a backend connection.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// The backend process or client could not be created.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The initialization handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed { name: String, reason: String },

    /// JSON-RPC communication error (malformed message, I/O error, HTTP failure).
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// The backend went away (stdout closed, process exited).
    #[error("connection to server '{server}' closed: {reason}")]
    ConnectionClosed { server: String, reason: String },

    /// The backend returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A tool call did not complete before its deadline.
    #[error("tool call '{tool}' timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    /// The backend configuration cannot be used.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl ConnectorError {
    /// Whether the connection should be considered dead after this error.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            ConnectorError::TransportError { .. } | ConnectorError::ConnectionClosed { .. }
        )
    }
}
