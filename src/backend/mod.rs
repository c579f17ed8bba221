//! Backend connector — transports to the tool-providing servers.
//!
//! This module handles:
//! - Spawning stdio servers and connecting to HTTP servers
//! - JSON-RPC 2.0 framing for both transports
//! - The MCP initialization handshake (and optional tool enumeration)
//! - Forwarding a single `tools/call` under a deadline
//!
//! Connection lifecycle (when to start, when to give up) belongs to the
//! server registry; this module only knows how to talk to one backend.

pub mod connector;
pub mod errors;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use connector::{call, BackendConnection, BackendConnector, ConnectionHandle, McpConnector};
pub use errors::ConnectorError;
pub use types::{BackendConfig, BackendsConfig, TransportKind};
