//! Dispatcher — the two meta-operations exposed to the agent.
//!
//! `get_tools_in_category` answers from the hierarchy alone.
//! `execute_tool` resolves the tool node, then holds exactly one backend
//! mutex while it connects and forwards the call:
//! resolve → lock → connect → call → record → unlock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend;
use crate::errors::GatewayError;
use crate::hierarchy::{CategoryListing, HierarchyStore};
use crate::registry::ServerRegistry;

// ─── Constants ──────────────────────────────────────────────────────────────

/// Default deadline for one backend tool call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

// ─── Dispatcher ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Dispatcher {
    hierarchy: Arc<HierarchyStore>,
    registry: Arc<ServerRegistry>,
    call_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        hierarchy: Arc<HierarchyStore>,
        registry: Arc<ServerRegistry>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            hierarchy,
            registry,
            call_timeout,
        }
    }

    pub fn hierarchy(&self) -> &HierarchyStore {
        &self.hierarchy
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    /// Browse one level of the hierarchy; `""` lists the root.
    pub fn get_tools_in_category(&self, path: &str) -> Result<CategoryListing, GatewayError> {
        self.hierarchy.list_children(path)
    }

    /// Execute the tool at `tool_path` with `arguments` passed through as-is.
    ///
    /// The backend mutex is released on every exit path, including timeout
    /// and cancellation of this future.
    pub async fn execute_tool(
        &self,
        tool_path: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError> {
        let tool = self.hierarchy.resolve_tool(tool_path)?;
        let server = tool.server();
        let tool_id = tool.tool_id();

        let mutex = self.registry.client_mutex(server);
        let waited = Instant::now();
        let mut entry = mutex.lock().await;
        let lock_wait_ms = waited.elapsed().as_millis() as u64;

        let connection = self.registry.get_or_create_connection(&mut entry).await?;

        if let Some(advertised) = connection.advertised_tools() {
            if !advertised.iter().any(|name| name == tool_id) {
                tracing::warn!(
                    server = %server,
                    tool = %tool_id,
                    tool_path = %tool_path,
                    "tool is not advertised by its backend, calling anyway"
                );
            }
        }

        let started = Instant::now();
        let outcome =
            backend::call(connection.as_mut(), tool_id, arguments, self.call_timeout).await;
        self.registry.record_call(&mut entry, &outcome);
        drop(entry);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(result) => {
                tracing::info!(
                    server = %server,
                    tool_path = %tool_path,
                    elapsed_ms,
                    lock_wait_ms,
                    "tool call completed"
                );
                Ok(result)
            }
            Err(e) => {
                let err = GatewayError::from_connector(server, e);
                tracing::warn!(
                    server = %server,
                    tool_path = %tool_path,
                    elapsed_ms,
                    kind = err.kind(),
                    error = %err,
                    "tool call failed"
                );
                Err(err)
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
