//! Server registry — one lazily-started connection per backend name.
//!
//! The name→entry map is guarded by a short std mutex used only for
//! check-then-insert. All connection work happens under the per-name async
//! mutex handed out by [`ServerRegistry::client_mutex`], so operations on one
//! backend are serialized while distinct backends run in parallel.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Instant;

use crate::backend::{BackendConfig, BackendConnector, ConnectionHandle, ConnectorError};
use crate::errors::GatewayError;

use super::entry::{ConnectionState, RetryPolicy, ServerEntry, ServerStatus};

/// The serialization mutex for one backend.
pub type ClientMutex = tokio::sync::Mutex<ServerEntry>;

// ─── ServerRegistry ──────────────────────────────────────────────────────────

pub struct ServerRegistry {
    entries: StdMutex<HashMap<String, Arc<ClientMutex>>>,
    configs: HashMap<String, BackendConfig>,
    connector: Arc<dyn BackendConnector>,
    retry: RetryPolicy,
}

impl ServerRegistry {
    pub fn new(
        configs: HashMap<String, BackendConfig>,
        connector: Arc<dyn BackendConnector>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            entries: StdMutex::new(HashMap::new()),
            configs,
            connector,
            retry,
        }
    }

    /// Return the mutex for `name`, creating a `NotStarted` entry on first use.
    ///
    /// Every call with the same name yields the same `Arc`.
    pub fn client_mutex(&self, name: &str) -> Arc<ClientMutex> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = entries.get(name) {
            return Arc::clone(existing);
        }

        tracing::debug!(server = %name, "creating registry entry");
        let created = Arc::new(ClientMutex::new(ServerEntry::new(name)));
        entries.insert(name.to_string(), Arc::clone(&created));
        created
    }

    /// Return the entry's live connection, starting it if needed.
    ///
    /// Takes the locked entry, so the caller necessarily holds the backend's
    /// mutex for the whole establishment.
    pub async fn get_or_create_connection<'e>(
        &self,
        entry: &'e mut ServerEntry,
    ) -> Result<&'e mut ConnectionHandle, GatewayError> {
        let ready = entry.state == ConnectionState::Ready && entry.connection.is_some();
        if !ready {
            self.establish(entry).await?;
        }

        match entry.connection.as_mut() {
            Some(connection) => Ok(connection),
            None => Err(GatewayError::ServerUnavailable {
                server: entry.name.clone(),
                reason: "connection missing after start".into(),
                retry_after_ms: None,
            }),
        }
    }

    async fn establish(&self, entry: &mut ServerEntry) -> Result<(), GatewayError> {
        match entry.state {
            ConnectionState::Starting => {
                // A previous start was cancelled mid-flight.
                tracing::warn!(server = %entry.name, "found abandoned start, retrying");
                entry.state = ConnectionState::NotStarted;
            }
            ConnectionState::Ready => entry.state = ConnectionState::NotStarted,
            ConnectionState::NotStarted | ConnectionState::Failed => {}
        }

        self.check_cooldown(entry)?;

        let Some(config) = self.configs.get(&entry.name) else {
            let reason = "no backend configuration for this server".to_string();
            entry.mark_failed(&reason);
            tracing::warn!(server = %entry.name, "call routed to unconfigured server");
            self.warn_if_exhausted(entry);
            return Err(GatewayError::ServerSpawnFailed {
                server: entry.name.clone(),
                reason,
            });
        };

        entry.state = ConnectionState::Starting;
        let started = Instant::now();
        tracing::info!(server = %entry.name, attempt = entry.failure_count + 1, "starting backend");

        match self.connector.start(&entry.name, config).await {
            Ok(connection) => {
                entry.mark_ready(connection);
                tracing::info!(
                    server = %entry.name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "backend ready"
                );
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                entry.mark_failed(&reason);
                tracing::error!(
                    server = %entry.name,
                    failures = entry.failure_count,
                    error = %reason,
                    "backend failed to start"
                );
                self.warn_if_exhausted(entry);
                Err(GatewayError::ServerSpawnFailed {
                    server: entry.name.clone(),
                    reason,
                })
            }
        }
    }

    /// Fail fast while a failed entry is cooling down or out of attempts.
    fn check_cooldown(&self, entry: &ServerEntry) -> Result<(), GatewayError> {
        if entry.state != ConnectionState::Failed {
            return Ok(());
        }
        let last_error = entry.last_error.as_deref().unwrap_or("unknown error");

        if self.retry.exhausted(entry.failure_count) {
            return Err(GatewayError::ServerUnavailable {
                server: entry.name.clone(),
                reason: format!(
                    "gave up after {} consecutive failures, reset required (last error: {last_error})",
                    entry.failure_count
                ),
                retry_after_ms: None,
            });
        }

        let cooldown = self.retry.cooldown_after(entry.failure_count);
        let elapsed = entry
            .last_failure
            .map(|at| at.elapsed())
            .unwrap_or(cooldown);
        if elapsed < cooldown {
            let remaining = cooldown - elapsed;
            return Err(GatewayError::ServerUnavailable {
                server: entry.name.clone(),
                reason: format!("cooling down after failure: {last_error}"),
                retry_after_ms: Some(remaining.as_millis().max(1) as u64),
            });
        }
        Ok(())
    }

    /// Update the entry after one tool call on its connection.
    ///
    /// A lost connection drops the handle and counts as a failure, and so
    /// does a timeout that left the connection unusable. Any other outcome
    /// (including a plain timeout) keeps the connection.
    pub fn record_call(
        &self,
        entry: &mut ServerEntry,
        outcome: &Result<serde_json::Value, ConnectorError>,
    ) {
        match outcome {
            Err(e) if e.is_connection_lost() => {
                let reason = e.to_string();
                entry.mark_failed(&reason);
                tracing::warn!(server = %entry.name, error = %reason, "backend connection lost");
                self.warn_if_exhausted(entry);
            }
            Err(e) if entry.connection.as_ref().is_some_and(|c| c.is_broken()) => {
                let reason = format!("connection unusable after interrupted call: {e}");
                entry.mark_failed(&reason);
                tracing::warn!(server = %entry.name, error = %reason, "dropping broken backend connection");
                self.warn_if_exhausted(entry);
            }
            _ => entry.touch(),
        }
    }

    /// Log once an entry has used up its start attempts. Returns whether it has.
    fn warn_if_exhausted(&self, entry: &ServerEntry) -> bool {
        let exhausted = self.retry.exhausted(entry.failure_count);
        if exhausted {
            tracing::warn!(
                server = %entry.name,
                failures = entry.failure_count,
                "backend disabled after repeated failures, calls fail until it is reset or the gateway restarts"
            );
        }
        exhausted
    }

    /// Clear a failed entry so the next call starts it again.
    ///
    /// Returns `false` when no entry exists for `name`.
    pub async fn reset(&self, name: &str) -> bool {
        let existing = {
            let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.get(name).cloned()
        };
        let Some(mutex) = existing else {
            return false;
        };

        let mut entry = mutex.lock().await;
        if entry.state != ConnectionState::Ready {
            entry.state = ConnectionState::NotStarted;
            entry.connection = None;
        }
        entry.failure_count = 0;
        entry.last_failure = None;
        entry.last_error = None;
        tracing::info!(server = %name, "registry entry reset");
        true
    }

    /// Shut every live connection down, each under its own mutex.
    pub async fn shutdown(&self) {
        let mutexes: Vec<Arc<ClientMutex>> = {
            let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.values().cloned().collect()
        };

        futures::future::join_all(mutexes.iter().map(|mutex| async move {
            let mut entry = mutex.lock().await;
            if let Some(mut connection) = entry.connection.take() {
                tracing::info!(server = %entry.name, "shutting down backend");
                connection.shutdown().await;
            }
            entry.state = ConnectionState::NotStarted;
        }))
        .await;
    }

    /// Snapshot of all entries, sorted by name, without waiting on busy ones.
    pub fn status(&self) -> Vec<ServerStatus> {
        let mutexes: Vec<(String, Arc<ClientMutex>)> = {
            let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries
                .iter()
                .map(|(name, mutex)| (name.clone(), Arc::clone(mutex)))
                .collect()
        };

        let mut statuses: Vec<ServerStatus> = mutexes
            .iter()
            .map(|(name, mutex)| match mutex.try_lock() {
                Ok(entry) => entry.status(),
                Err(_) => ServerStatus::busy(name),
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Names with a backend configuration.
    pub fn configured_servers(&self) -> BTreeSet<String> {
        self.configs.keys().cloned().collect()
    }

    pub fn is_configured(&self, name: &str) -> bool {
        self.configs.contains_key(name)
    }
}

impl std::fmt::Debug for ServerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRegistry")
            .field("configured", &self.configured_servers())
            .field("retry", &self.retry)
            .finish()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
