//! Per-backend registry entries and the retry policy applied to them.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::backend::ConnectionHandle;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Cooldown after the first failed start (doubles per consecutive failure).
pub const DEFAULT_BASE_COOLDOWN: Duration = Duration::from_secs(1);

/// Upper bound on the cooldown.
pub const DEFAULT_MAX_COOLDOWN: Duration = Duration::from_secs(60);

/// Consecutive failures before an entry needs an explicit reset.
pub const DEFAULT_MAX_SPAWN_ATTEMPTS: u32 = 5;

// ─── ConnectionState ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    NotStarted,
    Starting,
    Ready,
    Failed,
}

// ─── ServerEntry ─────────────────────────────────────────────────────────────

/// Registry state for one backend name.
///
/// Lives inside that backend's mutex; every field is only read or written
/// by a caller holding it.
pub struct ServerEntry {
    pub(crate) name: String,
    pub(crate) state: ConnectionState,
    pub(crate) connection: Option<ConnectionHandle>,
    /// Consecutive failures since the last successful start.
    pub(crate) failure_count: u32,
    pub(crate) last_failure: Option<Instant>,
    pub(crate) last_activity: Option<DateTime<Utc>>,
    pub(crate) last_error: Option<String>,
}

impl ServerEntry {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: ConnectionState::NotStarted,
            connection: None,
            failure_count: 0,
            last_failure: None,
            last_activity: None,
            last_error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub(crate) fn mark_ready(&mut self, connection: ConnectionHandle) {
        self.state = ConnectionState::Ready;
        self.connection = Some(connection);
        self.failure_count = 0;
        self.last_failure = None;
        self.last_error = None;
        self.touch();
    }

    /// Record a failed start or a lost connection, dropping any handle.
    pub(crate) fn mark_failed(&mut self, reason: &str) {
        self.state = ConnectionState::Failed;
        self.connection = None;
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure = Some(Instant::now());
        self.last_error = Some(reason.to_string());
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Some(Utc::now());
    }

    pub(crate) fn status(&self) -> ServerStatus {
        ServerStatus {
            name: self.name.clone(),
            state: Some(self.state),
            busy: false,
            failure_count: Some(self.failure_count),
            last_activity: self.last_activity,
            last_error: self.last_error.clone(),
        }
    }
}

impl std::fmt::Debug for ServerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerEntry")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("connected", &self.connection.is_some())
            .field("failure_count", &self.failure_count)
            .field("last_activity", &self.last_activity)
            .field("last_error", &self.last_error)
            .finish()
    }
}

// ─── RetryPolicy ─────────────────────────────────────────────────────────────

/// Backoff applied to connection establishment (never to tool calls).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_cooldown: Duration,
    pub max_cooldown: Duration,
    /// `0` disables the cap.
    pub max_spawn_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_cooldown: DEFAULT_BASE_COOLDOWN,
            max_cooldown: DEFAULT_MAX_COOLDOWN,
            max_spawn_attempts: DEFAULT_MAX_SPAWN_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Cooldown after `failures` consecutive failures:
    /// `min(base * 2^(failures - 1), max)`.
    pub fn cooldown_after(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (failures - 1).min(31);
        self.base_cooldown
            .saturating_mul(factor)
            .min(self.max_cooldown)
    }

    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_spawn_attempts > 0 && failures >= self.max_spawn_attempts
    }
}

// ─── ServerStatus ────────────────────────────────────────────────────────────

/// Point-in-time view of one entry.
///
/// An entry whose mutex is held at snapshot time reports `busy: true` and
/// leaves the remaining fields empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub state: Option<ConnectionState>,
    pub busy: bool,
    pub failure_count: Option<u32>,
    pub last_activity: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ServerStatus {
    pub(crate) fn busy(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: None,
            busy: true,
            failure_count: None,
            last_activity: None,
            last_error: None,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cooldown_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.cooldown_after(0), Duration::ZERO);
        assert_eq!(policy.cooldown_after(1), Duration::from_secs(1));
        assert_eq!(policy.cooldown_after(2), Duration::from_secs(2));
        assert_eq!(policy.cooldown_after(4), Duration::from_secs(8));
        assert_eq!(policy.cooldown_after(7), Duration::from_secs(60));
        assert_eq!(policy.cooldown_after(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_exhausted() {
        let policy = RetryPolicy::default();
        assert!(!policy.exhausted(4));
        assert!(policy.exhausted(5));

        let uncapped = RetryPolicy {
            max_spawn_attempts: 0,
            ..policy
        };
        assert!(!uncapped.exhausted(1000));
    }

    #[test]
    fn test_mark_failed_counts_and_clears_handle() {
        let mut entry = ServerEntry::new("serena");
        entry.mark_failed("exit status 1");
        entry.mark_failed("exit status 1");

        assert_eq!(entry.state(), ConnectionState::Failed);
        assert_eq!(entry.failure_count(), 2);
        assert!(entry.connection.is_none());
        assert!(entry.last_failure.is_some());
        assert_eq!(entry.last_error.as_deref(), Some("exit status 1"));
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let entry = ServerEntry::new("trello");
        let json = serde_json::to_value(entry.status()).unwrap();
        assert_eq!(json["state"], "not_started");
        assert_eq!(json["busy"], false);

        let busy = serde_json::to_value(ServerStatus::busy("trello")).unwrap();
        assert!(busy["state"].is_null());
        assert_eq!(busy["busy"], true);
    }
}
