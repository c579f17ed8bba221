//! Configuration loading — gateway settings (YAML) and backend definitions (JSON).
//!
//! Both are read once at startup. `${VAR}` and `${VAR:-default}` references
//! are expanded from the environment: over the whole settings text, and over
//! `env`/`headers` values of each backend entry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::backend::{BackendConfig, BackendsConfig};
use crate::errors::GatewayError;
use crate::policy::{CommandHook, HookCommand, HookFailurePolicy, DEFAULT_HOOK_TIMEOUT};
use crate::registry::RetryPolicy;

// ─── Gateway settings ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Persisted hierarchy file.
    pub hierarchy: Option<PathBuf>,
    /// Backend definitions file.
    pub servers: Option<PathBuf>,
    pub call_timeout_ms: u64,
    pub init_timeout_ms: u64,
    /// Fetch `tools/list` from each backend on start.
    pub verify_tools: bool,
    pub retry: RetryConfig,
    pub hooks: HooksConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            hierarchy: None,
            servers: None,
            call_timeout_ms: 60_000,
            init_timeout_ms: 30_000,
            verify_tools: false,
            retry: RetryConfig::default(),
            hooks: HooksConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    fn validate(&self) -> Result<(), GatewayError> {
        if self.call_timeout_ms == 0 {
            return Err(config_error("call_timeout_ms must be greater than 0"));
        }
        if self.init_timeout_ms == 0 {
            return Err(config_error("init_timeout_ms must be greater than 0"));
        }
        if self.retry.max_cooldown_ms < self.retry.base_cooldown_ms {
            return Err(config_error(
                "retry.max_cooldown_ms must not be less than retry.base_cooldown_ms",
            ));
        }
        for hook in [&self.hooks.pre_execute, &self.hooks.post_execute]
            .into_iter()
            .flatten()
        {
            if hook.command.trim().is_empty() {
                return Err(config_error("hook command must not be empty"));
            }
        }
        Ok(())
    }

    /// Resolve relative paths against the directory holding the settings file.
    fn resolve_paths(&mut self, base: &Path) {
        for path in [&mut self.hierarchy, &mut self.servers].into_iter().flatten() {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_cooldown_ms: u64,
    pub max_cooldown_ms: u64,
    /// Consecutive start failures before an explicit reset is needed; 0 = no cap.
    pub max_spawn_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            base_cooldown_ms: policy.base_cooldown.as_millis() as u64,
            max_cooldown_ms: policy.max_cooldown.as_millis() as u64,
            max_spawn_attempts: policy.max_spawn_attempts,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_cooldown: Duration::from_millis(self.base_cooldown_ms),
            max_cooldown: Duration::from_millis(self.max_cooldown_ms),
            max_spawn_attempts: self.max_spawn_attempts,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    pub pre_execute: Option<HookCommandConfig>,
    pub post_execute: Option<HookCommandConfig>,
    /// Allow executions when a hook itself fails (default: deny).
    pub fail_open: bool,
}

impl HooksConfig {
    pub fn is_empty(&self) -> bool {
        self.pre_execute.is_none() && self.post_execute.is_none()
    }

    pub fn command_hook(&self) -> CommandHook {
        let failure_policy = if self.fail_open {
            HookFailurePolicy::FailOpen
        } else {
            HookFailurePolicy::FailClosed
        };
        CommandHook::new(
            self.pre_execute.as_ref().map(HookCommandConfig::command),
            self.post_execute.as_ref().map(HookCommandConfig::command),
            failure_policy,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HookCommandConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl HookCommandConfig {
    fn command(&self) -> HookCommand {
        HookCommand {
            command: self.command.clone(),
            args: self.args.clone(),
            timeout: self
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_HOOK_TIMEOUT),
        }
    }
}

/// Load gateway settings from a YAML (or JSON) file.
pub fn load_gateway_config(path: &Path) -> Result<GatewayConfig, GatewayError> {
    let raw = read_file(path)?;
    let interpolated = interpolate_env_vars(&raw);

    let mut config: GatewayConfig = if interpolated.trim().is_empty() {
        GatewayConfig::default()
    } else {
        serde_yaml::from_str(&interpolated).map_err(|e| GatewayError::ConfigError {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?
    };

    if let Some(base) = path.parent() {
        config.resolve_paths(base);
    }
    config.validate()?;
    Ok(config)
}

// ─── Backend definitions ─────────────────────────────────────────────────────

/// Load backend definitions from a JSON file of the form
/// `{"servers": {"<name>": {...}}}`.
pub fn load_backends_config(path: &Path) -> Result<BackendsConfig, GatewayError> {
    let raw = read_file(path)?;
    let mut config: BackendsConfig =
        serde_json::from_str(&raw).map_err(|e| GatewayError::ConfigError {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?;

    for (name, backend) in config.servers.iter_mut() {
        interpolate_backend(backend);
        backend
            .transport_kind()
            .map_err(|e| GatewayError::ConfigError {
                reason: format!("server '{name}': {e}"),
            })?;
    }

    tracing::debug!(path = %path.display(), servers = config.servers.len(), "backends loaded");
    Ok(config)
}

fn interpolate_backend(backend: &mut BackendConfig) {
    interpolate_values(&mut backend.env);
    interpolate_values(&mut backend.headers);
}

fn interpolate_values(values: &mut HashMap<String, String>) {
    for value in values.values_mut() {
        if value.contains("${") {
            *value = interpolate_env_vars(value);
        }
    }
}

fn read_file(path: &Path) -> Result<String, GatewayError> {
    std::fs::read_to_string(path).map_err(|e| GatewayError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })
}

fn config_error(reason: &str) -> GatewayError {
    GatewayError::ConfigError {
        reason: reason.to_string(),
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` with environment values.
///
/// Unset variables without a default expand to the empty string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut expr = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '}' {
                    closed = true;
                    break;
                }
                expr.push(c);
            }
            if closed {
                result.push_str(&resolve_var_expr(&expr));
            } else {
                // Unterminated reference, keep it literally.
                result.push_str("${");
                result.push_str(&expr);
            }
        } else {
            result.push(ch);
        }
    }

    result
}

fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => match std::env::var(name) {
            Ok(value) if !value.is_empty() => value,
            _ => expand_tilde(default),
        },
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
