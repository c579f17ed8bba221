//! Policy hooks run by the host around `execute_tool`.
//!
//! The dispatcher never consults a policy. The host asks the configured
//! [`PolicyHook`] before each execution and notifies it afterwards, handing
//! over the `tool_path` and `arguments` exactly as the agent sent them.
//!
//! [`CommandHook`] runs an external command per event with the event JSON on
//! stdin. Exit codes:
//! - 0: allow (stdout may carry `{"decision": "allow"|"deny"|"ask", "reason": ...}`)
//! - 2: deny, with stderr as the reason
//! - anything else: hook failure, resolved by the failure policy

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::errors::GatewayError;

/// Cap on captured hook stdout/stderr.
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Default per-hook deadline.
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(10);

// ─── Types ───────────────────────────────────────────────────────────────────

/// One `execute_tool` request as seen by the policy.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInvocation {
    pub call_id: String,
    pub tool_path: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny { reason: String },
    /// The policy wants a human to confirm.
    Ask { reason: String },
}

#[async_trait]
pub trait PolicyHook: Send + Sync {
    async fn before_execute(&self, invocation: &ToolInvocation) -> PolicyDecision;

    async fn after_execute(
        &self,
        _invocation: &ToolInvocation,
        _outcome: &Result<serde_json::Value, GatewayError>,
    ) {
    }
}

/// Allows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPolicy;

#[async_trait]
impl PolicyHook for NoopPolicy {
    async fn before_execute(&self, _invocation: &ToolInvocation) -> PolicyDecision {
        PolicyDecision::Allow
    }
}

// ─── CommandHook ─────────────────────────────────────────────────────────────

/// How a hook that crashes, times out or answers garbage is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookFailurePolicy {
    /// Deny the execution.
    #[default]
    FailClosed,
    /// Allow the execution and log the failure.
    FailOpen,
}

impl HookFailurePolicy {
    fn resolve(self, message: String) -> PolicyDecision {
        match self {
            HookFailurePolicy::FailClosed => PolicyDecision::Deny {
                reason: format!("policy hook failed: {message}"),
            },
            HookFailurePolicy::FailOpen => {
                tracing::warn!(error = %message, "policy hook failed, allowing (fail-open)");
                PolicyDecision::Allow
            }
        }
    }
}

/// An external command run for one hook event.
#[derive(Debug, Clone)]
pub struct HookCommand {
    pub command: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

/// Policy backed by external commands.
#[derive(Debug, Clone, Default)]
pub struct CommandHook {
    pre_execute: Option<HookCommand>,
    post_execute: Option<HookCommand>,
    failure_policy: HookFailurePolicy,
}

#[derive(Debug, Serialize)]
struct HookEvent<'a> {
    event: &'static str,
    call_id: &'a str,
    tool_path: &'a str,
    arguments: &'a serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct HookVerdict {
    decision: VerdictKind,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum VerdictKind {
    Allow,
    Deny,
    Ask,
}

struct HookOutput {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

impl CommandHook {
    pub fn new(
        pre_execute: Option<HookCommand>,
        post_execute: Option<HookCommand>,
        failure_policy: HookFailurePolicy,
    ) -> Self {
        Self {
            pre_execute,
            post_execute,
            failure_policy,
        }
    }

    fn interpret(&self, output: HookOutput) -> PolicyDecision {
        match output.exit_code {
            0 => self.parse_verdict(&output.stdout),
            2 => {
                let reason = output.stderr.trim();
                PolicyDecision::Deny {
                    reason: if reason.is_empty() {
                        "denied by policy hook".to_string()
                    } else {
                        reason.to_string()
                    },
                }
            }
            code => {
                let stderr = output.stderr.trim();
                let message = if stderr.is_empty() {
                    format!("hook exited with code {code}")
                } else {
                    format!("hook exited with code {code}: {stderr}")
                };
                self.failure_policy.resolve(message)
            }
        }
    }

    /// Empty stdout from a hook that exited 0 is an allow.
    fn parse_verdict(&self, stdout: &str) -> PolicyDecision {
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return PolicyDecision::Allow;
        }

        match serde_json::from_str::<HookVerdict>(trimmed) {
            Ok(verdict) => {
                let reason = verdict.reason.unwrap_or_default();
                match verdict.decision {
                    VerdictKind::Allow => PolicyDecision::Allow,
                    VerdictKind::Deny => PolicyDecision::Deny { reason },
                    VerdictKind::Ask => PolicyDecision::Ask { reason },
                }
            }
            Err(e) => self
                .failure_policy
                .resolve(format!("hook produced invalid JSON: {e}")),
        }
    }
}

#[async_trait]
impl PolicyHook for CommandHook {
    async fn before_execute(&self, invocation: &ToolInvocation) -> PolicyDecision {
        let Some(hook) = &self.pre_execute else {
            return PolicyDecision::Allow;
        };

        let event = HookEvent {
            event: "pre_execute",
            call_id: &invocation.call_id,
            tool_path: &invocation.tool_path,
            arguments: &invocation.arguments,
            outcome: None,
        };

        match run_hook(hook, &event).await {
            Ok(output) => {
                let decision = self.interpret(output);
                tracing::debug!(
                    call_id = %invocation.call_id,
                    tool_path = %invocation.tool_path,
                    decision = ?decision,
                    "pre-execute hook decided"
                );
                decision
            }
            Err(message) => self.failure_policy.resolve(message),
        }
    }

    async fn after_execute(
        &self,
        invocation: &ToolInvocation,
        outcome: &Result<serde_json::Value, GatewayError>,
    ) {
        let Some(hook) = &self.post_execute else {
            return;
        };

        let outcome = match outcome {
            Ok(result) => serde_json::json!({"ok": true, "result": result}),
            Err(e) => serde_json::json!({
                "ok": false,
                "error": {"kind": e.kind(), "message": e.to_string()},
            }),
        };
        let event = HookEvent {
            event: "post_execute",
            call_id: &invocation.call_id,
            tool_path: &invocation.tool_path,
            arguments: &invocation.arguments,
            outcome: Some(outcome),
        };

        match run_hook(hook, &event).await {
            Ok(output) if output.exit_code == 0 => {}
            Ok(output) => tracing::warn!(
                call_id = %invocation.call_id,
                exit_code = output.exit_code,
                stderr = %truncate(output.stderr.trim(), 500),
                "post-execute hook failed"
            ),
            Err(message) => tracing::warn!(
                call_id = %invocation.call_id,
                error = %message,
                "post-execute hook failed"
            ),
        }
    }
}

/// Spawn the hook, write the event to stdin and collect its output.
async fn run_hook(hook: &HookCommand, event: &HookEvent<'_>) -> Result<HookOutput, String> {
    let payload =
        serde_json::to_vec(event).map_err(|e| format!("failed to serialize hook event: {e}"))?;

    let mut child = Command::new(&hook.command)
        .args(&hook.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn hook '{}': {e}", hook.command))?;

    // Feeding stdin and collecting output share one deadline: a hook that
    // never reads blocks the write once the pipe buffer is full.
    let stdin = child.stdin.take();
    let run = async move {
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A hook that ignores its input may already have exited.
                let _ = stdin.write_all(&payload).await;
            }
        };
        let ((), output) = tokio::join!(feed, child.wait_with_output());
        output
    };

    let output = tokio::time::timeout(hook.timeout, run)
        .await
        .map_err(|_| format!("hook timed out after {}ms", hook.timeout.as_millis()))?
        .map_err(|e| format!("failed to wait for hook: {e}"))?;

    Ok(HookOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: lossy_prefix(&output.stdout),
        stderr: lossy_prefix(&output.stderr),
    })
}

fn lossy_prefix(bytes: &[u8]) -> String {
    let end = bytes.len().min(MAX_OUTPUT_BYTES);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn truncate(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ─── Tests ───────────────────────────────────────────────────────────────────
