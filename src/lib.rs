pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod hierarchy;
pub mod policy;
pub mod registry;
pub mod server;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use backend::{BackendConnector, McpConnector};
use config::GatewayConfig;
use dispatcher::Dispatcher;
use hierarchy::HierarchyStore;
use policy::{NoopPolicy, PolicyHook};
use registry::ServerRegistry;
use server::GatewayServer;

/// Command-line arguments for the gateway binary.
#[derive(Debug, Clone, Parser)]
#[command(name = "hierarchy-gateway")]
#[command(about = "Browse and invoke MCP backend tools through a category hierarchy", long_about = None)]
#[command(version)]
#[command(
    after_help = "A backend that fails to start `retry.max_spawn_attempts` times in a row \
                  stays disabled until the gateway is restarted (0 disables the cap)."
)]
pub struct Cli {
    /// Gateway settings file (YAML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Hierarchy file (overrides the settings file)
    #[arg(long)]
    pub hierarchy: Option<PathBuf>,

    /// Backend servers file (overrides the settings file)
    #[arg(long)]
    pub servers: Option<PathBuf>,

    /// Log to stderr instead of the rotating log file
    #[arg(long)]
    pub log_stderr: bool,
}

/// Return the platform-standard data directory for the gateway.
///
/// - macOS: `~/Library/Application Support/hierarchy-gateway/`
/// - Windows: `{FOLDERID_RoamingAppData}\hierarchy-gateway\`
/// - Linux: `$XDG_DATA_HOME/hierarchy-gateway/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.hierarchy-gateway/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("hierarchy-gateway");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".hierarchy-gateway")
}

/// Load configuration, build the gateway and serve the agent on stdio
/// until stdin closes.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let log_path = init_tracing(cli.log_stderr)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        log_file = %log_path.as_deref().map(|p| p.display().to_string()).unwrap_or_else(|| "stderr".into()),
        "=== hierarchy-gateway starting ==="
    );

    let mut settings = match &cli.config {
        Some(path) => config::load_gateway_config(path)?,
        None => GatewayConfig::default(),
    };
    if cli.hierarchy.is_some() {
        settings.hierarchy = cli.hierarchy.clone();
    }
    if cli.servers.is_some() {
        settings.servers = cli.servers.clone();
    }

    let hierarchy_path = settings
        .hierarchy
        .clone()
        .context("no hierarchy file: pass --hierarchy or set `hierarchy` in the settings file")?;
    let servers_path = settings
        .servers
        .clone()
        .context("no servers file: pass --servers or set `servers` in the settings file")?;

    let hierarchy = Arc::new(HierarchyStore::load(&hierarchy_path)?);
    let backends = config::load_backends_config(&servers_path)?;

    let missing: Vec<String> = hierarchy
        .server_names()
        .into_iter()
        .filter(|name| !backends.servers.contains_key(name))
        .collect();
    if !missing.is_empty() {
        tracing::warn!(
            servers = ?missing,
            "hierarchy references servers with no configuration, their tools will fail"
        );
    }

    let connector: Arc<dyn BackendConnector> = Arc::new(McpConnector::new(
        settings.init_timeout(),
        settings.verify_tools,
    ));
    let registry = Arc::new(ServerRegistry::new(
        backends.servers,
        connector,
        settings.retry.policy(),
    ));
    let dispatcher = Dispatcher::new(hierarchy, registry, settings.call_timeout());

    let policy: Arc<dyn PolicyHook> = if settings.hooks.is_empty() {
        Arc::new(NoopPolicy)
    } else {
        tracing::info!(fail_open = settings.hooks.fail_open, "policy hooks enabled");
        Arc::new(settings.hooks.command_hook())
    };

    tracing::info!(
        tools = dispatcher.hierarchy().tool_count(),
        servers = dispatcher.registry().configured_servers().len(),
        call_timeout_ms = settings.call_timeout_ms,
        "gateway ready, serving on stdio"
    );

    let server = Arc::new(GatewayServer::new(dispatcher, policy));
    server
        .serve(tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("stdio transport failed")?;
    Ok(())
}

/// Initialize the tracing subscriber.
///
/// Stdout carries protocol traffic, so logs go either to stderr or to
/// `gateway.log` in the data directory. On each start the file sink rotates
/// existing logs (gateway.log → gateway.log.1 → .2 → .3, keeps last 3) and
/// opens a fresh file with a line-flushing writer. Returns the log path when
/// logging to a file.
fn init_tracing(log_to_stderr: bool) -> anyhow::Result<Option<PathBuf>> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("hierarchy_gateway=info,warn"));

    if log_to_stderr {
        fmt::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .with_target(true)
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;
        return Ok(None);
    }

    let log_dir = data_dir();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create {}", log_dir.display()))?;

    let log_path = log_dir.join("gateway.log");
    rotate_log_file(&log_path, 3);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;

    fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;

    Ok(Some(log_path))
}

/// Rotate log files: `gateway.log` → `gateway.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// Each log line reaches the file immediately, so the tail of the log
/// survives a killed process.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_rotate_log_file_shifts_and_drops_oldest() {
        let dir = tempfile::TempDir::new().unwrap();
        let base = dir.path().join("gateway.log");
        let path_n = |n: u32| PathBuf::from(format!("{}.{n}", base.display()));

        std::fs::write(&base, "current").unwrap();
        std::fs::write(path_n(1), "one").unwrap();
        std::fs::write(path_n(3), "three").unwrap();

        rotate_log_file(&base, 3);

        assert!(!base.exists());
        assert_eq!(std::fs::read_to_string(path_n(1)).unwrap(), "current");
        assert_eq!(std::fs::read_to_string(path_n(2)).unwrap(), "one");
        assert!(!path_n(3).exists());
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out.log");
        let file = std::fs::File::create(&path).unwrap();

        let mut writer = FlushingWriter::new(file);
        writer.write_all(b"line one\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line one\n");
    }

    #[test]
    fn test_cli_parses_overrides() {
        let cli = Cli::parse_from([
            "hierarchy-gateway",
            "--config",
            "gateway.yaml",
            "--servers",
            "servers.json",
            "--log-stderr",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("gateway.yaml")));
        assert_eq!(cli.servers, Some(PathBuf::from("servers.json")));
        assert!(cli.hierarchy.is_none());
        assert!(cli.log_stderr);
    }

    #[test]
    fn test_data_dir_is_named() {
        assert!(data_dir().ends_with("hierarchy-gateway") || data_dir().ends_with(".hierarchy-gateway"));
    }
}
