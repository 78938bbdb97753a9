use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "fleet-broker")]
#[command(about = "Local coordination broker for a fleet of interactive CLI agents")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the broker: control socket, agent registry, delivery engine.
    Serve(ServeCommand),
    /// Internal: hosts one CLI agent inside a PTY and speaks the worker
    /// protocol on stdio. Spawned by the broker, not for direct use.
    #[command(hide = true)]
    Pty(PtyCommand),
    /// Internal: line-oriented worker runtime without a PTY.
    #[command(hide = true)]
    Headless(HeadlessCommand),
}

#[derive(Debug, clap::Args, Clone)]
pub struct ServeCommand {
    /// Control socket path. Overrides FLEET_SOCKET.
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Maximum frame body size in bytes.
    #[arg(long, default_value_t = 1_048_576)]
    pub max_frame_bytes: usize,

    /// Per-agent delivery queue depth.
    #[arg(long, default_value_t = 1_000)]
    pub queue_depth: usize,

    /// Injection attempts per delivery before it fails.
    #[arg(long, default_value_t = 3)]
    pub max_attempts: u32,

    /// Drop queued deliveries older than this many seconds (0 = disabled).
    #[arg(long, default_value_t = 0)]
    pub delivery_ttl_secs: u64,

    /// Default timeout for blocking sends.
    #[arg(long, default_value_t = 30_000)]
    pub ack_timeout_ms: u64,

    /// Grace period before workers are hard-killed.
    #[arg(long, default_value_t = 3_000)]
    pub shutdown_grace_ms: u64,

    /// Per-subscriber event fan-out depth.
    #[arg(long, default_value_t = 256)]
    pub event_depth: usize,

    #[arg(long, default_value_t = 64)]
    pub max_agents: usize,

    /// Default idle threshold for spawned agents (0 = disabled).
    #[arg(long, default_value_t = 30)]
    pub idle_threshold_secs: u64,

    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Working directory for spawned agents. Overrides FLEET_WORKSPACE.
    #[arg(long)]
    pub workspace: Option<PathBuf>,

    /// Fallback CLI for agent specs without one. Overrides FLEET_CLI.
    #[arg(long)]
    pub default_cli: Option<String>,
}

impl ServeCommand {
    pub fn socket_path(&self) -> PathBuf {
        if let Some(path) = &self.socket {
            return path.clone();
        }
        if let Some(path) = std::env::var_os("FLEET_SOCKET").filter(|v| !v.is_empty()) {
            return PathBuf::from(path);
        }
        dirs::runtime_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("fleet-broker.sock")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.socket_path().with_extension("pid")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.socket_path().with_extension("lock")
    }

    pub fn workspace_dir(&self) -> Option<PathBuf> {
        self.workspace.clone().or_else(|| {
            std::env::var_os("FLEET_WORKSPACE")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        })
    }

    pub fn fallback_cli(&self) -> Option<String> {
        self.default_cli.clone().or_else(|| {
            std::env::var("FLEET_CLI")
                .ok()
                .filter(|v| !v.trim().is_empty())
        })
    }

    /// Log filter: FLEET_LOG beats RUST_LOG beats --log-level.
    pub fn log_filter(&self) -> String {
        std::env::var("FLEET_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| self.log_level.clone())
    }
}

#[derive(Debug, clap::Args, Clone)]
pub struct PtyCommand {
    pub cli: String,

    #[arg(last = true)]
    pub args: Vec<String>,

    #[arg(long)]
    pub agent_name: Option<String>,

    /// Silence duration in seconds before emitting agent_idle (0 = disabled).
    #[arg(long, default_value_t = 30)]
    pub idle_threshold_secs: u64,

    #[arg(long)]
    pub rows: Option<u16>,

    #[arg(long)]
    pub cols: Option<u16>,

    #[arg(long)]
    pub cwd: Option<String>,
}

#[derive(Debug, clap::Args, Clone)]
pub struct HeadlessCommand {
    pub cli: String,

    #[arg(last = true)]
    pub args: Vec<String>,

    #[arg(long)]
    pub agent_name: Option<String>,

    #[arg(long)]
    pub cwd: Option<String>,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, Commands};

    #[test]
    fn serve_defaults_match_contract() {
        let cli = Cli::parse_from(["fleet-broker", "serve"]);
        let Commands::Serve(cmd) = cli.command else {
            panic!("expected serve subcommand");
        };
        assert_eq!(cmd.max_frame_bytes, 1_048_576);
        assert_eq!(cmd.queue_depth, 1_000);
        assert_eq!(cmd.max_attempts, 3);
        assert_eq!(cmd.ack_timeout_ms, 30_000);
        assert_eq!(cmd.shutdown_grace_ms, 3_000);
        assert_eq!(cmd.delivery_ttl_secs, 0);
        assert_eq!(cmd.event_depth, 256);
        assert_eq!(cmd.max_agents, 64);
    }

    #[test]
    fn pty_subcommand_parses_trailing_args() {
        let cli = Cli::parse_from([
            "fleet-broker",
            "pty",
            "--agent-name",
            "Worker1",
            "claude",
            "--",
            "--verbose",
        ]);
        let Commands::Pty(cmd) = cli.command else {
            panic!("expected pty subcommand");
        };
        assert_eq!(cmd.cli, "claude");
        assert_eq!(cmd.agent_name.as_deref(), Some("Worker1"));
        assert_eq!(cmd.args, vec!["--verbose"]);
        assert_eq!(cmd.idle_threshold_secs, 30);
    }

    #[test]
    fn socket_path_prefers_explicit_flag() {
        let cli = Cli::parse_from(["fleet-broker", "serve", "--socket", "/tmp/x.sock"]);
        let Commands::Serve(cmd) = cli.command else {
            panic!("expected serve subcommand");
        };
        assert_eq!(cmd.socket_path().to_str(), Some("/tmp/x.sock"));
        assert_eq!(cmd.pid_path().to_str(), Some("/tmp/x.pid"));
    }
}
