use std::{
    collections::HashMap,
    path::PathBuf,
    process::Stdio,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
    sync::mpsc,
    time::timeout,
};

use crate::{
    channels::ChannelIndex,
    protocol::{AgentRuntime, AgentSpec, ProtocolEnvelope, PROTOCOL_VERSION},
    router::RoutingAgent,
};

#[cfg(unix)]
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Spawning,
    Ready,
    Active,
    Idle,
    Releasing,
}

#[derive(Debug)]
pub struct WorkerHandle {
    pub spec: AgentSpec,
    pub parent: Option<String>,
    pub child: Child,
    pub stdin: ChildStdin,
    pub spawned_at: Instant,
    pub state: AgentState,
    pub last_activity: Instant,
}

/// Anything a worker process says to the broker: a protocol frame on stdout,
/// or a raw line that was not a frame (streamed through as output).
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Frame {
        name: String,
        frame: ProtocolEnvelope<Value>,
    },
    Stream {
        name: String,
        stream: &'static str,
        chunk: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("agent '{0}' already exists")]
    AgentExists(String),
    #[error("invalid agent spec: {0}")]
    InvalidSpec(String),
    #[error("agent limit of {0} reached")]
    AgentLimit(usize),
    #[error("failed to spawn worker: {0}")]
    Failed(#[from] anyhow::Error),
}

/// Exclusive owner of worker handles. All mutations go through the broker
/// core task, which keeps spawn/release invariants without locks.
pub struct AgentRegistry {
    workers: HashMap<String, WorkerHandle>,
    /// Spawn order, for deterministic broadcast fan-out.
    order: Vec<String>,
    event_tx: mpsc::Sender<WorkerEvent>,
    workspace: Option<PathBuf>,
    fallback_cli: Option<String>,
    max_agents: usize,
    default_idle_threshold_secs: u64,
}

impl AgentRegistry {
    pub fn new(
        event_tx: mpsc::Sender<WorkerEvent>,
        workspace: Option<PathBuf>,
        fallback_cli: Option<String>,
        max_agents: usize,
        default_idle_threshold_secs: u64,
    ) -> Self {
        Self {
            workers: HashMap::new(),
            order: Vec::new(),
            event_tx,
            workspace,
            fallback_cli,
            max_agents,
            default_idle_threshold_secs,
        }
    }

    pub fn has_worker(&self, name: &str) -> bool {
        self.workers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn worker_pid(&self, name: &str) -> Option<u32> {
        self.workers.get(name).and_then(|h| h.child.id())
    }

    pub fn get(&self, name: &str) -> Option<&WorkerHandle> {
        self.workers.get(name)
    }

    pub fn runtime_of(&self, name: &str) -> Option<AgentRuntime> {
        self.workers.get(name).map(|h| h.spec.runtime)
    }

    pub fn set_state(&mut self, name: &str, state: AgentState) {
        if let Some(handle) = self.workers.get_mut(name) {
            handle.state = state;
        }
    }

    pub fn touch(&mut self, name: &str) {
        if let Some(handle) = self.workers.get_mut(name) {
            handle.last_activity = Instant::now();
            if handle.state == AgentState::Idle {
                handle.state = AgentState::Active;
            }
        }
    }

    /// Names in spawn order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn routing_agents(&self) -> Vec<RoutingAgent<'_>> {
        self.order
            .iter()
            .filter_map(|name| self.workers.get(name).map(|handle| (name, handle)))
            .map(|(name, handle)| RoutingAgent {
                name,
                parent: handle.parent.as_deref(),
            })
            .collect()
    }

    pub fn list(&self, channels: &ChannelIndex) -> Vec<Value> {
        self.order
            .iter()
            .filter_map(|name| self.workers.get(name).map(|handle| (name, handle)))
            .map(|(name, handle)| {
                json!({
                    "name": name,
                    "runtime": handle.spec.runtime,
                    "cli": handle.spec.cli,
                    "channels": channels.channels_of(name),
                    "parent": handle.parent,
                    "pid": handle.child.id(),
                    "state": handle.state,
                    "uptime_secs": handle.spawned_at.elapsed().as_secs(),
                })
            })
            .collect()
    }

    pub async fn spawn(&mut self, mut spec: AgentSpec, parent: Option<String>) -> Result<u32, SpawnError> {
        let name = spec.name.trim().to_string();
        if name.is_empty() {
            return Err(SpawnError::InvalidSpec("agent name is empty".into()));
        }
        if name.contains(['/', '\\', '\0', '#', '*', '@']) {
            return Err(SpawnError::InvalidSpec(format!(
                "agent name '{name}' contains reserved characters"
            )));
        }
        if self.workers.contains_key(&name) {
            return Err(SpawnError::AgentExists(name));
        }
        if self.workers.len() >= self.max_agents {
            return Err(SpawnError::AgentLimit(self.max_agents));
        }
        spec.name = name.clone();

        if spec.cli.is_none() {
            spec.cli = self.fallback_cli.clone();
        }
        let cli = spec
            .cli
            .clone()
            .ok_or_else(|| SpawnError::InvalidSpec("runtime requires `cli`".into()))?;

        tracing::info!(
            target = "fleet::spawn",
            name = %spec.name,
            cli = %cli,
            runtime = ?spec.runtime,
            parent = ?parent,
            cwd = ?spec.cwd,
            "spawning worker"
        );

        let exe = std::env::current_exe()
            .context("failed to locate current executable")
            .map_err(SpawnError::Failed)?;
        let mut command = Command::new(exe);

        match spec.runtime {
            AgentRuntime::Pty => {
                command.arg("pty");
                command.arg("--agent-name").arg(&spec.name);
                let idle = spec
                    .idle_threshold_secs
                    .unwrap_or(self.default_idle_threshold_secs);
                command.arg("--idle-threshold-secs").arg(idle.to_string());
                if let Some(rows) = spec.rows {
                    command.arg("--rows").arg(rows.to_string());
                }
                if let Some(cols) = spec.cols {
                    command.arg("--cols").arg(cols.to_string());
                }
                if let Some(cwd) = self.effective_cwd(&spec) {
                    command.arg("--cwd").arg(cwd);
                }
                command.arg(&cli);
                if !spec.args.is_empty() {
                    command.arg("--");
                    for arg in &spec.args {
                        command.arg(arg);
                    }
                }
            }
            AgentRuntime::Headless => {
                command.arg("headless");
                command.arg("--agent-name").arg(&spec.name);
                if let Some(cwd) = self.effective_cwd(&spec) {
                    command.arg("--cwd").arg(cwd);
                }
                command.arg(&cli);
                if !spec.args.is_empty() {
                    command.arg("--");
                    for arg in &spec.args {
                        command.arg(arg);
                    }
                }
            }
        }

        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Worker env is inherited by the hosted CLI through the PTY spawn.
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        command.env("FLEET_AGENT_NAME", &spec.name);

        let mut child = command
            .spawn()
            .context("failed to spawn worker process")
            .map_err(SpawnError::Failed)?;
        let stdin = child
            .stdin
            .take()
            .context("worker missing stdin pipe")
            .map_err(SpawnError::Failed)?;
        let stdout = child
            .stdout
            .take()
            .context("worker missing stdout pipe")
            .map_err(SpawnError::Failed)?;
        let stderr = child
            .stderr
            .take()
            .context("worker missing stderr pipe")
            .map_err(SpawnError::Failed)?;
        let pid = child.id().unwrap_or_default();

        spawn_worker_reader(self.event_tx.clone(), spec.name.clone(), "stdout", stdout);
        spawn_worker_reader(self.event_tx.clone(), spec.name.clone(), "stderr", stderr);

        let handle = WorkerHandle {
            spec: spec.clone(),
            parent,
            child,
            stdin,
            spawned_at: Instant::now(),
            state: AgentState::Spawning,
            last_activity: Instant::now(),
        };
        self.workers.insert(spec.name.clone(), handle);
        self.order.push(spec.name.clone());

        self.send_to_worker(&spec.name, "init_worker", None, json!({"agent": spec}))
            .await
            .map_err(SpawnError::Failed)?;

        Ok(pid)
    }

    fn effective_cwd(&self, spec: &AgentSpec) -> Option<String> {
        spec.cwd.clone().or_else(|| {
            self.workspace
                .as_ref()
                .map(|dir| dir.to_string_lossy().to_string())
        })
    }

    pub async fn send_to_worker(
        &mut self,
        name: &str,
        msg_type: &str,
        request_id: Option<String>,
        payload: Value,
    ) -> Result<()> {
        let handle = self
            .workers
            .get_mut(name)
            .with_context(|| format!("unknown worker '{name}'"))?;

        let frame = ProtocolEnvelope {
            v: PROTOCOL_VERSION,
            msg_type: msg_type.to_string(),
            request_id,
            payload,
        };
        let encoded = serde_json::to_string(&frame)?;
        handle
            .stdin
            .write_all(encoded.as_bytes())
            .await
            .with_context(|| format!("failed writing frame to worker '{name}'"))?;
        handle
            .stdin
            .write_all(b"\n")
            .await
            .with_context(|| format!("failed writing newline to worker '{name}'"))?;
        handle
            .stdin
            .flush()
            .await
            .with_context(|| format!("failed flushing worker '{name}' stdin"))?;
        Ok(())
    }

    /// Release path: polite shutdown frame, then SIGTERM, then SIGKILL after
    /// the grace period.
    pub async fn release(&mut self, name: &str, grace: Duration) -> Result<()> {
        tracing::info!(target = "fleet::release", name = %name, "releasing worker");
        let mut handle = self
            .workers
            .remove(name)
            .with_context(|| format!("unknown worker '{name}'"))?;
        self.order.retain(|n| n != name);

        let shutdown = ProtocolEnvelope {
            v: PROTOCOL_VERSION,
            msg_type: "shutdown_worker".to_string(),
            request_id: None,
            payload: json!({"reason": "release", "grace_ms": grace.as_millis() as u64}),
        };
        if let Ok(encoded) = serde_json::to_string(&shutdown) {
            let _ = handle.stdin.write_all(encoded.as_bytes()).await;
            let _ = handle.stdin.write_all(b"\n").await;
            let _ = handle.stdin.flush().await;
        }

        terminate_child(&mut handle.child, grace).await
    }

    /// Remove a worker whose process already exited (no shutdown frame, no
    /// signals). Used on `agent_exit` notifications.
    pub fn forget(&mut self, name: &str) -> bool {
        self.order.retain(|n| n != name);
        self.workers.remove(name).is_some()
    }

    pub async fn shutdown_all(&mut self, grace: Duration) {
        let names: Vec<String> = self.order.clone();
        for name in names {
            if let Err(error) = self.release(&name, grace).await {
                tracing::warn!(
                    target = "fleet::broker",
                    name = %name,
                    error = %error,
                    "worker shutdown failed"
                );
            }
        }
    }

    /// Reap workers whose processes exited without announcing it.
    pub fn reap_exited(&mut self) -> Vec<(String, Option<i32>, Option<String>)> {
        let names: Vec<String> = self.order.clone();
        let mut exited = Vec::new();
        for name in names {
            let status = match self.workers.get_mut(&name) {
                Some(handle) => match handle.child.try_wait() {
                    Ok(Some(status)) => Some(status),
                    Ok(None) => None,
                    Err(error) => {
                        // Already reaped elsewhere; treat as exited.
                        tracing::debug!(
                            target = "fleet::broker",
                            worker = %name,
                            error = %error,
                            "try_wait errored; treating worker as exited"
                        );
                        self.forget(&name);
                        exited.push((name, None, None));
                        continue;
                    }
                },
                None => None,
            };
            if let Some(status) = status {
                #[cfg(unix)]
                let signal = {
                    use std::os::unix::process::ExitStatusExt;
                    status.signal().map(|value| value.to_string())
                };
                #[cfg(not(unix))]
                let signal: Option<String> = None;
                self.forget(&name);
                exited.push((name, status.code(), signal));
            }
        }
        exited
    }
}

fn spawn_worker_reader<R>(
    tx: mpsc::Sender<WorkerEvent>,
    name: String,
    stream: &'static str,
    reader: R,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let event = if stream == "stdout" {
                match serde_json::from_str::<ProtocolEnvelope<Value>>(&line) {
                    Ok(frame) => WorkerEvent::Frame {
                        name: name.clone(),
                        frame,
                    },
                    Err(_) => WorkerEvent::Stream {
                        name: name.clone(),
                        stream,
                        chunk: line,
                    },
                }
            } else {
                WorkerEvent::Stream {
                    name: name.clone(),
                    stream,
                    chunk: line,
                }
            };
            if tx.send(event).await.is_err() {
                break;
            }
        }
    });
}

/// SIGTERM, wait up to the grace period, then SIGKILL.
pub async fn terminate_child(child: &mut Child, grace: Duration) -> Result<()> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.kill().await;
    }

    if timeout(grace, child.wait()).await.is_err() {
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = child.kill().await;
        }
        let _ = child.wait().await;
    }

    Ok(())
}
