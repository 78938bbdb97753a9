use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::{
    net::{UnixListener, UnixStream},
    sync::{mpsc, watch},
};

use crate::{
    broker::{BrokerCommand, BrokerHandle},
    framing::{read_frame, write_frame, FrameError},
    protocol::{error_envelope, event_envelope, ProtocolEnvelope, ProtocolError, PROTOCOL_VERSION},
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub struct ControlServer {
    socket_path: PathBuf,
    pid_path: PathBuf,
    lock_path: PathBuf,
    max_frame_bytes: usize,
    handle: BrokerHandle,
}

impl ControlServer {
    pub fn new(
        socket_path: PathBuf,
        pid_path: PathBuf,
        lock_path: PathBuf,
        max_frame_bytes: usize,
        handle: BrokerHandle,
    ) -> Self {
        Self {
            socket_path,
            pid_path,
            lock_path,
            max_frame_bytes,
            handle,
        }
    }

    /// Bind and serve until the shutdown signal fires. Startup errors (lock
    /// conflict, bind failure) surface to the caller for a non-zero exit.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        // One broker per socket: an exclusive lock held for the process
        // lifetime. A second instance fails fast instead of stealing the
        // socket.
        #[cfg(unix)]
        let _lock = {
            use nix::fcntl::{Flock, FlockArg};
            let lock_file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&self.lock_path)
                .with_context(|| format!("failed to open lock file {}", self.lock_path.display()))?;
            Flock::lock(lock_file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
                anyhow::anyhow!(
                    "another broker instance holds {} ({errno})",
                    self.lock_path.display()
                )
            })?
        };

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).with_context(|| {
                format!("failed to remove stale socket {}", self.socket_path.display())
            })?;
        }
        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("failed to bind {}", self.socket_path.display()))?;
        write_pid_file(&self.pid_path)?;

        tracing::info!(
            target = "fleet::server",
            socket = %self.socket_path.display(),
            "control server listening"
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let connection_id =
                                NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
                            let handle = self.handle.clone();
                            let max_frame = self.max_frame_bytes;
                            let shutdown = shutdown_rx.clone();
                            tokio::spawn(async move {
                                if let Err(error) =
                                    handle_connection(stream, connection_id, handle, max_frame, shutdown)
                                        .await
                                {
                                    tracing::debug!(
                                        target = "fleet::server",
                                        connection_id,
                                        error = %error,
                                        "connection ended with error"
                                    );
                                }
                            });
                        }
                        Err(error) => {
                            tracing::warn!(
                                target = "fleet::server",
                                error = %error,
                                "failed to accept connection"
                            );
                        }
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        let _ = std::fs::remove_file(&self.pid_path);
        tracing::info!(target = "fleet::server", "control server closed");
        Ok(())
    }
}

fn write_pid_file(path: &Path) -> Result<()> {
    let dir = path.parent().unwrap_or(path);
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed creating temp file in {}", dir.display()))?;
    use std::io::Write;
    write!(tmp, "{}", std::process::id())?;
    tmp.persist(path)
        .with_context(|| format!("failed persisting pid file {}", path.display()))?;
    Ok(())
}

async fn handle_connection(
    stream: UnixStream,
    connection_id: u64,
    handle: BrokerHandle,
    max_frame: usize,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::channel::<ProtocolEnvelope<Value>>(256);

    let writer_max = max_frame;
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if write_frame(&mut writer, &frame, writer_max).await.is_err() {
                break;
            }
        }
    });

    // ── Handshake ────────────────────────────────────────────────────────
    let client_name = loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader, max_frame) => frame,
            _ = shutdown_rx.changed() => {
                writer_task.abort();
                return Ok(());
            }
        };
        match frame {
            Ok(frame) if frame.msg_type == "hello" => {
                let client_name = frame
                    .payload
                    .get("client_name")
                    .and_then(Value::as_str)
                    .unwrap_or("sdk")
                    .to_string();
                let ack = ProtocolEnvelope {
                    v: PROTOCOL_VERSION,
                    msg_type: "hello_ack".to_string(),
                    request_id: frame.request_id,
                    payload: json!({
                        "broker_version": env!("CARGO_PKG_VERSION"),
                        "protocol_version": PROTOCOL_VERSION,
                    }),
                };
                if out_tx.send(ack).await.is_err() {
                    writer_task.abort();
                    return Ok(());
                }
                break client_name;
            }
            Ok(frame) => {
                let error = ProtocolError::new(
                    "handshake_required",
                    "first frame must be `hello`",
                    true,
                );
                let _ = out_tx.send(error_envelope(frame.request_id, &error)).await;
            }
            Err(error @ (FrameError::Closed | FrameError::Io(_))) => {
                tracing::trace!(
                    target = "fleet::server",
                    connection_id,
                    error = %error,
                    "connection closed before handshake"
                );
                writer_task.abort();
                return Ok(());
            }
            Err(error) => {
                let proto = ProtocolError::new(error.code(), error.to_string(), false);
                let _ = out_tx.send(error_envelope(None, &proto)).await;
            }
        }
    };

    tracing::debug!(
        target = "fleet::server",
        connection_id,
        client = %client_name,
        "handshake complete"
    );

    // Register with the broker core and start fanning out events. Replies
    // and events share the outbound queue, so per-source ordering holds.
    handle
        .cmd_tx
        .send(BrokerCommand::Attach {
            connection_id,
            client_name,
            reply_tx: out_tx.clone(),
        })
        .await
        .context("broker core is gone")?;

    let mut events = handle.bus.subscribe();
    let event_out = out_tx.clone();
    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if event_out.send(event_envelope(&event)).await.is_err() {
                break;
            }
        }
    });

    // ── Request loop ─────────────────────────────────────────────────────
    let result = loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader, max_frame) => frame,
            _ = shutdown_rx.changed() => break Ok(()),
        };
        match frame {
            Ok(frame) => {
                if frame.v != PROTOCOL_VERSION {
                    let error = ProtocolError::new(
                        "invalid_envelope",
                        format!(
                            "expected protocol version {}, got {}",
                            PROTOCOL_VERSION, frame.v
                        ),
                        false,
                    );
                    let _ = out_tx.send(error_envelope(frame.request_id, &error)).await;
                    continue;
                }
                if handle
                    .cmd_tx
                    .send(BrokerCommand::Request {
                        connection_id,
                        frame,
                    })
                    .await
                    .is_err()
                {
                    break Ok(());
                }
            }
            Err(FrameError::Closed) => break Ok(()),
            Err(error @ FrameError::Io(_)) => break Err(anyhow::anyhow!(error)),
            Err(error) => {
                let proto = ProtocolError::new(error.code(), error.to_string(), false);
                let _ = out_tx.send(error_envelope(None, &proto)).await;
            }
        }
    };

    let _ = handle
        .cmd_tx
        .send(BrokerCommand::Detach { connection_id })
        .await;
    event_task.abort();
    drop(out_tx);
    let _ = writer_task.await;
    result
}
