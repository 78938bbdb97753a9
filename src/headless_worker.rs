use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::Command,
    sync::mpsc,
};

use crate::{
    config::HeadlessCommand,
    helpers::parse_cli_command,
    protocol::{AgentDelivery, ProtocolEnvelope},
    pty_worker::{send_frame, spawn_stdout_writer},
    registry::terminate_child,
};

/// Line-oriented worker runtime: no pseudoterminal, no echo verification.
/// A delivery is verified once its bytes are written to the child's stdin,
/// and acked immediately after (this runtime acks explicitly, so the broker
/// never synthesizes one).
pub async fn run_headless_worker(cmd: HeadlessCommand) -> Result<()> {
    let (resolved_cli, inline_args) = parse_cli_command(&cmd.cli)
        .with_context(|| format!("invalid CLI command '{}'", cmd.cli))?;
    let mut effective_args = inline_args;
    effective_args.extend(cmd.args.clone());

    let mut child_cmd = Command::new(&resolved_cli);
    child_cmd
        .args(&effective_args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = cmd.cwd.as_deref() {
        child_cmd.current_dir(cwd);
    }
    let mut child = child_cmd
        .spawn()
        .with_context(|| format!("failed to spawn headless CLI '{resolved_cli}'"))?;

    let mut child_stdin = child.stdin.take().context("headless child missing stdin")?;
    let child_stdout = child.stdout.take().context("headless child missing stdout")?;
    let child_stderr = child.stderr.take().context("headless child missing stderr")?;

    let (out_tx, out_rx) = mpsc::channel::<ProtocolEnvelope<Value>>(512);
    spawn_stdout_writer(out_rx);

    spawn_stream_reader(out_tx.clone(), "stdout", child_stdout);
    spawn_stream_reader(out_tx.clone(), "stderr", child_stderr);

    let worker_name = cmd
        .agent_name
        .clone()
        .unwrap_or_else(|| "headless-worker".to_string());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) | Err(_) => break,
                };
                let frame: ProtocolEnvelope<Value> = match serde_json::from_str(&line) {
                    Ok(frame) => frame,
                    Err(error) => {
                        let _ = send_frame(&out_tx, "worker_error", None, json!({
                            "code": "invalid_frame",
                            "message": error.to_string(),
                            "retryable": false,
                        })).await;
                        continue;
                    }
                };

                match frame.msg_type.as_str() {
                    "init_worker" => {
                        let _ = send_frame(&out_tx, "worker_ready", frame.request_id, json!({
                            "name": worker_name,
                            "runtime": "headless",
                        })).await;
                    }
                    "deliver_agent" => {
                        let delivery: AgentDelivery = match serde_json::from_value(frame.payload) {
                            Ok(d) => d,
                            Err(error) => {
                                let _ = send_frame(&out_tx, "worker_error", frame.request_id, json!({
                                    "code": "invalid_delivery",
                                    "message": error.to_string(),
                                    "retryable": false,
                                })).await;
                                continue;
                            }
                        };

                        let mut payload = delivery.body.clone();
                        payload.push('\n');
                        if let Err(error) = child_stdin.write_all(payload.as_bytes()).await {
                            let _ = send_frame(&out_tx, "delivery_failed", frame.request_id, json!({
                                "delivery_id": delivery.delivery_id,
                                "event_id": delivery.event_id,
                                "reason": format!("stdin write failed: {error}"),
                                "retryable": true,
                            })).await;
                            continue;
                        }
                        let _ = child_stdin.flush().await;

                        let _ = send_frame(&out_tx, "delivery_verified", None, json!({
                            "delivery_id": delivery.delivery_id,
                            "event_id": delivery.event_id,
                        })).await;
                        let _ = send_frame(&out_tx, "delivery_ack", frame.request_id, json!({
                            "delivery_id": delivery.delivery_id,
                            "event_id": delivery.event_id,
                            "correlation_id": delivery.correlation_id,
                        })).await;
                    }
                    "send_input" => {
                        if let Some(data) = frame.payload.get("data").and_then(Value::as_str) {
                            let _ = child_stdin.write_all(data.as_bytes()).await;
                            let _ = child_stdin.flush().await;
                        }
                    }
                    "set_model" => {
                        let _ = send_frame(&out_tx, "worker_error", frame.request_id, json!({
                            "code": "not_supported",
                            "message": "headless runtime does not support set_model",
                            "retryable": false,
                        })).await;
                    }
                    "ping" => {
                        let ts = frame.payload.get("ts_ms").and_then(Value::as_u64).unwrap_or_default();
                        let _ = send_frame(&out_tx, "pong", frame.request_id, json!({"ts_ms": ts})).await;
                    }
                    "shutdown_worker" => break,
                    other => {
                        let _ = send_frame(&out_tx, "worker_error", frame.request_id, json!({
                            "code": "unsupported_operation",
                            "message": format!("unsupported message type '{other}'"),
                            "retryable": false,
                        })).await;
                    }
                }
            }

            status = child.wait() => {
                let (code, signal) = match status {
                    Ok(status) => {
                        #[cfg(unix)]
                        let signal = {
                            use std::os::unix::process::ExitStatusExt;
                            status.signal().map(|s| s.to_string())
                        };
                        #[cfg(not(unix))]
                        let signal: Option<String> = None;
                        (status.code(), signal)
                    }
                    Err(_) => (None, None),
                };
                let _ = send_frame(&out_tx, "agent_exit", None, json!({
                    "reason": "child_exited",
                })).await;
                let _ = send_frame(&out_tx, "worker_exited", None, json!({
                    "code": code,
                    "signal": signal,
                })).await;
                return Ok(());
            }
        }
    }

    drop(child_stdin);
    let _ = terminate_child(&mut child, Duration::from_secs(2)).await;
    let _ = send_frame(
        &out_tx,
        "worker_exited",
        None,
        json!({"code": Value::Null, "signal": Value::Null}),
    )
    .await;

    Ok(())
}

fn spawn_stream_reader<R>(tx: mpsc::Sender<ProtocolEnvelope<Value>>, stream: &'static str, reader: R)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let _ = send_frame(
                &tx,
                "worker_stream",
                None,
                json!({"stream": stream, "chunk": line}),
            )
            .await;
        }
    });
}
