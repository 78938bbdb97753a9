use std::{
    collections::{HashSet, VecDeque},
    path::Path,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
    time::MissedTickBehavior,
};

use crate::{
    config::PtyCommand,
    helpers::{
        append_bounded, check_echo_in_output, detect_cli_ready, floor_char_boundary,
        format_injection, parse_cli_command, strip_ansi, verify_tag,
    },
    protocol::{AgentDelivery, ProtocolEnvelope, PROTOCOL_VERSION},
    pty::PtySession,
};

const SCROLLBACK_MAX_BYTES: usize = 16_000;
const SCROLLBACK_KEEP_BYTES: usize = 12_000;
const STARTUP_BUFFER_MAX: usize = 12_000;
const STARTUP_BUFFER_KEEP: usize = 8_000;
const STARTUP_READY_TIMEOUT: Duration = Duration::from_secs(10);
const VERIFICATION_WINDOW: Duration = Duration::from_secs(5);
const SUBMIT_DELAY: Duration = Duration::from_millis(50);
const LAST_OUTPUT_TAIL: usize = 2_000;

#[derive(Debug, Clone)]
struct PendingInjection {
    delivery: AgentDelivery,
    request_id: Option<String>,
}

#[derive(Debug, Clone)]
struct PendingVerification {
    delivery: AgentDelivery,
    tag: String,
    injected_at: Instant,
    request_id: Option<String>,
}

/// Responds to terminal status queries (cursor position reports) that
/// full-screen CLIs send before drawing. Without a response some CLIs block
/// at startup inside a PTY with no real terminal attached.
#[derive(Debug, Clone, Copy, Default)]
enum QueryState {
    #[default]
    Idle,
    Esc,
    Csi,
    CsiQmark,
    Csi6,
    CsiQmark6,
}

#[derive(Debug, Default)]
struct TerminalQueryParser {
    state: QueryState,
}

impl TerminalQueryParser {
    fn feed(&mut self, chunk: &[u8]) -> Vec<&'static [u8]> {
        let mut out = Vec::new();
        for byte in chunk {
            self.state = match (self.state, *byte) {
                (_, 0x1b) => QueryState::Esc,
                (QueryState::Esc, b'[') => QueryState::Csi,
                (QueryState::Csi, b'?') => QueryState::CsiQmark,
                (QueryState::Csi, b'6') => QueryState::Csi6,
                (QueryState::CsiQmark, b'6') => QueryState::CsiQmark6,
                (QueryState::Csi6, b'n') => {
                    out.push(b"\x1b[1;1R".as_slice());
                    QueryState::Idle
                }
                (QueryState::CsiQmark6, b'n') => {
                    out.push(b"\x1b[?1;1R".as_slice());
                    QueryState::Idle
                }
                _ => QueryState::Idle,
            };
        }
        out
    }
}

/// Wrap a body in bracketed paste when it spans lines, so multi-line text
/// lands as one unit instead of triggering per-line submission.
fn injection_bytes(text: &str) -> Vec<u8> {
    if text.contains('\n') {
        let mut bytes = Vec::with_capacity(text.len() + 12);
        bytes.extend_from_slice(b"\x1b[200~");
        bytes.extend_from_slice(text.as_bytes());
        bytes.extend_from_slice(b"\x1b[201~");
        bytes
    } else {
        text.as_bytes().to_vec()
    }
}

pub(crate) async fn send_frame(
    tx: &mpsc::Sender<ProtocolEnvelope<Value>>,
    msg_type: &str,
    request_id: Option<String>,
    payload: Value,
) -> Result<()> {
    tx.send(ProtocolEnvelope {
        v: PROTOCOL_VERSION,
        msg_type: msg_type.to_string(),
        request_id,
        payload,
    })
    .await
    .context("worker output channel closed")
}

/// Forward frames from the worker's outbound channel to stdout as NDJSON.
pub(crate) fn spawn_stdout_writer(mut rx: mpsc::Receiver<ProtocolEnvelope<Value>>) {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Ok(line) = serde_json::to_string(&frame) {
                use std::io::Write;
                let mut stdout = std::io::stdout().lock();
                let _ = stdout.write_all(line.as_bytes());
                let _ = stdout.write_all(b"\n");
                let _ = stdout.flush();
            }
        }
    });
}

fn output_tail(scrollback: &str) -> Option<String> {
    let clean = strip_ansi(scrollback);
    let trimmed = clean.trim();
    if trimmed.is_empty() {
        return None;
    }
    let start = floor_char_boundary(trimmed, trimmed.len().saturating_sub(LAST_OUTPUT_TAIL));
    Some(trimmed[start..].to_string())
}

pub async fn run_pty_worker(cmd: PtyCommand) -> Result<()> {
    let (resolved_cli, inline_args) = parse_cli_command(&cmd.cli)
        .with_context(|| format!("invalid CLI command '{}'", cmd.cli))?;
    let mut effective_args = inline_args;
    effective_args.extend(cmd.args.clone());

    let rows = cmd.rows.unwrap_or(24);
    let cols = cmd.cols.unwrap_or(80);
    let cwd = cmd.cwd.as_deref().map(Path::new);
    let (pty, mut pty_rx) = PtySession::spawn(&resolved_cli, &effective_args, cwd, &[], rows, cols)?;
    let mut query_parser = TerminalQueryParser::default();

    let (out_tx, out_rx) = mpsc::channel::<ProtocolEnvelope<Value>>(1024);
    spawn_stdout_writer(out_rx);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut running = true;
    let mut worker_name = cmd
        .agent_name
        .clone()
        .unwrap_or_else(|| "pty-worker".to_string());

    let idle_threshold = match cmd.idle_threshold_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };

    let mut scrollback = String::new();
    let mut startup_output = String::new();
    let mut startup_total_bytes = 0usize;
    let mut init_request_id: Option<String> = None;
    let mut init_received_at: Option<Instant> = None;
    let mut worker_ready_sent = false;

    let mut pending_injections: VecDeque<PendingInjection> = VecDeque::new();
    let mut pending_delivery_ids: HashSet<String> = HashSet::new();
    let mut pending_verification: Option<PendingVerification> = None;

    let mut last_output_at = Instant::now();
    let mut reported_idle = false;

    let mut injection_tick = tokio::time::interval(Duration::from_millis(50));
    injection_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut verification_tick = tokio::time::interval(Duration::from_millis(200));
    verification_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut idle_tick = tokio::time::interval(Duration::from_secs(1));
    idle_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The PTY reader can miss EOF when the child exits silently; poll the
    // child directly as a safety net.
    let mut child_watchdog = tokio::time::interval(Duration::from_secs(5));
    child_watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while running {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
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
                                worker_name = cmd
                                    .agent_name
                                    .clone()
                                    .or_else(|| {
                                        frame.payload
                                            .get("agent")
                                            .and_then(|a| a.get("name"))
                                            .and_then(Value::as_str)
                                            .map(ToOwned::to_owned)
                                    })
                                    .unwrap_or_else(|| "pty-worker".to_string());
                                init_request_id = frame.request_id;
                                init_received_at = Some(Instant::now());
                                try_emit_worker_ready(
                                    &out_tx,
                                    &worker_name,
                                    &mut init_request_id,
                                    init_received_at,
                                    &mut worker_ready_sent,
                                    detect_cli_ready(&startup_output, startup_total_bytes),
                                ).await;
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
                                if pending_delivery_ids.insert(delivery.delivery_id.clone()) {
                                    pending_injections.push_back(PendingInjection {
                                        delivery,
                                        request_id: frame.request_id,
                                    });
                                } else {
                                    tracing::debug!(
                                        target = "fleet::worker::pty",
                                        delivery_id = %delivery.delivery_id,
                                        "skipping duplicate pending delivery"
                                    );
                                }
                            }
                            "send_input" => {
                                if let Some(data) = frame.payload.get("data").and_then(Value::as_str) {
                                    if let Err(error) = pty.write_all(data.as_bytes()) {
                                        let _ = send_frame(&out_tx, "worker_error", frame.request_id, json!({
                                            "code": "injection_failed",
                                            "message": error.to_string(),
                                            "retryable": true,
                                        })).await;
                                    }
                                }
                            }
                            "set_model" => {
                                if let Some(model) = frame.payload.get("model").and_then(Value::as_str) {
                                    let command = format!("/model {model}\r");
                                    if let Err(error) = pty.write_all(command.as_bytes()) {
                                        let _ = send_frame(&out_tx, "worker_error", frame.request_id, json!({
                                            "code": "injection_failed",
                                            "message": error.to_string(),
                                            "retryable": true,
                                        })).await;
                                    }
                                }
                            }
                            "shutdown_worker" => {
                                running = false;
                            }
                            "ping" => {
                                let ts = frame.payload.get("ts_ms").and_then(Value::as_u64).unwrap_or_default();
                                let _ = send_frame(&out_tx, "pong", frame.request_id, json!({"ts_ms": ts})).await;
                            }
                            other => {
                                let _ = send_frame(&out_tx, "worker_error", frame.request_id, json!({
                                    "code": "unsupported_operation",
                                    "message": format!("unsupported message type '{other}'"),
                                    "retryable": false,
                                })).await;
                            }
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }

            pty_output = pty_rx.recv() => {
                match pty_output {
                    Some(chunk) => {
                        last_output_at = Instant::now();
                        reported_idle = false;
                        pty.reset_no_pid_checks();
                        for response in query_parser.feed(&chunk) {
                            let _ = pty.write_all(response);
                        }

                        let text = String::from_utf8_lossy(&chunk).to_string();
                        let clean = strip_ansi(&text);
                        startup_total_bytes = startup_total_bytes.saturating_add(chunk.len());
                        append_bounded(&mut startup_output, &clean, STARTUP_BUFFER_MAX, STARTUP_BUFFER_KEEP);
                        append_bounded(&mut scrollback, &text, SCROLLBACK_MAX_BYTES, SCROLLBACK_KEEP_BYTES);

                        let _ = send_frame(&out_tx, "worker_stream", None, json!({
                            "stream": "stdout",
                            "chunk": text,
                        })).await;

                        try_emit_worker_ready(
                            &out_tx,
                            &worker_name,
                            &mut init_request_id,
                            init_received_at,
                            &mut worker_ready_sent,
                            detect_cli_ready(&startup_output, startup_total_bytes),
                        ).await;

                        let verified = pending_verification
                            .as_ref()
                            .map(|pv| check_echo_in_output(&scrollback, &pv.tag, &pv.delivery.body))
                            .unwrap_or(false);
                        if verified {
                            if let Some(pv) = pending_verification.take() {
                                complete_verification(&out_tx, pv, &mut pending_delivery_ids).await;
                            }
                        }
                    }
                    None => {
                        let mut exit_payload = json!({"reason": "pty_closed"});
                        if let Some(tail) = output_tail(&scrollback) {
                            exit_payload["last_output"] = json!(tail);
                        }
                        let _ = send_frame(&out_tx, "agent_exit", None, exit_payload).await;
                        running = false;
                    }
                }
            }

            _ = injection_tick.tick() => {
                if pending_verification.is_some() {
                    continue;
                }
                if let Some(pending) = pending_injections.pop_front() {
                    let tag = verify_tag(&pending.delivery.delivery_id);
                    let injection = format_injection(
                        &tag,
                        &pending.delivery.from,
                        &pending.delivery.target,
                        &pending.delivery.body,
                    );
                    if let Err(error) = pty.write_all(&injection_bytes(&injection)) {
                        tracing::warn!(
                            target = "fleet::worker::pty",
                            delivery_id = %pending.delivery.delivery_id,
                            error = %error,
                            "PTY injection write failed"
                        );
                        pending_delivery_ids.remove(&pending.delivery.delivery_id);
                        let _ = send_frame(&out_tx, "delivery_failed", pending.request_id, json!({
                            "delivery_id": pending.delivery.delivery_id,
                            "event_id": pending.delivery.event_id,
                            "reason": format!("pty write failed: {error}"),
                            "retryable": true,
                        })).await;
                        continue;
                    }
                    tokio::time::sleep(SUBMIT_DELAY).await;
                    let _ = pty.write_all(b"\r");
                    let _ = send_frame(&out_tx, "delivery_injected", None, json!({
                        "delivery_id": pending.delivery.delivery_id,
                        "event_id": pending.delivery.event_id,
                    })).await;
                    pending_verification = Some(PendingVerification {
                        delivery: pending.delivery,
                        tag,
                        injected_at: Instant::now(),
                        request_id: pending.request_id,
                    });
                }
            }

            _ = verification_tick.tick() => {
                try_emit_worker_ready(
                    &out_tx,
                    &worker_name,
                    &mut init_request_id,
                    init_received_at,
                    &mut worker_ready_sent,
                    detect_cli_ready(&startup_output, startup_total_bytes),
                ).await;

                let timed_out = pending_verification
                    .as_ref()
                    .map(|pv| pv.injected_at.elapsed() >= VERIFICATION_WINDOW)
                    .unwrap_or(false);
                if !timed_out {
                    continue;
                }
                if let Some(pv) = pending_verification.take() {
                    pending_delivery_ids.remove(&pv.delivery.delivery_id);
                    tracing::debug!(
                        target = "fleet::worker::pty",
                        delivery_id = %pv.delivery.delivery_id,
                        "echo not detected within verification window"
                    );
                    let _ = send_frame(&out_tx, "delivery_failed", pv.request_id, json!({
                        "delivery_id": pv.delivery.delivery_id,
                        "event_id": pv.delivery.event_id,
                        "reason": format!(
                            "echo not detected within {}s window",
                            VERIFICATION_WINDOW.as_secs()
                        ),
                        "retryable": true,
                    })).await;
                }
            }

            _ = idle_tick.tick() => {
                if let Some(threshold) = idle_threshold {
                    let silent = last_output_at.elapsed();
                    if silent >= threshold && !reported_idle {
                        reported_idle = true;
                        let _ = send_frame(&out_tx, "agent_idle", None, json!({
                            "idle_secs": silent.as_secs(),
                        })).await;
                    }
                }
            }

            _ = child_watchdog.tick() => {
                if pty.has_exited() {
                    // Drain whatever the child managed to print on its way
                    // out so the exit event can carry the error message.
                    while let Ok(chunk) = pty_rx.try_recv() {
                        let text = String::from_utf8_lossy(&chunk).to_string();
                        append_bounded(&mut scrollback, &text, SCROLLBACK_MAX_BYTES, SCROLLBACK_KEEP_BYTES);
                        let _ = send_frame(&out_tx, "worker_stream", None, json!({
                            "stream": "stdout",
                            "chunk": text,
                        })).await;
                    }
                    let mut exit_payload = json!({"reason": "child_exited"});
                    if let Some(tail) = output_tail(&scrollback) {
                        exit_payload["last_output"] = json!(tail);
                    }
                    let _ = send_frame(&out_tx, "agent_exit", None, exit_payload).await;
                    running = false;
                }
            }
        }
    }

    let _ = pty.shutdown();
    let _ = send_frame(
        &out_tx,
        "worker_exited",
        None,
        json!({"code": Value::Null, "signal": Value::Null}),
    )
    .await;

    Ok(())
}

async fn try_emit_worker_ready(
    out_tx: &mpsc::Sender<ProtocolEnvelope<Value>>,
    worker_name: &str,
    init_request_id: &mut Option<String>,
    init_received_at: Option<Instant>,
    worker_ready_sent: &mut bool,
    startup_ready: bool,
) {
    if *worker_ready_sent || init_request_id.is_none() {
        return;
    }

    let timed_out = init_received_at
        .map(|started| started.elapsed() >= STARTUP_READY_TIMEOUT)
        .unwrap_or(false);
    if !startup_ready && !timed_out {
        return;
    }

    if timed_out && !startup_ready {
        tracing::warn!(
            target = "fleet::worker::pty",
            worker = %worker_name,
            timeout_secs = STARTUP_READY_TIMEOUT.as_secs(),
            "startup readiness timed out; emitting worker_ready fallback"
        );
    }

    let request_id = init_request_id.take();
    let _ = send_frame(
        out_tx,
        "worker_ready",
        request_id,
        json!({"name": worker_name, "runtime": "pty"}),
    )
    .await;
    *worker_ready_sent = true;
}

/// Report a verified echo. The PTY runtime is non-ACKing: the broker's
/// delivery engine synthesizes the ack once it sees the verification.
async fn complete_verification(
    out_tx: &mpsc::Sender<ProtocolEnvelope<Value>>,
    pv: PendingVerification,
    pending_delivery_ids: &mut HashSet<String>,
) {
    pending_delivery_ids.remove(&pv.delivery.delivery_id);
    tracing::debug!(
        target = "fleet::worker::pty",
        delivery_id = %pv.delivery.delivery_id,
        "delivery echo verified"
    );
    let _ = send_frame(
        out_tx,
        "delivery_verified",
        pv.request_id.clone(),
        json!({
            "delivery_id": pv.delivery.delivery_id,
            "event_id": pv.delivery.event_id,
        }),
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::{injection_bytes, TerminalQueryParser};

    #[test]
    fn cursor_position_query_gets_response() {
        let mut parser = TerminalQueryParser::default();
        let responses = parser.feed(b"\x1b[6n");
        assert_eq!(responses, vec![b"\x1b[1;1R".as_slice()]);
    }

    #[test]
    fn private_query_gets_private_response() {
        let mut parser = TerminalQueryParser::default();
        let responses = parser.feed(b"\x1b[?6n");
        assert_eq!(responses, vec![b"\x1b[?1;1R".as_slice()]);
    }

    #[test]
    fn query_split_across_chunks() {
        let mut parser = TerminalQueryParser::default();
        assert!(parser.feed(b"\x1b[").is_empty());
        assert_eq!(parser.feed(b"6n"), vec![b"\x1b[1;1R".as_slice()]);
    }

    #[test]
    fn ordinary_output_produces_no_response() {
        let mut parser = TerminalQueryParser::default();
        assert!(parser.feed(b"plain text \x1b[31mred\x1b[0m").is_empty());
    }

    #[test]
    fn single_line_body_is_written_plain() {
        assert_eq!(injection_bytes("hello"), b"hello".to_vec());
    }

    #[test]
    fn multi_line_body_uses_bracketed_paste() {
        let bytes = injection_bytes("a\nb");
        assert!(bytes.starts_with(b"\x1b[200~"));
        assert!(bytes.ends_with(b"\x1b[201~"));
    }
}
