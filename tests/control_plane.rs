//! End-to-end tests over a real broker process and UNIX socket.

use std::{
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    time::{Duration, Instant},
};

use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

use fleet_broker::{
    framing::{read_frame, write_frame, DEFAULT_MAX_FRAME_BYTES},
    protocol::{ProtocolEnvelope, PROTOCOL_VERSION},
};

struct BrokerProc {
    child: Child,
    socket: PathBuf,
    _dir: tempfile::TempDir,
}

impl Drop for BrokerProc {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn start_broker(extra_args: &[&str]) -> BrokerProc {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket = dir.path().join("broker.sock");
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_fleet-broker"));
    cmd.arg("serve")
        .arg("--socket")
        .arg(&socket)
        .arg("--log-level")
        .arg("warn")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    for arg in extra_args {
        cmd.arg(arg);
    }
    let child = cmd.spawn().expect("spawn broker");

    let deadline = Instant::now() + Duration::from_secs(10);
    while !socket.exists() {
        assert!(Instant::now() < deadline, "broker socket never appeared");
        std::thread::sleep(Duration::from_millis(25));
    }
    BrokerProc {
        child,
        socket,
        _dir: dir,
    }
}

struct TestClient {
    stream: UnixStream,
    next_request: u64,
    stashed_events: Vec<Value>,
}

impl TestClient {
    async fn connect(socket: &Path) -> Self {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match UnixStream::connect(socket).await {
                Ok(stream) => {
                    return Self {
                        stream,
                        next_request: 0,
                        stashed_events: Vec::new(),
                    }
                }
                Err(_) if Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
                Err(error) => panic!("connect failed: {error}"),
            }
        }
    }

    async fn send_raw(&mut self, msg_type: &str, request_id: Option<String>, payload: Value) {
        let frame = ProtocolEnvelope {
            v: PROTOCOL_VERSION,
            msg_type: msg_type.to_string(),
            request_id,
            payload,
        };
        write_frame(&mut self.stream, &frame, DEFAULT_MAX_FRAME_BYTES)
            .await
            .expect("write frame");
    }

    async fn recv(&mut self) -> ProtocolEnvelope<Value> {
        tokio::time::timeout(
            Duration::from_secs(20),
            read_frame(&mut self.stream, DEFAULT_MAX_FRAME_BYTES),
        )
        .await
        .expect("timed out waiting for frame")
        .expect("read frame")
    }

    async fn hello(&mut self) -> ProtocolEnvelope<Value> {
        self.send_raw(
            "hello",
            Some("hello_req".to_string()),
            json!({"client_name": "test-sdk", "client_version": "0.0.0"}),
        )
        .await;
        let ack = self.recv().await;
        assert_eq!(ack.msg_type, "hello_ack");
        ack
    }

    /// Issue a request and read frames until its reply arrives, stashing any
    /// events seen on the way.
    async fn request(&mut self, msg_type: &str, payload: Value) -> ProtocolEnvelope<Value> {
        self.next_request += 1;
        let request_id = format!("req_{}", self.next_request);
        self.send_raw(msg_type, Some(request_id.clone()), payload)
            .await;
        loop {
            let frame = self.recv().await;
            if frame.request_id.as_deref() == Some(&request_id) {
                return frame;
            }
            if frame.msg_type == "event" {
                self.stashed_events.push(frame.payload);
            }
        }
    }

    /// Wait until an event matching the predicate is observed.
    async fn wait_for_event<F>(&mut self, what: &str, mut pred: F) -> Value
    where
        F: FnMut(&Value) -> bool,
    {
        if let Some(pos) = self.stashed_events.iter().position(&mut pred) {
            return self.stashed_events.remove(pos);
        }
        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for event: {what}"
            );
            let frame = self.recv().await;
            if frame.msg_type != "event" {
                continue;
            }
            if pred(&frame.payload) {
                return frame.payload;
            }
            self.stashed_events.push(frame.payload);
        }
    }
}

fn event_kind(event: &Value) -> &str {
    event.get("kind").and_then(Value::as_str).unwrap_or("")
}

fn result_of(frame: &ProtocolEnvelope<Value>) -> &Value {
    assert_eq!(
        frame.msg_type, "ok",
        "expected ok frame, got {:?}",
        frame
    );
    frame.payload.get("result").expect("ok payload has result")
}

fn error_code(frame: &ProtocolEnvelope<Value>) -> &str {
    assert_eq!(frame.msg_type, "error", "expected error frame: {frame:?}");
    frame
        .payload
        .get("code")
        .and_then(Value::as_str)
        .unwrap_or("")
}

fn pty_spec(name: &str, cli: &str, channels: &[&str]) -> Value {
    json!({
        "agent": {
            "name": name,
            "runtime": "pty",
            "cli": cli,
            "channels": channels,
        }
    })
}

#[tokio::test]
async fn handshake_is_required_before_requests() {
    let broker = start_broker(&[]);
    let mut client = TestClient::connect(&broker.socket).await;

    client
        .send_raw("list_agents", Some("early".to_string()), json!({}))
        .await;
    let reply = client.recv().await;
    assert_eq!(error_code(&reply), "handshake_required");

    let ack = client.hello().await;
    assert_eq!(
        ack.payload.get("protocol_version").and_then(Value::as_u64),
        Some(1)
    );

    let reply = client.request("ping", json!({})).await;
    assert!(result_of(&reply).get("ts_ms").is_some());
}

#[tokio::test]
async fn malformed_frames_get_typed_errors() {
    let broker = start_broker(&[]);
    let mut client = TestClient::connect(&broker.socket).await;
    client.hello().await;

    // Valid length prefix, invalid JSON body.
    let body = b"not json at all";
    client
        .stream
        .write_all(&(body.len() as u32).to_be_bytes())
        .await
        .unwrap();
    client.stream.write_all(body).await.unwrap();
    let reply = client.recv().await;
    assert_eq!(error_code(&reply), "invalid_frame");

    // Valid JSON without a `type` field.
    let body = br#"{"v":1,"payload":{}}"#;
    client
        .stream
        .write_all(&(body.len() as u32).to_be_bytes())
        .await
        .unwrap();
    client.stream.write_all(body).await.unwrap();
    let reply = client.recv().await;
    assert_eq!(error_code(&reply), "invalid_envelope");

    // The connection survives malformed frames.
    let reply = client.request("ping", json!({})).await;
    assert!(result_of(&reply).get("ts_ms").is_some());
}

#[tokio::test]
async fn oversized_frame_is_rejected() {
    let broker = start_broker(&["--max-frame-bytes", "512"]);
    let mut client = TestClient::connect(&broker.socket).await;
    client.hello().await;

    let filler = "x".repeat(1024);
    let frame = ProtocolEnvelope {
        v: PROTOCOL_VERSION,
        msg_type: "ping".to_string(),
        request_id: Some("big".to_string()),
        payload: json!({"filler": filler}),
    };
    // Bypass the client's cap to exercise the server's.
    write_frame(&mut client.stream, &frame, DEFAULT_MAX_FRAME_BYTES)
        .await
        .unwrap();
    let reply = client.recv().await;
    assert_eq!(error_code(&reply), "frame_too_large");
}

#[tokio::test]
async fn send_to_unknown_target_errors() {
    let broker = start_broker(&[]);
    let mut client = TestClient::connect(&broker.socket).await;
    client.hello().await;

    let reply = client
        .request("send_message", json!({"to": "Nobody", "text": "hi"}))
        .await;
    assert_eq!(error_code(&reply), "unknown_target");
}

#[tokio::test]
async fn spawn_send_verify_release_round_trip() {
    let broker = start_broker(&[]);
    let mut client = TestClient::connect(&broker.socket).await;
    client.hello().await;

    let reply = client
        .request("spawn_agent", pty_spec("Echoer", "cat", &[]))
        .await;
    assert_eq!(
        result_of(&reply).get("name").and_then(Value::as_str),
        Some("Echoer")
    );
    client
        .wait_for_event("agent_spawned", |e| event_kind(e) == "agent_spawned")
        .await;
    client
        .wait_for_event("agent_ready", |e| event_kind(e) == "agent_ready")
        .await;

    let reply = client
        .request(
            "send_message",
            json!({"to": "Echoer", "text": "ping", "from": "Sender"}),
        )
        .await;
    let result = result_of(&reply);
    let event_id = result
        .get("event_id")
        .and_then(Value::as_str)
        .expect("event_id")
        .to_string();
    assert_eq!(result.get("targets"), Some(&json!(["Echoer"])));

    for kind in [
        "delivery_queued",
        "delivery_injected",
        "delivery_verified",
    ] {
        let event = client.wait_for_event(kind, |e| event_kind(e) == kind).await;
        assert_eq!(
            event.get("event_id").and_then(Value::as_str),
            Some(event_id.as_str()),
            "wrong event_id on {kind}"
        );
    }
    let inbound = client
        .wait_for_event("relay_inbound", |e| event_kind(e) == "relay_inbound")
        .await;
    assert_eq!(inbound.get("from").and_then(Value::as_str), Some("Sender"));
    assert_eq!(inbound.get("target").and_then(Value::as_str), Some("Echoer"));
    assert_eq!(inbound.get("body").and_then(Value::as_str), Some("ping"));
    client
        .wait_for_event("delivery_ack", |e| event_kind(e) == "delivery_ack")
        .await;

    let reply = client
        .request("release_agent", json!({"name": "Echoer"}))
        .await;
    assert_eq!(
        result_of(&reply).get("name").and_then(Value::as_str),
        Some("Echoer")
    );
    client
        .wait_for_event("agent_released", |e| event_kind(e) == "agent_released")
        .await;

    let reply = client.request("list_agents", json!({})).await;
    assert_eq!(result_of(&reply), &json!([]));
}

#[tokio::test]
async fn channel_fanout_reaches_all_members_once() {
    let broker = start_broker(&[]);
    let mut client = TestClient::connect(&broker.socket).await;
    client.hello().await;

    for name in ["A", "B", "C"] {
        client
            .request("spawn_agent", pty_spec(name, "cat", &["team"]))
            .await;
        let ready = format!("agent_ready {name}");
        client
            .wait_for_event(&ready, |e| {
                event_kind(e) == "agent_ready"
                    && e.get("name").and_then(Value::as_str) == Some(name)
            })
            .await;
    }

    let reply = client
        .request("send_message", json!({"to": "#team", "text": "all hands"}))
        .await;
    let result = result_of(&reply);
    let event_id = result
        .get("event_id")
        .and_then(Value::as_str)
        .expect("event_id")
        .to_string();
    assert_eq!(
        result.get("targets"),
        Some(&json!(["A", "B", "C"])),
        "fan-out follows join order"
    );

    let mut seen = Vec::new();
    for _ in 0..3 {
        let inbound = client
            .wait_for_event("relay_inbound", |e| {
                event_kind(e) == "relay_inbound"
                    && e.get("event_id").and_then(Value::as_str) == Some(event_id.as_str())
            })
            .await;
        seen.push(
            inbound
                .get("target")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
        );
    }
    seen.sort();
    assert_eq!(seen, vec!["A", "B", "C"]);
}

#[tokio::test]
async fn blocking_send_resolves_on_ack() {
    let broker = start_broker(&[]);
    let mut client = TestClient::connect(&broker.socket).await;
    client.hello().await;

    client
        .request("spawn_agent", pty_spec("Responder", "cat", &[]))
        .await;
    client
        .wait_for_event("agent_ready", |e| event_kind(e) == "agent_ready")
        .await;

    let reply = client
        .request(
            "send_message",
            json!({
                "to": "Responder",
                "text": "Q",
                "sync": {"blocking": true, "timeout_ms": 15_000},
            }),
        )
        .await;
    // PTY runtimes implicitly ack on verification, which resolves the
    // blocking request.
    let result = result_of(&reply);
    assert!(result
        .get("correlation_id")
        .and_then(Value::as_str)
        .is_some());
    assert_eq!(
        result.get("target").and_then(Value::as_str),
        Some("Responder")
    );
}

#[tokio::test]
async fn blocking_send_times_out_without_ack() {
    let broker = start_broker(&[]);
    let mut client = TestClient::connect(&broker.socket).await;
    client.hello().await;

    // Echo disabled: injection can never verify, so no implicit ack.
    client
        .request(
            "spawn_agent",
            pty_spec("Mute", "sh -c 'stty -echo; sleep 300'", &[]),
        )
        .await;
    client
        .wait_for_event("agent_ready", |e| event_kind(e) == "agent_ready")
        .await;

    let reply = client
        .request(
            "send_message",
            json!({
                "to": "Mute",
                "text": "anyone there?",
                "sync": {"blocking": true, "timeout_ms": 1_000, "correlation_id": "corr_t1"},
            }),
        )
        .await;
    assert_eq!(error_code(&reply), "ack_timeout");
    assert_eq!(
        reply
            .payload
            .get("data")
            .and_then(|d| d.get("correlation_id"))
            .and_then(Value::as_str),
        Some("corr_t1")
    );
}

#[tokio::test]
async fn duplicate_correlation_id_rejected_while_pending() {
    let broker = start_broker(&[]);
    let mut client = TestClient::connect(&broker.socket).await;
    client.hello().await;

    client
        .request(
            "spawn_agent",
            pty_spec("Quiet", "sh -c 'stty -echo; sleep 300'", &[]),
        )
        .await;
    client
        .wait_for_event("agent_ready", |e| event_kind(e) == "agent_ready")
        .await;

    // Tagged non-blocking send registers the correlation and returns.
    let reply = client
        .request(
            "send_message",
            json!({
                "to": "Quiet",
                "text": "first",
                "sync": {"correlation_id": "corr_dup", "timeout_ms": 15_000},
            }),
        )
        .await;
    assert_eq!(
        result_of(&reply).get("correlation_id").and_then(Value::as_str),
        Some("corr_dup")
    );

    let reply = client
        .request(
            "send_message",
            json!({
                "to": "Quiet",
                "text": "second",
                "sync": {"correlation_id": "corr_dup", "timeout_ms": 15_000},
            }),
        )
        .await;
    assert_eq!(error_code(&reply), "duplicate_correlation_id");

    let reply = client
        .request(
            "send_message",
            json!({"to": "Quiet", "text": "third", "sync": {}}),
        )
        .await;
    assert_eq!(error_code(&reply), "missing_correlation_id");
}

#[tokio::test]
async fn full_queue_preempts_lower_priority_only() {
    let broker = start_broker(&["--queue-depth", "2"]);
    let mut client = TestClient::connect(&broker.socket).await;
    client.hello().await;

    // A worker that never verifies keeps deliveries parked in the queue.
    client
        .request(
            "spawn_agent",
            pty_spec("Stuck", "sh -c 'stty -echo; sleep 300'", &[]),
        )
        .await;
    client
        .wait_for_event("agent_ready", |e| event_kind(e) == "agent_ready")
        .await;

    // First send goes in flight; the next two fill the queue.
    for text in ["d0", "d1", "d2"] {
        let reply = client
            .request(
                "send_message",
                json!({"to": "Stuck", "text": text, "priority": 0}),
            )
            .await;
        assert_eq!(reply.msg_type, "ok", "send {text} should succeed");
    }

    // Strictly higher priority preempts the oldest priority-0 entry.
    let reply = client
        .request(
            "send_message",
            json!({"to": "Stuck", "text": "d3", "priority": 1}),
        )
        .await;
    assert_eq!(reply.msg_type, "ok");
    let dropped = client
        .wait_for_event("priority_preempt drop", |e| {
            event_kind(e) == "delivery_dropped"
                && e.get("reason").and_then(Value::as_str) == Some("priority_preempt")
        })
        .await;
    assert_eq!(dropped.get("name").and_then(Value::as_str), Some("Stuck"));
    assert_eq!(dropped.get("count").and_then(Value::as_u64), Some(1));

    // Equal priority cannot preempt.
    let reply = client
        .request(
            "send_message",
            json!({"to": "Stuck", "text": "d4", "priority": 0}),
        )
        .await;
    assert_eq!(error_code(&reply), "queue_full");
}

#[tokio::test]
async fn worker_crash_is_isolated() {
    let broker = start_broker(&[]);
    let mut client = TestClient::connect(&broker.socket).await;
    client.hello().await;

    for name in ["Doomed", "Survivor"] {
        client
            .request("spawn_agent", pty_spec(name, "cat", &[]))
            .await;
        let ready = format!("agent_ready {name}");
        client
            .wait_for_event(&ready, |e| {
                event_kind(e) == "agent_ready"
                    && e.get("name").and_then(Value::as_str) == Some(name)
            })
            .await;
    }

    let reply = client.request("list_agents", json!({})).await;
    let pid = result_of(&reply)
        .as_array()
        .and_then(|agents| {
            agents
                .iter()
                .find(|a| a.get("name").and_then(Value::as_str) == Some("Doomed"))
        })
        .and_then(|a| a.get("pid"))
        .and_then(Value::as_u64)
        .expect("Doomed has a pid");

    // SAFETY: kill(2) with SIGKILL on a worker we just spawned.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }

    let exited = client
        .wait_for_event("agent_exited", |e| event_kind(e) == "agent_exited")
        .await;
    assert_eq!(exited.get("name").and_then(Value::as_str), Some("Doomed"));

    // The survivor still receives messages with a normal event sequence.
    let reply = client
        .request("send_message", json!({"to": "Survivor", "text": "still on?"}))
        .await;
    assert_eq!(reply.msg_type, "ok");
    let inbound = client
        .wait_for_event("relay_inbound", |e| event_kind(e) == "relay_inbound")
        .await;
    assert_eq!(
        inbound.get("target").and_then(Value::as_str),
        Some("Survivor")
    );

    let reply = client.request("list_agents", json!({})).await;
    let names: Vec<&str> = result_of(&reply)
        .as_array()
        .map(|agents| {
            agents
                .iter()
                .filter_map(|a| a.get("name").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    assert_eq!(names, vec!["Survivor"]);
}

#[tokio::test]
async fn duplicate_agent_name_rejected_until_released() {
    let broker = start_broker(&[]);
    let mut client = TestClient::connect(&broker.socket).await;
    client.hello().await;

    client
        .request("spawn_agent", pty_spec("Solo", "cat", &[]))
        .await;
    let reply = client
        .request("spawn_agent", pty_spec("Solo", "cat", &[]))
        .await;
    assert_eq!(error_code(&reply), "agent_exists");

    client
        .request("release_agent", json!({"name": "Solo"}))
        .await;
    let reply = client
        .request("spawn_agent", pty_spec("Solo", "cat", &[]))
        .await;
    assert_eq!(reply.msg_type, "ok");
}

#[tokio::test]
async fn status_reports_counts() {
    let broker = start_broker(&[]);
    let mut client = TestClient::connect(&broker.socket).await;
    client.hello().await;

    client
        .request("spawn_agent", pty_spec("Counted", "cat", &[]))
        .await;
    let reply = client.request("get_status", json!({})).await;
    let status = result_of(&reply);
    assert_eq!(status.get("agent_count").and_then(Value::as_u64), Some(1));
    assert!(status.get("pending_deliveries").is_some());
}
