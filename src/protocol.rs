use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRuntime {
    Pty,
    Headless,
}

impl AgentRuntime {
    /// Whether workers of this runtime emit their own `delivery_ack`.
    /// Runtimes that do not get an ack synthesized on verification.
    pub fn acks_explicitly(self) -> bool {
        matches!(self, AgentRuntime::Headless)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub runtime: AgentRuntime,
    #[serde(default)]
    pub cli: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default, skip_serializing_if = "std::collections::HashMap::is_empty")]
    pub env: std::collections::HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_threshold_secs: Option<u64>,
}

/// One in-flight unit addressed to exactly one agent, as sent to its worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDelivery {
    pub delivery_id: String,
    pub event_id: String,
    pub from: String,
    pub target: String,
    pub body: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

/// Sync metadata carried by a blocking `send_message`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub blocking: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolEnvelope<T> {
    pub v: u32,
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub request_id: Option<String>,
    pub payload: T,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ProtocolError {
    pub fn new(code: &str, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            retryable,
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// `ok{result}` response envelope.
pub fn ok_envelope(request_id: Option<String>, result: Value) -> ProtocolEnvelope<Value> {
    ProtocolEnvelope {
        v: PROTOCOL_VERSION,
        msg_type: "ok".to_string(),
        request_id,
        payload: serde_json::json!({ "result": result }),
    }
}

/// `error{code,message,retryable,data?}` response envelope.
pub fn error_envelope(request_id: Option<String>, error: &ProtocolError) -> ProtocolEnvelope<Value> {
    ProtocolEnvelope {
        v: PROTOCOL_VERSION,
        msg_type: "error".to_string(),
        request_id,
        payload: serde_json::to_value(error).unwrap_or_else(|_| Value::Null),
    }
}

/// `event{payload}` envelope; events carry no request id.
pub fn event_envelope(event: &BrokerEvent) -> ProtocolEnvelope<Value> {
    ProtocolEnvelope {
        v: PROTOCOL_VERSION,
        msg_type: "event".to_string(),
        request_id: None,
        payload: serde_json::to_value(event).unwrap_or_else(|_| Value::Null),
    }
}

/// `ack{...}` envelope forwarded to a blocking sender's connection.
pub fn ack_envelope(payload: Value) -> ProtocolEnvelope<Value> {
    ProtocolEnvelope {
        v: PROTOCOL_VERSION,
        msg_type: "ack".to_string(),
        request_id: None,
        payload,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BrokerEvent {
    AgentSpawned {
        name: String,
        runtime: AgentRuntime,
        parent: Option<String>,
        cli: Option<String>,
        pid: Option<u32>,
    },
    AgentReady {
        name: String,
    },
    AgentReleased {
        name: String,
    },
    AgentExited {
        name: String,
        code: Option<i32>,
        signal: Option<String>,
    },
    AgentIdle {
        name: String,
        idle_secs: u64,
    },
    RelayInbound {
        event_id: String,
        from: String,
        target: String,
        body: String,
        thread_id: Option<String>,
    },
    WorkerStream {
        name: String,
        stream: String,
        chunk: String,
    },
    WorkerError {
        name: String,
        code: String,
        message: String,
    },
    DeliveryQueued {
        name: String,
        delivery_id: String,
        event_id: String,
    },
    DeliveryInjected {
        name: String,
        delivery_id: String,
        event_id: String,
    },
    DeliveryVerified {
        name: String,
        delivery_id: String,
        event_id: String,
    },
    DeliveryAck {
        name: String,
        delivery_id: String,
        event_id: String,
        correlation_id: Option<String>,
    },
    DeliveryRetry {
        name: String,
        delivery_id: String,
        event_id: String,
        attempts: u32,
    },
    DeliveryFailed {
        name: String,
        delivery_id: String,
        event_id: String,
        reason: String,
    },
    DeliveryDropped {
        name: String,
        count: usize,
        reason: String,
    },
    AclDenied {
        name: String,
        sender: String,
        owner_chain: Vec<String>,
    },
    ChannelJoined {
        name: String,
        channel: String,
    },
    ChannelLeft {
        name: String,
        channel: String,
    },
}

/// Frames the broker writes to a worker's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum BrokerToWorker {
    InitWorker {
        agent: AgentSpec,
    },
    DeliverAgent(AgentDelivery),
    SendInput {
        data: String,
    },
    SetModel {
        model: String,
    },
    ShutdownWorker {
        reason: String,
        #[serde(default)]
        grace_ms: Option<u64>,
    },
    Ping {
        ts_ms: u64,
    },
}

/// Frames a worker writes to its stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WorkerToBroker {
    WorkerReady {
        name: String,
        runtime: AgentRuntime,
    },
    DeliveryInjected {
        delivery_id: String,
        event_id: String,
    },
    DeliveryVerified {
        delivery_id: String,
        event_id: String,
    },
    DeliveryAck {
        delivery_id: String,
        event_id: String,
        #[serde(default)]
        correlation_id: Option<String>,
        #[serde(default)]
        response: Option<String>,
    },
    DeliveryFailed {
        delivery_id: String,
        event_id: String,
        reason: String,
        #[serde(default)]
        retryable: bool,
    },
    WorkerStream {
        stream: String,
        chunk: String,
    },
    AgentIdle {
        idle_secs: u64,
    },
    WorkerError(ProtocolError),
    AgentExit {
        reason: String,
        #[serde(default)]
        last_output: Option<String>,
    },
    WorkerExited {
        code: Option<i32>,
        signal: Option<String>,
    },
    Pong {
        ts_ms: u64,
    },
}
