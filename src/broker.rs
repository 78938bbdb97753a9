use std::{
    collections::HashMap,
    path::PathBuf,
    time::{Duration, Instant},
};

use anyhow::Result;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{
    sync::{mpsc, watch},
    time::MissedTickBehavior,
};

use crate::{
    channels::ChannelIndex,
    config::ServeCommand,
    correlator::{CorrelatorError, SyncCorrelator},
    delivery::{new_correlation_id, new_event_id, Delivery, DeliveryState},
    events::EventBus,
    helpers::current_timestamp_ms,
    protocol::{
        ack_envelope, error_envelope, ok_envelope, AgentSpec, BrokerEvent, ProtocolEnvelope,
        ProtocolError, SyncOptions,
    },
    queue::{DeliveryQueue, QueueError, MAX_PRIORITY},
    registry::{AgentRegistry, AgentState, SpawnError, WorkerEvent},
    router::{resolve, RouteError, TargetSelector},
};

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub queue_depth: usize,
    pub max_attempts: u32,
    pub delivery_ttl: Option<Duration>,
    pub ack_timeout: Duration,
    pub shutdown_grace: Duration,
    /// How long the engine waits for a worker verdict on one injection
    /// before treating the attempt as failed. Covers the worker's own
    /// verification window plus margin.
    pub dispatch_deadline: Duration,
    pub retry_backoff: Duration,
    pub event_depth: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue_depth: 1_000,
            max_attempts: 3,
            delivery_ttl: None,
            ack_timeout: Duration::from_millis(30_000),
            shutdown_grace: Duration::from_millis(3_000),
            dispatch_deadline: Duration::from_secs(8),
            retry_backoff: Duration::from_millis(500),
            event_depth: 256,
        }
    }
}

impl BrokerConfig {
    pub fn from_serve(cmd: &ServeCommand) -> Self {
        Self {
            queue_depth: cmd.queue_depth,
            max_attempts: cmd.max_attempts,
            delivery_ttl: match cmd.delivery_ttl_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            ack_timeout: Duration::from_millis(cmd.ack_timeout_ms),
            shutdown_grace: Duration::from_millis(cmd.shutdown_grace_ms),
            dispatch_deadline: Duration::from_secs(8),
            retry_backoff: Duration::from_millis(500),
            event_depth: cmd.event_depth,
        }
    }
}

/// Commands from connection tasks to the broker core.
#[derive(Debug)]
pub enum BrokerCommand {
    Attach {
        connection_id: u64,
        client_name: String,
        reply_tx: mpsc::Sender<ProtocolEnvelope<Value>>,
    },
    Request {
        connection_id: u64,
        frame: ProtocolEnvelope<Value>,
    },
    Detach {
        connection_id: u64,
    },
}

#[derive(Clone)]
pub struct BrokerHandle {
    pub cmd_tx: mpsc::Sender<BrokerCommand>,
    pub bus: EventBus,
}

struct ConnectionEntry {
    client_name: String,
    reply_tx: mpsc::Sender<ProtocolEnvelope<Value>>,
}

struct InFlight {
    delivery: Delivery,
    deadline: Instant,
}

#[derive(Debug, Deserialize)]
struct SpawnPayload {
    agent: AgentSpec,
    #[serde(default)]
    initial_task: Option<String>,
    #[serde(default)]
    parent: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendMessagePayload {
    to: String,
    text: String,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    priority: Option<u8>,
    #[serde(default)]
    sync: Option<SyncOptions>,
}

#[derive(Debug, Deserialize)]
struct NamePayload {
    name: String,
}

#[derive(Debug, Deserialize)]
struct SendInputPayload {
    name: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct SetModelPayload {
    name: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct ChannelPayload {
    name: String,
    channel: String,
}

/// The serialized owner of registry, channel index, queues, and correlator.
/// Every mutation arrives as a message; concurrency lives at the edges.
pub struct Broker {
    cfg: BrokerConfig,
    registry: AgentRegistry,
    channels: ChannelIndex,
    correlator: SyncCorrelator,
    bus: EventBus,
    cmd_rx: mpsc::Receiver<BrokerCommand>,
    worker_rx: mpsc::Receiver<WorkerEvent>,
    connections: HashMap<u64, ConnectionEntry>,
    queues: HashMap<String, DeliveryQueue<Delivery>>,
    in_flight: HashMap<String, InFlight>,
    next_dispatch_at: HashMap<String, Instant>,
    initial_tasks: HashMap<String, String>,
    shutdown_tx: watch::Sender<bool>,
    shutting_down: bool,
}

impl Broker {
    pub fn new(
        cfg: BrokerConfig,
        workspace: Option<PathBuf>,
        fallback_cli: Option<String>,
        max_agents: usize,
        default_idle_threshold_secs: u64,
        shutdown_tx: watch::Sender<bool>,
    ) -> (Self, BrokerHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (worker_tx, worker_rx) = mpsc::channel(1024);
        let bus = EventBus::new(cfg.event_depth);
        let registry = AgentRegistry::new(
            worker_tx,
            workspace,
            fallback_cli,
            max_agents,
            default_idle_threshold_secs,
        );

        let broker = Self {
            cfg,
            registry,
            channels: ChannelIndex::new(),
            correlator: SyncCorrelator::new(),
            bus: bus.clone(),
            cmd_rx,
            worker_rx,
            connections: HashMap::new(),
            queues: HashMap::new(),
            in_flight: HashMap::new(),
            next_dispatch_at: HashMap::new(),
            initial_tasks: HashMap::new(),
            shutdown_tx,
            shutting_down: false,
        };
        let handle = BrokerHandle { cmd_tx, bus };
        (broker, handle)
    }

    pub async fn run(mut self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tick = tokio::time::interval(Duration::from_millis(100));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut reap_tick = tokio::time::interval(Duration::from_secs(1));
        reap_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ping_tick = tokio::time::interval(Duration::from_secs(15));
        ping_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if self.handle_command(cmd).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                event = self.worker_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_worker_event(event).await;
                    }
                }
                _ = tick.tick() => {
                    self.on_tick(Instant::now()).await;
                }
                _ = reap_tick.tick() => {
                    self.reap_workers().await;
                }
                _ = ping_tick.tick() => {
                    self.ping_workers().await;
                }
                _ = shutdown_rx.changed() => {
                    break;
                }
            }
        }

        self.shutdown_sequence().await;
        Ok(())
    }

    /// Returns true when the broker should stop (shutdown request).
    async fn handle_command(&mut self, cmd: BrokerCommand) -> bool {
        match cmd {
            BrokerCommand::Attach {
                connection_id,
                client_name,
                reply_tx,
            } => {
                self.connections.insert(
                    connection_id,
                    ConnectionEntry {
                        client_name,
                        reply_tx,
                    },
                );
                false
            }
            BrokerCommand::Detach { connection_id } => {
                self.connections.remove(&connection_id);
                let cancelled = self.correlator.cancel_connection(connection_id);
                if !cancelled.is_empty() {
                    tracing::debug!(
                        target = "fleet::broker",
                        connection_id,
                        cancelled = cancelled.len(),
                        "cancelled correlations for closed connection"
                    );
                }
                false
            }
            BrokerCommand::Request {
                connection_id,
                frame,
            } => self.handle_request(connection_id, frame).await,
        }
    }

    async fn handle_request(&mut self, conn_id: u64, frame: ProtocolEnvelope<Value>) -> bool {
        let request_id = frame.request_id.clone();
        if self.shutting_down {
            self.reply_err(
                conn_id,
                request_id,
                ProtocolError::new("broker_shutting_down", "broker is shutting down", false),
            )
            .await;
            return false;
        }

        match frame.msg_type.as_str() {
            "spawn_agent" => {
                self.handle_spawn(conn_id, request_id, frame.payload).await;
                false
            }
            "send_message" => {
                self.handle_send(conn_id, request_id, frame.payload).await;
                false
            }
            "release_agent" => {
                self.handle_release(conn_id, request_id, frame.payload)
                    .await;
                false
            }
            "send_input" => {
                self.handle_send_input(conn_id, request_id, frame.payload)
                    .await;
                false
            }
            "set_model" => {
                self.handle_set_model(conn_id, request_id, frame.payload)
                    .await;
                false
            }
            "join_channel" | "leave_channel" => {
                let join = frame.msg_type == "join_channel";
                self.handle_channel(conn_id, request_id, frame.payload, join)
                    .await;
                false
            }
            "list_agents" => {
                let agents = self.registry.list(&self.channels);
                self.reply_ok(conn_id, request_id, json!(agents)).await;
                false
            }
            "get_status" => {
                let status = self.status_snapshot();
                self.reply_ok(conn_id, request_id, status).await;
                false
            }
            "ping" => {
                self.reply_ok(conn_id, request_id, json!({"ts_ms": current_timestamp_ms()}))
                    .await;
                false
            }
            "shutdown" => {
                self.reply_ok(conn_id, request_id, json!({})).await;
                self.shutting_down = true;
                let _ = self.shutdown_tx.send(true);
                true
            }
            other => {
                self.reply_err(
                    conn_id,
                    request_id,
                    ProtocolError::new(
                        "unsupported_operation",
                        format!("unsupported request type '{other}'"),
                        false,
                    ),
                )
                .await;
                false
            }
        }
    }

    async fn handle_spawn(&mut self, conn_id: u64, request_id: Option<String>, payload: Value) {
        let payload: SpawnPayload = match serde_json::from_value(payload) {
            Ok(p) => p,
            Err(error) => {
                self.reply_err(
                    conn_id,
                    request_id,
                    ProtocolError::new("invalid_spec", error.to_string(), false),
                )
                .await;
                return;
            }
        };

        if let Some(parent) = payload.parent.as_deref() {
            if !self.registry.has_worker(parent) {
                self.reply_err(
                    conn_id,
                    request_id,
                    ProtocolError::new(
                        "invalid_spec",
                        format!("parent agent '{parent}' does not exist"),
                        false,
                    ),
                )
                .await;
                return;
            }
        }

        let spec = payload.agent.clone();
        let name = spec.name.trim().to_string();
        let runtime = spec.runtime;
        match self.registry.spawn(spec, payload.parent.clone()).await {
            Ok(pid) => {
                for channel in &payload.agent.channels {
                    self.channels.join(channel, &name);
                }
                self.queues
                    .insert(name.clone(), DeliveryQueue::new(self.cfg.queue_depth));
                if let Some(task) = payload
                    .initial_task
                    .filter(|task| !task.trim().is_empty())
                {
                    self.initial_tasks.insert(name.clone(), task);
                }
                self.bus.publish(BrokerEvent::AgentSpawned {
                    name: name.clone(),
                    runtime,
                    parent: payload.parent,
                    cli: payload.agent.cli.clone(),
                    pid: Some(pid),
                });
                self.reply_ok(conn_id, request_id, json!({"name": name, "runtime": runtime}))
                    .await;
            }
            Err(error) => {
                let proto = match &error {
                    SpawnError::AgentExists(name) => ProtocolError::new(
                        "agent_exists",
                        format!("agent '{name}' already exists"),
                        false,
                    ),
                    SpawnError::InvalidSpec(message) => {
                        ProtocolError::new("invalid_spec", message.clone(), false)
                    }
                    SpawnError::AgentLimit(limit) => {
                        ProtocolError::new("spawn_failed", error.to_string(), false)
                            .with_data(json!({"max_agents": limit}))
                    }
                    SpawnError::Failed(_) => {
                        ProtocolError::new("spawn_failed", error.to_string(), true)
                    }
                };
                self.reply_err(conn_id, request_id, proto).await;
            }
        }
    }

    async fn handle_send(&mut self, conn_id: u64, request_id: Option<String>, payload: Value) {
        let payload: SendMessagePayload = match serde_json::from_value(payload) {
            Ok(p) => p,
            Err(error) => {
                self.reply_err(
                    conn_id,
                    request_id,
                    ProtocolError::new("invalid_envelope", error.to_string(), false),
                )
                .await;
                return;
            }
        };

        let sender = self.normalize_sender(conn_id, payload.from.clone());
        let selector = TargetSelector::parse(&payload.to);
        let agents = self.registry.routing_agents();
        let plan = match resolve(&selector, &sender, &agents, &self.channels) {
            Ok(plan) => plan,
            Err(RouteError::UnknownTarget(target)) => {
                self.reply_err(
                    conn_id,
                    request_id,
                    ProtocolError::new(
                        "unknown_target",
                        format!("unknown target '{target}'"),
                        false,
                    ),
                )
                .await;
                return;
            }
        };

        // Sync metadata is validated before any delivery is enqueued so a
        // rejected request has no side effects.
        let mut correlation: Option<(String, bool, Duration)> = None;
        if let Some(sync) = payload.sync.clone() {
            let timeout = sync
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(self.cfg.ack_timeout);
            if sync.blocking {
                let cid = sync.correlation_id.unwrap_or_else(new_correlation_id);
                correlation = Some((cid, true, timeout));
            } else if let Some(cid) = sync.correlation_id {
                correlation = Some((cid, false, timeout));
            } else {
                self.reply_err(
                    conn_id,
                    request_id,
                    ProtocolError::new(
                        "missing_correlation_id",
                        "sync metadata requires `blocking:true` or a correlation_id",
                        false,
                    ),
                )
                .await;
                return;
            }
        }
        if let Some((cid, _, _)) = &correlation {
            if self.correlator.is_pending(cid) {
                self.reply_err(
                    conn_id,
                    request_id,
                    ProtocolError::new(
                        "duplicate_correlation_id",
                        format!("correlation id '{cid}' is already pending"),
                        false,
                    ),
                )
                .await;
                return;
            }
        }

        for (denied, chain) in &plan.denied {
            self.bus.publish(BrokerEvent::AclDenied {
                name: denied.clone(),
                sender: sender.clone(),
                owner_chain: chain.clone(),
            });
        }

        let event_id = new_event_id();
        let priority = payload.priority.unwrap_or(2).min(MAX_PRIORITY);
        let exact_target = matches!(selector, TargetSelector::Agent(_));
        let correlation_id = correlation.as_ref().map(|(cid, _, _)| cid.clone());

        let mut targets = Vec::new();
        for recipient in &plan.recipients {
            let delivery = Delivery::new(
                &event_id,
                &sender,
                recipient,
                &payload.text,
                payload.thread_id.clone(),
                priority,
                correlation_id.clone(),
            );
            let delivery_id = delivery.delivery_id.clone();
            let queue = self
                .queues
                .entry(recipient.clone())
                .or_insert_with(|| DeliveryQueue::new(self.cfg.queue_depth));

            match queue.push_with_preemption(delivery) {
                Ok(None) => {}
                Ok(Some(mut preempted)) => {
                    preempted.transition(DeliveryState::Dropped);
                    self.bus.publish(BrokerEvent::DeliveryDropped {
                        name: recipient.clone(),
                        count: 1,
                        reason: "priority_preempt".to_string(),
                    });
                }
                Err(QueueError::Full) => {
                    if exact_target {
                        self.reply_err(
                            conn_id,
                            request_id,
                            ProtocolError::new(
                                "queue_full",
                                format!("delivery queue for '{recipient}' is full"),
                                true,
                            ),
                        )
                        .await;
                        return;
                    }
                    // Fan-out: skip the saturated member, keep the rest.
                    self.bus.publish(BrokerEvent::DeliveryDropped {
                        name: recipient.clone(),
                        count: 1,
                        reason: "queue_full".to_string(),
                    });
                    continue;
                }
            }
            self.bus.publish(BrokerEvent::DeliveryQueued {
                name: recipient.clone(),
                delivery_id,
                event_id: event_id.clone(),
            });
            targets.push(recipient.clone());
        }

        for target in targets.clone() {
            self.pump(&target).await;
        }

        match correlation {
            Some((cid, blocking, timeout)) if !targets.is_empty() => {
                let held_request = if blocking { request_id.clone() } else { None };
                match self.correlator.register(
                    &cid,
                    conn_id,
                    held_request,
                    &event_id,
                    &payload.to,
                    timeout,
                ) {
                    Ok(()) => {}
                    Err(CorrelatorError::Duplicate(cid)) => {
                        // Checked above; a race here means a buggy client.
                        self.reply_err(
                            conn_id,
                            request_id,
                            ProtocolError::new(
                                "duplicate_correlation_id",
                                format!("correlation id '{cid}' is already pending"),
                                false,
                            ),
                        )
                        .await;
                        return;
                    }
                }
                if !blocking {
                    self.reply_ok(
                        conn_id,
                        request_id,
                        json!({
                            "event_id": event_id,
                            "targets": targets,
                            "correlation_id": cid,
                        }),
                    )
                    .await;
                }
                // Blocking: the reply is issued by the correlator on ack or
                // timeout.
            }
            _ => {
                self.reply_ok(
                    conn_id,
                    request_id,
                    json!({"event_id": event_id, "targets": targets}),
                )
                .await;
            }
        }
    }

    async fn handle_release(&mut self, conn_id: u64, request_id: Option<String>, payload: Value) {
        let payload: NamePayload = match serde_json::from_value(payload) {
            Ok(p) => p,
            Err(error) => {
                self.reply_err(
                    conn_id,
                    request_id,
                    ProtocolError::new("invalid_envelope", error.to_string(), false),
                )
                .await;
                return;
            }
        };

        if !self.registry.has_worker(&payload.name) {
            self.reply_err(
                conn_id,
                request_id,
                ProtocolError::new(
                    "unknown_agent",
                    format!("unknown agent '{}'", payload.name),
                    false,
                ),
            )
            .await;
            return;
        }

        self.release_agent(&payload.name).await;
        self.reply_ok(conn_id, request_id, json!({"name": payload.name}))
            .await;
    }

    async fn handle_send_input(&mut self, conn_id: u64, request_id: Option<String>, payload: Value) {
        let payload: SendInputPayload = match serde_json::from_value(payload) {
            Ok(p) => p,
            Err(error) => {
                self.reply_err(
                    conn_id,
                    request_id,
                    ProtocolError::new("invalid_envelope", error.to_string(), false),
                )
                .await;
                return;
            }
        };

        if !self.registry.has_worker(&payload.name) {
            self.reply_err(
                conn_id,
                request_id,
                ProtocolError::new(
                    "unknown_agent",
                    format!("unknown agent '{}'", payload.name),
                    false,
                ),
            )
            .await;
            return;
        }

        let result = self
            .registry
            .send_to_worker(
                &payload.name,
                "send_input",
                None,
                json!({"data": payload.data}),
            )
            .await;
        match result {
            Ok(()) => self.reply_ok(conn_id, request_id, json!({})).await,
            Err(error) => {
                self.reply_err(
                    conn_id,
                    request_id,
                    ProtocolError::new("injection_failed", error.to_string(), true),
                )
                .await;
            }
        }
    }

    async fn handle_set_model(&mut self, conn_id: u64, request_id: Option<String>, payload: Value) {
        let payload: SetModelPayload = match serde_json::from_value(payload) {
            Ok(p) => p,
            Err(error) => {
                self.reply_err(
                    conn_id,
                    request_id,
                    ProtocolError::new("invalid_envelope", error.to_string(), false),
                )
                .await;
                return;
            }
        };

        let Some(runtime) = self.registry.runtime_of(&payload.name) else {
            self.reply_err(
                conn_id,
                request_id,
                ProtocolError::new(
                    "unknown_agent",
                    format!("unknown agent '{}'", payload.name),
                    false,
                ),
            )
            .await;
            return;
        };
        if runtime.acks_explicitly() {
            // Line-oriented runtimes have no slash-command surface.
            self.reply_err(
                conn_id,
                request_id,
                ProtocolError::new(
                    "not_supported",
                    format!("runtime {runtime:?} does not support set_model"),
                    false,
                ),
            )
            .await;
            return;
        }

        let result = self
            .registry
            .send_to_worker(
                &payload.name,
                "set_model",
                None,
                json!({"model": payload.model}),
            )
            .await;
        match result {
            Ok(()) => self.reply_ok(conn_id, request_id, json!({})).await,
            Err(error) => {
                self.reply_err(
                    conn_id,
                    request_id,
                    ProtocolError::new("injection_failed", error.to_string(), true),
                )
                .await;
            }
        }
    }

    async fn handle_channel(
        &mut self,
        conn_id: u64,
        request_id: Option<String>,
        payload: Value,
        join: bool,
    ) {
        let payload: ChannelPayload = match serde_json::from_value(payload) {
            Ok(p) => p,
            Err(error) => {
                self.reply_err(
                    conn_id,
                    request_id,
                    ProtocolError::new("invalid_envelope", error.to_string(), false),
                )
                .await;
                return;
            }
        };

        if !self.registry.has_worker(&payload.name) {
            self.reply_err(
                conn_id,
                request_id,
                ProtocolError::new(
                    "unknown_agent",
                    format!("unknown agent '{}'", payload.name),
                    false,
                ),
            )
            .await;
            return;
        }

        if join {
            self.channels.join(&payload.channel, &payload.name);
            self.bus.publish(BrokerEvent::ChannelJoined {
                name: payload.name.clone(),
                channel: payload.channel.clone(),
            });
        } else {
            self.channels.leave(&payload.channel, &payload.name);
            self.bus.publish(BrokerEvent::ChannelLeft {
                name: payload.name.clone(),
                channel: payload.channel.clone(),
            });
        }
        self.reply_ok(conn_id, request_id, json!({})).await;
    }

    fn normalize_sender(&self, conn_id: u64, from: Option<String>) -> String {
        let raw = from.unwrap_or_default().trim().to_string();
        if !raw.is_empty() {
            return raw;
        }
        let client = self
            .connections
            .get(&conn_id)
            .map(|entry| entry.client_name.as_str())
            .filter(|name| !name.is_empty())
            .unwrap_or("orchestrator");
        format!("human:{client}")
    }

    fn status_snapshot(&self) -> Value {
        let mut pending = Vec::new();
        for (name, infl) in &self.in_flight {
            pending.push(delivery_snapshot(name, &infl.delivery));
        }
        for (name, queue) in &self.queues {
            for delivery in queue.iter() {
                pending.push(delivery_snapshot(name, delivery));
            }
        }
        json!({
            "agent_count": self.registry.len(),
            "agents": self.registry.list(&self.channels),
            "pending_delivery_count": pending.len(),
            "pending_deliveries": pending,
            "pending_correlations": self.correlator.len(),
        })
    }

    async fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Stream {
                name,
                stream,
                chunk,
            } => {
                self.registry.touch(&name);
                self.bus.publish(BrokerEvent::WorkerStream {
                    name,
                    stream: stream.to_string(),
                    chunk,
                });
            }
            WorkerEvent::Frame { name, frame } => {
                self.handle_worker_frame(name, frame).await;
            }
        }
    }

    async fn handle_worker_frame(&mut self, name: String, frame: ProtocolEnvelope<Value>) {
        match frame.msg_type.as_str() {
            "worker_ready" => {
                self.registry.set_state(&name, AgentState::Ready);
                self.bus.publish(BrokerEvent::AgentReady { name: name.clone() });
                if let Some(task) = self.initial_tasks.remove(&name) {
                    self.enqueue_system_delivery(&name, &task).await;
                }
                self.pump(&name).await;
            }
            "worker_stream" => {
                self.registry.touch(&name);
                let stream = frame
                    .payload
                    .get("stream")
                    .and_then(Value::as_str)
                    .unwrap_or("stdout")
                    .to_string();
                let chunk = frame
                    .payload
                    .get("chunk")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.bus
                    .publish(BrokerEvent::WorkerStream { name, stream, chunk });
            }
            "delivery_injected" => {
                if let Some(infl) = self.matching_in_flight(&name, &frame.payload) {
                    self.bus.publish(BrokerEvent::DeliveryInjected {
                        name: name.clone(),
                        delivery_id: infl.delivery.delivery_id.clone(),
                        event_id: infl.delivery.event_id.clone(),
                    });
                }
            }
            "delivery_verified" => {
                self.on_delivery_verified(&name, &frame.payload).await;
            }
            "delivery_ack" => {
                self.on_delivery_ack(&name, &frame.payload).await;
            }
            "delivery_failed" => {
                let reason = frame
                    .payload
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("worker reported failure")
                    .to_string();
                let retryable = frame
                    .payload
                    .get("retryable")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                self.on_delivery_failed(&name, &frame.payload, &reason, retryable)
                    .await;
            }
            "agent_idle" => {
                let idle_secs = frame
                    .payload
                    .get("idle_secs")
                    .and_then(Value::as_u64)
                    .unwrap_or_default();
                self.registry.set_state(&name, AgentState::Idle);
                self.bus
                    .publish(BrokerEvent::AgentIdle { name, idle_secs });
            }
            "worker_error" => {
                let code = frame
                    .payload
                    .get("code")
                    .and_then(Value::as_str)
                    .unwrap_or("internal_error")
                    .to_string();
                let message = frame
                    .payload
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.bus
                    .publish(BrokerEvent::WorkerError { name, code, message });
            }
            "agent_exit" => {
                tracing::info!(
                    target = "fleet::broker",
                    worker = %name,
                    reason = %frame
                        .payload
                        .get("reason")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("unknown"),
                    "worker announced exit"
                );
            }
            "worker_exited" => {
                let code = frame
                    .payload
                    .get("code")
                    .and_then(Value::as_i64)
                    .map(|v| v as i32);
                let signal = frame
                    .payload
                    .get("signal")
                    .and_then(Value::as_str)
                    .map(ToOwned::to_owned);
                self.on_agent_exited(&name, code, signal).await;
            }
            "pong" => {
                self.registry.touch(&name);
            }
            other => {
                tracing::debug!(
                    target = "fleet::broker",
                    worker = %name,
                    msg_type = %other,
                    "ignoring unrecognized worker frame"
                );
            }
        }
    }

    /// The in-flight entry for a worker, only when the frame references it.
    fn matching_in_flight(&self, name: &str, payload: &Value) -> Option<&InFlight> {
        let delivery_id = payload.get("delivery_id").and_then(Value::as_str)?;
        let infl = self.in_flight.get(name)?;
        if infl.delivery.delivery_id == delivery_id {
            Some(infl)
        } else {
            tracing::warn!(
                target = "fleet::broker",
                worker = %name,
                expected = %infl.delivery.delivery_id,
                received = %delivery_id,
                "ignoring stale delivery lifecycle frame"
            );
            None
        }
    }

    async fn on_delivery_verified(&mut self, name: &str, payload: &Value) {
        if self.matching_in_flight(name, payload).is_none() {
            return;
        }
        let Some(infl) = self.in_flight.get_mut(name) else {
            return;
        };
        if !infl.delivery.transition(DeliveryState::Verified) {
            return;
        }
        let delivery = infl.delivery.clone();
        self.registry.touch(name);
        self.bus.publish(BrokerEvent::DeliveryVerified {
            name: name.to_string(),
            delivery_id: delivery.delivery_id.clone(),
            event_id: delivery.event_id.clone(),
        });
        self.bus.publish(BrokerEvent::RelayInbound {
            event_id: delivery.event_id.clone(),
            from: delivery.from.clone(),
            target: name.to_string(),
            body: delivery.body.clone(),
            thread_id: delivery.thread_id.clone(),
        });

        let acks_explicitly = self
            .registry
            .runtime_of(name)
            .map(|rt| rt.acks_explicitly())
            .unwrap_or(false);
        if !acks_explicitly {
            // Non-ACKing runtime: verification is the terminal signal.
            self.complete_ack(name, None).await;
        }
    }

    async fn on_delivery_ack(&mut self, name: &str, payload: &Value) {
        let response = payload
            .get("response")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned);

        if self.matching_in_flight(name, payload).is_some() {
            self.complete_ack(name, response).await;
            return;
        }

        // No in-flight match: the ack may still complete a pending
        // correlation (e.g. an agent responding asynchronously).
        if let Some(cid) = payload.get("correlation_id").and_then(Value::as_str) {
            self.resolve_correlation(cid, response).await;
        }
    }

    async fn complete_ack(&mut self, name: &str, response: Option<String>) {
        let Some(mut infl) = self.in_flight.remove(name) else {
            return;
        };
        if !infl.delivery.transition(DeliveryState::Acked) {
            return;
        }
        self.bus.publish(BrokerEvent::DeliveryAck {
            name: name.to_string(),
            delivery_id: infl.delivery.delivery_id.clone(),
            event_id: infl.delivery.event_id.clone(),
            correlation_id: infl.delivery.correlation_id.clone(),
        });
        if let Some(cid) = infl.delivery.correlation_id.clone() {
            self.resolve_correlation(&cid, response).await;
        }
        self.next_dispatch_at.remove(name);
        self.pump(name).await;
    }

    /// At-most-once completion: forwards the ACK to the sender connection and
    /// resolves the blocked request, if any. Later ACKs for the same id are
    /// silently dropped by the correlator.
    async fn resolve_correlation(&mut self, correlation_id: &str, response: Option<String>) {
        let Some(pending) = self.correlator.complete(correlation_id) else {
            tracing::debug!(
                target = "fleet::broker",
                correlation_id,
                "dropping ack for completed correlation"
            );
            return;
        };

        let ack_payload = json!({
            "correlation_id": pending.correlation_id,
            "event_id": pending.event_id,
            "target": pending.target,
            "response": response,
        });
        self.send_to_conn(pending.connection_id, ack_envelope(ack_payload.clone()))
            .await;
        if let Some(request_id) = pending.request_id {
            self.send_to_conn(
                pending.connection_id,
                ok_envelope(Some(request_id), ack_payload),
            )
            .await;
        }
    }

    async fn on_delivery_failed(
        &mut self,
        name: &str,
        payload: &Value,
        reason: &str,
        retryable: bool,
    ) {
        if self.matching_in_flight(name, payload).is_none() {
            return;
        }
        let Some(infl) = self.in_flight.remove(name) else {
            return;
        };
        self.fail_or_retry(name, infl.delivery, reason, retryable)
            .await;
    }

    async fn fail_or_retry(
        &mut self,
        name: &str,
        mut delivery: Delivery,
        reason: &str,
        retryable: bool,
    ) {
        if retryable && delivery.attempts < self.cfg.max_attempts {
            if !delivery.return_to_queue() {
                return;
            }
            let attempts = delivery.attempts;
            let delivery_id = delivery.delivery_id.clone();
            let event_id = delivery.event_id.clone();
            if let Some(queue) = self.queues.get_mut(name) {
                queue.push_front(delivery);
            }
            let jitter = rand::thread_rng().gen_range(0..250);
            self.next_dispatch_at.insert(
                name.to_string(),
                Instant::now() + self.cfg.retry_backoff + Duration::from_millis(jitter),
            );
            self.bus.publish(BrokerEvent::DeliveryRetry {
                name: name.to_string(),
                delivery_id,
                event_id,
                attempts,
            });
        } else {
            delivery.transition(DeliveryState::Failed);
            self.bus.publish(BrokerEvent::DeliveryFailed {
                name: name.to_string(),
                delivery_id: delivery.delivery_id.clone(),
                event_id: delivery.event_id.clone(),
                reason: reason.to_string(),
            });
            Box::pin(self.pump(name)).await;
        }
    }

    async fn enqueue_system_delivery(&mut self, name: &str, body: &str) {
        let event_id = new_event_id();
        let delivery = Delivery::new(&event_id, "system", name, body, None, MAX_PRIORITY, None);
        let delivery_id = delivery.delivery_id.clone();
        let queue = self
            .queues
            .entry(name.to_string())
            .or_insert_with(|| DeliveryQueue::new(self.cfg.queue_depth));
        if queue.push(delivery).is_ok() {
            self.bus.publish(BrokerEvent::DeliveryQueued {
                name: name.to_string(),
                delivery_id,
                event_id,
            });
            self.pump(name).await;
        }
    }

    /// Advance one agent's delivery loop: exactly one injection in flight at
    /// a time, FIFO within priority.
    async fn pump(&mut self, name: &str) {
        if self.shutting_down || self.in_flight.contains_key(name) {
            return;
        }
        let Some(handle) = self.registry.get(name) else {
            return;
        };
        if handle.state == AgentState::Spawning {
            return;
        }
        if let Some(not_before) = self.next_dispatch_at.get(name) {
            if Instant::now() < *not_before {
                return;
            }
        }
        let Some(queue) = self.queues.get_mut(name) else {
            return;
        };
        let Some(mut delivery) = queue.pop() else {
            return;
        };
        if !delivery.begin_attempt() {
            return;
        }

        let wire = json!({
            "delivery_id": delivery.delivery_id,
            "event_id": delivery.event_id,
            "from": delivery.from,
            "target": delivery.target,
            "body": delivery.body,
            "thread_id": delivery.thread_id,
            "priority": delivery.priority,
            "correlation_id": delivery.correlation_id,
        });
        match self
            .registry
            .send_to_worker(name, "deliver_agent", None, wire)
            .await
        {
            Ok(()) => {
                self.in_flight.insert(
                    name.to_string(),
                    InFlight {
                        delivery,
                        deadline: Instant::now() + self.cfg.dispatch_deadline,
                    },
                );
            }
            Err(error) => {
                tracing::warn!(
                    target = "fleet::broker",
                    worker = %name,
                    error = %error,
                    "failed to hand delivery to worker"
                );
                self.fail_or_retry(name, delivery, &error.to_string(), true)
                    .await;
            }
        }
    }

    async fn on_tick(&mut self, now: Instant) {
        // Engine-side deadline: the worker never reported a verdict.
        let overdue: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, infl)| now >= infl.deadline)
            .map(|(name, _)| name.clone())
            .collect();
        for name in overdue {
            if let Some(infl) = self.in_flight.remove(&name) {
                self.fail_or_retry(
                    &name,
                    infl.delivery,
                    "no delivery verdict before deadline",
                    true,
                )
                .await;
            }
        }

        // Blocking-send timeouts.
        for pending in self.correlator.expire(now) {
            let error = ProtocolError::new(
                "ack_timeout",
                format!(
                    "no ack for correlation '{}' within timeout",
                    pending.correlation_id
                ),
                true,
            )
            .with_data(json!({"correlation_id": pending.correlation_id}));
            self.send_to_conn(
                pending.connection_id,
                error_envelope(pending.request_id.clone(), &error),
            )
            .await;
        }

        // Optional TTL sweep over queued deliveries.
        if let Some(ttl) = self.cfg.delivery_ttl {
            let mut drops: Vec<(String, usize)> = Vec::new();
            for (name, queue) in &mut self.queues {
                let expired = queue.sweep_expired(ttl, now);
                if expired.is_empty() {
                    continue;
                }
                let mut count = 0usize;
                for mut delivery in expired {
                    delivery.transition(DeliveryState::Dropped);
                    count += 1;
                }
                drops.push((name.clone(), count));
            }
            for (name, count) in drops {
                self.bus.publish(BrokerEvent::DeliveryDropped {
                    name,
                    count,
                    reason: "ttl".to_string(),
                });
            }
        }

        // Re-pump agents whose retry backoff elapsed or whose queue has work.
        let ready: Vec<String> = self
            .queues
            .iter()
            .filter(|(name, queue)| !queue.is_empty() && !self.in_flight.contains_key(*name))
            .map(|(name, _)| name.clone())
            .collect();
        for name in ready {
            self.pump(&name).await;
        }
    }

    /// Liveness probe: a worker whose stdin pipe broke is surfaced here even
    /// before its process dies and the reap tick notices.
    async fn ping_workers(&mut self) {
        for name in self.registry.names().to_vec() {
            let probe = json!({"ts_ms": current_timestamp_ms()});
            if let Err(error) = self
                .registry
                .send_to_worker(&name, "ping", None, probe)
                .await
            {
                tracing::debug!(
                    target = "fleet::broker",
                    worker = %name,
                    error = %error,
                    "worker ping failed"
                );
            }
        }
    }

    async fn reap_workers(&mut self) {
        for (name, code, signal) in self.registry.reap_exited() {
            self.cleanup_exited_agent(&name).await;
            self.bus.publish(BrokerEvent::AgentExited {
                name,
                code,
                signal,
            });
        }
    }

    async fn on_agent_exited(&mut self, name: &str, code: Option<i32>, signal: Option<String>) {
        if !self.registry.has_worker(name) {
            return;
        }
        // The worker said goodbye; reap the process promptly.
        if let Err(error) = self
            .registry
            .release(name, Duration::from_millis(200))
            .await
        {
            tracing::debug!(
                target = "fleet::broker",
                worker = %name,
                error = %error,
                "release after worker exit failed"
            );
        }
        self.cleanup_exited_agent(name).await;
        self.bus.publish(BrokerEvent::AgentExited {
            name: name.to_string(),
            code,
            signal,
        });
    }

    async fn cleanup_exited_agent(&mut self, name: &str) {
        self.drop_agent_deliveries(name, "agent_exited");
        self.channels.remove_member(name);
        self.initial_tasks.remove(name);
        self.next_dispatch_at.remove(name);
        self.registry.forget(name);
    }

    /// Cancel queued and in-flight deliveries for an agent, emitting a single
    /// counted drop event.
    fn drop_agent_deliveries(&mut self, name: &str, reason: &str) {
        let mut count = 0usize;
        if let Some(mut queue) = self.queues.remove(name) {
            while let Some(mut delivery) = queue.pop() {
                delivery.transition(DeliveryState::Dropped);
                count += 1;
            }
        }
        if let Some(mut infl) = self.in_flight.remove(name) {
            infl.delivery.transition(DeliveryState::Dropped);
            count += 1;
        }
        if count > 0 {
            self.bus.publish(BrokerEvent::DeliveryDropped {
                name: name.to_string(),
                count,
                reason: reason.to_string(),
            });
        }
    }

    async fn release_agent(&mut self, name: &str) {
        self.registry.set_state(name, AgentState::Releasing);
        self.drop_agent_deliveries(name, "released");
        self.channels.remove_member(name);
        self.initial_tasks.remove(name);
        self.next_dispatch_at.remove(name);
        if let Err(error) = self.registry.release(name, self.cfg.shutdown_grace).await {
            tracing::warn!(
                target = "fleet::broker",
                worker = %name,
                error = %error,
                "worker release failed"
            );
        }
        self.bus.publish(BrokerEvent::AgentReleased {
            name: name.to_string(),
        });
    }

    async fn shutdown_sequence(&mut self) {
        self.shutting_down = true;
        tracing::info!(target = "fleet::broker", "shutting down; releasing agents");
        let names: Vec<String> = self.registry.names().to_vec();
        for name in names {
            self.release_agent(&name).await;
        }
    }

    async fn send_to_conn(&self, conn_id: u64, envelope: ProtocolEnvelope<Value>) {
        if let Some(entry) = self.connections.get(&conn_id) {
            if entry.reply_tx.send(envelope).await.is_err() {
                tracing::debug!(
                    target = "fleet::broker",
                    connection_id = conn_id,
                    "reply channel closed"
                );
            }
        }
    }

    async fn reply_ok(&self, conn_id: u64, request_id: Option<String>, result: Value) {
        self.send_to_conn(conn_id, ok_envelope(request_id, result))
            .await;
    }

    async fn reply_err(&self, conn_id: u64, request_id: Option<String>, error: ProtocolError) {
        self.send_to_conn(conn_id, error_envelope(request_id, &error))
            .await;
    }
}

fn delivery_snapshot(name: &str, delivery: &Delivery) -> Value {
    json!({
        "name": name,
        "delivery_id": delivery.delivery_id,
        "event_id": delivery.event_id,
        "from": delivery.from,
        "state": delivery.state,
        "attempts": delivery.attempts,
        "priority": delivery.priority,
    })
}
