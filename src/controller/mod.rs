//! Message controller: the public entry point of the bus.
//!
//! Owns the priority queues, the schema adapter, the bridge, and the
//! handler registry. Messages are validated synchronously on send,
//! queued by priority, and dispatched by the processing loop to every
//! handler registered for their type, then routed across the bridge.

use crate::adapter::{self, SchemaAdapter};
use crate::bridge::{Bridge, BridgeStatus, SubsystemChannel, TcpJsonChannel};
use crate::config::BusConfig;
use crate::error::BusError;
use crate::message::{
    AckStatus, Acknowledgment, Message, MessageContext, MessageType, Payload, Priority, Subsystem,
};
use crate::metrics::{BusMetrics, MetricsSnapshot};
use crate::queue::{PriorityQueues, QueueStats};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Sliding window of recently accepted message ids for duplicate rejection.
const SEEN_IDS_MAX: usize = 4096;
/// Acknowledgments retained for lookup before the oldest are dropped.
const ACK_HISTORY_MAX: usize = 4096;
/// Upper bound on drain cycles during shutdown; whatever is still queued
/// afterwards is dropped with a warning.
const SHUTDOWN_DRAIN_CYCLES_MAX: usize = 100;

/// Outcome reported by one handler invocation.
#[derive(Debug, Clone, Default)]
pub struct HandlerReport {
    pub success: bool,
    pub error: Option<String>,
    pub metrics: Option<Value>,
}

impl HandlerReport {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            metrics: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(reason.into()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Value) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Consumer of messages of a given type. All handlers registered for a
/// type run for every message of that type; each invocation is bounded by
/// the configured timeout.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, message: &Message) -> anyhow::Result<HandlerReport>;
}

/// Adapts a plain closure into a handler.
pub struct FnHandler {
    name: String,
    func: Box<dyn Fn(&Message) -> HandlerReport + Send + Sync>,
}

impl FnHandler {
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(&Message) -> HandlerReport + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }
}

#[async_trait]
impl MessageHandler for FnHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, message: &Message) -> anyhow::Result<HandlerReport> {
        Ok((self.func)(message))
    }
}

/// Aggregated operational view across all bus components.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthReport {
    pub bridge: BridgeStatus,
    pub queued_messages: usize,
    pub queue_stats: QueueStats,
    pub registered_handlers: usize,
    pub pending_context_requests: usize,
}

#[derive(Default)]
struct SeenWindow {
    set: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenWindow {
    /// Returns false when the id was already seen within the window.
    fn insert(&mut self, id: &str) -> bool {
        if self.set.contains(id) {
            return false;
        }
        self.set.insert(id.to_string());
        self.order.push_back(id.to_string());
        while self.order.len() > SEEN_IDS_MAX {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        true
    }
}

#[derive(Default)]
struct AckLog {
    map: HashMap<String, Acknowledgment>,
    order: VecDeque<String>,
}

impl AckLog {
    fn insert(&mut self, id: String, ack: Acknowledgment) {
        if self.map.insert(id.clone(), ack).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > ACK_HISTORY_MAX {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
    }
}

struct LoopTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl LoopTask {
    /// Cancel and wait for the loop to exit its current tick, so no
    /// message is mid-processing once shutdown proceeds.
    async fn stop(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}

pub struct Controller {
    config: BusConfig,
    adapter: Arc<SchemaAdapter>,
    bridge: Arc<Bridge>,
    queues: Mutex<PriorityQueues>,
    handlers: RwLock<HashMap<MessageType, Vec<Arc<dyn MessageHandler>>>>,
    acks: Mutex<AckLog>,
    seen_ids: Mutex<SeenWindow>,
    waiters: Mutex<HashMap<String, oneshot::Sender<Message>>>,
    metrics: BusMetrics,
    loop_task: Mutex<Option<LoopTask>>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller").finish_non_exhaustive()
    }
}

impl Controller {
    /// Build a controller with TCP channels from the configured endpoints.
    /// Both endpoints are required; tests that stub transports use
    /// `with_channels` instead.
    pub fn new(config: BusConfig) -> Result<Arc<Self>, BusError> {
        let reasoning_endpoint = config
            .channels
            .reasoning
            .clone()
            .ok_or_else(|| BusError::Config("channels.reasoning endpoint is required".into()))?;
        let dynamics_endpoint = config
            .channels
            .dynamics
            .clone()
            .ok_or_else(|| BusError::Config("channels.dynamics endpoint is required".into()))?;

        let reasoning = Arc::new(TcpJsonChannel::new(Subsystem::Reasoning, reasoning_endpoint));
        let dynamics = Arc::new(TcpJsonChannel::new(Subsystem::Dynamics, dynamics_endpoint));
        Self::with_channels(config, reasoning, dynamics)
    }

    /// Build a controller over caller-supplied channels.
    pub fn with_channels(
        config: BusConfig,
        reasoning: Arc<dyn SubsystemChannel>,
        dynamics: Arc<dyn SubsystemChannel>,
    ) -> Result<Arc<Self>, BusError> {
        config.validate()?;
        let bridge = Arc::new(Bridge::new(reasoning, dynamics, &config));
        Ok(Arc::new(Self {
            queues: Mutex::new(PriorityQueues::new(config.message_queue_size)),
            adapter: Arc::new(SchemaAdapter::new()),
            bridge,
            handlers: RwLock::new(HashMap::new()),
            acks: Mutex::new(AckLog::default()),
            seen_ids: Mutex::new(SeenWindow::default()),
            waiters: Mutex::new(HashMap::new()),
            metrics: BusMetrics::new(),
            loop_task: Mutex::new(None),
            config,
        }))
    }

    /// Adapter access for registering type-specific validation rules and
    /// running payload transformations.
    pub fn adapter(&self) -> &SchemaAdapter {
        &self.adapter
    }

    pub fn bridge(&self) -> Arc<Bridge> {
        Arc::clone(&self.bridge)
    }

    pub fn register_handler(&self, kind: MessageType, handler: Arc<dyn MessageHandler>) {
        debug!(kind = %kind, handler = handler.name(), "handler registered");
        self.handlers.write().entry(kind).or_default().push(handler);
    }

    /// Validate and enqueue one message.
    ///
    /// Invalid messages are rejected here and never enter a queue. The
    /// returned acknowledgment is the pending receipt; `get_acknowledgment`
    /// reflects the final status once the message has been processed.
    pub fn send_message(&self, message: Message) -> Result<Acknowledgment, BusError> {
        let result = self.adapter.validate_message(&message);
        if !result.valid {
            self.metrics.record_validation_failure();
            let reason = result
                .first_error()
                .map(str::to_string)
                .unwrap_or_else(|| format!("validation score {:.2} below threshold", result.score));
            debug!(message_id = %message.id, reason = %reason, "message rejected");
            return Err(BusError::validation(message.id, reason));
        }
        if !self.seen_ids.lock().insert(&message.id) {
            self.metrics.record_validation_failure();
            return Err(BusError::validation(message.id, "duplicate message id"));
        }

        let ack = Acknowledgment::pending();
        self.acks.lock().insert(message.id.clone(), ack.clone());

        let evicted = self.queues.lock().enqueue(message);
        if let Some(evicted) = evicted {
            self.finalize_ack(
                &evicted.id,
                AckStatus::Error,
                Some("evicted before processing: queue at capacity".to_string()),
                0,
            );
        }
        self.metrics.record_sent();
        Ok(ack)
    }

    pub fn get_acknowledgment(&self, message_id: &str) -> Option<Acknowledgment> {
        self.acks.lock().map.get(message_id).cloned()
    }

    fn finalize_ack(&self, id: &str, status: AckStatus, error: Option<String>, elapsed_ms: u64) {
        let mut acks = self.acks.lock();
        if let Some(ack) = acks.map.get_mut(id) {
            ack.processed = true;
            ack.status = status;
            ack.error_message = error;
            ack.processing_time_ms = elapsed_ms;
            ack.timestamp = Utc::now();
        }
    }

    /// Connect the bridge, enable its background tasks, and spawn the
    /// processing loop. Idempotent once started.
    pub async fn start(self: &Arc<Self>) -> Result<(), BusError> {
        self.bridge.connect().await?;
        self.bridge.enable_bidirectional_sync();
        self.bridge.start_health_monitor();

        let mut slot = self.loop_task.lock();
        if slot.is_some() {
            return Ok(());
        }
        let token = CancellationToken::new();
        let task_token = token.clone();
        let controller = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(
                controller.config.process_interval_ms,
            ));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => controller.process_tick().await,
                }
            }
        });
        *slot = Some(LoopTask { token, handle });
        info!("controller started");
        Ok(())
    }

    /// One processing cycle: drain a batch from every priority class and
    /// run each message through handlers and bridge delivery. Public so
    /// tests can drive the loop deterministically.
    pub async fn process_tick(&self) {
        let batch = self.queues.lock().drain_tick(self.config.drain_batch_size);
        for message in batch {
            self.process_message(message).await;
        }
    }

    async fn process_message(&self, message: Message) {
        let started = Instant::now();

        // A response completes its pending context waiter, if any.
        if message.kind == MessageType::ContextResponse {
            if let Some(correlation_id) = message.context.correlation_id.as_deref() {
                if let Some(sender) = self.waiters.lock().remove(correlation_id) {
                    let _ = sender.send(message.clone());
                }
            }
        }

        let handlers: Vec<Arc<dyn MessageHandler>> = self
            .handlers
            .read()
            .get(&message.kind)
            .cloned()
            .unwrap_or_default();

        let mut failures = Vec::new();
        for handler in &handlers {
            let outcome = tokio::time::timeout(
                Duration::from_millis(self.config.timeout_ms),
                handler.handle(&message),
            )
            .await;
            match outcome {
                Err(_) => {
                    self.metrics.record_handler_timeout();
                    failures.push(
                        BusError::timeout(
                            format!("handler `{}`", handler.name()),
                            self.config.timeout_ms,
                        )
                        .to_string(),
                    );
                }
                Ok(Err(error)) => {
                    self.metrics.record_handler_error();
                    failures.push(
                        BusError::Handler {
                            handler: handler.name().to_string(),
                            message_id: message.id.clone(),
                            reason: format!("{error:#}"),
                        }
                        .to_string(),
                    );
                }
                Ok(Ok(report)) if !report.success => {
                    self.metrics.record_handler_error();
                    failures.push(
                        BusError::Handler {
                            handler: handler.name().to_string(),
                            message_id: message.id.clone(),
                            reason: report
                                .error
                                .unwrap_or_else(|| "handler reported failure".to_string()),
                        }
                        .to_string(),
                    );
                }
                Ok(Ok(report)) => {
                    if let Some(metrics) = report.metrics {
                        debug!(handler = handler.name(), %metrics, "handler metrics");
                    }
                }
            }
        }
        for failure in &failures {
            warn!(message_id = %message.id, kind = %message.kind, failure, "handler failure");
        }

        // Cross-subsystem delivery, adapting template/field payloads to the
        // peer's representation.
        let attempted_delivery = self.bridge.is_connected();
        let mut delivery_error = None;
        if attempted_delivery {
            let outbound = adapt_for_target(&message);
            if let Err(error) = self.bridge.deliver(&outbound).await {
                delivery_error = Some(error.to_string());
            }
        }

        let attempted = handlers.len() + usize::from(attempted_delivery);
        let failed = failures.len() + usize::from(delivery_error.is_some());
        let status = if failed == 0 {
            AckStatus::Success
        } else if failed == attempted {
            AckStatus::Error
        } else {
            AckStatus::Partial
        };
        let error_message = if failed == 0 {
            None
        } else {
            let mut parts = failures;
            parts.extend(delivery_error);
            Some(parts.join("; "))
        };

        let elapsed = started.elapsed();
        self.finalize_ack(&message.id, status, error_message, elapsed.as_millis() as u64);
        self.metrics.record_processed(
            message.kind,
            message.priority,
            elapsed.as_secs_f64() * 1000.0,
            failed == 0,
        );
    }

    /// Ask the peer subsystem for context and await the correlated
    /// response. On timeout an error-status reply is returned instead of
    /// hanging the caller.
    pub async fn request_context(
        &self,
        requester: Subsystem,
        query: Value,
    ) -> Result<Message, BusError> {
        let correlation_id = Uuid::new_v4().to_string();
        let (sender, receiver) = oneshot::channel();
        self.waiters.lock().insert(correlation_id.clone(), sender);

        let mut context = MessageContext::default();
        context.correlation_id = Some(correlation_id.clone());
        context.request_id = Some(correlation_id.clone());
        let request = Message::new(
            requester,
            requester.peer(),
            MessageType::ContextRequest,
            Payload::new(query, "context_query_v1"),
            Priority::High,
        )
        .with_context(context);

        if let Err(error) = self.send_message(request) {
            self.waiters.lock().remove(&correlation_id);
            return Err(error);
        }

        match tokio::time::timeout(Duration::from_millis(self.config.timeout_ms), receiver).await {
            Ok(Ok(response)) => Ok(response),
            // Elapsed, or the waiter was dropped during shutdown.
            _ => {
                self.waiters.lock().remove(&correlation_id);
                warn!(correlation_id = %correlation_id, "context request timed out");
                Ok(self.timeout_reply(requester, &correlation_id))
            }
        }
    }

    fn timeout_reply(&self, requester: Subsystem, correlation_id: &str) -> Message {
        let mut context = MessageContext::default();
        context.correlation_id = Some(correlation_id.to_string());
        let mut reply = Message::new(
            requester.peer(),
            requester,
            MessageType::ContextResponse,
            Payload::new(
                json!({
                    "error": format!("context request timed out after {}ms", self.config.timeout_ms),
                }),
                "context_reply_v1",
            ),
            Priority::High,
        )
        .with_context(context);
        reply.acknowledgment = Some(Acknowledgment {
            received: true,
            processed: true,
            timestamp: Utc::now(),
            processing_time_ms: self.config.timeout_ms,
            status: AckStatus::Error,
            error_message: Some("context request timed out".to_string()),
        });
        reply
    }

    /// Graceful shutdown: stop the loop, drain remaining messages within a
    /// bounded number of cycles, wake pending context waiters, disconnect
    /// the bridge, and release adapter state. Never fails.
    pub async fn shutdown(&self) {
        info!("controller shutting down");
        let task = self.loop_task.lock().take();
        if let Some(task) = task {
            task.stop().await;
        }

        let mut cycles = 0;
        while !self.queues.lock().is_empty() && cycles < SHUTDOWN_DRAIN_CYCLES_MAX {
            self.process_tick().await;
            cycles += 1;
        }
        let remaining = self.queues.lock().len();
        if remaining > 0 {
            warn!(remaining, "drain budget exhausted; dropping queued messages");
        }

        // Dropping the senders wakes every pending context waiter.
        self.waiters.lock().clear();
        self.bridge.disconnect().await;
        self.adapter.clear();
        info!("controller stopped");
    }

    pub fn health_report(&self) -> HealthReport {
        let queues = self.queues.lock();
        HealthReport {
            bridge: self.bridge.status(),
            queued_messages: queues.len(),
            queue_stats: queues.stats(),
            registered_handlers: self.handlers.read().values().map(Vec::len).sum(),
            pending_context_requests: self.waiters.lock().len(),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn clear_metrics(&self) {
        self.metrics.clear();
    }
}

/// Template traffic heading into dynamics is mapped to field form, and
/// field traffic heading into reasoning to template form. Everything else
/// crosses the bridge unchanged.
fn adapt_for_target(message: &Message) -> Message {
    let adapted = match (message.kind, message.target) {
        (
            MessageType::TemplateRequest | MessageType::TemplateResponse,
            Subsystem::Dynamics,
        ) => Some((
            adapter::adapt_reasoning_to_dynamics(&message.payload.data),
            "field_v1",
        )),
        (
            MessageType::FieldUpdate | MessageType::FieldSnapshot,
            Subsystem::Reasoning,
        ) => Some((
            adapter::adapt_dynamics_to_reasoning(&message.payload.data),
            "template_v1",
        )),
        _ => None,
    };
    match adapted {
        Some((data, schema)) => {
            let mut outbound = message.clone();
            outbound.payload = Payload::new(data, schema);
            outbound
        }
        None => message.clone(),
    }
}
