//! End-to-end pipeline scenarios: send, queue, dispatch, deliver, shut down.

use async_trait::async_trait;
use fieldbridge::bridge::InProcessChannel;
use fieldbridge::controller::{Controller, FnHandler, HandlerReport, MessageHandler};
use fieldbridge::{
    AckStatus, BusConfig, BusError, Message, MessageContext, MessageType, Payload, Priority,
    SubsystemChannel, Subsystem,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn harness(
    config: BusConfig,
) -> (
    Arc<Controller>,
    Arc<InProcessChannel>,
    Arc<InProcessChannel>,
) {
    fieldbridge::observability::init_tracing();
    let reasoning = Arc::new(InProcessChannel::new(Subsystem::Reasoning));
    let dynamics = Arc::new(InProcessChannel::new(Subsystem::Dynamics));
    let controller = Controller::with_channels(
        config,
        Arc::clone(&reasoning) as Arc<dyn SubsystemChannel>,
        Arc::clone(&dynamics) as Arc<dyn SubsystemChannel>,
    )
    .expect("controller");
    (controller, reasoning, dynamics)
}

fn fast_config() -> BusConfig {
    BusConfig {
        retry_delay_ms: 1,
        process_interval_ms: 10,
        ..BusConfig::default()
    }
}

fn event(priority: Priority, marker: u64) -> Message {
    Message::new(
        Subsystem::Reasoning,
        Subsystem::Dynamics,
        MessageType::FieldUpdate,
        Payload::new(json!({"marker": marker}), "field_v1"),
        priority,
    )
    .with_context(MessageContext::with_session("sess-pipeline"))
}

#[tokio::test]
async fn well_formed_message_flows_end_to_end() {
    let (controller, _, dynamics) = harness(fast_config());
    controller.bridge().connect().await.expect("connect");

    let seen = Arc::new(Mutex::new(0u32));
    let counter = Arc::clone(&seen);
    controller.register_handler(
        MessageType::FieldUpdate,
        Arc::new(FnHandler::new("counter", move |_| {
            *counter.lock() += 1;
            HandlerReport::ok()
        })),
    );

    let message = event(Priority::Normal, 1);
    let id = message.id.clone();
    let ack = controller.send_message(message).expect("accepted");
    assert!(ack.received);
    assert!(!ack.processed);

    controller.process_tick().await;

    let finalized = controller.get_acknowledgment(&id).expect("ack recorded");
    assert!(finalized.processed);
    assert_eq!(finalized.status, AckStatus::Success);
    assert_eq!(*seen.lock(), 1);
    assert_eq!(dynamics.delivered().len(), 1);

    let metrics = controller.metrics();
    assert_eq!(metrics.messages_sent, 1);
    assert_eq!(metrics.messages_processed, 1);
    assert_eq!(metrics.messages_failed, 0);
}

#[tokio::test]
async fn malformed_message_is_rejected_before_queuing() {
    let (controller, _, _) = harness(fast_config());

    // No payload metadata and no session id: one high-severity error plus
    // a warning put the score at 0.65, below the 0.7 floor.
    let message = Message::new(
        Subsystem::Reasoning,
        Subsystem::Dynamics,
        MessageType::FieldUpdate,
        Payload {
            data: json!({"marker": 1}),
            metadata: None,
            schema: Some("field_v1".to_string()),
        },
        Priority::Normal,
    );

    let error = controller.send_message(message).expect_err("rejected");
    assert!(matches!(error, BusError::Validation { .. }));
    assert_eq!(controller.health_report().queued_messages, 0);
    assert_eq!(controller.metrics().validation_failures, 1);
}

#[tokio::test]
async fn critical_backlog_does_not_starve_lower_classes() {
    let (controller, _, dynamics) = harness(fast_config());
    controller.bridge().connect().await.expect("connect");

    for i in 0..25 {
        controller
            .send_message(event(Priority::Critical, i))
            .expect("send critical");
    }
    for i in 0..3 {
        controller
            .send_message(event(Priority::Normal, i))
            .expect("send normal");
    }

    controller.process_tick().await;

    // Batch of 10 per class: 10 critical + 3 normal processed, 15 critical
    // left over, nothing normal waiting behind the critical backlog.
    let delivered = dynamics.delivered();
    assert_eq!(delivered.len(), 13);
    assert!(delivered[..10]
        .iter()
        .all(|m| m.priority == Priority::Critical));
    assert!(delivered[10..]
        .iter()
        .all(|m| m.priority == Priority::Normal));
    assert_eq!(controller.health_report().queued_messages, 15);
}

#[tokio::test]
async fn transform_results_are_cache_stable() {
    let (controller, _, _) = harness(fast_config());
    let adapter = controller.adapter();
    let payload = Payload::new(json!({"name": "spiral", "weights": [1, 2, 3]}), "template_v1");

    let first = adapter.transform_payload(&payload, "field_v1");
    let second = adapter.transform_payload(&payload, "field_v1");
    assert_eq!(first, second);
    assert_eq!(adapter.cache_stats().hits, 1);
    assert_eq!(adapter.cache_stats().misses, 1);
}

struct StuckHandler;

#[async_trait]
impl MessageHandler for StuckHandler {
    fn name(&self) -> &str {
        "stuck"
    }

    async fn handle(&self, _message: &Message) -> anyhow::Result<HandlerReport> {
        std::future::pending::<()>().await;
        Ok(HandlerReport::ok())
    }
}

#[tokio::test]
async fn shutdown_is_not_blocked_by_stuck_handlers() {
    let config = BusConfig {
        timeout_ms: 20,
        ..fast_config()
    };
    let (controller, _, dynamics) = harness(config);
    controller.start().await.expect("start");
    controller.register_handler(MessageType::FieldUpdate, Arc::new(StuckHandler));

    for i in 0..3 {
        controller
            .send_message(event(Priority::Normal, i))
            .expect("send");
    }

    // Each message costs at most one 20ms handler timeout; a handler that
    // never resolves must not stall the drain.
    let started = Instant::now();
    controller.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(controller.health_report().queued_messages, 0);
    assert_eq!(controller.metrics().handler_timeouts, 3);
    assert_eq!(dynamics.delivered().len(), 3);
    assert!(!controller.bridge().is_connected());
}

#[tokio::test]
async fn shutdown_completes_with_a_loaded_queue() {
    let (controller, _, dynamics) = harness(fast_config());
    controller.start().await.expect("start");

    for i in 0..120 {
        controller
            .send_message(event(Priority::Normal, i))
            .expect("send");
    }
    controller.shutdown().await;

    assert_eq!(controller.health_report().queued_messages, 0);
    assert_eq!(dynamics.delivered().len(), 120);
    assert!(!controller.bridge().is_connected());

    // Acknowledgments were finalized for everything that drained.
    let metrics = controller.metrics();
    assert_eq!(metrics.messages_processed, 120);
}
