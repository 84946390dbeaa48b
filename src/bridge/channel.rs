use crate::bridge::sync::SyncOperation;
use crate::config::ChannelEndpoint;
use crate::error::BusError;
use crate::message::{Message, Subsystem};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Transport to one subsystem side of the bus.
///
/// The bridge only talks through this trait; tests wire in the in-process
/// implementation while deployments use the TCP channel.
#[async_trait]
pub trait SubsystemChannel: Send + Sync {
    fn subsystem(&self) -> Subsystem;

    /// Establish the transport. One call is one attempt; retry policy
    /// lives in the bridge.
    async fn open(&self) -> Result<(), BusError>;

    async fn close(&self);

    /// Push one message to the subsystem.
    async fn deliver(&self, message: &Message) -> Result<(), BusError>;

    /// Drain the subsystem's pending state changes for a sync round.
    async fn collect_pending(&self) -> Result<Vec<SyncOperation>, BusError>;

    /// Apply one reconciled state change to the subsystem.
    async fn apply(&self, operation: &SyncOperation) -> Result<(), BusError>;

    /// Liveness probe; false means the bridge should reconnect.
    async fn health_check(&self) -> bool;
}

struct ChannelIo {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Newline-delimited JSON frames over TCP.
///
/// Every exchange is one request line followed by one reply line. All I/O
/// is bounded by the endpoint's timeouts.
pub struct TcpJsonChannel {
    subsystem: Subsystem,
    endpoint: ChannelEndpoint,
    io: tokio::sync::Mutex<Option<ChannelIo>>,
}

impl TcpJsonChannel {
    pub fn new(subsystem: Subsystem, endpoint: ChannelEndpoint) -> Self {
        Self {
            subsystem,
            endpoint,
            io: tokio::sync::Mutex::new(None),
        }
    }

    async fn exchange(&self, frame: Value) -> Result<Value, BusError> {
        let io_timeout = Duration::from_millis(self.endpoint.io_timeout_ms);
        let mut guard = self.io.lock().await;

        let mut line = serde_json::to_string(&frame).map_err(|e| BusError::Connection {
            subsystem: self.subsystem,
            attempts: 1,
            reason: format!("frame encode failed: {e}"),
        })?;
        line.push('\n');

        let written = {
            let io = guard.as_mut().ok_or(BusError::NotConnected {
                subsystem: self.subsystem,
            })?;
            timeout(io_timeout, io.writer.write_all(line.as_bytes()))
                .await
                .map_err(|_| BusError::timeout("channel write", self.endpoint.io_timeout_ms))?
        };
        if let Err(error) = written {
            // A transport failure poisons the stream; drop it so the next
            // use reports NotConnected and the bridge reconnects.
            *guard = None;
            return Err(self.transport_error(error));
        }

        let mut reply = String::new();
        let read = {
            let io = guard.as_mut().ok_or(BusError::NotConnected {
                subsystem: self.subsystem,
            })?;
            timeout(io_timeout, io.reader.read_line(&mut reply))
                .await
                .map_err(|_| BusError::timeout("channel read", self.endpoint.io_timeout_ms))?
        };
        match read {
            Err(error) => {
                *guard = None;
                return Err(self.transport_error(error));
            }
            Ok(0) => {
                *guard = None;
                return Err(BusError::Connection {
                    subsystem: self.subsystem,
                    attempts: 1,
                    reason: "peer closed the connection".into(),
                });
            }
            Ok(_) => {}
        }

        serde_json::from_str(&reply).map_err(|e| BusError::Connection {
            subsystem: self.subsystem,
            attempts: 1,
            reason: format!("malformed reply frame: {e}"),
        })
    }

    fn transport_error(&self, error: std::io::Error) -> BusError {
        BusError::Connection {
            subsystem: self.subsystem,
            attempts: 1,
            reason: error.to_string(),
        }
    }

    fn rejected(&self, reply: &Value, operation: &str) -> BusError {
        let reason = reply
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("rejected by peer");
        BusError::Connection {
            subsystem: self.subsystem,
            attempts: 1,
            reason: format!("{operation} failed: {reason}"),
        }
    }
}

#[async_trait]
impl SubsystemChannel for TcpJsonChannel {
    fn subsystem(&self) -> Subsystem {
        self.subsystem
    }

    async fn open(&self) -> Result<(), BusError> {
        let connect_timeout = Duration::from_millis(self.endpoint.connect_timeout_ms);
        let stream = timeout(connect_timeout, TcpStream::connect(&self.endpoint.address))
            .await
            .map_err(|_| {
                BusError::timeout(
                    format!("connect to {}", self.subsystem),
                    self.endpoint.connect_timeout_ms,
                )
            })?
            .map_err(|e| BusError::Connection {
                subsystem: self.subsystem,
                attempts: 1,
                reason: e.to_string(),
            })?;

        let (read, write) = stream.into_split();
        *self.io.lock().await = Some(ChannelIo {
            reader: BufReader::new(read),
            writer: write,
        });

        let reply = self
            .exchange(json!({"op": "hello", "subsystem": self.subsystem}))
            .await?;
        if reply.get("ready").and_then(Value::as_bool) != Some(true) {
            *self.io.lock().await = None;
            return Err(self.rejected(&reply, "handshake"));
        }
        debug!(subsystem = %self.subsystem, address = %self.endpoint.address, "channel open");
        Ok(())
    }

    async fn close(&self) {
        if let Some(mut io) = self.io.lock().await.take() {
            let _ = io.writer.shutdown().await;
        }
    }

    async fn deliver(&self, message: &Message) -> Result<(), BusError> {
        let reply = self
            .exchange(json!({"op": "deliver", "message": message}))
            .await?;
        if reply.get("ok").and_then(Value::as_bool) == Some(true) {
            Ok(())
        } else {
            Err(self.rejected(&reply, "delivery"))
        }
    }

    async fn collect_pending(&self) -> Result<Vec<SyncOperation>, BusError> {
        let reply = self.exchange(json!({"op": "collect"})).await?;
        match reply.get("operations") {
            Some(operations) => {
                serde_json::from_value(operations.clone()).map_err(|e| BusError::Connection {
                    subsystem: self.subsystem,
                    attempts: 1,
                    reason: format!("malformed operations list: {e}"),
                })
            }
            None => Ok(Vec::new()),
        }
    }

    async fn apply(&self, operation: &SyncOperation) -> Result<(), BusError> {
        let reply = self
            .exchange(json!({"op": "apply", "operation": operation}))
            .await?;
        if reply.get("ok").and_then(Value::as_bool) == Some(true) {
            Ok(())
        } else {
            // A refused apply is a state disagreement, not a transport
            // failure; sync records it and moves on.
            let reason = reply
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("rejected by peer");
            Err(BusError::Conflict {
                description: format!(
                    "peer {} refused `{}`: {reason}",
                    self.subsystem, operation.key
                ),
            })
        }
    }

    async fn health_check(&self) -> bool {
        match self.exchange(json!({"op": "ping"})).await {
            Ok(reply) => reply.get("ok").and_then(Value::as_bool) == Some(true),
            Err(_) => false,
        }
    }
}

/// In-process channel used by tests and embedded deployments.
///
/// State transitions are scripted through the `fail_next_*` knobs so retry
/// and reconnect paths can be exercised deterministically.
pub struct InProcessChannel {
    subsystem: Subsystem,
    state: parking_lot::Mutex<InProcessState>,
}

struct InProcessState {
    connected: bool,
    healthy: bool,
    connect_attempts: u32,
    fail_connects_remaining: u32,
    fail_collects_remaining: u32,
    fail_delivers_remaining: u32,
    apply_delay_ms: u64,
    pending: Vec<SyncOperation>,
    delivered: Vec<Message>,
    applied: Vec<SyncOperation>,
}

impl Default for InProcessState {
    fn default() -> Self {
        Self {
            connected: false,
            healthy: true,
            connect_attempts: 0,
            fail_connects_remaining: 0,
            fail_collects_remaining: 0,
            fail_delivers_remaining: 0,
            apply_delay_ms: 0,
            pending: Vec::new(),
            delivered: Vec::new(),
            applied: Vec::new(),
        }
    }
}

impl InProcessChannel {
    pub fn new(subsystem: Subsystem) -> Self {
        Self {
            subsystem,
            state: parking_lot::Mutex::new(InProcessState::default()),
        }
    }

    /// Queue a pending state change to be handed out by `collect_pending`.
    pub fn push_pending(&self, operation: SyncOperation) {
        self.state.lock().pending.push(operation);
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().fail_connects_remaining = count;
    }

    pub fn fail_next_collects(&self, count: u32) {
        self.state.lock().fail_collects_remaining = count;
    }

    pub fn fail_next_delivers(&self, count: u32) {
        self.state.lock().fail_delivers_remaining = count;
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.state.lock().healthy = healthy;
    }

    /// Make every `apply` sleep before recording, to simulate a slow peer.
    pub fn set_apply_delay_ms(&self, delay_ms: u64) {
        self.state.lock().apply_delay_ms = delay_ms;
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().connect_attempts
    }

    pub fn delivered(&self) -> Vec<Message> {
        self.state.lock().delivered.clone()
    }

    pub fn applied(&self) -> Vec<SyncOperation> {
        self.state.lock().applied.clone()
    }
}

#[async_trait]
impl SubsystemChannel for InProcessChannel {
    fn subsystem(&self) -> Subsystem {
        self.subsystem
    }

    async fn open(&self) -> Result<(), BusError> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        if state.fail_connects_remaining > 0 {
            state.fail_connects_remaining -= 1;
            return Err(BusError::Connection {
                subsystem: self.subsystem,
                attempts: 1,
                reason: "scripted connect failure".into(),
            });
        }
        state.connected = true;
        Ok(())
    }

    async fn close(&self) {
        self.state.lock().connected = false;
    }

    async fn deliver(&self, message: &Message) -> Result<(), BusError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(BusError::NotConnected {
                subsystem: self.subsystem,
            });
        }
        if state.fail_delivers_remaining > 0 {
            state.fail_delivers_remaining -= 1;
            return Err(BusError::Connection {
                subsystem: self.subsystem,
                attempts: 1,
                reason: "scripted delivery failure".into(),
            });
        }
        state.delivered.push(message.clone());
        Ok(())
    }

    async fn collect_pending(&self) -> Result<Vec<SyncOperation>, BusError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(BusError::NotConnected {
                subsystem: self.subsystem,
            });
        }
        if state.fail_collects_remaining > 0 {
            state.fail_collects_remaining -= 1;
            return Err(BusError::Connection {
                subsystem: self.subsystem,
                attempts: 1,
                reason: "scripted collect failure".into(),
            });
        }
        Ok(std::mem::take(&mut state.pending))
    }

    async fn apply(&self, operation: &SyncOperation) -> Result<(), BusError> {
        let delay_ms = {
            let state = self.state.lock();
            if !state.connected {
                return Err(BusError::NotConnected {
                    subsystem: self.subsystem,
                });
            }
            state.apply_delay_ms
        };
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        self.state.lock().applied.push(operation.clone());
        Ok(())
    }

    async fn health_check(&self) -> bool {
        let state = self.state.lock();
        state.connected && state.healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageType, Payload, Priority};
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn spawn_peer() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let frame: Value = serde_json::from_str(&line).unwrap();
                let reply = match frame["op"].as_str() {
                    Some("hello") => json!({"ready": true}),
                    Some("deliver") => json!({"ok": frame["message"]["id"].is_string()}),
                    Some("collect") => json!({"operations": []}),
                    Some("apply") => {
                        if frame["operation"]["key"] == "state/locked" {
                            json!({"ok": false, "error": "key is locked"})
                        } else {
                            json!({"ok": true})
                        }
                    }
                    Some("ping") => json!({"ok": true}),
                    _ => json!({"ok": false, "error": "unknown op"}),
                };
                let mut encoded = reply.to_string();
                encoded.push('\n');
                write.write_all(encoded.as_bytes()).await.unwrap();
            }
        });
        address
    }

    fn sample_message() -> Message {
        Message::new(
            Subsystem::Reasoning,
            Subsystem::Dynamics,
            MessageType::FieldUpdate,
            Payload::new(json!({"field": 1}), "field_v1"),
            Priority::Normal,
        )
    }

    #[tokio::test]
    async fn tcp_channel_handshakes_and_delivers() {
        let address = spawn_peer().await;
        let channel = TcpJsonChannel::new(
            Subsystem::Dynamics,
            ChannelEndpoint::new(address.to_string()),
        );

        channel.open().await.expect("handshake");
        assert!(channel.health_check().await);
        channel.deliver(&sample_message()).await.expect("deliver");
        let pending = channel.collect_pending().await.expect("collect");
        assert!(pending.is_empty());
        channel.close().await;
    }

    #[tokio::test]
    async fn tcp_channel_surfaces_a_refused_apply_as_a_conflict() {
        let address = spawn_peer().await;
        let channel = TcpJsonChannel::new(
            Subsystem::Dynamics,
            ChannelEndpoint::new(address.to_string()),
        );
        channel.open().await.expect("handshake");

        channel
            .apply(&SyncOperation::new(
                Subsystem::Reasoning,
                "state/open",
                json!({"v": 1}),
                1,
            ))
            .await
            .expect("unlocked key applies");

        let error = channel
            .apply(&SyncOperation::new(
                Subsystem::Reasoning,
                "state/locked",
                json!({"v": 1}),
                1,
            ))
            .await
            .expect_err("locked key is refused");
        match error {
            BusError::Conflict { description } => {
                assert!(description.contains("state/locked"));
                assert!(description.contains("key is locked"));
            }
            other => panic!("expected Conflict, got {other}"),
        }
    }

    #[tokio::test]
    async fn tcp_channel_requires_open_before_use() {
        let channel = TcpJsonChannel::new(
            Subsystem::Reasoning,
            ChannelEndpoint::new("127.0.0.1:1".to_string()),
        );
        let error = channel
            .deliver(&sample_message())
            .await
            .expect_err("must be NotConnected");
        assert!(matches!(error, BusError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn tcp_channel_reports_refused_connect() {
        // Bind then drop to get a port that refuses connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let channel = TcpJsonChannel::new(
            Subsystem::Dynamics,
            ChannelEndpoint::new(address.to_string()),
        );
        let error = channel.open().await.expect_err("connect must fail");
        assert!(matches!(
            error,
            BusError::Connection { .. } | BusError::Timeout { .. }
        ));
    }

    #[tokio::test]
    async fn in_process_channel_scripts_connect_failures() {
        let channel = InProcessChannel::new(Subsystem::Reasoning);
        channel.fail_next_connects(2);

        assert!(channel.open().await.is_err());
        assert!(channel.open().await.is_err());
        channel.open().await.expect("third attempt succeeds");
        assert_eq!(channel.connect_attempts(), 3);
        assert!(channel.is_connected());
    }

    #[tokio::test]
    async fn in_process_channel_drains_pending_once() {
        let channel = InProcessChannel::new(Subsystem::Dynamics);
        channel.open().await.unwrap();
        channel.push_pending(SyncOperation::new(
            Subsystem::Dynamics,
            "field/1",
            json!({"v": 1}),
            1,
        ));

        let first = channel.collect_pending().await.unwrap();
        assert_eq!(first.len(), 1);
        let second = channel.collect_pending().await.unwrap();
        assert!(second.is_empty());
    }
}
