//! Dual-channel bridge between the reasoning and dynamics subsystems.
//!
//! The bridge owns one channel per subsystem and is responsible for
//! connection lifecycle (retry with linear backoff), message delivery,
//! bidirectional state synchronization with conflict resolution, and
//! health monitoring.

pub mod channel;
pub mod sync;

pub use channel::{InProcessChannel, SubsystemChannel, TcpJsonChannel};
pub use sync::{
    ApplyDecision, ConflictKind, ConflictResolution, SyncConflict, SyncOperation, SyncResult,
};

use crate::config::BusConfig;
use crate::error::BusError;
use crate::message::{Message, Subsystem};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Rolling window of per-delivery latency samples.
const LATENCY_HISTORY_MAX: usize = 100;
/// Rolling window of throughput samples, one per health tick.
const THROUGHPUT_HISTORY_MAX: usize = 60;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Connected but the health classification is below healthy.
    Degraded,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Critical,
    Offline,
}

/// Point-in-time view of the bridge, safe to hand out to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeStatus {
    pub connected: bool,
    pub connection: ConnectionState,
    pub last_sync: Option<DateTime<Utc>>,
    pub messages_processed: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub average_latency_ms: f64,
    pub throughput_per_sec: f64,
    pub health: HealthState,
}

/// Health thresholds: error rate above 10% or average latency above 5s is
/// critical; above 5% or 2s is degraded; a disconnected bridge is offline.
pub fn classify_health(connected: bool, error_rate: f64, average_latency_ms: f64) -> HealthState {
    if !connected {
        return HealthState::Offline;
    }
    if error_rate > 0.1 || average_latency_ms > 5000.0 {
        return HealthState::Critical;
    }
    if error_rate > 0.05 || average_latency_ms > 2000.0 {
        return HealthState::Degraded;
    }
    HealthState::Healthy
}

struct BridgeState {
    connection: ConnectionState,
    last_sync: Option<DateTime<Utc>>,
    messages_processed: u64,
    error_count: u64,
    latency_history: VecDeque<f64>,
    throughput_history: VecDeque<f64>,
    last_throughput_count: u64,
    /// Reconciled key -> (value, version), updated on every applied sync
    /// operation. Version comparisons against this map drive conflict
    /// detection.
    shared_state: HashMap<String, (Value, u64)>,
    /// Shared across connect and reconnect paths; resets only on a
    /// successful connect.
    retry_attempts: u32,
}

impl BridgeState {
    fn new() -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            last_sync: None,
            messages_processed: 0,
            error_count: 0,
            latency_history: VecDeque::new(),
            throughput_history: VecDeque::new(),
            last_throughput_count: 0,
            shared_state: HashMap::new(),
            retry_attempts: 0,
        }
    }
}

struct PeriodicTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Cancel and wait out an in-flight tick, so teardown is strictly
    /// ordered: nothing runs against the channels after this returns.
    async fn stop(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}

pub struct Bridge {
    reasoning: Arc<dyn SubsystemChannel>,
    dynamics: Arc<dyn SubsystemChannel>,
    max_retries: u32,
    retry_delay_ms: u64,
    sync_interval_ms: u64,
    health_check_interval_ms: u64,
    state: Mutex<BridgeState>,
    sync_task: Mutex<Option<PeriodicTask>>,
    health_task: Mutex<Option<PeriodicTask>>,
}

impl Bridge {
    pub fn new(
        reasoning: Arc<dyn SubsystemChannel>,
        dynamics: Arc<dyn SubsystemChannel>,
        config: &BusConfig,
    ) -> Self {
        Self {
            reasoning,
            dynamics,
            max_retries: config.max_retries,
            retry_delay_ms: config.retry_delay_ms,
            sync_interval_ms: config.sync_interval_ms,
            health_check_interval_ms: config.health_check_interval_ms,
            state: Mutex::new(BridgeState::new()),
            sync_task: Mutex::new(None),
            health_task: Mutex::new(None),
        }
    }

    fn channel_for(&self, subsystem: Subsystem) -> &Arc<dyn SubsystemChannel> {
        match subsystem {
            Subsystem::Reasoning => &self.reasoning,
            Subsystem::Dynamics => &self.dynamics,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state.lock().connection,
            ConnectionState::Connected | ConnectionState::Degraded
        )
    }

    /// Open both channels and run the initial state sync, retrying with
    /// linear backoff (`retry_delay_ms * attempt`). The attempt counter is
    /// shared with reconnects and resets only on success; once the budget
    /// is exhausted, or the failure is not retryable, the error is
    /// terminal.
    pub async fn connect(&self) -> Result<(), BusError> {
        if self.is_connected() {
            return Ok(());
        }
        loop {
            let attempt = {
                let mut state = self.state.lock();
                state.connection = ConnectionState::Connecting;
                state.retry_attempts += 1;
                state.retry_attempts
            };
            match self.connect_once().await {
                Ok(()) => {
                    let mut state = self.state.lock();
                    state.retry_attempts = 0;
                    state.connection = ConnectionState::Connected;
                    info!("bridge connected to both subsystems");
                    return Ok(());
                }
                Err(error) => {
                    warn!(attempt, error = %error, "bridge connect attempt failed");
                    self.close_channels().await;
                    if attempt >= self.max_retries.max(1) || !error.is_retryable() {
                        self.state.lock().connection = ConnectionState::Disconnected;
                        return Err(match error {
                            BusError::Connection {
                                subsystem, reason, ..
                            } => BusError::Connection {
                                subsystem,
                                attempts: attempt,
                                reason,
                            },
                            other => other,
                        });
                    }
                    let backoff = self.retry_delay_ms.saturating_mul(u64::from(attempt));
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
            }
        }
    }

    async fn connect_once(&self) -> Result<(), BusError> {
        let (reasoning, dynamics) = tokio::join!(self.reasoning.open(), self.dynamics.open());
        reasoning?;
        dynamics?;

        // Initial full sync; failure rolls the whole connect back.
        let result = self.sync_state().await;
        if !result.success {
            return Err(BusError::Sync {
                reason: result.errors.join("; "),
            });
        }
        Ok(())
    }

    async fn close_channels(&self) {
        tokio::join!(self.reasoning.close(), self.dynamics.close());
    }

    /// Stop background tasks and close both channels. Never fails. Both
    /// tasks are awaited, so no sync round or probe runs past this point.
    pub async fn disconnect(&self) {
        self.disable_bidirectional_sync().await;
        self.stop_health_monitor().await;
        self.close_channels().await;
        self.state.lock().connection = ConnectionState::Disconnected;
        info!("bridge disconnected");
    }

    /// Route one message to its target subsystem, recording latency on
    /// success and the error count on failure.
    pub async fn deliver(&self, message: &Message) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::NotConnected {
                subsystem: message.target,
            });
        }
        let started = Instant::now();
        let result = self.channel_for(message.target).deliver(message).await;

        let mut state = self.state.lock();
        match &result {
            Ok(()) => {
                state.messages_processed += 1;
                state
                    .latency_history
                    .push_back(started.elapsed().as_secs_f64() * 1000.0);
                while state.latency_history.len() > LATENCY_HISTORY_MAX {
                    state.latency_history.pop_front();
                }
            }
            Err(_) => state.error_count += 1,
        }
        result
    }

    /// One full bidirectional sync round.
    ///
    /// Pending operations are collected from both sides, checked for
    /// conflicts against the reconciled state, and applied to the peer.
    /// Operations blocked by a manual or deferred conflict are recorded in
    /// `conflicts` and skipped; they are neither counted in `items_synced`
    /// nor reported in `errors`.
    pub async fn sync_state(&self) -> SyncResult {
        let started = Instant::now();
        let mut errors = Vec::new();
        let mut conflicts = Vec::new();
        let mut items_synced = 0u64;

        let (from_reasoning, from_dynamics) = tokio::join!(
            self.reasoning.collect_pending(),
            self.dynamics.collect_pending()
        );
        let reasoning_ops = match from_reasoning {
            Ok(operations) => operations,
            Err(error) => {
                self.state.lock().error_count += 1;
                errors.push(format!("collect from reasoning: {error}"));
                Vec::new()
            }
        };
        let dynamics_ops = match from_dynamics {
            Ok(operations) => operations,
            Err(error) => {
                self.state.lock().error_count += 1;
                errors.push(format!("collect from dynamics: {error}"));
                Vec::new()
            }
        };

        let reasoning_keys: HashSet<&str> =
            reasoning_ops.iter().map(|op| op.key.as_str()).collect();
        let dynamics_keys: HashSet<&str> = dynamics_ops.iter().map(|op| op.key.as_str()).collect();

        for operation in &reasoning_ops {
            self.reconcile(
                operation,
                dynamics_keys.contains(operation.key.as_str()),
                &mut items_synced,
                &mut errors,
                &mut conflicts,
            )
            .await;
        }
        for operation in &dynamics_ops {
            self.reconcile(
                operation,
                reasoning_keys.contains(operation.key.as_str()),
                &mut items_synced,
                &mut errors,
                &mut conflicts,
            )
            .await;
        }

        self.state.lock().last_sync = Some(Utc::now());
        let success = errors.is_empty();
        debug!(
            items_synced,
            conflicts = conflicts.len(),
            errors = errors.len(),
            "state sync round complete"
        );
        SyncResult {
            success,
            items_synced,
            errors,
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
            conflicts,
        }
    }

    async fn reconcile(
        &self,
        operation: &SyncOperation,
        concurrent: bool,
        items_synced: &mut u64,
        errors: &mut Vec<String>,
        conflicts: &mut Vec<SyncConflict>,
    ) {
        let stored = self.state.lock().shared_state.get(&operation.key).cloned();
        let detected = sync::classify_operation(operation, concurrent, stored.as_ref());
        let decision = sync::decide(&detected);
        conflicts.extend(detected);

        match decision {
            ApplyDecision::Skip => {}
            ApplyDecision::Apply => {
                self.apply_operation(operation.clone(), items_synced, errors)
                    .await;
            }
            ApplyDecision::ResolveThenApply => {
                let mut resolved = operation.clone();
                resolved.version = match stored {
                    Some((_, stored_version)) => stored_version + 1,
                    None => resolved.version + 1,
                };
                self.apply_operation(resolved, items_synced, errors).await;
            }
        }
    }

    async fn apply_operation(
        &self,
        operation: SyncOperation,
        items_synced: &mut u64,
        errors: &mut Vec<String>,
    ) {
        let target = self.channel_for(operation.source.peer());
        match target.apply(&operation).await {
            Ok(()) => {
                self.state.lock().shared_state.insert(
                    operation.key.clone(),
                    (operation.value.clone(), operation.version),
                );
                *items_synced += 1;
            }
            Err(error) => {
                self.state.lock().error_count += 1;
                errors.push(format!(
                    "apply `{}` to {}: {error}",
                    operation.key,
                    target.subsystem()
                ));
            }
        }
    }

    /// Reconciled value and version for a synced key, if any.
    pub fn shared_value(&self, key: &str) -> Option<(Value, u64)> {
        self.state.lock().shared_state.get(key).cloned()
    }

    /// Spawn the periodic sync task. Idempotent.
    pub fn enable_bidirectional_sync(self: &Arc<Self>) {
        let mut slot = self.sync_task.lock();
        if slot.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let task_token = token.clone();
        let bridge = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(bridge.sync_interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; connect already synced.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        if bridge.is_connected() {
                            let result = bridge.sync_state().await;
                            if !result.success {
                                warn!(errors = result.errors.len(), "periodic state sync reported errors");
                            }
                        }
                    }
                }
            }
        });
        *slot = Some(PeriodicTask { token, handle });
        debug!("bidirectional sync enabled");
    }

    pub async fn disable_bidirectional_sync(&self) {
        let task = self.sync_task.lock().take();
        if let Some(task) = task {
            task.stop().await;
        }
    }

    /// Spawn the health monitor task. Idempotent.
    pub fn start_health_monitor(self: &Arc<Self>) {
        let mut slot = self.health_task.lock();
        if slot.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let task_token = token.clone();
        let bridge = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(bridge.health_check_interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => bridge.health_tick().await,
                }
            }
        });
        *slot = Some(PeriodicTask { token, handle });
        debug!("health monitor started");
    }

    pub async fn stop_health_monitor(&self) {
        let task = self.health_task.lock().take();
        if let Some(task) = task {
            task.stop().await;
        }
    }

    /// Probe both channels; a failed probe tears the connection down and
    /// re-enters the shared retry path.
    async fn health_tick(&self) {
        if self.is_connected() {
            let (reasoning_ok, dynamics_ok) = tokio::join!(
                self.reasoning.health_check(),
                self.dynamics.health_check()
            );
            if !(reasoning_ok && dynamics_ok) {
                warn!(
                    reasoning_ok,
                    dynamics_ok, "subsystem failed health probe; reconnecting"
                );
                self.close_channels().await;
                self.state.lock().connection = ConnectionState::Disconnected;
                if let Err(error) = self.connect().await {
                    warn!(error = %error, "reconnect after failed health probe did not succeed");
                }
            }
        }
        self.record_throughput_sample();
        self.refresh_connection_grade();
    }

    fn record_throughput_sample(&self) {
        let interval_secs = (self.health_check_interval_ms as f64 / 1000.0).max(0.001);
        let mut state = self.state.lock();
        let delta = state
            .messages_processed
            .saturating_sub(state.last_throughput_count);
        state.last_throughput_count = state.messages_processed;
        state.throughput_history.push_back(delta as f64 / interval_secs);
        while state.throughput_history.len() > THROUGHPUT_HISTORY_MAX {
            state.throughput_history.pop_front();
        }
    }

    fn refresh_connection_grade(&self) {
        let health = self.status().health;
        let mut state = self.state.lock();
        if matches!(
            state.connection,
            ConnectionState::Connected | ConnectionState::Degraded
        ) {
            state.connection = match health {
                HealthState::Healthy => ConnectionState::Connected,
                _ => ConnectionState::Degraded,
            };
        }
    }

    pub fn status(&self) -> BridgeStatus {
        let state = self.state.lock();
        let connected = matches!(
            state.connection,
            ConnectionState::Connected | ConnectionState::Degraded
        );
        let average_latency_ms = mean(&state.latency_history);
        let throughput_per_sec = mean(&state.throughput_history);
        let total = state.messages_processed + state.error_count;
        let error_rate = if total == 0 {
            0.0
        } else {
            state.error_count as f64 / total as f64
        };
        BridgeStatus {
            connected,
            connection: state.connection,
            last_sync: state.last_sync,
            messages_processed: state.messages_processed,
            error_count: state.error_count,
            error_rate,
            average_latency_ms,
            throughput_per_sec,
            health: classify_health(connected, error_rate, average_latency_ms),
        }
    }
}

fn mean(values: &VecDeque<f64>) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}
