use crate::message::{MessageType, Priority};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Instant;

/// Window over which throughput is computed.
const THROUGHPUT_WINDOW_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct LatencySnapshot {
    pub samples: u64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

/// Immutable snapshot of the controller's rolling aggregates.
///
/// Per-type and per-priority maps are string-keyed so the snapshot
/// serializes to plain JSON objects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub started_at: DateTime<Utc>,
    pub messages_sent: u64,
    pub messages_processed: u64,
    pub messages_failed: u64,
    pub validation_failures: u64,
    pub handler_errors: u64,
    pub handler_timeouts: u64,
    pub per_type: BTreeMap<String, u64>,
    pub per_priority: BTreeMap<String, u64>,
    pub latency: LatencySnapshot,
    pub throughput_per_sec: f64,
}

#[derive(Debug)]
struct MetricsInner {
    started_at: DateTime<Utc>,
    messages_sent: u64,
    messages_processed: u64,
    messages_failed: u64,
    validation_failures: u64,
    handler_errors: u64,
    handler_timeouts: u64,
    per_type: HashMap<MessageType, u64>,
    per_priority: HashMap<Priority, u64>,
    latency_count: u64,
    latency_total_ms: f64,
    latency_min_ms: f64,
    latency_max_ms: f64,
    processed_window: VecDeque<Instant>,
}

impl MetricsInner {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            messages_sent: 0,
            messages_processed: 0,
            messages_failed: 0,
            validation_failures: 0,
            handler_errors: 0,
            handler_timeouts: 0,
            per_type: HashMap::new(),
            per_priority: HashMap::new(),
            latency_count: 0,
            latency_total_ms: 0.0,
            latency_min_ms: f64::MAX,
            latency_max_ms: 0.0,
            processed_window: VecDeque::new(),
        }
    }

    fn trim_window(&mut self) {
        let cutoff = std::time::Duration::from_secs(THROUGHPUT_WINDOW_SECS);
        while let Some(oldest) = self.processed_window.front() {
            if oldest.elapsed() > cutoff {
                self.processed_window.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Process-lifetime aggregates, reset only on `clear` or restart.
#[derive(Debug)]
pub struct BusMetrics {
    inner: Mutex<MetricsInner>,
}

impl Default for BusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl BusMetrics {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MetricsInner::new()),
        }
    }

    pub fn record_sent(&self) {
        self.inner.lock().messages_sent += 1;
    }

    pub fn record_validation_failure(&self) {
        self.inner.lock().validation_failures += 1;
    }

    pub fn record_processed(
        &self,
        kind: MessageType,
        priority: Priority,
        latency_ms: f64,
        success: bool,
    ) {
        let mut inner = self.inner.lock();
        inner.messages_processed += 1;
        if !success {
            inner.messages_failed += 1;
        }
        *inner.per_type.entry(kind).or_insert(0) += 1;
        *inner.per_priority.entry(priority).or_insert(0) += 1;
        inner.latency_count += 1;
        inner.latency_total_ms += latency_ms;
        inner.latency_min_ms = inner.latency_min_ms.min(latency_ms);
        inner.latency_max_ms = inner.latency_max_ms.max(latency_ms);
        inner.processed_window.push_back(Instant::now());
        inner.trim_window();
    }

    pub fn record_handler_error(&self) {
        self.inner.lock().handler_errors += 1;
    }

    pub fn record_handler_timeout(&self) {
        let mut inner = self.inner.lock();
        inner.handler_timeouts += 1;
        inner.handler_errors += 1;
    }

    /// Snapshot copy; callers never see live state.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut inner = self.inner.lock();
        inner.trim_window();

        let latency = if inner.latency_count == 0 {
            LatencySnapshot::default()
        } else {
            LatencySnapshot {
                samples: inner.latency_count,
                avg_ms: inner.latency_total_ms / inner.latency_count as f64,
                min_ms: inner.latency_min_ms,
                max_ms: inner.latency_max_ms,
            }
        };

        MetricsSnapshot {
            started_at: inner.started_at,
            messages_sent: inner.messages_sent,
            messages_processed: inner.messages_processed,
            messages_failed: inner.messages_failed,
            validation_failures: inner.validation_failures,
            handler_errors: inner.handler_errors,
            handler_timeouts: inner.handler_timeouts,
            per_type: inner
                .per_type
                .iter()
                .map(|(kind, count)| (kind.as_str().to_string(), *count))
                .collect(),
            per_priority: inner
                .per_priority
                .iter()
                .map(|(priority, count)| (priority.as_str().to_string(), *count))
                .collect(),
            latency,
            throughput_per_sec: inner.processed_window.len() as f64
                / THROUGHPUT_WINDOW_SECS as f64,
        }
    }

    pub fn clear(&self) {
        *self.inner.lock() = MetricsInner::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_min_avg_max() {
        let metrics = BusMetrics::new();
        metrics.record_processed(MessageType::FieldUpdate, Priority::Normal, 10.0, true);
        metrics.record_processed(MessageType::FieldUpdate, Priority::Normal, 30.0, true);
        metrics.record_processed(MessageType::ResonanceEvent, Priority::High, 20.0, false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_processed, 3);
        assert_eq!(snapshot.messages_failed, 1);
        assert_eq!(snapshot.latency.samples, 3);
        assert!((snapshot.latency.avg_ms - 20.0).abs() < f64::EPSILON);
        assert!((snapshot.latency.min_ms - 10.0).abs() < f64::EPSILON);
        assert!((snapshot.latency.max_ms - 30.0).abs() < f64::EPSILON);
        assert_eq!(snapshot.per_type.get("field_update"), Some(&2));
        assert_eq!(snapshot.per_priority.get("high"), Some(&1));
        assert!(snapshot.throughput_per_sec > 0.0);
    }

    #[test]
    fn clear_resets_everything() {
        let metrics = BusMetrics::new();
        metrics.record_sent();
        metrics.record_handler_timeout();
        metrics.record_processed(MessageType::HealthProbe, Priority::Low, 5.0, true);
        metrics.clear();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_sent, 0);
        assert_eq!(snapshot.messages_processed, 0);
        assert_eq!(snapshot.handler_errors, 0);
        assert_eq!(snapshot.handler_timeouts, 0);
        assert_eq!(snapshot.latency.samples, 0);
        assert!(snapshot.per_type.is_empty());
    }

    #[test]
    fn empty_metrics_snapshot_is_zeroed() {
        let snapshot = BusMetrics::new().snapshot();
        assert_eq!(snapshot.latency.avg_ms, 0.0);
        assert_eq!(snapshot.latency.min_ms, 0.0);
        assert_eq!(snapshot.throughput_per_sec, 0.0);
    }

    #[test]
    fn timeout_counts_as_handler_error() {
        let metrics = BusMetrics::new();
        metrics.record_handler_timeout();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.handler_timeouts, 1);
        assert_eq!(snapshot.handler_errors, 1);
    }
}
