use crate::message::{Message, Priority};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::warn;

/// Runtime counters for operational visibility.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub enqueued_total: u64,
    /// Messages evicted because their priority class was at capacity.
    pub evictions_total: u64,
    pub drained_total: u64,
}

/// Four independent bounded queues, one per priority class.
///
/// Overflow policy: evict the oldest entry in the same class and warn;
/// the caller is never blocked. Draining removes up to `batch_size`
/// messages per class per tick, each class independent of the others'
/// backlog, in fixed order critical, high, normal, low. Execution order
/// within the tick favors higher classes without starving lower ones.
#[derive(Debug)]
pub struct PriorityQueues {
    capacity: usize,
    queues: [VecDeque<Message>; 4],
    stats: QueueStats,
}

impl PriorityQueues {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queues: [
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
            ],
            stats: QueueStats::default(),
        }
    }

    /// Enqueue into the message's priority class. Returns the evicted
    /// message when the class was at capacity.
    pub fn enqueue(&mut self, message: Message) -> Option<Message> {
        let queue = &mut self.queues[message.priority.index()];
        let evicted = if queue.len() >= self.capacity {
            queue.pop_front()
        } else {
            None
        };
        if let Some(evicted) = evicted.as_ref() {
            self.stats.evictions_total += 1;
            warn!(
                priority = %message.priority,
                evicted_id = %evicted.id,
                capacity = self.capacity,
                "priority queue at capacity; evicting oldest message"
            );
        }
        self.queues[message.priority.index()].push_back(message);
        self.stats.enqueued_total += 1;
        evicted
    }

    /// Remove up to `batch_size` messages per class, classes in fixed
    /// order. A class with fewer queued messages than the batch fully
    /// drains even when a higher class still has a backlog.
    pub fn drain_tick(&mut self, batch_size: usize) -> Vec<Message> {
        let mut drained = Vec::new();
        for priority in Priority::ORDERED {
            let queue = &mut self.queues[priority.index()];
            let take = batch_size.min(queue.len());
            drained.extend(queue.drain(..take));
        }
        self.stats.drained_total += drained.len() as u64;
        drained
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }

    pub fn len_for(&self, priority: Priority) -> usize {
        self.queues[priority.index()].len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageType, Payload, Subsystem};
    use serde_json::json;

    fn message(priority: Priority, marker: u64) -> Message {
        Message::new(
            Subsystem::Reasoning,
            Subsystem::Dynamics,
            MessageType::FieldUpdate,
            Payload::new(json!({ "marker": marker }), "s1"),
            priority,
        )
    }

    #[test]
    fn classes_drain_independently() {
        let mut queues = PriorityQueues::new(100);
        for i in 0..25 {
            queues.enqueue(message(Priority::Critical, i));
        }
        for i in 0..3 {
            queues.enqueue(message(Priority::Normal, i));
        }

        let drained = queues.drain_tick(10);

        // 10 critical + 3 normal in one tick; normal does not wait for
        // the critical backlog to clear.
        assert_eq!(drained.len(), 13);
        assert_eq!(queues.len_for(Priority::Critical), 15);
        assert_eq!(queues.len_for(Priority::Normal), 0);
    }

    #[test]
    fn drain_order_is_fixed_per_class() {
        let mut queues = PriorityQueues::new(100);
        queues.enqueue(message(Priority::Low, 1));
        queues.enqueue(message(Priority::Critical, 2));
        queues.enqueue(message(Priority::Normal, 3));
        queues.enqueue(message(Priority::High, 4));

        let drained = queues.drain_tick(10);
        let order: Vec<Priority> = drained.iter().map(|m| m.priority).collect();
        assert_eq!(
            order,
            vec![
                Priority::Critical,
                Priority::High,
                Priority::Normal,
                Priority::Low
            ]
        );
    }

    #[test]
    fn overflow_evicts_oldest_in_same_class() {
        let mut queues = PriorityQueues::new(2);
        queues.enqueue(message(Priority::Normal, 0));
        queues.enqueue(message(Priority::Normal, 1));
        let evicted = queues
            .enqueue(message(Priority::Normal, 2))
            .expect("oldest must be evicted at capacity");
        assert_eq!(evicted.payload.data["marker"], json!(0));
        assert_eq!(queues.len_for(Priority::Normal), 2);
        assert_eq!(queues.stats().evictions_total, 1);

        // Other classes are untouched by the eviction.
        queues.enqueue(message(Priority::Critical, 3));
        assert_eq!(queues.len_for(Priority::Critical), 1);
    }

    #[test]
    fn fifo_within_a_class() {
        let mut queues = PriorityQueues::new(10);
        for i in 0..4 {
            queues.enqueue(message(Priority::High, i));
        }
        let drained = queues.drain_tick(10);
        let markers: Vec<u64> = drained
            .iter()
            .map(|m| m.payload.data["marker"].as_u64().unwrap())
            .collect();
        assert_eq!(markers, vec![0, 1, 2, 3]);
    }

    #[test]
    fn stats_track_lifecycle() {
        let mut queues = PriorityQueues::new(10);
        queues.enqueue(message(Priority::Low, 0));
        queues.enqueue(message(Priority::Low, 1));
        queues.drain_tick(10);
        let stats = queues.stats();
        assert_eq!(stats.enqueued_total, 2);
        assert_eq!(stats.drained_total, 2);
        assert_eq!(stats.evictions_total, 0);
        assert!(queues.is_empty());
    }
}
