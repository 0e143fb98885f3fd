//! Broadcast scheduler: bounded priority queue, batched fan-out.
//!
//! Single-writer with respect to the queue: enqueues are serialized through
//! the queue lock and at most one drain runs at a time. Envelopes are
//! serialized once per type group; per-recipient delivery failures are
//! isolated to that recipient's mailbox.

use crate::history::InMemoryHistory;
use crate::registry::{ConnectionId, ConnectionRegistry, Outbound};
use crate::ws_common::{encode_bounded, now_ms, offer, server_frame};
use pulse_protocol::{BatchData, BatchEntry, MessageType, Priority, ServerEvent, ServerFrame};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// One queued fan-out job. Consumed exactly once; never persisted.
#[derive(Debug, Clone)]
pub struct BroadcastTask {
    pub kind: MessageType,
    pub event: ServerEvent,
    pub data: Value,
    pub priority: Priority,
    pub enqueued_at: i64,
    /// Admission sequence; total order tie-break for equal priorities.
    seq: u64,
}

impl BroadcastTask {
    pub fn new(kind: MessageType, event: ServerEvent, data: Value, priority: Priority) -> Self {
        Self {
            kind,
            event,
            data,
            priority,
            enqueued_at: now_ms(),
            seq: 0,
        }
    }
}

/// Queue depth and drain state for the read-only HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub length: usize,
    pub is_processing: bool,
}

pub struct BroadcastScheduler {
    registry: Arc<ConnectionRegistry>,
    history: Arc<InMemoryHistory>,
    queue: Mutex<Vec<BroadcastTask>>,
    kick: Notify,
    processing: AtomicBool,
    stopped: AtomicBool,
    seq: AtomicU64,
    frames_sent: AtomicU64,
    max_queue_size: usize,
    batch_size: usize,
    flush_interval: std::time::Duration,
    max_message_size: usize,
}

impl BroadcastScheduler {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        history: Arc<InMemoryHistory>,
        max_queue_size: usize,
        batch_size: usize,
        flush_interval: std::time::Duration,
        max_message_size: usize,
    ) -> Self {
        Self {
            registry,
            history,
            queue: Mutex::new(Vec::new()),
            kick: Notify::new(),
            processing: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            max_queue_size,
            batch_size,
            flush_interval,
            max_message_size,
        }
    }

    /// Spawn the drain loop. Ticks every flush interval and whenever a
    /// high-priority enqueue kicks it.
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(scheduler.flush_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    () = scheduler.kick.notified() => {}
                    _ = shutdown.changed() => break,
                }
                if scheduler.stopped.load(Ordering::Acquire) {
                    break;
                }
                scheduler.flush().await;
            }
            debug!("broadcast drain loop stopped");
        })
    }

    /// Cancel draining and drop any undrained tasks.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let dropped = {
            let mut queue = self.queue.lock().expect("queue lock poisoned");
            std::mem::take(&mut *queue).len()
        };
        self.kick.notify_one();
        if dropped > 0 {
            info!(dropped, "scheduler stopped with undrained tasks");
        }
    }

    /// Queue a fan-out job. Returns false when the task was rejected under
    /// the full-queue displacement rule; rejection is silent to clients.
    pub fn enqueue(&self, mut task: BroadcastTask) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        task.seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let priority = task.priority;
        let accepted = {
            let mut queue = self.queue.lock().expect("queue lock poisoned");
            if queue.len() < self.max_queue_size {
                queue.push(task);
                true
            } else {
                Self::displace(&mut queue, task)
            }
        };
        if !accepted {
            warn!(priority = ?priority, "broadcast queue full, dropping task");
        } else if priority == Priority::High {
            self.kick.notify_one();
        }
        accepted
    }

    /// Full-queue admission: evict the first lower-priority task, insert the
    /// incoming one in priority order, or reject.
    fn displace(queue: &mut Vec<BroadcastTask>, task: BroadcastTask) -> bool {
        if let Some(pos) = queue.iter().position(|t| t.priority == Priority::Low) {
            if task.priority != Priority::Low {
                queue.remove(pos);
                Self::insert_in_priority_order(queue, task);
                return true;
            }
            return false;
        }
        if task.priority == Priority::High {
            if let Some(pos) = queue.iter().position(|t| t.priority == Priority::Normal) {
                queue.remove(pos);
                Self::insert_in_priority_order(queue, task);
                return true;
            }
        }
        false
    }

    fn insert_in_priority_order(queue: &mut Vec<BroadcastTask>, task: BroadcastTask) {
        let pos = queue
            .iter()
            .position(|t| t.priority < task.priority)
            .unwrap_or(queue.len());
        queue.insert(pos, task);
    }

    /// Enqueue shorthand used by the detector and the privileged endpoint.
    pub fn broadcast(
        &self,
        kind: MessageType,
        event: ServerEvent,
        data: Value,
        priority: Priority,
    ) -> bool {
        self.enqueue(BroadcastTask::new(kind, event, data, priority))
    }

    /// Bypass the queue and fan out immediately. Reserved for safety-critical
    /// notifications; per-recipient failures remain isolated.
    pub async fn broadcast_urgent(&self, kind: MessageType, event: ServerEvent, data: Value) {
        let timestamp = now_ms();
        self.history.record(kind, event, &data, timestamp);
        let frame = server_frame(kind, event, data);
        self.fan_out(&frame).await;
    }

    /// Write one envelope to an explicit recipient list, serialized once.
    pub async fn broadcast_to_connections(&self, ids: &[ConnectionId], frame: &ServerFrame) {
        let Some(text) = encode_bounded(frame, self.max_message_size) else {
            return;
        };
        for id in ids {
            if let Some(mailbox) = self.registry.mailbox(id).await {
                if offer(id, &mailbox, text.clone()) {
                    self.frames_sent.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Drain one batch: sort the queue by (priority, admission order), take
    /// the prefix, coalesce per type, fan out each group.
    pub async fn flush(&self) {
        if self.processing.swap(true, Ordering::AcqRel) {
            return;
        }
        let batch: Vec<BroadcastTask> = {
            let mut queue = self.queue.lock().expect("queue lock poisoned");
            queue.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
            let take = self.batch_size.min(queue.len());
            queue.drain(..take).collect()
        };

        if !batch.is_empty() {
            let mut groups: Vec<(MessageType, Vec<BroadcastTask>)> = Vec::new();
            for task in batch {
                match groups.iter_mut().find(|(kind, _)| *kind == task.kind) {
                    Some((_, tasks)) => tasks.push(task),
                    None => groups.push((task.kind, vec![task])),
                }
            }
            for (kind, mut tasks) in groups {
                // Admission order within the group keeps batch timestamps
                // non-decreasing.
                tasks.sort_by_key(|t| t.seq);
                for task in &tasks {
                    self.history.record(kind, task.event, &task.data, task.enqueued_at);
                }
                let subscribers = self.registry.by_subscription(kind).await;
                if subscribers.is_empty() {
                    continue;
                }
                let frame = if tasks.len() == 1 {
                    let task = tasks.pop().expect("group is non-empty");
                    server_frame(kind, task.event, task.data)
                } else {
                    let events = tasks
                        .into_iter()
                        .map(|t| BatchEntry {
                            event: t.event,
                            data: t.data,
                            timestamp: t.enqueued_at,
                        })
                        .collect();
                    let data = serde_json::to_value(BatchData { events }).unwrap_or(Value::Null);
                    server_frame(kind, ServerEvent::BatchUpdate, data)
                };
                self.fan_out(&frame).await;
            }
        }

        self.processing.store(false, Ordering::Release);
        let backlog = self.queue.lock().expect("queue lock poisoned").len();
        if backlog > 0 {
            self.kick.notify_one();
        }
    }

    async fn fan_out(&self, frame: &ServerFrame) {
        let subscribers = self.registry.by_subscription(frame.kind).await;
        if subscribers.is_empty() {
            return;
        }
        let Some(text) = encode_bounded(frame, self.max_message_size) else {
            return;
        };
        for (id, mailbox) in &subscribers {
            if offer(id, mailbox, text.clone()) {
                self.frames_sent.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn queue_stats(&self) -> QueueStats {
        QueueStats {
            length: self.queue.lock().expect("queue lock poisoned").len(),
            is_processing: self.processing.load(Ordering::Acquire),
        }
    }

    /// Total frames written to mailboxes since startup.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn queue_priorities(&self) -> Vec<Priority> {
        self.queue
            .lock()
            .expect("queue lock poisoned")
            .iter()
            .map(|t| t.priority)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_protocol::error_codes;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn scheduler_with_capacity(max_queue: usize) -> (Arc<BroadcastScheduler>, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ConnectionRegistry::new(100, 10));
        let history = Arc::new(InMemoryHistory::new(100));
        let scheduler = Arc::new(BroadcastScheduler::new(
            registry.clone(),
            history,
            max_queue,
            100,
            std::time::Duration::from_millis(10_000),
            64 * 1024,
        ));
        (scheduler, registry)
    }

    fn task(priority: Priority, tag: u64) -> BroadcastTask {
        BroadcastTask::new(
            MessageType::Status,
            ServerEvent::StatusUpdate,
            json!({ "tag": tag }),
            priority,
        )
    }

    async fn subscribe_mailbox(
        registry: &ConnectionRegistry,
        types: &[MessageType],
    ) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(64);
        let id = registry.register("observer", tx).await.unwrap();
        registry.set_subscriptions(&id, types).await;
        rx
    }

    fn frame_from(outbound: Outbound) -> ServerFrame {
        match outbound {
            Outbound::Frame(text) => serde_json::from_str(&text).expect("valid server frame"),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn displacement_evicts_the_oldest_low_task_for_high() {
        let (scheduler, _registry) = scheduler_with_capacity(3);
        assert!(scheduler.enqueue(task(Priority::Low, 1)));
        assert!(scheduler.enqueue(task(Priority::Low, 2)));
        assert!(scheduler.enqueue(task(Priority::Low, 3)));

        assert!(scheduler.enqueue(task(Priority::High, 4)));
        assert_eq!(
            scheduler.queue_priorities(),
            vec![Priority::High, Priority::Low, Priority::Low]
        );
        // The evicted task is the first queued low one.
        let tags: Vec<u64> = scheduler
            .queue
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.data["tag"].as_u64().unwrap())
            .collect();
        assert_eq!(tags, vec![4, 2, 3]);

        // A low task cannot displace anything once the queue is full.
        assert!(!scheduler.enqueue(task(Priority::Low, 5)));
        assert_eq!(scheduler.queue_stats().length, 3);
    }

    #[tokio::test]
    async fn high_displaces_normal_only_when_no_low_exists() {
        let (scheduler, _registry) = scheduler_with_capacity(2);
        assert!(scheduler.enqueue(task(Priority::Normal, 1)));
        assert!(scheduler.enqueue(task(Priority::Normal, 2)));

        // Normal cannot displace normal.
        assert!(!scheduler.enqueue(task(Priority::Normal, 3)));
        // High can.
        assert!(scheduler.enqueue(task(Priority::High, 4)));
        assert_eq!(scheduler.queue_priorities(), vec![Priority::High, Priority::Normal]);
    }

    #[tokio::test]
    async fn full_queue_of_high_rejects_everything() {
        let (scheduler, _registry) = scheduler_with_capacity(2);
        assert!(scheduler.enqueue(task(Priority::High, 1)));
        assert!(scheduler.enqueue(task(Priority::High, 2)));
        assert!(!scheduler.enqueue(task(Priority::High, 3)));
        assert!(!scheduler.enqueue(task(Priority::Normal, 4)));
        assert_eq!(scheduler.queue_stats().length, 2);
    }

    #[tokio::test]
    async fn queue_never_exceeds_its_bound() {
        let (scheduler, _registry) = scheduler_with_capacity(5);
        for i in 0..50 {
            let priority = match i % 3 {
                0 => Priority::Low,
                1 => Priority::Normal,
                _ => Priority::High,
            };
            scheduler.enqueue(task(priority, i));
            assert!(scheduler.queue_stats().length <= 5);
        }
    }

    #[tokio::test]
    async fn coalesces_same_type_tasks_into_one_batch_update() {
        let (scheduler, registry) = scheduler_with_capacity(100);
        let mut rx = subscribe_mailbox(&registry, &[MessageType::Status]).await;

        assert!(scheduler.enqueue(task(Priority::Normal, 1)));
        assert!(scheduler.enqueue(task(Priority::Normal, 2)));
        assert!(scheduler.enqueue(task(Priority::Normal, 3)));
        scheduler.flush().await;

        let frame = frame_from(rx.try_recv().expect("one coalesced frame"));
        assert_eq!(frame.event, ServerEvent::BatchUpdate);
        let events = frame.data["events"].as_array().expect("events array");
        assert_eq!(events.len(), 3);
        let timestamps: Vec<i64> = events
            .iter()
            .map(|e| e["timestamp"].as_i64().unwrap())
            .collect();
        assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
        assert!(rx.try_recv().is_err(), "exactly one envelope per subscriber");
    }

    #[tokio::test]
    async fn single_task_groups_keep_their_own_event() {
        let (scheduler, registry) = scheduler_with_capacity(100);
        let mut rx = subscribe_mailbox(&registry, &[MessageType::Health]).await;

        scheduler.broadcast(
            MessageType::Health,
            ServerEvent::HealthAlert,
            json!({ "component": "cpu" }),
            Priority::Normal,
        );
        scheduler.flush().await;

        let frame = frame_from(rx.try_recv().expect("one frame"));
        assert_eq!(frame.event, ServerEvent::HealthAlert);
        assert_eq!(frame.kind, MessageType::Health);
    }

    #[tokio::test]
    async fn fan_out_reaches_only_matching_subscribers() {
        let (scheduler, registry) = scheduler_with_capacity(100);
        let mut status_rx = subscribe_mailbox(&registry, &[MessageType::Status]).await;
        let mut all_rx = subscribe_mailbox(&registry, &[MessageType::All]).await;
        let mut config_rx = subscribe_mailbox(&registry, &[MessageType::Config]).await;

        scheduler.broadcast(
            MessageType::Status,
            ServerEvent::StatusUpdate,
            json!({}),
            Priority::Normal,
        );
        scheduler.flush().await;

        assert!(status_rx.try_recv().is_ok());
        assert!(all_rx.try_recv().is_ok());
        assert!(config_rx.try_recv().is_err());
        assert_eq!(scheduler.frames_sent(), 2);
    }

    #[tokio::test]
    async fn explicit_recipient_lists_bypass_subscriptions() {
        let (scheduler, registry) = scheduler_with_capacity(100);
        let (tx, mut target_rx) = mpsc::channel(16);
        let target = registry.register("target", tx).await.unwrap();
        let mut bystander_rx = subscribe_mailbox(&registry, &[MessageType::All]).await;

        let frame = crate::ws_common::server_frame(
            MessageType::System,
            ServerEvent::Disconnected,
            json!({ "reason": "maintenance" }),
        );
        scheduler.broadcast_to_connections(&[target], &frame).await;

        let delivered = frame_from(target_rx.try_recv().expect("targeted frame"));
        assert_eq!(delivered.event, ServerEvent::Disconnected);
        assert!(bystander_rx.try_recv().is_err(), "subscription set not consulted");
    }

    #[tokio::test]
    async fn urgent_broadcast_bypasses_the_queue() {
        let (scheduler, registry) = scheduler_with_capacity(1);
        let mut rx = subscribe_mailbox(&registry, &[MessageType::Health]).await;

        // Fill the queue so a regular enqueue would be rejected.
        assert!(scheduler.enqueue(task(Priority::High, 1)));
        scheduler
            .broadcast_urgent(
                MessageType::Health,
                ServerEvent::HealthAlert,
                json!({ "level": "critical" }),
            )
            .await;

        let frame = frame_from(rx.try_recv().expect("urgent frame delivered"));
        assert_eq!(frame.event, ServerEvent::HealthAlert);
        assert_eq!(scheduler.queue_stats().length, 1, "queued task untouched");
    }

    #[tokio::test]
    async fn slow_consumer_does_not_abort_the_batch() {
        let (scheduler, registry) = scheduler_with_capacity(100);
        // A mailbox of capacity 1 that is never drained: the second frame is
        // dropped for this recipient only.
        let (full_tx, mut full_rx) = mpsc::channel(1);
        let slow = registry.register("slow", full_tx).await.unwrap();
        registry.set_subscriptions(&slow, &[MessageType::Status]).await;
        let mut healthy_rx = subscribe_mailbox(&registry, &[MessageType::Status]).await;

        scheduler.broadcast(MessageType::Status, ServerEvent::StatusUpdate, json!({"n": 1}), Priority::Normal);
        scheduler.flush().await;
        scheduler.broadcast(MessageType::Status, ServerEvent::StatusUpdate, json!({"n": 2}), Priority::Normal);
        scheduler.flush().await;

        assert!(healthy_rx.try_recv().is_ok());
        assert!(healthy_rx.try_recv().is_ok(), "healthy recipient got both frames");
        assert!(full_rx.try_recv().is_ok());
        assert!(full_rx.try_recv().is_err(), "slow recipient lost the overflow frame");
    }

    #[tokio::test]
    async fn stop_drops_undrained_tasks() {
        let (scheduler, registry) = scheduler_with_capacity(100);
        let mut rx = subscribe_mailbox(&registry, &[MessageType::Status]).await;
        scheduler.enqueue(task(Priority::Normal, 1));
        scheduler.stop();
        assert_eq!(scheduler.queue_stats().length, 0);
        assert!(!scheduler.enqueue(task(Priority::Normal, 2)));
        scheduler.flush().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn error_frames_are_never_broadcast_to_subscribers() {
        // No subscription can contain `error`, so an error-typed task finds
        // no recipients even with an `all` subscriber present.
        let (scheduler, registry) = scheduler_with_capacity(100);
        let mut rx = subscribe_mailbox(&registry, &[MessageType::All]).await;
        scheduler.broadcast(
            MessageType::Error,
            ServerEvent::Error,
            json!({ "code": error_codes::INTERNAL_ERROR }),
            Priority::High,
        );
        scheduler.flush().await;
        assert!(rx.try_recv().is_err());
    }
}
