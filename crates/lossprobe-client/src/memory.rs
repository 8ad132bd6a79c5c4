//! In-process broker with Kafka-like semantics.
//!
//! Topics are split into partitions filled round-robin. Readers belong to a
//! consumer group; readers in one group share per-partition positions, so each
//! record is handed to exactly one of them. Committed offsets are tracked per
//! group and [`InMemoryBroker::rewind_to_committed`] replays from them, which
//! is what a restarted consumer would see.
//!
//! Fault injection (`fail_next_publishes`, `lose_next_publishes`) lets tests
//! exercise the loss-detection path without a real cluster.
use crate::{ClientError, DeliveryEvent, PublishClient, ReadClient, Result, WireMessage};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;

pub const DEFAULT_PARTITIONS: usize = 4;
const COMPLETION_CAPACITY: usize = 4096;

#[derive(Default)]
struct GroupState {
    // Next offset to hand out, per partition.
    positions: Vec<i64>,
    // Next offset a restarted reader would start from, per partition.
    committed: Vec<i64>,
    // Partition to try first on the next read, for fairness.
    next_partition: usize,
}

#[derive(Default)]
struct TopicState {
    partitions: Vec<Vec<WireMessage>>,
    next_partition: usize,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, TopicState>,
    // (group, topic) -> positions.
    groups: HashMap<(String, String), GroupState>,
}

struct BrokerInner {
    partitions: usize,
    state: Mutex<BrokerState>,
    appended: Notify,
    fail_next: AtomicU64,
    lose_next: AtomicU64,
}

/// Shared handle to an in-process broker.
///
/// ```
/// use bytes::Bytes;
/// use lossprobe_client::{InMemoryBroker, PublishClient, ReadClient, WireMessage};
/// use std::time::Duration;
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let broker = InMemoryBroker::new();
///     let reader = broker.reader("group", true);
///     reader.subscribe(&["updates".to_string()]).await.expect("subscribe");
///     broker
///         .publisher()
///         .publish(WireMessage::new("updates", Bytes::from_static(b"payload")))
///         .await
///         .expect("publish");
///     let read = reader.read(Duration::from_secs(1)).await.expect("read");
///     assert_eq!(read.payload, Bytes::from_static(b"payload"));
/// });
/// ```
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    pub fn with_partitions(partitions: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                partitions: partitions.max(1),
                state: Mutex::new(BrokerState::default()),
                appended: Notify::new(),
                fail_next: AtomicU64::new(0),
                lose_next: AtomicU64::new(0),
            }),
        }
    }

    pub fn partitions(&self) -> usize {
        self.inner.partitions
    }

    pub fn publisher(&self) -> MemoryPublisher {
        let (events_tx, events_rx) = mpsc::channel(COMPLETION_CAPACITY);
        MemoryPublisher {
            broker: self.clone(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            closed: AtomicBool::new(false),
        }
    }

    /// A reader in `group`. With `auto_commit` every read also commits.
    pub fn reader(&self, group: impl Into<String>, auto_commit: bool) -> MemoryReader {
        MemoryReader {
            broker: self.clone(),
            group: group.into(),
            auto_commit,
            topics: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Reject the next `count` publishes with a transport error.
    pub fn fail_next_publishes(&self, count: u64) {
        self.inner.fail_next.store(count, Ordering::SeqCst);
    }

    /// Acknowledge the next `count` publishes without storing them.
    pub fn lose_next_publishes(&self, count: u64) {
        self.inner.lose_next.store(count, Ordering::SeqCst);
    }

    /// Number of records stored for `topic` across all partitions.
    pub fn len(&self, topic: &str) -> usize {
        self.inner
            .state
            .lock()
            .topics
            .get(topic)
            .map_or(0, |t| t.partitions.iter().map(Vec::len).sum())
    }

    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }

    /// Committed offset (next to read) for one partition, if the group exists.
    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        let state = self.inner.state.lock();
        let group = state.groups.get(&(group.to_string(), topic.to_string()))?;
        group.committed.get(usize::try_from(partition).ok()?).copied()
    }

    /// Move every position of `group` back to its committed offset.
    pub fn rewind_to_committed(&self, group: &str) {
        let mut state = self.inner.state.lock();
        for ((name, _), positions) in state.groups.iter_mut() {
            if name == group {
                positions.positions = positions.committed.clone();
            }
        }
    }

    fn append(&self, mut message: WireMessage) -> WireMessage {
        let lose = take_one(&self.inner.lose_next);
        let mut state = self.inner.state.lock();
        let partitions = self.inner.partitions;
        let topic = state
            .topics
            .entry(message.topic.clone())
            .or_insert_with(|| TopicState {
                partitions: vec![Vec::new(); partitions],
                next_partition: 0,
            });
        let partition = topic.next_partition;
        topic.next_partition = (partition + 1) % partitions;
        let log = &mut topic.partitions[partition];
        message.partition = Some(partition as i32);
        message.offset = Some(log.len() as i64);
        if lose {
            tracing::debug!(topic = %message.topic, "dropping publish (injected loss)");
        } else {
            log.push(message.clone());
        }
        drop(state);
        self.inner.appended.notify_waiters();
        message
    }

    fn join_group(&self, group: &str, topic: &str) {
        let partitions = self.inner.partitions;
        let mut state = self.inner.state.lock();
        state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicState {
                partitions: vec![Vec::new(); partitions],
                next_partition: 0,
            });
        state
            .groups
            .entry((group.to_string(), topic.to_string()))
            .or_insert_with(|| GroupState {
                positions: vec![0; partitions],
                committed: vec![0; partitions],
                next_partition: 0,
            });
    }

    fn try_take(&self, group: &str, topics: &[String], commit: bool) -> Option<WireMessage> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        for topic in topics {
            let (Some(log), Some(cursor)) = (
                state.topics.get(topic),
                state.groups.get_mut(&(group.to_string(), topic.clone())),
            ) else {
                continue;
            };
            let partitions = log.partitions.len();
            for step in 0..partitions {
                let partition = (cursor.next_partition + step) % partitions;
                let position = cursor.positions[partition];
                if let Some(message) = log.partitions[partition].get(position as usize) {
                    cursor.positions[partition] = position + 1;
                    if commit {
                        cursor.committed[partition] = position + 1;
                    }
                    cursor.next_partition = (partition + 1) % partitions;
                    return Some(message.clone());
                }
            }
        }
        None
    }

    fn commit(&self, group: &str, message: &WireMessage) -> Result<()> {
        let (Some(partition), Some(offset)) = (message.partition, message.offset) else {
            return Err(ClientError::Transport(
                "cannot commit a record without placement".to_string(),
            ));
        };
        let mut state = self.inner.state.lock();
        let cursor = state
            .groups
            .get_mut(&(group.to_string(), message.topic.clone()))
            .ok_or(ClientError::NotSubscribed)?;
        let slot = usize::try_from(partition)
            .ok()
            .and_then(|idx| cursor.committed.get_mut(idx))
            .ok_or_else(|| ClientError::Transport(format!("unknown partition {partition}")))?;
        *slot = (*slot).max(offset + 1);
        Ok(())
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn take_one(counter: &AtomicU64) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

pub struct MemoryPublisher {
    broker: InMemoryBroker,
    events_tx: mpsc::Sender<DeliveryEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<DeliveryEvent>>>,
    closed: AtomicBool,
}

impl MemoryPublisher {
    fn report(&self, event: DeliveryEvent) {
        // Nobody may be draining reports; dropping them is fine.
        let _ = self.events_tx.try_send(event);
    }
}

#[async_trait]
impl PublishClient for MemoryPublisher {
    async fn publish(&self, message: WireMessage) -> Result<WireMessage> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        if take_one(&self.broker.inner.fail_next) {
            let error = "injected publish failure".to_string();
            let mut failed = message;
            failed.error = Some(error.clone());
            self.report(DeliveryEvent::Failed {
                message: failed,
                error: error.clone(),
            });
            return Err(ClientError::Transport(error));
        }
        let delivered = self.broker.append(message);
        self.report(DeliveryEvent::Delivered(delivered.clone()));
        Ok(delivered)
    }

    async fn flush(&self, _timeout: Duration) -> usize {
        0
    }

    fn take_completion_events(&self) -> Option<mpsc::Receiver<DeliveryEvent>> {
        self.events_rx.lock().take()
    }

    fn pending_queue_length(&self) -> usize {
        0
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

pub struct MemoryReader {
    broker: InMemoryBroker,
    group: String,
    auto_commit: bool,
    topics: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl MemoryReader {
    pub fn group(&self) -> &str {
        &self.group
    }
}

#[async_trait]
impl ReadClient for MemoryReader {
    async fn subscribe(&self, topics: &[String]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        for topic in topics {
            self.broker.join_group(&self.group, topic);
        }
        let mut subscribed = self.topics.lock();
        subscribed.clear();
        subscribed.extend(topics.iter().cloned());
        Ok(())
    }

    async fn read(&self, timeout: Duration) -> Result<WireMessage> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(ClientError::Closed);
            }
            let topics = self.topics.lock().clone();
            if topics.is_empty() {
                return Err(ClientError::NotSubscribed);
            }
            // Register interest before checking so an append in between is not missed.
            let appended = self.broker.inner.appended.notified();
            if let Some(message) = self.broker.try_take(&self.group, &topics, self.auto_commit) {
                return Ok(message);
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Err(ClientError::TimedOut);
            }
        }
    }

    async fn commit(&self, message: &WireMessage) -> Result<()> {
        self.broker.commit(&self.group, message)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
