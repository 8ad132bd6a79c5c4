// Broker client seams used by the engines.
// The engines only ever see these traits; the in-process broker backs tests
// and self-checks, and the Kafka adapter (feature `kafka`) backs real runs.
use async_trait::async_trait;
use bytes::Bytes;
use lossprobe_common::PartitionInfo;
use std::time::Duration;
use tokio::sync::mpsc;

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod stats;

#[cfg(feature = "kafka")]
pub use kafka::{KafkaConfig, KafkaPublisher, KafkaReader, KafkaSecurity};
pub use memory::{InMemoryBroker, MemoryPublisher, MemoryReader};
pub use stats::{BrokerStats, ClientStats, StatsSink};

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("timed out")]
    TimedOut,
    #[error("client closed")]
    Closed,
    #[error("not subscribed to any topic")]
    NotSubscribed,
    #[error("transport error: {0}")]
    Transport(String),
    #[cfg(feature = "kafka")]
    #[error(transparent)]
    Kafka(#[from] rdkafka::error::KafkaError),
}

impl ClientError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut)
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// A record as it crosses the broker boundary.
///
/// `partition` and `offset` are unset until the broker assigns them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub topic: String,
    pub partition: Option<i32>,
    pub offset: Option<i64>,
    pub key: Option<Bytes>,
    pub payload: Bytes,
    pub error: Option<String>,
}

impl WireMessage {
    pub fn new(topic: impl Into<String>, payload: Bytes) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            offset: None,
            key: None,
            payload,
            error: None,
        }
    }

    pub fn with_key(mut self, key: Bytes) -> Self {
        self.key = Some(key);
        self
    }

    pub fn partition_info(&self) -> PartitionInfo {
        PartitionInfo {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
            error: self.error.clone(),
        }
    }
}

/// Asynchronous delivery report from a publish client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    Delivered(WireMessage),
    Failed { message: WireMessage, error: String },
}

#[async_trait]
pub trait PublishClient: Send + Sync {
    /// Publish one record, returning it with broker-assigned placement.
    async fn publish(&self, message: WireMessage) -> Result<WireMessage>;
    /// Wait up to `timeout` for in-flight records; returns how many remain.
    async fn flush(&self, timeout: Duration) -> usize;
    /// Delivery reports. Only the first caller gets the receiver.
    fn take_completion_events(&self) -> Option<mpsc::Receiver<DeliveryEvent>>;
    fn pending_queue_length(&self) -> usize;
    async fn close(&self);
}

#[async_trait]
pub trait ReadClient: Send + Sync {
    async fn subscribe(&self, topics: &[String]) -> Result<()>;
    /// Next record, or [`ClientError::TimedOut`] when nothing arrived in time.
    async fn read(&self, timeout: Duration) -> Result<WireMessage>;
    /// Mark `message` and everything before it in its partition as consumed.
    async fn commit(&self, message: &WireMessage) -> Result<()>;
    async fn close(&self) -> Result<()>;
}
