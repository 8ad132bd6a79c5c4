// Message and trace types shared by the engines and the tracking store.
use bytes::Bytes;
use std::fmt;
use std::time::{Duration, SystemTime};

/// A generated test message.
///
/// Messages are immutable once built; the factory assigns `sequence`, `id`
/// and `created_time`, and decoders rebuild them with [`Message::from_parts`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    sequence: u64,
    id: String,
    created_time: SystemTime,
    payload: Bytes,
}

impl Message {
    pub fn from_parts(
        sequence: u64,
        id: impl Into<String>,
        created_time: SystemTime,
        payload: Bytes,
    ) -> Self {
        Self {
            sequence,
            id: id.into(),
            created_time,
            payload,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_time(&self) -> SystemTime {
        self.created_time
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Time elapsed since creation. Clock skew that puts `created_time` in
    /// the future yields zero.
    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.created_time)
            .unwrap_or(Duration::ZERO)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "message seq={} id={} payload_bytes={}",
            self.sequence,
            self.id,
            self.payload.len()
        )
    }
}

/// Broker-assigned placement of a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionInfo {
    pub topic: String,
    pub partition: Option<i32>,
    pub offset: Option<i64>,
    // Set when the broker reported a delivery problem after the fact.
    pub error: Option<String>,
}

impl fmt::Display for PartitionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.topic)?;
        match self.partition {
            Some(partition) => write!(f, "[{partition}]")?,
            None => write!(f, "[any]")?,
        }
        if let Some(offset) = self.offset {
            write!(f, "@{offset}")?;
        }
        if let Some(error) = &self.error {
            write!(f, " ({error})")?;
        }
        Ok(())
    }
}

/// A message paired with its placement; the unit of delivery tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trace {
    pub message: Message,
    pub partition: PartitionInfo,
}

impl Trace {
    pub fn new(message: Message, partition: PartitionInfo) -> Self {
        Self { message, partition }
    }
}
