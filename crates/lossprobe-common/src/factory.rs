// Message factory: sequenced, uniquely identified, timestamped messages.
use crate::Message;
use bytes::Bytes;
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use uuid::Uuid;

// Synthetic payloads are split into this many tab-separated paragraphs.
const PARAGRAPHS: usize = 10;
pub const DEFAULT_PAYLOAD_BYTES: usize = 1024;

/// Creates messages for the producer engine.
///
/// Safe to share across workers: the sequence is a single atomic counter and
/// ids come from the thread-local RNG, so no lock is held while generating.
///
/// ```
/// use lossprobe_common::MessageFactory;
///
/// let factory = MessageFactory::with_payload_bytes(64);
/// let first = factory.next();
/// let second = factory.next();
/// assert_eq!(first.sequence(), 1);
/// assert!(second.sequence() > first.sequence());
/// assert_ne!(first.id(), second.id());
/// ```
#[derive(Debug)]
pub struct MessageFactory {
    sequence: AtomicU64,
    payload_bytes: usize,
}

impl MessageFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payload_bytes(payload_bytes: usize) -> Self {
        Self {
            sequence: AtomicU64::new(0),
            payload_bytes,
        }
    }

    pub fn payload_bytes(&self) -> usize {
        self.payload_bytes
    }

    /// Build the next message with a synthetic payload.
    pub fn next(&self) -> Message {
        self.wrap(synthetic_payload(self.payload_bytes), SystemTime::now())
    }

    /// Wrap an externally supplied payload, keeping the caller's timestamp.
    pub fn wrap(&self, payload: Bytes, created_time: SystemTime) -> Message {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        Message::from_parts(sequence, Uuid::new_v4().to_string(), created_time, payload)
    }

    /// Sequence of the most recently created message (0 before the first).
    pub fn last_sequence(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }
}

impl Default for MessageFactory {
    fn default() -> Self {
        Self::with_payload_bytes(DEFAULT_PAYLOAD_BYTES)
    }
}

fn synthetic_payload(len: usize) -> Bytes {
    let mut rng = rand::thread_rng();
    let mut buf: Vec<u8> = (&mut rng).sample_iter(Alphanumeric).take(len).collect();
    if len >= PARAGRAPHS * 2 {
        let stride = len / PARAGRAPHS;
        for idx in 1..PARAGRAPHS {
            buf[idx * stride] = b'\t';
        }
    }
    Bytes::from(buf)
}
