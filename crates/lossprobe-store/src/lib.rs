//! Delivery tracking: remembers what was sent and what came back.
//!
//! Every produced message is *tracked* and every consumed message is
//! *acknowledged* under an identity key computed by a [`TraceId`] projection.
//! The difference between the two sets is the list of messages that never
//! made it through the broker.
//!
//! Three backends implement [`TrackingStore`]:
//! - [`LocalStore`]: in-process map behind a mutex.
//! - [`RemoteStore`]: two named sets in a shared set-store (Redis in
//!   production), which survives restarts and can be shared by several runs.
//! - [`DisabledStore`]: accepts everything and reports nothing; used when
//!   the run is unbounded and "everything acknowledged" cannot be evaluated.
//!
//! Backend choice happens once, at startup, through [`StoreBackend::select`]
//! and [`connect`].
use async_trait::async_trait;
use lossprobe_common::Trace;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use thiserror::Error;

pub mod config;
pub mod disabled;
pub mod local;
pub mod remote;

pub use config::{StoreBackend, connect};
pub use disabled::DisabledStore;
pub use local::LocalStore;
pub use remote::{MemorySets, RedisSets, RemoteStore, SetBackend};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("remote store error: {0}")]
    Remote(#[from] redis::RedisError),
    #[error("remote store unreachable at {addr}: {reason}")]
    Unreachable { addr: String, reason: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Projection from a trace to the key used to correlate send and receive.
pub type TraceId = Arc<dyn Fn(&Trace) -> String + Send + Sync>;

/// Identity by message id; the normal choice.
pub fn by_message_id() -> TraceId {
    Arc::new(|trace: &Trace| trace.message.id().to_string())
}

/// Identity by payload content, for codecs that do not carry an id on the wire.
pub fn by_payload_digest() -> TraceId {
    Arc::new(|trace: &Trace| {
        let mut hasher = DefaultHasher::new();
        trace.message.payload().hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    })
}

/// Counters reported at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackResult {
    pub tracked: u64,
    pub acknowledged: u64,
}

impl TrackResult {
    pub fn lost(&self) -> u64 {
        self.tracked.saturating_sub(self.acknowledged)
    }
}

#[async_trait]
pub trait TrackingStore: Send + Sync {
    /// Record a message as sent.
    async fn track(&self, trace: &Trace) -> StoreResult<()>;
    /// Record a message as received. Repeats are harmless.
    async fn acknowledge(&self, trace: &Trace) -> StoreResult<()>;
    /// Identity keys tracked but not yet acknowledged, computed at call time.
    async fn unacknowledged(&self) -> StoreResult<Vec<String>>;
    async fn result(&self) -> StoreResult<TrackResult>;
    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
    fn backend_name(&self) -> &'static str;
}
