//! Tracking store backed by two named sets in a shared set-store.
//!
//! Keys are `{namespace}:published:ids` and `{namespace}:acked:ids`. Both
//! track and acknowledge are set-adds, so repeating either is harmless; the
//! unacknowledged list is a set difference evaluated by the store itself.
//! State lives in the set-store, so it outlives the process and several
//! harness instances may share one namespace.
//!
//! # Failure handling
//! - Construction pings the store under a timeout and fails if it cannot.
//! - Per-operation errors are returned to the caller, which logs them and
//!   keeps traffic flowing.
use crate::{StoreError, StoreResult, TraceId, TrackResult, TrackingStore};
use async_trait::async_trait;
use lossprobe_common::Trace;
use parking_lot::Mutex;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// The handful of set operations the remote store needs.
#[async_trait]
pub trait SetBackend: Send + Sync {
    async fn add(&self, key: &str, member: &str) -> StoreResult<()>;
    async fn difference(&self, key: &str, minus: &str) -> StoreResult<Vec<String>>;
    async fn cardinality(&self, key: &str) -> StoreResult<u64>;
    async fn ping(&self) -> StoreResult<()>;
}

/// Redis-backed sets over a multiplexed connection.
#[derive(Clone)]
pub struct RedisSets {
    conn: MultiplexedConnection,
}

impl RedisSets {
    /// Open a connection. `addr` may be a bare `host:port` or a full URL.
    pub async fn open(addr: &str) -> StoreResult<Self> {
        let url = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("redis://{addr}")
        };
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl SetBackend for RedisSets {
    async fn add(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.sadd(key, member).await?;
        Ok(())
    }

    async fn difference(&self, key: &str, minus: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.sdiff(vec![key, minus]).await?;
        Ok(members)
    }

    async fn cardinality(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let count: u64 = conn.scard(key).await?;
        Ok(count)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// In-process sets with the same semantics as [`RedisSets`].
///
/// Clones share state, which stands in for several processes talking to one
/// server.
#[derive(Clone, Default)]
pub struct MemorySets {
    sets: Arc<Mutex<HashMap<String, HashSet<String>>>>,
}

impl MemorySets {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SetBackend for MemorySets {
    async fn add(&self, key: &str, member: &str) -> StoreResult<()> {
        self.sets
            .lock()
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn difference(&self, key: &str, minus: &str) -> StoreResult<Vec<String>> {
        let sets = self.sets.lock();
        let Some(base) = sets.get(key) else {
            return Ok(Vec::new());
        };
        let empty = HashSet::new();
        let minus = sets.get(minus).unwrap_or(&empty);
        Ok(base.difference(minus).cloned().collect())
    }

    async fn cardinality(&self, key: &str) -> StoreResult<u64> {
        Ok(self.sets.lock().get(key).map_or(0, |set| set.len() as u64))
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

pub struct RemoteStore {
    backend: Arc<dyn SetBackend>,
    trace_id: TraceId,
    published_key: String,
    acked_key: String,
}

impl RemoteStore {
    /// Connect to Redis at `addr` and verify it answers before returning.
    pub async fn connect(
        addr: &str,
        namespace: &str,
        trace_id: TraceId,
        timeout: Duration,
    ) -> StoreResult<Self> {
        let unreachable = |reason: String| StoreError::Unreachable {
            addr: addr.to_string(),
            reason,
        };
        let backend = tokio::time::timeout(timeout, RedisSets::open(addr))
            .await
            .map_err(|_| unreachable(format!("connect timed out after {timeout:?}")))?
            .map_err(|err| unreachable(err.to_string()))?;
        Self::with_backend(Arc::new(backend), namespace, trace_id, timeout).await
    }

    /// Build on an existing backend; still pings it first.
    pub async fn with_backend(
        backend: Arc<dyn SetBackend>,
        namespace: &str,
        trace_id: TraceId,
        timeout: Duration,
    ) -> StoreResult<Self> {
        let store = Self {
            backend,
            trace_id,
            published_key: format!("{namespace}:published:ids"),
            acked_key: format!("{namespace}:acked:ids"),
        };
        tokio::time::timeout(timeout, store.health_check())
            .await
            .map_err(|_| StoreError::Unreachable {
                addr: namespace.to_string(),
                reason: format!("ping timed out after {timeout:?}"),
            })??;
        Ok(store)
    }

    pub fn published_key(&self) -> &str {
        &self.published_key
    }

    pub fn acked_key(&self) -> &str {
        &self.acked_key
    }
}

#[async_trait]
impl TrackingStore for RemoteStore {
    async fn track(&self, trace: &Trace) -> StoreResult<()> {
        let key = (self.trace_id)(trace);
        self.backend.add(&self.published_key, &key).await
    }

    async fn acknowledge(&self, trace: &Trace) -> StoreResult<()> {
        let key = (self.trace_id)(trace);
        self.backend.add(&self.acked_key, &key).await
    }

    async fn unacknowledged(&self) -> StoreResult<Vec<String>> {
        self.backend
            .difference(&self.published_key, &self.acked_key)
            .await
    }

    // The acked set may hold members that were never published in this
    // namespace, so only acks that match a published id are counted.
    async fn result(&self) -> StoreResult<TrackResult> {
        let tracked = self.backend.cardinality(&self.published_key).await?;
        let pending = self.unacknowledged().await?.len() as u64;
        let acknowledged = tracked.saturating_sub(pending);
        Ok(TrackResult {
            tracked,
            acknowledged,
        })
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.backend.ping().await
    }

    fn backend_name(&self) -> &'static str {
        "remote"
    }
}
