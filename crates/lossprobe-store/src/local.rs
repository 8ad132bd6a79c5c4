// In-process tracking store.
use crate::{StoreResult, TraceId, TrackResult, TrackingStore, by_message_id};
use async_trait::async_trait;
use lossprobe_common::Trace;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
struct State {
    pending: HashMap<String, Trace>,
    // Acknowledged keys; the flag records whether a track was seen. Keys
    // acknowledged before any track are held here and only counted once the
    // track arrives.
    settled: HashMap<String, bool>,
    tracked: u64,
    acknowledged: u64,
}

/// Map-backed store for single-process runs.
///
/// Acknowledgements may race ahead of the matching track (the consumer can
/// observe a record before the producer's callbacks finish). Such keys are
/// settled on arrival but not counted; the late track counts both sides.
/// Keys that are never tracked (stale records from an earlier run) therefore
/// never inflate `acknowledged`, and at rest
/// `tracked - acknowledged == unacknowledged().len()`.
pub struct LocalStore {
    trace_id: TraceId,
    state: Mutex<State>,
}

impl LocalStore {
    pub fn new(trace_id: TraceId) -> Self {
        Self {
            trace_id,
            state: Mutex::new(State::default()),
        }
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new(by_message_id())
    }
}

#[async_trait]
impl TrackingStore for LocalStore {
    async fn track(&self, trace: &Trace) -> StoreResult<()> {
        let key = (self.trace_id)(trace);
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.pending.contains_key(&key) {
            return Ok(());
        }
        match state.settled.get_mut(&key) {
            Some(seen) if *seen => {}
            Some(seen) => {
                *seen = true;
                state.tracked += 1;
                state.acknowledged += 1;
            }
            None => {
                state.pending.insert(key, trace.clone());
                state.tracked += 1;
            }
        }
        Ok(())
    }

    async fn acknowledge(&self, trace: &Trace) -> StoreResult<()> {
        let key = (self.trace_id)(trace);
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.pending.remove(&key).is_some() {
            state.settled.insert(key, true);
            state.acknowledged += 1;
        } else {
            state.settled.entry(key).or_insert(false);
        }
        Ok(())
    }

    async fn unacknowledged(&self) -> StoreResult<Vec<String>> {
        Ok(self.state.lock().pending.keys().cloned().collect())
    }

    async fn result(&self) -> StoreResult<TrackResult> {
        let state = self.state.lock();
        Ok(TrackResult {
            tracked: state.tracked,
            acknowledged: state.acknowledged,
        })
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}
