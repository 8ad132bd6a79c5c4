// No-op store for unbounded runs.
use crate::{StoreResult, TrackResult, TrackingStore};
use async_trait::async_trait;
use lossprobe_common::Trace;

#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledStore;

#[async_trait]
impl TrackingStore for DisabledStore {
    async fn track(&self, _trace: &Trace) -> StoreResult<()> {
        Ok(())
    }

    async fn acknowledge(&self, _trace: &Trace) -> StoreResult<()> {
        Ok(())
    }

    async fn unacknowledged(&self) -> StoreResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn result(&self) -> StoreResult<TrackResult> {
        Ok(TrackResult::default())
    }

    fn backend_name(&self) -> &'static str {
        "disabled"
    }
}
