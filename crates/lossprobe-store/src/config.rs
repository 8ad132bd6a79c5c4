// Backend selection, decided once at startup.
use crate::remote::DEFAULT_CONNECT_TIMEOUT;
use crate::{DisabledStore, LocalStore, RemoteStore, StoreResult, TraceId, TrackingStore};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Disabled,
    Local,
    Remote {
        addr: String,
        namespace: String,
        connect_timeout: Duration,
    },
}

impl StoreBackend {
    /// Unbounded runs get no tracking; a configured address means remote.
    pub fn select(total_messages: Option<u64>, remote_addr: Option<&str>, namespace: &str) -> Self {
        if total_messages.is_none() {
            return Self::Disabled;
        }
        match remote_addr.map(str::trim).filter(|addr| !addr.is_empty()) {
            Some(addr) => Self::Remote {
                addr: addr.to_string(),
                namespace: namespace.to_string(),
                connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            },
            None => Self::Local,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Local => "local",
            Self::Remote { .. } => "remote",
        }
    }
}

/// Build the selected store. Remote construction fails if the server does not answer.
pub async fn connect(
    backend: &StoreBackend,
    trace_id: TraceId,
) -> StoreResult<Arc<dyn TrackingStore>> {
    let store: Arc<dyn TrackingStore> = match backend {
        StoreBackend::Disabled => Arc::new(DisabledStore),
        StoreBackend::Local => Arc::new(LocalStore::new(trace_id)),
        StoreBackend::Remote {
            addr,
            namespace,
            connect_timeout,
        } => Arc::new(RemoteStore::connect(addr, namespace, trace_id, *connect_timeout).await?),
    };
    tracing::info!(backend = store.backend_name(), "tracking store ready");
    Ok(store)
}
