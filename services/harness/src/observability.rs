//! Logging and metrics setup for the harness binary.
//!
//! Logs go through a `tracing` fmt subscriber filtered by `RUST_LOG`
//! (default `info`). Metrics are recorded into a Prometheus recorder that is
//! installed once per process; the `/metrics`, `/live` and `/ready` endpoints
//! are only served when a bind address is configured.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the tracing subscriber and the metrics recorder.
pub fn init_observability(service_name: &str) -> Result<PrometheusHandle> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());
    init_subscriber(registry);
    tracing::debug!(service = service_name, "observability initialized");
    install_metrics_recorder()
}

/// Serves Prometheus metrics and health endpoints until the task is aborted.
pub async fn serve_metrics(handle: PrometheusHandle, addr: SocketAddr) -> std::io::Result<()> {
    let app = axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/live", axum::routing::get(|| async { "ok" }))
        .route("/ready", axum::routing::get(|| async { "ok" }));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "metrics listening");
    axum::serve(listener, app.into_make_service()).await
}

// A global recorder can only be installed once; later calls reuse it.
fn install_metrics_recorder() -> Result<PrometheusHandle> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("install metrics recorder")?;
    let _ = METRICS_HANDLE.set(handle.clone());
    Ok(handle)
}

fn init_subscriber<S>(subscriber: S)
where
    S: tracing::Subscriber + Send + Sync + 'static,
{
    #[cfg(test)]
    {
        let _ = subscriber.try_init();
    }
    #[cfg(not(test))]
    {
        subscriber.init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn recorder_is_installed_once() {
        init_observability("lossprobe-test").expect("first");
        init_observability("lossprobe-test").expect("second");
        assert!(METRICS_HANDLE.get().is_some());
    }

    #[tokio::test]
    #[serial]
    async fn serve_metrics_reports_bind_errors() {
        let handle = init_observability("lossprobe-test").expect("handle");
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = taken.local_addr().expect("addr");
        let err = serve_metrics(handle, addr).await.expect_err("port in use");
        assert_eq!(err.kind(), std::io::ErrorKind::AddrInUse);
    }
}
