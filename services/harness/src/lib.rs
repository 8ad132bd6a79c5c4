//! Runnable loss-detection harness.
//!
//! Loads [`config::HarnessConfig`], installs logging and metrics, builds an
//! [`app::Harness`] and prints the final report once the run ends.
pub mod app;
pub mod config;
pub mod observability;

use anyhow::Result;
use lossprobe_engine::Report;
use std::future::Future;

pub const SERVICE_NAME: &str = "lossprobe-harness";

/// Run one harness session, stopping early when `shutdown` resolves.
pub async fn run_with_shutdown<F>(config: config::HarnessConfig, shutdown: F) -> Result<Report>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability(SERVICE_NAME)?;
    let metrics_task = config
        .metrics_bind
        .map(|bind| tokio::spawn(observability::serve_metrics(metrics_handle, bind)));

    tracing::info!(
        broker = %config.broker,
        topic = %config.topic,
        run_id = %config.store.run_id,
        "running harness"
    );
    let result = match app::Harness::build(config).await {
        Ok(harness) => harness.run(shutdown).await,
        Err(err) => Err(err),
    };

    if let Some(task) = metrics_task {
        task.abort();
        let _ = task.await;
    }
    let report = result?;
    println!("{report}");
    Ok(report)
}
