// End-of-run report.
use crate::LatencySketch;
use lossprobe_store::TrackingStore;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_UNACKNOWLEDGED_SAMPLE: usize = 10;

/// Collects what the final report needs: the tracking store handle, the
/// latency sketch and the run start time.
pub struct Reporter {
    store: Arc<dyn TrackingStore>,
    latency: Mutex<LatencySketch>,
    started: Instant,
    unacknowledged_sample: usize,
}

impl Reporter {
    pub fn new(store: Arc<dyn TrackingStore>, top_n: usize) -> Self {
        Self {
            store,
            latency: Mutex::new(LatencySketch::new(top_n)),
            started: Instant::now(),
            unacknowledged_sample: DEFAULT_UNACKNOWLEDGED_SAMPLE,
        }
    }

    pub fn with_unacknowledged_sample(mut self, count: usize) -> Self {
        self.unacknowledged_sample = count;
        self
    }

    pub fn store(&self) -> &Arc<dyn TrackingStore> {
        &self.store
    }

    /// Record an end-to-end latency, truncated to whole milliseconds.
    pub fn record_latency(&self, latency: Duration) {
        let millis = u32::try_from(latency.as_millis()).unwrap_or(u32::MAX);
        self.latency.lock().push(millis);
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Build the report. Store failures are logged and leave counts at zero.
    ///
    /// The unacknowledged list is always read, and `lost` is never reported
    /// below its length even if the store's counters disagree.
    pub async fn report(&self) -> Report {
        let mut report = Report {
            run_duration: self.elapsed(),
            ..Default::default()
        };
        {
            let latency = self.latency.lock();
            report.min_latency_ms = latency.min();
            report.max_latency_ms = latency.max();
            report.top_latencies_ms = latency.values().iter().rev().copied().collect();
        }
        match self.store.result().await {
            Ok(result) => {
                report.tracked = result.tracked;
                report.acknowledged = result.acknowledged;
                report.lost = result.lost();
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to read tracking result");
                report.store_error = Some(err.to_string());
            }
        }
        match self.store.unacknowledged().await {
            Ok(mut ids) => {
                ids.sort();
                report.unacknowledged_total = ids.len();
                report.lost = report.lost.max(ids.len() as u64);
                ids.truncate(self.unacknowledged_sample);
                report.unacknowledged_sample = ids;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to list unacknowledged messages");
            }
        }
        report
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    pub tracked: u64,
    pub acknowledged: u64,
    pub lost: u64,
    pub min_latency_ms: Option<u32>,
    pub max_latency_ms: Option<u32>,
    /// Largest retained latencies, descending.
    pub top_latencies_ms: Vec<u32>,
    pub run_duration: Duration,
    pub unacknowledged_total: usize,
    pub unacknowledged_sample: Vec<String>,
    pub store_error: Option<String>,
}

fn millis(value: Option<u32>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v}ms"))
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Report:")?;
        writeln!(f, "  Messages")?;
        writeln!(f, "    Sent: {}", self.tracked)?;
        writeln!(f, "    Received: {}", self.acknowledged)?;
        writeln!(f, "    Lost: {}", self.lost)?;
        writeln!(f, "  Time")?;
        writeln!(f, "    Min consumption: {}", millis(self.min_latency_ms))?;
        writeln!(f, "    Max consumption: {}", millis(self.max_latency_ms))?;
        if !self.top_latencies_ms.is_empty() {
            let top: Vec<String> = self
                .top_latencies_ms
                .iter()
                .map(|v| format!("{v}ms"))
                .collect();
            writeln!(f, "    Slowest: {}", top.join(", "))?;
        }
        writeln!(f, "    Run: {:.3}s", self.run_duration.as_secs_f64())?;
        if !self.unacknowledged_sample.is_empty() {
            writeln!(
                f,
                "  Unacknowledged ({} of {})",
                self.unacknowledged_sample.len(),
                self.unacknowledged_total
            )?;
            for id in &self.unacknowledged_sample {
                writeln!(f, "    {id}")?;
            }
        }
        if let Some(err) = &self.store_error {
            writeln!(f, "  Tracking store error: {err}")?;
        }
        Ok(())
    }
}
