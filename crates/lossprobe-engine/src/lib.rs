// Producer and consumer engines plus the callbacks and reporting around them.
use lossprobe_client::ClientError;
use std::fmt;

pub mod callback;
pub mod consumer;
pub mod delivery;
pub mod latency;
pub mod options;
pub mod producer;
pub mod report;
pub mod telemetry;

pub use callback::{
    Acker, Callback, LatencySampler, LogDisplay, PublishMetrics, Record, Tracker, from_fn,
};
pub use consumer::ConsumerEngine;
pub use delivery::{DeliveryHandler, DeliveryStats};
pub use latency::LatencySketch;
pub use options::{ConsumerOptions, ProducerOptions};
pub use producer::{ProducerEngine, ProducerSummary};
pub use report::{Report, Reporter};
pub use telemetry::Telemetry;

/// Engine lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Running,
    Draining,
    Closed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("cannot {op} while {state}")]
    InvalidState {
        op: &'static str,
        state: EngineState,
    },
    #[error("failed to create reader {index}: {source}")]
    Connect { index: usize, source: ClientError },
    #[error("reader {index} failed to subscribe to {topic}: {source}")]
    Subscribe {
        index: usize,
        topic: String,
        source: ClientError,
    },
}

pub type Result<T> = std::result::Result<T, EngineError>;
