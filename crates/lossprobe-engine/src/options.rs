// Engine options.
use std::time::Duration;

pub const DEFAULT_QUEUE_DEPTH: usize = 1000;
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_POLL_YIELD: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct ProducerOptions {
    pub topic: String,
    /// Number of publishing workers.
    pub concurrency: usize,
    /// `None` generates until cancelled.
    pub total_messages: Option<u64>,
    /// Pause before each publish, per worker.
    pub worker_delay: Duration,
    pub flush_timeout: Duration,
    /// Capacity of the generator-to-worker queue.
    pub queue_depth: usize,
    /// How often to report queue depth; `None` disables the sampler.
    pub sample_interval: Option<Duration>,
}

impl ProducerOptions {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            concurrency: 1,
            total_messages: None,
            worker_delay: Duration::ZERO,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            sample_interval: Some(DEFAULT_SAMPLE_INTERVAL),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub topic: String,
    /// Number of reading clients, each with its own poll and drain task.
    pub concurrency: usize,
    pub poll_timeout: Duration,
    /// When false the engine commits each record right after reading it.
    pub auto_commit: bool,
    /// Capacity of each client's read-to-callback queue.
    pub queue_depth: usize,
    /// Pause between polls; zero yields to the scheduler instead.
    pub poll_yield: Duration,
}

impl ConsumerOptions {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            concurrency: 1,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            auto_commit: true,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            poll_yield: DEFAULT_POLL_YIELD,
        }
    }
}
