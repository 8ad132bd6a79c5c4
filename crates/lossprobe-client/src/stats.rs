//! Periodic client statistics.
//!
//! Broker clients that can report their own internals (librdkafka does, on
//! `statistics.interval.ms`) convert them into a [`ClientStats`] snapshot and
//! hand it to a [`StatsSink`]. Counters are cumulative since client start.

/// Rolling latency window; librdkafka reports these in microseconds, except
/// throttle which is in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Window {
    pub avg: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BrokerStats {
    pub name: String,
    pub tx: u64,
    pub rx: u64,
    pub outbuf_msg_cnt: f64,
    pub int_latency: Option<Window>,
    pub outbuf_latency: Option<Window>,
    pub rtt: Option<Window>,
    pub throttle: Option<Window>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientStats {
    /// Client instance name, e.g. `rdkafka#producer-1`.
    pub client: String,
    pub tx: u64,
    pub rx: u64,
    pub txmsgs: u64,
    pub rxmsgs: u64,
    /// Messages currently queued in the client.
    pub msg_cnt: f64,
    pub msg_size: f64,
    pub brokers: Vec<BrokerStats>,
}

pub trait StatsSink: Send + Sync {
    fn record(&self, stats: &ClientStats);
}
