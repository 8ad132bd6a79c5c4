// Metric emission context. Built once per run and handed to engines and callbacks.
use lossprobe_client::{ClientStats, StatsSink, stats::Window};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Telemetry {
    topic: String,
}

impl Telemetry {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn message_sent(&self) {
        metrics::counter!("lossprobe_messages_sent_total", "topic" => self.topic.clone())
            .increment(1);
    }

    pub fn message_acknowledged(&self) {
        metrics::counter!("lossprobe_messages_acknowledged_total", "topic" => self.topic.clone())
            .increment(1);
    }

    pub fn publish_failed(&self) {
        metrics::counter!("lossprobe_publish_failures_total", "topic" => self.topic.clone())
            .increment(1);
    }

    pub fn delivery_failed(&self) {
        metrics::counter!("lossprobe_delivery_failures_total", "topic" => self.topic.clone())
            .increment(1);
    }

    pub fn decode_failed(&self, stage: &'static str) {
        metrics::counter!(
            "lossprobe_decode_failures_total",
            "topic" => self.topic.clone(),
            "stage" => stage
        )
        .increment(1);
    }

    pub fn tracking_failed(&self, op: &'static str) {
        metrics::counter!(
            "lossprobe_tracking_failures_total",
            "topic" => self.topic.clone(),
            "op" => op
        )
        .increment(1);
    }

    pub fn produce_latency(&self, latency: Duration) {
        metrics::histogram!("lossprobe_produce_latency_ms", "topic" => self.topic.clone())
            .record(latency.as_secs_f64() * 1000.0);
    }

    pub fn consume_latency(&self, latency: Duration) {
        metrics::histogram!("lossprobe_consume_latency_ms", "topic" => self.topic.clone())
            .record(latency.as_secs_f64() * 1000.0);
    }

    pub fn queue_depth(&self, depth: usize) {
        metrics::gauge!("lossprobe_producer_queue_depth", "topic" => self.topic.clone())
            .set(depth as f64);
    }

    pub fn workers(&self, role: &'static str, count: usize) {
        metrics::gauge!(
            "lossprobe_workers",
            "topic" => self.topic.clone(),
            "role" => role
        )
        .set(count as f64);
    }
}

fn window_gauges(
    name: &'static str,
    topic: &str,
    client: &str,
    broker: &str,
    window: Option<Window>,
) {
    let Some(window) = window else {
        return;
    };
    for (stat, value) in [("avg", window.avg), ("p99", window.p99)] {
        metrics::gauge!(
            name,
            "topic" => topic.to_string(),
            "client" => client.to_string(),
            "broker" => broker.to_string(),
            "stat" => stat
        )
        .set(value);
    }
}

// Client counters are running totals, so they are set absolutely.
impl StatsSink for Telemetry {
    fn record(&self, stats: &ClientStats) {
        let topic = self.topic.as_str();
        let client = stats.client.as_str();
        let totals = [
            ("lossprobe_client_tx_total", stats.tx),
            ("lossprobe_client_rx_total", stats.rx),
            ("lossprobe_client_txmsgs_total", stats.txmsgs),
            ("lossprobe_client_rxmsgs_total", stats.rxmsgs),
        ];
        for (name, value) in totals {
            metrics::counter!(name, "topic" => topic.to_string(), "client" => client.to_string())
                .absolute(value);
        }
        for (name, value) in [
            ("lossprobe_client_msg_cnt", stats.msg_cnt),
            ("lossprobe_client_msg_size", stats.msg_size),
        ] {
            metrics::gauge!(name, "topic" => topic.to_string(), "client" => client.to_string())
                .set(value);
        }

        for broker in &stats.brokers {
            let name = broker.name.as_str();
            for (metric, value) in [
                ("lossprobe_broker_tx_total", broker.tx),
                ("lossprobe_broker_rx_total", broker.rx),
            ] {
                metrics::counter!(
                    metric,
                    "topic" => topic.to_string(),
                    "client" => client.to_string(),
                    "broker" => name.to_string()
                )
                .absolute(value);
            }
            metrics::gauge!(
                "lossprobe_broker_outbuf_msg_cnt",
                "topic" => topic.to_string(),
                "client" => client.to_string(),
                "broker" => name.to_string()
            )
            .set(broker.outbuf_msg_cnt);
            let windows = [
                ("lossprobe_broker_int_latency_us", broker.int_latency),
                ("lossprobe_broker_outbuf_latency_us", broker.outbuf_latency),
                ("lossprobe_broker_rtt_us", broker.rtt),
                ("lossprobe_broker_throttle_ms", broker.throttle),
            ];
            for (metric, window) in windows {
                window_gauges(metric, topic, client, name, window);
            }
        }
    }
}
