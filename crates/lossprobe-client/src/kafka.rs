// Kafka adapter built on rdkafka's future producer and stream consumer.
use crate::stats::{BrokerStats, ClientStats, StatsSink, Window};
use crate::{ClientError, DeliveryEvent, PublishClient, ReadClient, Result, WireMessage};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rdkafka::ClientConfig;
use rdkafka::ClientContext;
use rdkafka::Offset;
use rdkafka::TopicPartitionList;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::statistics::{self, Statistics};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const COMPLETION_CAPACITY: usize = 4096;

/// TLS and protocol settings passed straight through to librdkafka.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KafkaSecurity {
    /// `plaintext`, `ssl`, `sasl_plaintext` or `sasl_ssl`.
    pub protocol: Option<String>,
    pub ca_location: Option<String>,
    pub certificate_location: Option<String>,
    pub key_location: Option<String>,
    pub key_password: Option<String>,
}

impl KafkaSecurity {
    fn apply(&self, config: &mut ClientConfig) {
        let settings = [
            ("security.protocol", &self.protocol),
            ("ssl.ca.location", &self.ca_location),
            ("ssl.certificate.location", &self.certificate_location),
            ("ssl.key.location", &self.key_location),
            ("ssl.key.password", &self.key_password),
        ];
        for (key, value) in settings {
            if let Some(value) = value {
                config.set(key, value);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub bootstrap_servers: String,
    pub group_id: String,
    pub auto_commit: bool,
    /// Upper bound for a single publish including broker retries.
    pub message_timeout: Duration,
    pub security: KafkaSecurity,
    /// librdkafka emits statistics at this interval when set.
    pub statistics_interval: Option<Duration>,
}

impl KafkaConfig {
    pub fn new(bootstrap_servers: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            group_id: group_id.into(),
            auto_commit: true,
            message_timeout: Duration::from_secs(5),
            security: KafkaSecurity::default(),
            statistics_interval: None,
        }
    }

    fn base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        self.security.apply(&mut config);
        if let Some(interval) = self.statistics_interval {
            config.set(
                "statistics.interval.ms",
                interval.as_millis().max(1).to_string(),
            );
        }
        config
    }

    fn producer_config(&self) -> ClientConfig {
        let mut config = self.base_config();
        config.set(
            "message.timeout.ms",
            self.message_timeout.as_millis().to_string(),
        );
        config
    }

    fn consumer_config(&self) -> ClientConfig {
        let mut config = self.base_config();
        config
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", self.auto_commit.to_string())
            .set("auto.offset.reset", "earliest");
        config
    }
}

/// Client context that forwards librdkafka statistics to a sink.
#[derive(Clone, Default)]
pub struct StatsContext {
    sink: Option<Arc<dyn StatsSink>>,
}

impl StatsContext {
    pub fn new(sink: Option<Arc<dyn StatsSink>>) -> Self {
        Self { sink }
    }
}

impl ClientContext for StatsContext {
    fn stats(&self, statistics: Statistics) {
        if let Some(sink) = &self.sink {
            sink.record(&client_stats(&statistics));
        }
    }
}

impl ConsumerContext for StatsContext {}

fn window(window: &Option<statistics::Window>) -> Option<Window> {
    window.as_ref().map(|w| Window {
        avg: w.avg as f64,
        p99: w.p99 as f64,
    })
}

fn client_stats(stats: &Statistics) -> ClientStats {
    let mut brokers: Vec<BrokerStats> = stats
        .brokers
        .iter()
        .map(|(name, broker)| BrokerStats {
            name: name.clone(),
            tx: broker.tx as u64,
            rx: broker.rx as u64,
            outbuf_msg_cnt: broker.outbuf_msg_cnt as f64,
            int_latency: window(&broker.int_latency),
            outbuf_latency: window(&broker.outbuf_latency),
            rtt: window(&broker.rtt),
            throttle: window(&broker.throttle),
        })
        .collect();
    brokers.sort_by(|a, b| a.name.cmp(&b.name));
    ClientStats {
        client: stats.name.clone(),
        tx: stats.tx as u64,
        rx: stats.rx as u64,
        txmsgs: stats.txmsgs as u64,
        rxmsgs: stats.rxmsgs as u64,
        msg_cnt: stats.msg_cnt as f64,
        msg_size: stats.msg_size as f64,
        brokers,
    }
}

pub struct KafkaPublisher {
    producer: FutureProducer<StatsContext>,
    message_timeout: Duration,
    events_tx: mpsc::Sender<DeliveryEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<DeliveryEvent>>>,
}

impl KafkaPublisher {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        Self::with_stats(config, None)
    }

    /// Statistics only flow when `config.statistics_interval` is set.
    pub fn with_stats(config: &KafkaConfig, sink: Option<Arc<dyn StatsSink>>) -> Result<Self> {
        let producer: FutureProducer<StatsContext> = config
            .producer_config()
            .create_with_context(StatsContext::new(sink))?;
        let (events_tx, events_rx) = mpsc::channel(COMPLETION_CAPACITY);
        Ok(Self {
            producer,
            message_timeout: config.message_timeout,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }
}

#[async_trait]
impl PublishClient for KafkaPublisher {
    async fn publish(&self, message: WireMessage) -> Result<WireMessage> {
        let mut record = FutureRecord::<[u8], [u8]>::to(&message.topic).payload(&message.payload);
        if let Some(key) = &message.key {
            record = record.key(key.as_ref());
        }
        let outcome = self
            .producer
            .send(record, Timeout::After(self.message_timeout))
            .await;
        match outcome {
            Ok((partition, offset)) => {
                let mut delivered = message;
                delivered.partition = Some(partition);
                delivered.offset = Some(offset);
                let _ = self
                    .events_tx
                    .try_send(DeliveryEvent::Delivered(delivered.clone()));
                Ok(delivered)
            }
            Err((err, _)) => {
                let mut failed = message;
                failed.error = Some(err.to_string());
                let _ = self.events_tx.try_send(DeliveryEvent::Failed {
                    message: failed,
                    error: err.to_string(),
                });
                Err(err.into())
            }
        }
    }

    async fn flush(&self, timeout: Duration) -> usize {
        let producer = self.producer.clone();
        let flushed =
            tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout))).await;
        match flushed {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(error = %err, "kafka flush incomplete"),
            Err(err) => tracing::warn!(error = %err, "kafka flush task failed"),
        }
        self.pending_queue_length()
    }

    fn take_completion_events(&self) -> Option<mpsc::Receiver<DeliveryEvent>> {
        self.events_rx.lock().take()
    }

    fn pending_queue_length(&self) -> usize {
        usize::try_from(self.producer.in_flight_count()).unwrap_or(0)
    }

    async fn close(&self) {
        let remaining = self.flush(Duration::ZERO).await;
        if remaining > 0 {
            tracing::warn!(remaining, "closing kafka producer with records in flight");
        }
    }
}

pub struct KafkaReader {
    consumer: Arc<StreamConsumer<StatsContext>>,
}

impl KafkaReader {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        Self::with_stats(config, None)
    }

    pub fn with_stats(config: &KafkaConfig, sink: Option<Arc<dyn StatsSink>>) -> Result<Self> {
        let consumer: StreamConsumer<StatsContext> = config
            .consumer_config()
            .create_with_context(StatsContext::new(sink))?;
        Ok(Self {
            consumer: Arc::new(consumer),
        })
    }
}

#[async_trait]
impl ReadClient for KafkaReader {
    async fn subscribe(&self, topics: &[String]) -> Result<()> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topics)?;
        Ok(())
    }

    async fn read(&self, timeout: Duration) -> Result<WireMessage> {
        let received = tokio::time::timeout(timeout, self.consumer.recv())
            .await
            .map_err(|_| ClientError::TimedOut)??;
        Ok(WireMessage {
            topic: received.topic().to_string(),
            partition: Some(received.partition()),
            offset: Some(received.offset()),
            key: received.key().map(Bytes::copy_from_slice),
            payload: received
                .payload()
                .map(Bytes::copy_from_slice)
                .unwrap_or_default(),
            error: None,
        })
    }

    async fn commit(&self, message: &WireMessage) -> Result<()> {
        let (Some(partition), Some(offset)) = (message.partition, message.offset) else {
            return Err(ClientError::Transport(
                "cannot commit a record without placement".to_string(),
            ));
        };
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(&message.topic, partition, Offset::Offset(offset + 1))?;
        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || consumer.commit(&offsets, CommitMode::Sync))
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))??;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.consumer.unsubscribe();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> KafkaConfig {
        let mut config = KafkaConfig::new("kafka-1:9092", "lossprobe");
        config.auto_commit = false;
        config.message_timeout = Duration::from_millis(1500);
        config
    }

    #[test]
    fn plain_config_sets_no_security_or_statistics() {
        let producer = config().producer_config();
        assert_eq!(producer.get("bootstrap.servers"), Some("kafka-1:9092"));
        assert_eq!(producer.get("message.timeout.ms"), Some("1500"));
        assert_eq!(producer.get("security.protocol"), None);
        assert_eq!(producer.get("statistics.interval.ms"), None);

        let consumer = config().consumer_config();
        assert_eq!(consumer.get("group.id"), Some("lossprobe"));
        assert_eq!(consumer.get("enable.auto.commit"), Some("false"));
        assert_eq!(consumer.get("auto.offset.reset"), Some("earliest"));
    }

    #[test]
    fn security_and_statistics_reach_both_clients() {
        let mut config = config();
        config.security = KafkaSecurity {
            protocol: Some("ssl".to_string()),
            ca_location: Some("ca.crt".to_string()),
            certificate_location: Some("cert.crt".to_string()),
            key_location: Some("client.key".to_string()),
            key_password: None,
        };
        config.statistics_interval = Some(Duration::from_secs(5));
        for client in [config.producer_config(), config.consumer_config()] {
            assert_eq!(client.get("security.protocol"), Some("ssl"));
            assert_eq!(client.get("ssl.ca.location"), Some("ca.crt"));
            assert_eq!(client.get("ssl.certificate.location"), Some("cert.crt"));
            assert_eq!(client.get("ssl.key.location"), Some("client.key"));
            assert_eq!(client.get("ssl.key.password"), None);
            assert_eq!(client.get("statistics.interval.ms"), Some("5000"));
        }
    }
}
