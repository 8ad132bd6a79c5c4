// Wires configuration into a running harness: store, broker clients, engines
// and callbacks, then drives one run to completion and produces the report.
use crate::config::{CodecKind, HarnessConfig, StoreKind};
use anyhow::{Context, Result};
use lossprobe_client::{InMemoryBroker, PublishClient, ReadClient};
use lossprobe_common::{BinaryCodec, Decoder, Encoder, MessageFactory, OpaqueCodec};
use lossprobe_engine::{
    Acker, ConsumerEngine, ConsumerOptions, LatencySampler, LogDisplay, ProducerEngine,
    ProducerOptions, PublishMetrics, Report, Reporter, Telemetry, Tracker,
};
use lossprobe_store::{StoreBackend, TraceId, by_message_id, by_payload_digest};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const COMPLETION_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Where records go.
#[derive(Clone)]
pub enum Broker {
    Memory(InMemoryBroker),
    #[cfg(feature = "kafka")]
    Kafka(String),
}

impl Broker {
    pub fn from_config(config: &HarnessConfig) -> Result<Self> {
        if config.uses_memory_broker() {
            return Ok(Self::Memory(InMemoryBroker::new()));
        }
        #[cfg(feature = "kafka")]
        {
            Ok(Self::Kafka(config.broker.clone()))
        }
        #[cfg(not(feature = "kafka"))]
        {
            anyhow::bail!(
                "broker {:?} needs the `kafka` feature; only `memory` is available",
                config.broker
            )
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            #[cfg(feature = "kafka")]
            Self::Kafka(_) => "kafka",
        }
    }

    #[cfg_attr(not(feature = "kafka"), allow(unused_variables))]
    fn publisher(
        &self,
        config: &HarnessConfig,
        telemetry: &Telemetry,
    ) -> Result<Arc<dyn PublishClient>> {
        match self {
            Self::Memory(broker) => Ok(Arc::new(broker.publisher())),
            #[cfg(feature = "kafka")]
            Self::Kafka(servers) => {
                let publisher = lossprobe_client::KafkaPublisher::with_stats(
                    &kafka_config(servers, config),
                    stats_sink(telemetry),
                )
                .context("create kafka producer")?;
                Ok(Arc::new(publisher))
            }
        }
    }

    #[cfg_attr(not(feature = "kafka"), allow(unused_variables))]
    fn reader(
        &self,
        config: &HarnessConfig,
        telemetry: &Telemetry,
    ) -> lossprobe_client::Result<Arc<dyn ReadClient>> {
        match self {
            Self::Memory(broker) => Ok(Arc::new(
                broker.reader(config.consumer.group_id.clone(), config.consumer.auto_commit),
            )),
            #[cfg(feature = "kafka")]
            Self::Kafka(servers) => Ok(Arc::new(lossprobe_client::KafkaReader::with_stats(
                &kafka_config(servers, config),
                stats_sink(telemetry),
            )?)),
        }
    }
}

#[cfg(feature = "kafka")]
fn stats_sink(telemetry: &Telemetry) -> Option<Arc<dyn lossprobe_client::StatsSink>> {
    Some(Arc::new(telemetry.clone()))
}

#[cfg(feature = "kafka")]
fn kafka_config(servers: &str, config: &HarnessConfig) -> lossprobe_client::KafkaConfig {
    let settings = &config.kafka;
    let mut kafka = lossprobe_client::KafkaConfig::new(servers, config.consumer.group_id.clone());
    kafka.auto_commit = config.consumer.auto_commit;
    kafka.message_timeout = Duration::from_millis(config.producer.flush_timeout_ms);
    kafka.security = lossprobe_client::KafkaSecurity {
        protocol: settings.effective_protocol(),
        ca_location: settings.ssl_ca_location.clone(),
        certificate_location: settings.ssl_certificate_location.clone(),
        key_location: settings.ssl_key_location.clone(),
        key_password: settings.ssl_key_password.clone(),
    };
    kafka.statistics_interval = settings.statistics_interval();
    kafka
}

/// Tracking is skipped entirely for unbounded runs or when disabled.
pub fn store_backend(config: &HarnessConfig) -> StoreBackend {
    let total = config.producer.total_messages;
    match config.store.kind {
        StoreKind::Disabled => StoreBackend::Disabled,
        StoreKind::Local => StoreBackend::select(total, None, &config.store.run_id),
        StoreKind::Redis => StoreBackend::select(
            total,
            config.store.redis_addr.as_deref(),
            &config.store.run_id,
        ),
    }
}

fn producer_options(config: &HarnessConfig) -> ProducerOptions {
    let mut options = ProducerOptions::new(config.topic.clone());
    options.concurrency = config.producer.concurrency;
    options.total_messages = config.producer.total_messages;
    options.worker_delay = Duration::from_millis(config.producer.worker_delay_ms);
    options.flush_timeout = Duration::from_millis(config.producer.flush_timeout_ms);
    options.queue_depth = config.producer.queue_depth;
    options
}

fn consumer_options(config: &HarnessConfig) -> ConsumerOptions {
    let mut options = ConsumerOptions::new(config.topic.clone());
    options.concurrency = config.consumer.concurrency;
    options.poll_timeout = Duration::from_millis(config.consumer.poll_timeout_ms);
    options.auto_commit = config.consumer.auto_commit;
    options.queue_depth = config.consumer.queue_depth;
    options
}

pub struct Harness {
    config: HarnessConfig,
    backend: StoreBackend,
    reporter: Arc<Reporter>,
    producer: Option<ProducerEngine>,
    consumer: Option<ConsumerEngine>,
}

impl Harness {
    pub async fn build(config: HarnessConfig) -> Result<Self> {
        let broker = Broker::from_config(&config)?;
        Self::with_broker(config, broker).await
    }

    /// Build against an existing broker. Fails if the tracking store cannot be
    /// reached or a consumer cannot subscribe.
    pub async fn with_broker(config: HarnessConfig, broker: Broker) -> Result<Self> {
        let telemetry = Telemetry::new(config.topic.clone());
        let factory = Arc::new(MessageFactory::with_payload_bytes(
            config.producer.payload_bytes,
        ));
        let (encoder, decoder, trace_id): (Arc<dyn Encoder>, Arc<dyn Decoder>, TraceId) =
            match config.codec {
                CodecKind::Binary => {
                    let codec = Arc::new(BinaryCodec);
                    let encoder: Arc<dyn Encoder> = codec.clone();
                    let decoder: Arc<dyn Decoder> = codec;
                    (encoder, decoder, by_message_id())
                }
                CodecKind::Opaque => {
                    // Opaque payloads carry no id, so identity is the payload itself.
                    let codec = Arc::new(OpaqueCodec::new(Arc::clone(&factory)));
                    let encoder: Arc<dyn Encoder> = codec.clone();
                    let decoder: Arc<dyn Decoder> = codec;
                    (encoder, decoder, by_payload_digest())
                }
            };

        let backend = store_backend(&config);
        let store = lossprobe_store::connect(&backend, trace_id)
            .await
            .with_context(|| format!("connect {} tracking store", backend.name()))?;
        let reporter = Arc::new(Reporter::new(Arc::clone(&store), config.latency_top_n));

        let producer = if config.producer.enabled {
            let mut producer = ProducerEngine::new(
                broker.publisher(&config, &telemetry)?,
                factory,
                Arc::clone(&encoder),
                producer_options(&config),
                telemetry.clone(),
            );
            producer.register(Tracker::new(
                Arc::clone(&store),
                Arc::clone(&decoder),
                telemetry.clone(),
            ));
            producer.register(PublishMetrics::new(Arc::clone(&decoder), telemetry.clone()));
            if config.is_development() {
                producer.register(LogDisplay::new(Arc::clone(&decoder), telemetry.clone()));
            }
            Some(producer)
        } else {
            None
        };

        let consumer = if config.consumer.enabled {
            let mut consumer =
                ConsumerEngine::open(consumer_options(&config), telemetry.clone(), |_| {
                    broker.reader(&config, &telemetry)
                })
                .await
                .context("open consumer")?;
            consumer.register(Acker::new(
                Arc::clone(&store),
                Arc::clone(&decoder),
                telemetry.clone(),
            ));
            consumer.register(LatencySampler::new(
                Arc::clone(&reporter),
                Arc::clone(&decoder),
                telemetry.clone(),
            ));
            if config.is_development() {
                consumer.register(LogDisplay::new(Arc::clone(&decoder), telemetry));
            }
            Some(consumer)
        } else {
            None
        };

        tracing::info!(
            broker = broker.name(),
            topic = %config.topic,
            store = backend.name(),
            producer = producer.is_some(),
            consumer = consumer.is_some(),
            "harness ready"
        );
        Ok(Self {
            config,
            backend,
            reporter,
            producer,
            consumer,
        })
    }

    pub fn reporter(&self) -> &Arc<Reporter> {
        &self.reporter
    }

    /// Run until `shutdown` resolves, the run duration elapses, or every
    /// tracked message has been acknowledged. Then tear down and report.
    pub async fn run<F>(self, shutdown: F) -> Result<Report>
    where
        F: Future<Output = ()>,
    {
        let cancel = CancellationToken::new();
        tokio::pin!(shutdown);

        if let Some(consumer) = &self.consumer {
            consumer.run(&cancel)?;
        }
        let mut reason = None;
        if !self.config.startup_delay().is_zero() {
            tokio::select! {
                _ = &mut shutdown => reason = Some("interrupted"),
                _ = tokio::time::sleep(self.config.startup_delay()) => {}
            }
        }
        let reason = match reason {
            Some(reason) => reason,
            None => {
                if let Some(producer) = &self.producer {
                    producer.run(&cancel)?;
                }
                tokio::select! {
                    _ = &mut shutdown => "interrupted",
                    _ = tokio::time::sleep(self.config.run_duration()) => "run duration elapsed",
                    _ = self.wait_for_completion() => "all messages acknowledged",
                }
            }
        };
        tracing::info!(reason, "stopping harness");
        cancel.cancel();

        if let Some(producer) = &self.producer {
            let summary = producer.close().await.context("close producer")?;
            tracing::info!(
                generated = summary.generated,
                published = summary.published,
                failed = summary.failed,
                delivered = summary.delivery.delivered,
                delivery_failed = summary.delivery.failed,
                "producer summary"
            );
        }
        if let Some(consumer) = &self.consumer {
            consumer.close().await.context("close consumer")?;
        }
        Ok(self.reporter.report().await)
    }

    fn tracks_completion(&self) -> bool {
        self.producer.is_some()
            && self.consumer.is_some()
            && self.backend != StoreBackend::Disabled
    }

    // Resolves once publishing is over and nothing tracked is still
    // unacknowledged; never resolves when that cannot be observed.
    async fn wait_for_completion(&self) {
        let Some(producer) = self.producer.as_ref().filter(|_| self.tracks_completion()) else {
            return std::future::pending().await;
        };
        let mut ticker = tokio::time::interval(COMPLETION_POLL_INTERVAL);
        loop {
            ticker.tick().await;
            if !producer.publishing_finished() {
                continue;
            }
            match self.reporter.store().unacknowledged().await {
                Ok(pending) if pending.is_empty() => return,
                Ok(pending) => {
                    tracing::debug!(pending = pending.len(), "waiting for acknowledgements");
                }
                Err(err) => tracing::warn!(error = %err, "unable to list unacknowledged messages"),
            }
        }
    }
}
