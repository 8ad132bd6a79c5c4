use anyhow::{Context, Result, bail};
use lossprobe_common::factory::DEFAULT_PAYLOAD_BYTES;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

pub const MEMORY_BROKER: &str = "memory";

const DEFAULT_TOPIC: &str = "lossprobe_test";
const DEFAULT_GROUP_ID: &str = "lossprobe_consumer";
const DEFAULT_PRODUCER_CONCURRENCY: usize = 100;
const DEFAULT_TOTAL_MESSAGES: i64 = 10_000;
const DEFAULT_FLUSH_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_POLL_TIMEOUT_MS: u64 = 500;
const DEFAULT_QUEUE_DEPTH: usize = 1_000;
const DEFAULT_RUN_DURATION_MS: u64 = 30_000;
const DEFAULT_LATENCY_TOP_N: usize = 10;

/// Which wire format the engines use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    Binary,
    Opaque,
}

impl FromStr for CodecKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "binary" => Ok(Self::Binary),
            "opaque" => Ok(Self::Opaque),
            other => bail!("unknown codec {other:?} (expected binary or opaque)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Local,
    Redis,
    Disabled,
}

impl FromStr for StoreKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" | "memory" => Ok(Self::Local),
            "redis" | "remote" => Ok(Self::Redis),
            "disabled" | "none" => Ok(Self::Disabled),
            other => bail!("unknown store type {other:?} (expected local, redis or disabled)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub enabled: bool,
    pub concurrency: usize,
    // None runs until cancelled.
    pub total_messages: Option<u64>,
    pub worker_delay_ms: u64,
    pub flush_timeout_ms: u64,
    pub payload_bytes: usize,
    pub queue_depth: usize,
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub enabled: bool,
    pub concurrency: usize,
    pub group_id: String,
    pub poll_timeout_ms: u64,
    pub auto_commit: bool,
    pub queue_depth: usize,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub kind: StoreKind,
    pub redis_addr: Option<String>,
    // Namespaces remote keys so runs sharing a server stay apart.
    pub run_id: String,
}

/// Kafka client settings beyond the bootstrap servers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KafkaSettings {
    pub security_protocol: Option<String>,
    pub ssl_ca_location: Option<String>,
    pub ssl_certificate_location: Option<String>,
    pub ssl_key_location: Option<String>,
    pub ssl_key_password: Option<String>,
    // Client statistics are exported as metrics when set.
    pub statistics_interval_ms: Option<u64>,
}

impl KafkaSettings {
    /// The configured protocol, or `ssl` when only TLS files are given.
    pub fn effective_protocol(&self) -> Option<String> {
        let uses_tls = self.ssl_ca_location.is_some()
            || self.ssl_certificate_location.is_some()
            || self.ssl_key_location.is_some();
        self.security_protocol
            .clone()
            .or_else(|| uses_tls.then(|| "ssl".to_string()))
    }

    pub fn statistics_interval(&self) -> Option<Duration> {
        self.statistics_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

// Harness configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    // `memory` for the in-process broker, otherwise Kafka bootstrap servers.
    pub broker: String,
    pub topic: String,
    // `development` logs every record.
    pub environment: String,
    pub codec: CodecKind,
    pub run_duration_ms: u64,
    // Gives consumers time to join before the first publish.
    pub startup_delay_ms: u64,
    pub latency_top_n: usize,
    pub metrics_bind: Option<SocketAddr>,
    pub producer: ProducerConfig,
    pub consumer: ConsumerConfig,
    pub store: StoreConfig,
    pub kafka: KafkaSettings,
}

#[derive(Debug, Default, Deserialize)]
struct HarnessConfigOverride {
    broker: Option<String>,
    topic: Option<String>,
    environment: Option<String>,
    codec: Option<String>,
    run_duration_ms: Option<u64>,
    startup_delay_ms: Option<u64>,
    latency_top_n: Option<usize>,
    metrics_bind: Option<String>,
    #[serde(default)]
    producer: ProducerOverride,
    #[serde(default)]
    consumer: ConsumerOverride,
    #[serde(default)]
    store: StoreOverride,
    #[serde(default)]
    kafka: KafkaOverride,
}

#[derive(Debug, Default, Deserialize)]
struct ProducerOverride {
    enabled: Option<bool>,
    concurrency: Option<usize>,
    total_messages: Option<i64>,
    worker_delay_ms: Option<u64>,
    flush_timeout_ms: Option<u64>,
    payload_bytes: Option<usize>,
    queue_depth: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ConsumerOverride {
    enabled: Option<bool>,
    concurrency: Option<usize>,
    group_id: Option<String>,
    poll_timeout_ms: Option<u64>,
    auto_commit: Option<bool>,
    queue_depth: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct StoreOverride {
    #[serde(rename = "type")]
    kind: Option<String>,
    redis_addr: Option<String>,
    run_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct KafkaOverride {
    security_protocol: Option<String>,
    ssl_ca_location: Option<String>,
    ssl_certificate_location: Option<String>,
    ssl_key_location: Option<String>,
    ssl_key_password: Option<String>,
    statistics_interval_ms: Option<u64>,
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(default)
}

fn env_positive<T>(key: &str, default: T) -> T
where
    T: FromStr + PartialOrd + Default,
{
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .filter(|value| *value > T::default())
        .unwrap_or(default)
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Negative totals mean "run until cancelled".
fn total_from_signed(value: i64) -> Option<u64> {
    u64::try_from(value).ok()
}

impl HarnessConfig {
    pub fn from_env() -> Result<Self> {
        let codec = std::env::var("LOSSPROBE_CODEC")
            .unwrap_or_else(|_| "binary".to_string())
            .parse()
            .with_context(|| "parse LOSSPROBE_CODEC")?;
        let metrics_bind = env_nonempty("LOSSPROBE_METRICS_BIND")
            .map(|value| value.parse::<SocketAddr>())
            .transpose()
            .with_context(|| "parse LOSSPROBE_METRICS_BIND")?;
        let total_messages = match std::env::var("LOSSPROBE_PRODUCER_TOTAL_MESSAGES") {
            Ok(value) => value
                .trim()
                .parse::<i64>()
                .with_context(|| "parse LOSSPROBE_PRODUCER_TOTAL_MESSAGES")?,
            Err(_) => DEFAULT_TOTAL_MESSAGES,
        };
        let store_kind = std::env::var("LOSSPROBE_STORE_TYPE")
            .unwrap_or_else(|_| "local".to_string())
            .parse()
            .with_context(|| "parse LOSSPROBE_STORE_TYPE")?;

        let producer = ProducerConfig {
            enabled: env_flag("LOSSPROBE_PRODUCER_ENABLED", true),
            concurrency: env_positive(
                "LOSSPROBE_PRODUCER_CONCURRENCY",
                DEFAULT_PRODUCER_CONCURRENCY,
            ),
            total_messages: total_from_signed(total_messages),
            worker_delay_ms: env_or("LOSSPROBE_PRODUCER_WORKER_DELAY_MS", 0),
            flush_timeout_ms: env_positive(
                "LOSSPROBE_PRODUCER_FLUSH_TIMEOUT_MS",
                DEFAULT_FLUSH_TIMEOUT_MS,
            ),
            payload_bytes: env_or("LOSSPROBE_PRODUCER_PAYLOAD_BYTES", DEFAULT_PAYLOAD_BYTES),
            queue_depth: env_positive("LOSSPROBE_PRODUCER_QUEUE_DEPTH", DEFAULT_QUEUE_DEPTH),
        };
        let consumer = ConsumerConfig {
            enabled: env_flag("LOSSPROBE_CONSUMER_ENABLED", true),
            concurrency: env_positive("LOSSPROBE_CONSUMER_CONCURRENCY", 1),
            group_id: env_nonempty("LOSSPROBE_CONSUMER_GROUP_ID")
                .unwrap_or_else(|| DEFAULT_GROUP_ID.to_string()),
            poll_timeout_ms: env_positive(
                "LOSSPROBE_CONSUMER_POLL_TIMEOUT_MS",
                DEFAULT_POLL_TIMEOUT_MS,
            ),
            auto_commit: env_flag("LOSSPROBE_CONSUMER_AUTO_COMMIT", true),
            queue_depth: env_positive("LOSSPROBE_CONSUMER_QUEUE_DEPTH", DEFAULT_QUEUE_DEPTH),
        };
        let store = StoreConfig {
            kind: store_kind,
            redis_addr: env_nonempty("LOSSPROBE_REDIS_ADDR"),
            run_id: env_nonempty("LOSSPROBE_RUN_ID")
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        };

        let kafka = KafkaSettings {
            security_protocol: env_nonempty("LOSSPROBE_KAFKA_SECURITY_PROTOCOL"),
            ssl_ca_location: env_nonempty("LOSSPROBE_KAFKA_SSL_CA_LOCATION"),
            ssl_certificate_location: env_nonempty("LOSSPROBE_KAFKA_SSL_CERTIFICATE_LOCATION"),
            ssl_key_location: env_nonempty("LOSSPROBE_KAFKA_SSL_KEY_LOCATION"),
            ssl_key_password: env_nonempty("LOSSPROBE_KAFKA_SSL_KEY_PASSWORD"),
            statistics_interval_ms: env_nonempty("LOSSPROBE_KAFKA_STATISTICS_INTERVAL_MS")
                .map(|value| value.parse::<u64>())
                .transpose()
                .with_context(|| "parse LOSSPROBE_KAFKA_STATISTICS_INTERVAL_MS")?,
        };

        let config = Self {
            broker: env_nonempty("LOSSPROBE_BROKER").unwrap_or_else(|| MEMORY_BROKER.to_string()),
            topic: env_nonempty("LOSSPROBE_TOPIC").unwrap_or_else(|| DEFAULT_TOPIC.to_string()),
            environment: env_nonempty("LOSSPROBE_ENVIRONMENT")
                .unwrap_or_else(|| "production".to_string()),
            codec,
            run_duration_ms: env_positive("LOSSPROBE_RUN_DURATION_MS", DEFAULT_RUN_DURATION_MS),
            startup_delay_ms: env_or("LOSSPROBE_STARTUP_DELAY_MS", 0),
            latency_top_n: env_positive("LOSSPROBE_LATENCY_TOP_N", DEFAULT_LATENCY_TOP_N),
            metrics_bind,
            producer,
            consumer,
            store,
            kafka,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("LOSSPROBE_CONFIG") {
            config
                .apply_yaml_file(&path)
                .with_context(|| format!("apply LOSSPROBE_CONFIG: {path}"))?;
        }
        Ok(config)
    }

    /// Patch fields present in a YAML file; absent keys keep their values.
    pub fn apply_yaml_file(&mut self, path: &str) -> Result<()> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read config file: {path}"))?;
        self.apply_yaml(&contents)
    }

    pub fn apply_yaml(&mut self, contents: &str) -> Result<()> {
        let override_cfg: HarnessConfigOverride =
            serde_yaml::from_str(contents).with_context(|| "parse harness config yaml")?;
        if let Some(value) = override_cfg.broker {
            self.broker = value;
        }
        if let Some(value) = override_cfg.topic {
            self.topic = value;
        }
        if let Some(value) = override_cfg.environment {
            self.environment = value;
        }
        if let Some(value) = override_cfg.codec {
            self.codec = value.parse().with_context(|| "parse codec")?;
        }
        if let Some(value) = override_cfg.run_duration_ms
            && value > 0
        {
            self.run_duration_ms = value;
        }
        if let Some(value) = override_cfg.startup_delay_ms {
            self.startup_delay_ms = value;
        }
        if let Some(value) = override_cfg.latency_top_n
            && value > 0
        {
            self.latency_top_n = value;
        }
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = Some(value.parse().with_context(|| "parse metrics_bind")?);
        }

        let producer = override_cfg.producer;
        if let Some(value) = producer.enabled {
            self.producer.enabled = value;
        }
        if let Some(value) = producer.concurrency
            && value > 0
        {
            self.producer.concurrency = value;
        }
        if let Some(value) = producer.total_messages {
            self.producer.total_messages = total_from_signed(value);
        }
        if let Some(value) = producer.worker_delay_ms {
            self.producer.worker_delay_ms = value;
        }
        if let Some(value) = producer.flush_timeout_ms
            && value > 0
        {
            self.producer.flush_timeout_ms = value;
        }
        if let Some(value) = producer.payload_bytes {
            self.producer.payload_bytes = value;
        }
        if let Some(value) = producer.queue_depth
            && value > 0
        {
            self.producer.queue_depth = value;
        }

        let consumer = override_cfg.consumer;
        if let Some(value) = consumer.enabled {
            self.consumer.enabled = value;
        }
        if let Some(value) = consumer.concurrency
            && value > 0
        {
            self.consumer.concurrency = value;
        }
        if let Some(value) = consumer.group_id {
            self.consumer.group_id = value;
        }
        if let Some(value) = consumer.poll_timeout_ms
            && value > 0
        {
            self.consumer.poll_timeout_ms = value;
        }
        if let Some(value) = consumer.auto_commit {
            self.consumer.auto_commit = value;
        }
        if let Some(value) = consumer.queue_depth
            && value > 0
        {
            self.consumer.queue_depth = value;
        }

        let store = override_cfg.store;
        if let Some(value) = store.kind {
            self.store.kind = value.parse().with_context(|| "parse store type")?;
        }
        if let Some(value) = store.redis_addr {
            self.store.redis_addr = Some(value).filter(|addr| !addr.trim().is_empty());
        }
        if let Some(value) = store.run_id {
            self.store.run_id = value;
        }

        let kafka = override_cfg.kafka;
        let strings = [
            (kafka.security_protocol, &mut self.kafka.security_protocol),
            (kafka.ssl_ca_location, &mut self.kafka.ssl_ca_location),
            (kafka.ssl_certificate_location, &mut self.kafka.ssl_certificate_location),
            (kafka.ssl_key_location, &mut self.kafka.ssl_key_location),
            (kafka.ssl_key_password, &mut self.kafka.ssl_key_password),
        ];
        for (value, field) in strings {
            if let Some(value) = value {
                *field = Some(value).filter(|v| !v.trim().is_empty());
            }
        }
        if let Some(value) = kafka.statistics_interval_ms {
            self.kafka.statistics_interval_ms = Some(value);
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            bail!("topic must not be empty");
        }
        if self.store.kind == StoreKind::Redis && self.store.redis_addr.is_none() {
            bail!("store type redis requires a redis address");
        }
        Ok(())
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn uses_memory_broker(&self) -> bool {
        self.broker.eq_ignore_ascii_case(MEMORY_BROKER)
    }

    pub fn run_duration(&self) -> Duration {
        Duration::from_millis(self.run_duration_ms)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    /// A small in-process run that does not read the environment.
    pub(crate) fn base_config() -> HarnessConfig {
        HarnessConfig {
            broker: MEMORY_BROKER.to_string(),
            topic: "lossprobe_app_test".to_string(),
            environment: "test".to_string(),
            codec: CodecKind::Binary,
            run_duration_ms: DEFAULT_RUN_DURATION_MS,
            startup_delay_ms: 0,
            latency_top_n: DEFAULT_LATENCY_TOP_N,
            metrics_bind: None,
            producer: ProducerConfig {
                enabled: true,
                concurrency: 4,
                total_messages: Some(100),
                worker_delay_ms: 0,
                flush_timeout_ms: 1_000,
                payload_bytes: 64,
                queue_depth: 64,
            },
            consumer: ConsumerConfig {
                enabled: true,
                concurrency: 2,
                group_id: DEFAULT_GROUP_ID.to_string(),
                poll_timeout_ms: 50,
                auto_commit: true,
                queue_depth: 64,
            },
            store: StoreConfig {
                kind: StoreKind::Local,
                redis_addr: None,
                run_id: "test".to_string(),
            },
            kafka: KafkaSettings::default(),
        }
    }
}
