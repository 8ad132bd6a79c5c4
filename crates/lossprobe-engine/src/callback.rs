//! Callbacks run on every published or consumed record.
//!
//! Engines await each registered callback in registration order on the
//! worker that handled the record, so callbacks should be quick. The payload
//! is decoded at most once per [`Record`], by whichever callback asks first,
//! and the result is shared with the rest. A record that fails to decode is
//! logged and skipped by every callback that needs the decoded message.
use crate::{Reporter, Telemetry};
use async_trait::async_trait;
use lossprobe_client::WireMessage;
use lossprobe_common::{Decoder, Message, MessageError, Trace};
use lossprobe_store::TrackingStore;
use std::sync::{Arc, OnceLock};

/// A published or consumed record as seen by callbacks.
///
/// The first call to [`Record::message`] decodes the payload; later calls
/// return the cached outcome, whatever decoder they pass. One engine feeds
/// all of its callbacks from a single decoder, so this only matters for
/// hand-built records.
pub struct Record {
    wire: WireMessage,
    decoded: OnceLock<Result<Message, MessageError>>,
}

impl Record {
    pub fn new(wire: WireMessage) -> Self {
        Self {
            wire,
            decoded: OnceLock::new(),
        }
    }

    pub fn wire(&self) -> &WireMessage {
        &self.wire
    }

    pub fn message(&self, decoder: &dyn Decoder) -> Result<&Message, &MessageError> {
        self.decoded
            .get_or_init(|| decoder.decode(&self.wire.payload))
            .as_ref()
    }

    pub fn is_decoded(&self) -> bool {
        self.decoded.get().is_some()
    }
}

#[async_trait]
pub trait Callback: Send + Sync {
    async fn call(&self, record: &Record);
}

struct FnCallback<F>(F);

#[async_trait]
impl<F> Callback for FnCallback<F>
where
    F: Fn(&Record) + Send + Sync + 'static,
{
    async fn call(&self, record: &Record) {
        (self.0)(record)
    }
}

/// Wrap a plain closure.
pub fn from_fn<F>(f: F) -> Arc<dyn Callback>
where
    F: Fn(&Record) + Send + Sync + 'static,
{
    Arc::new(FnCallback(f))
}

fn decode<'a>(
    decoder: &dyn Decoder,
    record: &'a Record,
    telemetry: &Telemetry,
    stage: &'static str,
) -> Option<&'a Message> {
    match record.message(decoder) {
        Ok(message) => Some(message),
        Err(err) => {
            let wire = record.wire();
            tracing::debug!(
                stage,
                placement = %wire.partition_info(),
                error = %err,
                "unable to decode record"
            );
            telemetry.decode_failed(stage);
            None
        }
    }
}

/// Marks published records as sent.
pub struct Tracker {
    store: Arc<dyn TrackingStore>,
    decoder: Arc<dyn Decoder>,
    telemetry: Telemetry,
}

impl Tracker {
    pub fn new(
        store: Arc<dyn TrackingStore>,
        decoder: Arc<dyn Decoder>,
        telemetry: Telemetry,
    ) -> Arc<dyn Callback> {
        Arc::new(Self {
            store,
            decoder,
            telemetry,
        })
    }
}

#[async_trait]
impl Callback for Tracker {
    async fn call(&self, record: &Record) {
        let Some(message) = decode(self.decoder.as_ref(), record, &self.telemetry, "track") else {
            return;
        };
        let trace = Trace::new(message.clone(), record.wire().partition_info());
        if let Err(err) = self.store.track(&trace).await {
            tracing::warn!(id = trace.message.id(), error = %err, "unable to track message");
            self.telemetry.tracking_failed("track");
        }
    }
}

/// Marks consumed records as received.
pub struct Acker {
    store: Arc<dyn TrackingStore>,
    decoder: Arc<dyn Decoder>,
    telemetry: Telemetry,
}

impl Acker {
    pub fn new(
        store: Arc<dyn TrackingStore>,
        decoder: Arc<dyn Decoder>,
        telemetry: Telemetry,
    ) -> Arc<dyn Callback> {
        Arc::new(Self {
            store,
            decoder,
            telemetry,
        })
    }
}

#[async_trait]
impl Callback for Acker {
    async fn call(&self, record: &Record) {
        let Some(message) = decode(self.decoder.as_ref(), record, &self.telemetry, "ack") else {
            return;
        };
        let age = message.age();
        let trace = Trace::new(message.clone(), record.wire().partition_info());
        match self.store.acknowledge(&trace).await {
            Ok(()) => {
                self.telemetry.message_acknowledged();
                self.telemetry.consume_latency(age);
            }
            Err(err) => {
                tracing::warn!(id = trace.message.id(), error = %err, "unable to acknowledge message");
                self.telemetry.tracking_failed("acknowledge");
            }
        }
    }
}

/// Feeds end-to-end latency into the reporter's sketch.
pub struct LatencySampler {
    reporter: Arc<Reporter>,
    decoder: Arc<dyn Decoder>,
    telemetry: Telemetry,
}

impl LatencySampler {
    pub fn new(
        reporter: Arc<Reporter>,
        decoder: Arc<dyn Decoder>,
        telemetry: Telemetry,
    ) -> Arc<dyn Callback> {
        Arc::new(Self {
            reporter,
            decoder,
            telemetry,
        })
    }
}

#[async_trait]
impl Callback for LatencySampler {
    async fn call(&self, record: &Record) {
        if let Some(message) = decode(self.decoder.as_ref(), record, &self.telemetry, "latency") {
            self.reporter.record_latency(message.age());
        }
    }
}

/// Counts sent records and their publish latency.
pub struct PublishMetrics {
    decoder: Arc<dyn Decoder>,
    telemetry: Telemetry,
}

impl PublishMetrics {
    pub fn new(decoder: Arc<dyn Decoder>, telemetry: Telemetry) -> Arc<dyn Callback> {
        Arc::new(Self { decoder, telemetry })
    }
}

#[async_trait]
impl Callback for PublishMetrics {
    async fn call(&self, record: &Record) {
        if let Some(message) = decode(self.decoder.as_ref(), record, &self.telemetry, "sent") {
            self.telemetry.message_sent();
            self.telemetry.produce_latency(message.age());
        }
    }
}

/// Debug-logs every record.
pub struct LogDisplay {
    decoder: Arc<dyn Decoder>,
    telemetry: Telemetry,
}

impl LogDisplay {
    pub fn new(decoder: Arc<dyn Decoder>, telemetry: Telemetry) -> Arc<dyn Callback> {
        Arc::new(Self { decoder, telemetry })
    }
}

#[async_trait]
impl Callback for LogDisplay {
    async fn call(&self, record: &Record) {
        if let Some(message) = decode(self.decoder.as_ref(), record, &self.telemetry, "display") {
            tracing::debug!(placement = %record.wire().partition_info(), %message, "record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use lossprobe_common::{BinaryCodec, Encoder, MessageFactory};
    use lossprobe_store::{LocalStore, StoreError, StoreResult, TrackResult};
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, SystemTime};

    fn encoded(message: &Message) -> Record {
        let mut wire = WireMessage::new("cb", BinaryCodec.encode(message).expect("encode"));
        wire.partition = Some(0);
        wire.offset = Some(0);
        Record::new(wire)
    }

    struct CountingDecoder {
        calls: AtomicUsize,
    }

    impl Decoder for CountingDecoder {
        fn decode(&self, bytes: &[u8]) -> lossprobe_common::Result<Message> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            BinaryCodec.decode(bytes)
        }
    }

    struct UnavailableStore;

    #[async_trait]
    impl TrackingStore for UnavailableStore {
        async fn track(&self, _trace: &Trace) -> StoreResult<()> {
            Ok(())
        }
        async fn acknowledge(&self, _trace: &Trace) -> StoreResult<()> {
            Err(StoreError::Unreachable {
                addr: "cb".to_string(),
                reason: "down".to_string(),
            })
        }
        async fn unacknowledged(&self) -> StoreResult<Vec<String>> {
            Ok(Vec::new())
        }
        async fn result(&self) -> StoreResult<TrackResult> {
            Ok(TrackResult::default())
        }
        fn backend_name(&self) -> &'static str {
            "unavailable"
        }
    }

    #[tokio::test]
    async fn tracker_and_acker_share_identity() {
        let store: Arc<dyn TrackingStore> = Arc::new(LocalStore::default());
        let telemetry = Telemetry::new("cb");
        let tracker = Tracker::new(store.clone(), Arc::new(BinaryCodec), telemetry.clone());
        let acker = Acker::new(store.clone(), Arc::new(BinaryCodec), telemetry);
        let factory = MessageFactory::with_payload_bytes(8);
        let first = encoded(&factory.next());
        let second = encoded(&factory.next());

        tracker.call(&first).await;
        tracker.call(&second).await;
        acker.call(&first).await;

        let result = store.result().await.expect("result");
        assert_eq!(result.tracked, 2);
        assert_eq!(result.acknowledged, 1);
    }

    #[tokio::test]
    async fn undecodable_records_are_skipped() {
        let store: Arc<dyn TrackingStore> = Arc::new(LocalStore::default());
        let telemetry = Telemetry::new("cb");
        let tracker = Tracker::new(store.clone(), Arc::new(BinaryCodec), telemetry.clone());
        let acker = Acker::new(store.clone(), Arc::new(BinaryCodec), telemetry);
        let garbage = Record::new(WireMessage::new("cb", Bytes::from_static(b"not a message")));
        tracker.call(&garbage).await;
        acker.call(&garbage).await;
        let result = store.result().await.expect("result");
        assert_eq!(result.tracked, 0);
        assert_eq!(result.acknowledged, 0);
    }

    #[tokio::test]
    async fn latency_sampler_records_message_age() {
        let reporter = Arc::new(Reporter::new(
            Arc::new(lossprobe_store::DisabledStore),
            5,
        ));
        let sampler = LatencySampler::new(
            reporter.clone(),
            Arc::new(BinaryCodec),
            Telemetry::new("cb"),
        );
        let created = SystemTime::now() - Duration::from_millis(250);
        let message = Message::from_parts(1, "old", created, Bytes::new());
        sampler.call(&encoded(&message)).await;
        let report = reporter.report().await;
        let max = report.max_latency_ms.expect("sampled");
        assert!(max >= 250, "latency {max}ms");
    }

    #[tokio::test]
    async fn closures_are_callbacks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let callback = from_fn(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let record = Record::new(WireMessage::new("cb", Bytes::new()));
        callback.call(&record).await;
        callback.call(&record).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn payload_is_decoded_once_per_record() {
        let decoder = Arc::new(CountingDecoder {
            calls: AtomicUsize::new(0),
        });
        let store: Arc<dyn TrackingStore> = Arc::new(LocalStore::default());
        let telemetry = Telemetry::new("cb");
        let reporter = Arc::new(Reporter::new(store.clone(), 5));
        let callbacks = [
            Tracker::new(store.clone(), decoder.clone(), telemetry.clone()),
            PublishMetrics::new(decoder.clone(), telemetry.clone()),
            Acker::new(store.clone(), decoder.clone(), telemetry.clone()),
            LatencySampler::new(reporter, decoder.clone(), telemetry.clone()),
            LogDisplay::new(decoder.clone(), telemetry),
        ];
        let record = encoded(&MessageFactory::with_payload_bytes(8).next());
        assert!(!record.is_decoded());
        for callback in &callbacks {
            callback.call(&record).await;
        }
        assert!(record.is_decoded());
        assert_eq!(decoder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.result().await.expect("result").acknowledged, 1);
    }

    #[test]
    fn failed_acknowledgement_is_not_counted_as_received() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let acker = Acker::new(
            Arc::new(UnavailableStore),
            Arc::new(BinaryCodec),
            Telemetry::new("cb_unavailable"),
        );
        let record = encoded(&MessageFactory::with_payload_bytes(8).next());
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        metrics::with_local_recorder(&recorder, || rt.block_on(acker.call(&record)));

        let rendered = handle.render();
        assert!(rendered.contains("lossprobe_tracking_failures_total"), "{rendered}");
        assert!(!rendered.contains("lossprobe_messages_acknowledged_total"), "{rendered}");
        assert!(!rendered.contains("lossprobe_consume_latency_ms"), "{rendered}");
    }
}
