// End-to-end runs of both engines against the in-process broker.
use bytes::Bytes;
use lossprobe_client::{InMemoryBroker, PublishClient, ReadClient, WireMessage};
use lossprobe_common::{BinaryCodec, Decoder, Encoder, MessageFactory, PartitionInfo, Trace};
use lossprobe_engine::{
    Acker, ConsumerEngine, ConsumerOptions, LatencySampler, ProducerEngine, ProducerOptions,
    PublishMetrics, Reporter, Telemetry, Tracker,
};
use lossprobe_store::{LocalStore, MemorySets, RemoteStore, TrackingStore, by_message_id};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const TOPIC: &str = "lossprobe_scenarios";
const GROUP: &str = "lossprobe_scenarios_group";

struct Harness {
    broker: InMemoryBroker,
    store: Arc<dyn TrackingStore>,
    reporter: Arc<Reporter>,
    codec: Arc<BinaryCodec>,
    telemetry: Telemetry,
}

impl Harness {
    fn new(store: Arc<dyn TrackingStore>) -> Self {
        Self {
            broker: InMemoryBroker::new(),
            reporter: Arc::new(Reporter::new(Arc::clone(&store), 10)),
            store,
            codec: Arc::new(BinaryCodec),
            telemetry: Telemetry::new(TOPIC),
        }
    }

    fn local() -> Self {
        Self::new(Arc::new(LocalStore::default()))
    }

    fn producer(&self, options: ProducerOptions) -> ProducerEngine {
        let encoder: Arc<dyn Encoder> = self.codec.clone();
        let decoder: Arc<dyn Decoder> = self.codec.clone();
        let mut producer = ProducerEngine::new(
            Arc::new(self.broker.publisher()),
            Arc::new(MessageFactory::with_payload_bytes(64)),
            encoder,
            options,
            self.telemetry.clone(),
        );
        producer.register(Tracker::new(
            Arc::clone(&self.store),
            Arc::clone(&decoder),
            self.telemetry.clone(),
        ));
        producer.register(PublishMetrics::new(decoder, self.telemetry.clone()));
        producer
    }

    async fn consumer(&self, options: ConsumerOptions) -> ConsumerEngine {
        let broker = self.broker.clone();
        let auto_commit = options.auto_commit;
        let mut consumer = ConsumerEngine::open(options, self.telemetry.clone(), move |_| {
            let reader: Arc<dyn ReadClient> = Arc::new(broker.reader(GROUP, auto_commit));
            Ok(reader)
        })
        .await
        .expect("open consumer");
        let decoder: Arc<dyn Decoder> = self.codec.clone();
        consumer.register(Acker::new(
            Arc::clone(&self.store),
            Arc::clone(&decoder),
            self.telemetry.clone(),
        ));
        consumer.register(LatencySampler::new(
            Arc::clone(&self.reporter),
            decoder,
            self.telemetry.clone(),
        ));
        consumer
    }

    async fn wait_for_acknowledged(&self, expected: u64) {
        let store = Arc::clone(&self.store);
        tokio::time::timeout(Duration::from_secs(10), async move {
            loop {
                let result = store.result().await.expect("result");
                if result.acknowledged >= expected {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("acknowledged in time");
    }
}

fn producer_options(total: Option<u64>, concurrency: usize) -> ProducerOptions {
    let mut options = ProducerOptions::new(TOPIC);
    options.total_messages = total;
    options.concurrency = concurrency;
    options
}

fn consumer_options(concurrency: usize, auto_commit: bool) -> ConsumerOptions {
    let mut options = ConsumerOptions::new(TOPIC);
    options.concurrency = concurrency;
    options.auto_commit = auto_commit;
    options.poll_timeout = Duration::from_millis(50);
    options.poll_yield = Duration::ZERO;
    options
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_message_is_acknowledged() {
    let harness = Harness::local();
    let cancel = CancellationToken::new();
    let consumer = harness.consumer(consumer_options(1, true)).await;
    let producer = harness.producer(producer_options(Some(1000), 10));

    consumer.run(&cancel).expect("run consumer");
    producer.run(&cancel).expect("run producer");
    let summary = producer.close().await.expect("close producer");
    assert_eq!(summary.published, 1000);

    harness.wait_for_acknowledged(1000).await;
    cancel.cancel();
    consumer.close().await.expect("close consumer");

    let result = harness.store.result().await.expect("result");
    assert_eq!(result.tracked, 1000);
    assert_eq!(result.acknowledged, 1000);
    assert!(harness.store.unacknowledged().await.expect("pending").is_empty());

    let report = harness.reporter.report().await;
    assert_eq!(report.lost, 0);
    assert!(report.max_latency_ms.is_some());
    assert_eq!(report.top_latencies_ms.len(), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nothing_is_acknowledged_without_a_consumer() {
    let harness = Harness::local();
    let producer = harness.producer(producer_options(Some(1000), 10));
    producer.run(&CancellationToken::new()).expect("run producer");
    producer.close().await.expect("close producer");

    assert_eq!(
        harness.store.unacknowledged().await.expect("pending").len(),
        1000
    );
    let report = harness.reporter.report().await;
    assert_eq!(report.tracked, 1000);
    assert_eq!(report.lost, 1000);
    assert_eq!(report.unacknowledged_total, 1000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unbounded_run_stops_at_the_deadline() {
    let harness = Harness::local();
    let mut options = producer_options(None, 2);
    options.worker_delay = Duration::from_millis(5);
    options.queue_depth = 4;
    let producer = harness.producer(options);
    let consumer = harness.consumer(consumer_options(1, true)).await;

    let cancel = CancellationToken::new();
    consumer.run(&cancel).expect("run consumer");
    producer.run(&cancel).expect("run producer");
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let cancelled_at = Instant::now();
    while !producer.generation_finished() {
        assert!(
            cancelled_at.elapsed() < Duration::from_millis(500),
            "generator kept running after cancel"
        );
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let generated = producer.generated();

    let summary = tokio::time::timeout(Duration::from_secs(5), producer.close())
        .await
        .expect("producer closes")
        .expect("close producer");
    tokio::time::timeout(Duration::from_secs(5), consumer.close())
        .await
        .expect("consumer closes")
        .expect("close consumer");
    assert!(generated > 0);
    assert_eq!(summary.generated, generated);
    assert_eq!(summary.published, generated);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silently_dropped_publishes_are_reported_lost() {
    let store = RemoteStore::with_backend(
        Arc::new(MemorySets::new()),
        "scenario",
        by_message_id(),
        Duration::from_secs(1),
    )
    .await
    .expect("store");
    let harness = Harness::new(Arc::new(store));
    harness.broker.lose_next_publishes(5);

    let cancel = CancellationToken::new();
    let consumer = harness.consumer(consumer_options(2, true)).await;
    let producer = harness.producer(producer_options(Some(100), 4));
    consumer.run(&cancel).expect("run consumer");
    producer.run(&cancel).expect("run producer");
    producer.close().await.expect("close producer");

    harness.wait_for_acknowledged(95).await;
    cancel.cancel();
    consumer.close().await.expect("close consumer");

    let report = harness.reporter.report().await;
    assert_eq!(report.tracked, 100);
    assert_eq!(report.acknowledged, 95);
    assert_eq!(report.lost, 5);
    assert_eq!(report.unacknowledged_total, 5);
}

// Commit happens before callbacks, so a record that cannot be decoded is
// never redelivered and never acknowledged: it surfaces only as loss.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn undecodable_record_is_committed_but_not_acknowledged() {
    let harness = Harness {
        broker: InMemoryBroker::with_partitions(1),
        ..Harness::local()
    };
    let cancel = CancellationToken::new();
    let consumer = harness.consumer(consumer_options(1, false)).await;
    consumer.run(&cancel).expect("run consumer");

    let publisher = harness.broker.publisher();
    publisher
        .publish(WireMessage::new(TOPIC, Bytes::from_static(b"garbage")))
        .await
        .expect("publish garbage");
    let valid = MessageFactory::with_payload_bytes(8).next();
    harness
        .store
        .track(&Trace::new(valid.clone(), PartitionInfo::default()))
        .await
        .expect("track valid");
    publisher
        .publish(WireMessage::new(
            TOPIC,
            BinaryCodec.encode(&valid).expect("encode"),
        ))
        .await
        .expect("publish valid");

    harness.wait_for_acknowledged(1).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while consumer.received() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("both read");
    cancel.cancel();
    consumer.close().await.expect("close consumer");

    assert_eq!(harness.broker.committed(GROUP, TOPIC, 0), Some(2));
    let result = harness.store.result().await.expect("result");
    assert_eq!(result.acknowledged, 1);

    // A restarted consumer resumes after both records.
    harness.broker.rewind_to_committed(GROUP);
    let reader = harness.broker.reader(GROUP, false);
    reader
        .subscribe(&[TOPIC.to_string()])
        .await
        .expect("subscribe");
    assert!(
        reader
            .read(Duration::from_millis(50))
            .await
            .expect_err("nothing to redeliver")
            .is_timeout()
    );
}
