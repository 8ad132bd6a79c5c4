//! Producer engine: a generator feeding a pool of publishing workers.
//!
//! ```text
//! generator ──bounded queue──► worker 0..N ──publish──► broker
//!                                   │
//!                                   └─ callbacks (in order, awaited)
//! ```
//!
//! The generator stops at the configured total, on the run's cancellation
//! token or on [`ProducerEngine::stop`]. Workers always drain what is already
//! queued, so [`ProducerEngine::close`] returns once the queue is empty and
//! the broker client has been flushed. A failed publish is logged and counted
//! but never retried and never reaches callbacks.
use crate::delivery::{DeliveryHandler, DeliveryStats};
use crate::{Callback, EngineError, EngineState, ProducerOptions, Record, Result, Telemetry};
use lossprobe_client::{PublishClient, WireMessage};
use lossprobe_common::{Encoder, Message, MessageFactory};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Counts gathered while closing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerSummary {
    pub generated: u64,
    pub published: u64,
    pub failed: u64,
    /// Records still in flight after the final flush.
    pub unflushed: usize,
    pub delivery: DeliveryStats,
}

#[derive(Default)]
struct Counters {
    generated: AtomicU64,
    published: AtomicU64,
    failed: AtomicU64,
    // Messages whose publish and callbacks have both completed.
    settled: AtomicU64,
    generation_done: AtomicBool,
}

#[derive(Default)]
struct Tasks {
    generator: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    sampler: Option<JoinHandle<()>>,
    delivery: Option<JoinHandle<DeliveryStats>>,
}

pub struct ProducerEngine {
    client: Arc<dyn PublishClient>,
    factory: Arc<MessageFactory>,
    encoder: Arc<dyn Encoder>,
    options: ProducerOptions,
    telemetry: Telemetry,
    callbacks: Vec<Arc<dyn Callback>>,
    state: Mutex<EngineState>,
    counters: Arc<Counters>,
    stop: CancellationToken,
    // Ends the sampler and the delivery handler once workers are done.
    shutdown: CancellationToken,
    tasks: Mutex<Tasks>,
}

impl ProducerEngine {
    pub fn new(
        client: Arc<dyn PublishClient>,
        factory: Arc<MessageFactory>,
        encoder: Arc<dyn Encoder>,
        options: ProducerOptions,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            client,
            factory,
            encoder,
            options,
            telemetry,
            callbacks: Vec::new(),
            state: Mutex::new(EngineState::Created),
            counters: Arc::new(Counters::default()),
            stop: CancellationToken::new(),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Tasks::default()),
        }
    }

    /// Add a callback invoked after every successful publish.
    pub fn register(&mut self, callback: Arc<dyn Callback>) {
        self.callbacks.push(callback);
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    pub fn options(&self) -> &ProducerOptions {
        &self.options
    }

    /// Messages handed to the worker queue so far.
    pub fn generated(&self) -> u64 {
        self.counters.generated.load(Ordering::Acquire)
    }

    pub fn published(&self) -> u64 {
        self.counters.published.load(Ordering::Acquire)
    }

    pub fn failed(&self) -> u64 {
        self.counters.failed.load(Ordering::Acquire)
    }

    /// True once the generator has exited, for whatever reason.
    pub fn generation_finished(&self) -> bool {
        self.counters.generation_done.load(Ordering::Acquire)
    }

    /// True once generation is over and every generated message has been
    /// published (or has failed) and passed through the callbacks.
    pub fn publishing_finished(&self) -> bool {
        self.generation_finished()
            && self.counters.settled.load(Ordering::Acquire)
                >= self.counters.generated.load(Ordering::Acquire)
    }

    /// Stop generating without touching the shared cancellation token.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Start the generator, the worker pool and the background tasks.
    pub fn run(&self, cancel: &CancellationToken) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != EngineState::Created {
                return Err(EngineError::InvalidState {
                    op: "run",
                    state: *state,
                });
            }
            *state = EngineState::Running;
        }

        let concurrency = self.options.concurrency.max(1);
        let (tx, rx) = mpsc::channel::<Message>(self.options.queue_depth.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut tasks = Tasks::default();

        if let Some(interval) = self.options.sample_interval {
            tasks.sampler = Some(tokio::spawn(
                sample_queue(
                    tx.downgrade(),
                    Arc::clone(&self.client),
                    self.telemetry.clone(),
                    interval,
                    self.shutdown.clone(),
                )
                .instrument(tracing::debug_span!("queue_sampler")),
            ));
        }
        if let Some(events) = self.client.take_completion_events() {
            let handler = DeliveryHandler::new(events, self.telemetry.clone());
            tasks.delivery = Some(tokio::spawn(
                handler
                    .run(self.shutdown.clone())
                    .instrument(tracing::debug_span!("delivery_handler")),
            ));
        }

        let worker = Arc::new(PublishWorker {
            client: Arc::clone(&self.client),
            encoder: Arc::clone(&self.encoder),
            topic: self.options.topic.clone(),
            callbacks: self.callbacks.clone(),
            telemetry: self.telemetry.clone(),
            counters: Arc::clone(&self.counters),
            delay: self.options.worker_delay,
        });
        for id in 0..concurrency {
            let worker = Arc::clone(&worker);
            let rx = Arc::clone(&rx);
            tasks.workers.push(tokio::spawn(
                async move { worker.run(rx).await }
                    .instrument(tracing::info_span!("publish_worker", id)),
            ));
        }
        self.telemetry.workers("producer", concurrency);

        tasks.generator = Some(tokio::spawn(
            generate(
                tx,
                Arc::clone(&self.factory),
                self.options.total_messages,
                Arc::clone(&self.counters),
                cancel.clone(),
                self.stop.clone(),
            )
            .instrument(tracing::info_span!("generator", topic = %self.options.topic)),
        ));

        *self.tasks.lock() = tasks;
        tracing::info!(
            topic = %self.options.topic,
            concurrency,
            total = ?self.options.total_messages,
            "producer running"
        );
        Ok(())
    }

    /// Wait for generation and publishing to finish, flush, then release the client.
    ///
    /// An unbounded run only finishes generating once cancelled or stopped.
    pub async fn close(&self) -> Result<ProducerSummary> {
        let previous = {
            let mut state = self.state.lock();
            let previous = *state;
            match previous {
                EngineState::Created | EngineState::Running => *state = EngineState::Draining,
                other => {
                    return Err(EngineError::InvalidState {
                        op: "close",
                        state: other,
                    });
                }
            }
            previous
        };
        tracing::info!("closing producer");

        let tasks = std::mem::take(&mut *self.tasks.lock());
        if let Some(generator) = tasks.generator {
            if let Err(err) = generator.await {
                tracing::error!(error = %err, "generator task failed");
            }
        }
        for worker in tasks.workers {
            if let Err(err) = worker.await {
                tracing::error!(error = %err, "publish worker failed");
            }
        }

        let unflushed = if previous == EngineState::Running {
            self.client.flush(self.options.flush_timeout).await
        } else {
            0
        };
        if unflushed > 0 {
            tracing::warn!(unflushed, "records still in flight after flush");
        }
        self.client.close().await;
        self.shutdown.cancel();

        if let Some(sampler) = tasks.sampler {
            if let Err(err) = sampler.await {
                tracing::error!(error = %err, "queue sampler failed");
            }
        }
        let delivery = match tasks.delivery {
            Some(handle) => handle.await.unwrap_or_else(|err| {
                tracing::error!(error = %err, "delivery handler failed");
                DeliveryStats::default()
            }),
            None => DeliveryStats::default(),
        };

        *self.state.lock() = EngineState::Closed;
        let summary = ProducerSummary {
            generated: self.generated(),
            published: self.published(),
            failed: self.failed(),
            unflushed,
            delivery,
        };
        tracing::info!(
            generated = summary.generated,
            published = summary.published,
            failed = summary.failed,
            "producer closed"
        );
        Ok(summary)
    }
}

async fn generate(
    tx: mpsc::Sender<Message>,
    factory: Arc<MessageFactory>,
    total: Option<u64>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    stop: CancellationToken,
) {
    let mut generated = 0u64;
    loop {
        if total.is_some_and(|total| generated >= total) {
            break;
        }
        let message = factory.next();
        // A full queue parks here; cancellation still wins.
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = stop.cancelled() => false,
            sent = tx.send(message) => sent.is_ok(),
        };
        if !sent {
            break;
        }
        generated += 1;
        counters.generated.store(generated, Ordering::Release);
    }
    counters.generation_done.store(true, Ordering::Release);
    tracing::info!(generated, "generation finished");
}

async fn sample_queue(
    tx: mpsc::WeakSender<Message>,
    client: Arc<dyn PublishClient>,
    telemetry: Telemetry,
    interval: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let depth = tx
                    .upgrade()
                    .map_or(0, |tx| tx.max_capacity() - tx.capacity());
                telemetry.queue_depth(depth);
                tracing::debug!(
                    depth,
                    in_flight = client.pending_queue_length(),
                    "producer queue"
                );
            }
        }
    }
}

struct PublishWorker {
    client: Arc<dyn PublishClient>,
    encoder: Arc<dyn Encoder>,
    topic: String,
    callbacks: Vec<Arc<dyn Callback>>,
    telemetry: Telemetry,
    counters: Arc<Counters>,
    delay: std::time::Duration,
}

impl PublishWorker {
    async fn run(&self, rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Message>>>) {
        loop {
            let next = rx.lock().await.recv().await;
            let Some(message) = next else {
                break;
            };
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.publish(message).await;
            self.counters.settled.fetch_add(1, Ordering::AcqRel);
        }
    }

    async fn publish(&self, message: Message) {
        let payload = match self.encoder.encode(&message) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(seq = message.sequence(), error = %err, "unable to encode message");
                self.counters.failed.fetch_add(1, Ordering::AcqRel);
                self.telemetry.publish_failed();
                return;
            }
        };
        match self
            .client
            .publish(WireMessage::new(self.topic.clone(), payload))
            .await
        {
            Ok(delivered) => {
                self.counters.published.fetch_add(1, Ordering::AcqRel);
                let record = Record::new(delivered);
                for callback in &self.callbacks {
                    callback.call(&record).await;
                }
            }
            Err(err) => {
                tracing::error!(
                    seq = message.sequence(),
                    id = message.id(),
                    error = %err,
                    "error publishing message"
                );
                self.counters.failed.fetch_add(1, Ordering::AcqRel);
                self.telemetry.publish_failed();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::from_fn;
    use lossprobe_client::InMemoryBroker;
    use lossprobe_common::BinaryCodec;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn engine(broker: &InMemoryBroker, options: ProducerOptions) -> ProducerEngine {
        ProducerEngine::new(
            Arc::new(broker.publisher()),
            Arc::new(MessageFactory::with_payload_bytes(16)),
            Arc::new(BinaryCodec),
            options,
            Telemetry::new(TOPIC),
        )
    }

    const TOPIC: &str = "producer_test";

    fn bounded(total: u64, concurrency: usize) -> ProducerOptions {
        let mut options = ProducerOptions::new(TOPIC);
        options.total_messages = Some(total);
        options.concurrency = concurrency;
        options.sample_interval = Some(Duration::from_millis(5));
        options
    }

    #[tokio::test]
    async fn publishes_the_configured_total() {
        let broker = InMemoryBroker::new();
        let mut producer = engine(&broker, bounded(50, 4));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        producer.register(from_fn(move |record| {
            assert!(record.wire().offset.is_some());
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        producer.run(&CancellationToken::new()).expect("run");
        assert_eq!(producer.state(), EngineState::Running);
        let summary = producer.close().await.expect("close");

        assert_eq!(summary.generated, 50);
        assert_eq!(summary.published, 50);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.delivery.delivered, 50);
        assert_eq!(calls.load(Ordering::SeqCst), 50);
        assert_eq!(broker.len(TOPIC), 50);
        assert_eq!(producer.state(), EngineState::Closed);
        assert!(producer.generation_finished());
    }

    #[tokio::test]
    async fn failed_publish_skips_callbacks() {
        let broker = InMemoryBroker::new();
        broker.fail_next_publishes(3);
        let mut producer = engine(&broker, bounded(10, 1));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        producer.register(from_fn(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        producer.run(&CancellationToken::new()).expect("run");
        let summary = producer.close().await.expect("close");

        assert_eq!(summary.failed, 3);
        assert_eq!(summary.published, 7);
        assert_eq!(summary.delivery.failed, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn stop_ends_an_unbounded_run() {
        let broker = InMemoryBroker::new();
        let mut options = bounded(0, 2);
        options.total_messages = None;
        options.queue_depth = 8;
        let producer = engine(&broker, options);
        producer.run(&CancellationToken::new()).expect("run");
        tokio::time::sleep(Duration::from_millis(20)).await;
        producer.stop();

        let summary = tokio::time::timeout(Duration::from_secs(5), producer.close())
            .await
            .expect("close in time")
            .expect("close");
        assert!(summary.generated > 0);
        assert_eq!(summary.generated, summary.published);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn publishing_finishes_after_callbacks() {
        let broker = InMemoryBroker::new();
        broker.fail_next_publishes(2);
        let mut producer = engine(&broker, bounded(20, 3));
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        let gate = parking_lot::Mutex::new(Some(gate_rx));
        producer.register(from_fn(move |_| {
            // Hold the first successful callback until the test releases it.
            if let Some(rx) = gate.lock().take() {
                let _ = rx.recv_timeout(Duration::from_secs(5));
            }
        }));
        assert!(!producer.publishing_finished());

        producer.run(&CancellationToken::new()).expect("run");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.publishing_finished());
        gate_tx.send(()).expect("release");

        tokio::time::timeout(Duration::from_secs(5), async {
            while !producer.publishing_finished() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("publishing finished");
        assert_eq!(producer.failed(), 2);
        assert_eq!(producer.published(), 18);
        producer.close().await.expect("close");
    }

    #[tokio::test]
    async fn run_twice_is_rejected() {
        let broker = InMemoryBroker::new();
        let producer = engine(&broker, bounded(1, 1));
        let cancel = CancellationToken::new();
        producer.run(&cancel).expect("run");
        let err = producer.run(&cancel).expect_err("second run");
        assert!(matches!(
            err,
            EngineError::InvalidState {
                state: EngineState::Running,
                ..
            }
        ));
        producer.close().await.expect("close");
        assert!(producer.close().await.is_err());
    }

    #[tokio::test]
    async fn close_without_run_releases_the_client() {
        let broker = InMemoryBroker::new();
        let producer = engine(&broker, bounded(5, 1));
        let summary = producer.close().await.expect("close");
        assert_eq!(summary, ProducerSummary::default());
        assert_eq!(producer.state(), EngineState::Closed);
    }
}
