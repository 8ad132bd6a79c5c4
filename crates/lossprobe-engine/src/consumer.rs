//! Consumer engine: one poll task and one drain task per reading client.
//!
//! The poll task reads with a bounded timeout and pushes records onto the
//! client's bounded queue; when auto-commit is off it commits each record
//! right after the read, before any callback has seen it. The drain task runs
//! the callbacks. Polling ends on the run's cancellation token or on
//! [`ConsumerEngine::stop`], checked after every read.
use crate::{Callback, ConsumerOptions, EngineError, EngineState, Record, Result, Telemetry};
use lossprobe_client::{ClientError, ReadClient, WireMessage};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub struct ConsumerEngine {
    clients: Vec<Arc<dyn ReadClient>>,
    options: ConsumerOptions,
    telemetry: Telemetry,
    callbacks: Vec<Arc<dyn Callback>>,
    state: Mutex<EngineState>,
    stop: CancellationToken,
    received: Arc<AtomicU64>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConsumerEngine {
    /// Create `options.concurrency` readers through `connect` and subscribe
    /// each to the topic. Any failure closes the readers opened so far and
    /// aborts construction.
    pub async fn open<F>(
        options: ConsumerOptions,
        telemetry: Telemetry,
        mut connect: F,
    ) -> Result<Self>
    where
        F: FnMut(usize) -> lossprobe_client::Result<Arc<dyn ReadClient>>,
    {
        let concurrency = options.concurrency.max(1);
        let topics = vec![options.topic.clone()];
        let mut clients: Vec<Arc<dyn ReadClient>> = Vec::with_capacity(concurrency);
        for index in 0..concurrency {
            let client = match connect(index) {
                Ok(client) => client,
                Err(source) => {
                    close_all(&clients).await;
                    return Err(EngineError::Connect { index, source });
                }
            };
            if let Err(source) = client.subscribe(&topics).await {
                clients.push(client);
                close_all(&clients).await;
                return Err(EngineError::Subscribe {
                    index,
                    topic: options.topic.clone(),
                    source,
                });
            }
            clients.push(client);
        }
        tracing::debug!(topic = %options.topic, concurrency, "consumer subscribed");
        Ok(Self {
            clients,
            options,
            telemetry,
            callbacks: Vec::new(),
            state: Mutex::new(EngineState::Created),
            stop: CancellationToken::new(),
            received: Arc::new(AtomicU64::new(0)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Add a callback invoked for every consumed record.
    pub fn register(&mut self, callback: Arc<dyn Callback>) {
        self.callbacks.push(callback);
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Acquire)
    }

    /// End polling without touching the shared cancellation token.
    pub fn stop(&self) {
        self.stop.cancel();
    }

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

        let mut tasks = Vec::with_capacity(self.clients.len() * 2);
        for (id, client) in self.clients.iter().enumerate() {
            let (tx, rx) = mpsc::channel(self.options.queue_depth.max(1));
            let poller = Poller {
                id,
                client: Arc::clone(client),
                options: self.options.clone(),
                received: Arc::clone(&self.received),
                cancel: cancel.clone(),
                stop: self.stop.clone(),
            };
            tasks.push(tokio::spawn(
                poller
                    .run(tx)
                    .instrument(tracing::info_span!("consumer_poll", id)),
            ));
            tasks.push(tokio::spawn(
                drain(rx, self.callbacks.clone())
                    .instrument(tracing::info_span!("consumer_drain", id)),
            ));
        }
        self.telemetry.workers("consumer", self.clients.len());
        *self.tasks.lock() = tasks;
        tracing::info!(
            topic = %self.options.topic,
            concurrency = self.clients.len(),
            auto_commit = self.options.auto_commit,
            "consumer running"
        );
        Ok(())
    }

    /// Stop polling, wait for every queued record to pass through the
    /// callbacks, then close the readers.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                EngineState::Created | EngineState::Running => *state = EngineState::Draining,
                other => {
                    return Err(EngineError::InvalidState {
                        op: "close",
                        state: other,
                    });
                }
            }
        }
        tracing::info!("closing consumer");
        self.stop();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "consumer task failed");
            }
        }
        close_all(&self.clients).await;
        *self.state.lock() = EngineState::Closed;
        tracing::info!(received = self.received(), "consumer closed");
        Ok(())
    }
}

struct Poller {
    id: usize,
    client: Arc<dyn ReadClient>,
    options: ConsumerOptions,
    received: Arc<AtomicU64>,
    cancel: CancellationToken,
    stop: CancellationToken,
}

impl Poller {
    async fn run(self, tx: mpsc::Sender<WireMessage>) {
        loop {
            match self.client.read(self.options.poll_timeout).await {
                Ok(message) => {
                    if !self.options.auto_commit {
                        if let Err(err) = self.client.commit(&message).await {
                            tracing::warn!(
                                placement = %message.partition_info(),
                                error = %err,
                                "commit failed"
                            );
                        }
                    }
                    self.received.fetch_add(1, Ordering::AcqRel);
                    // A full queue stalls polling until the drain task catches up.
                    if tx.send(message).await.is_err() {
                        break;
                    }
                }
                Err(err) if err.is_timeout() => {}
                Err(ClientError::Closed) => {
                    tracing::debug!(worker = self.id, "reader closed");
                    break;
                }
                Err(err) => {
                    tracing::error!(
                        worker = self.id,
                        timeout = ?self.options.poll_timeout,
                        error = %err,
                        "error consuming messages"
                    );
                }
            }
            if self.cancel.is_cancelled() || self.stop.is_cancelled() {
                tracing::debug!(worker = self.id, "polling stopped");
                break;
            }
            if self.options.poll_yield.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.options.poll_yield).await;
            }
        }
    }
}

async fn close_all(clients: &[Arc<dyn ReadClient>]) {
    for (id, client) in clients.iter().enumerate() {
        if let Err(err) = client.close().await {
            tracing::warn!(id, error = %err, "error closing reader");
        }
    }
}

async fn drain(mut rx: mpsc::Receiver<WireMessage>, callbacks: Vec<Arc<dyn Callback>>) {
    while let Some(message) = rx.recv().await {
        let record = Record::new(message);
        for callback in &callbacks {
            callback.call(&record).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::from_fn;
    use bytes::Bytes;
    use lossprobe_client::{InMemoryBroker, PublishClient};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const TOPIC: &str = "consumer_test";

    fn options(concurrency: usize, auto_commit: bool) -> ConsumerOptions {
        let mut options = ConsumerOptions::new(TOPIC);
        options.concurrency = concurrency;
        options.auto_commit = auto_commit;
        options.poll_timeout = Duration::from_millis(20);
        options.poll_yield = Duration::ZERO;
        options
    }

    async fn open(broker: &InMemoryBroker, options: ConsumerOptions) -> ConsumerEngine {
        let broker = broker.clone();
        let auto_commit = options.auto_commit;
        ConsumerEngine::open(options, Telemetry::new(TOPIC), move |_| {
            let reader: Arc<dyn ReadClient> = Arc::new(broker.reader("group", auto_commit));
            Ok(reader)
        })
        .await
        .expect("open")
    }

    async fn wait_for(count: &AtomicUsize, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while count.load(Ordering::SeqCst) < expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("callbacks in time");
    }

    #[tokio::test]
    async fn every_record_reaches_callbacks_once() {
        let broker = InMemoryBroker::new();
        let mut consumer = open(&broker, options(3, true)).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        consumer.register(from_fn(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        let cancel = CancellationToken::new();
        consumer.run(&cancel).expect("run");

        let publisher = broker.publisher();
        for _ in 0..30 {
            publisher
                .publish(WireMessage::new(TOPIC, Bytes::from_static(b"x")))
                .await
                .expect("publish");
        }
        wait_for(&calls, 30).await;
        cancel.cancel();
        consumer.close().await.expect("close");

        assert_eq!(calls.load(Ordering::SeqCst), 30);
        assert_eq!(consumer.received(), 30);
        assert_eq!(consumer.state(), EngineState::Closed);
    }

    #[tokio::test]
    async fn callbacks_run_in_registration_order() {
        let broker = InMemoryBroker::new();
        let mut consumer = open(&broker, options(1, true)).await;
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let order = Arc::clone(&order);
            consumer.register(from_fn(move |_| order.lock().push(tag)));
        }
        consumer.run(&CancellationToken::new()).expect("run");
        broker
            .publisher()
            .publish(WireMessage::new(TOPIC, Bytes::from_static(b"x")))
            .await
            .expect("publish");
        tokio::time::timeout(Duration::from_secs(5), async {
            while order.lock().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("callbacks in time");
        consumer.close().await.expect("close");
        assert_eq!(*order.lock(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn manual_commit_happens_on_read() {
        let broker = InMemoryBroker::with_partitions(1);
        let consumer = open(&broker, options(1, false)).await;
        consumer.run(&CancellationToken::new()).expect("run");
        broker
            .publisher()
            .publish(WireMessage::new(TOPIC, Bytes::from_static(b"x")))
            .await
            .expect("publish");
        tokio::time::timeout(Duration::from_secs(5), async {
            while consumer.received() < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("read in time");
        consumer.close().await.expect("close");
        assert_eq!(broker.committed("group", TOPIC, 0), Some(1));
    }

    // Reader whose failures are set up per test. Reads fail with a transport
    // error `read_errors` times, then yield the queued record once, then time out.
    #[derive(Default)]
    struct ScriptedReader {
        refuse_subscribe: bool,
        fail_commit: bool,
        read_errors: AtomicUsize,
        record: parking_lot::Mutex<Option<WireMessage>>,
        commits: AtomicUsize,
        closes: Arc<AtomicUsize>,
    }

    impl ScriptedReader {
        fn closing_into(closes: &Arc<AtomicUsize>) -> Self {
            Self {
                closes: Arc::clone(closes),
                ..Self::default()
            }
        }
    }

    #[async_trait::async_trait]
    impl ReadClient for ScriptedReader {
        async fn subscribe(&self, _topics: &[String]) -> lossprobe_client::Result<()> {
            if self.refuse_subscribe {
                return Err(ClientError::Transport("unknown topic".to_string()));
            }
            Ok(())
        }

        async fn read(&self, timeout: Duration) -> lossprobe_client::Result<WireMessage> {
            let remaining = self.read_errors.load(Ordering::SeqCst);
            if remaining > 0 {
                self.read_errors.store(remaining - 1, Ordering::SeqCst);
                return Err(ClientError::Transport("broker unavailable".to_string()));
            }
            if let Some(record) = self.record.lock().take() {
                return Ok(record);
            }
            tokio::time::sleep(timeout).await;
            Err(ClientError::TimedOut)
        }

        async fn commit(&self, _message: &WireMessage) -> lossprobe_client::Result<()> {
            self.commits.fetch_add(1, Ordering::SeqCst);
            if self.fail_commit {
                return Err(ClientError::Transport("commit rejected".to_string()));
            }
            Ok(())
        }

        async fn close(&self) -> lossprobe_client::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn subscribe_failure_is_fatal() {
        let closes = Arc::new(AtomicUsize::new(0));
        let shared = Arc::clone(&closes);
        let result = ConsumerEngine::open(options(3, true), Telemetry::new(TOPIC), move |index| {
            let reader = ScriptedReader {
                refuse_subscribe: index == 1,
                ..ScriptedReader::closing_into(&shared)
            };
            let reader: Arc<dyn ReadClient> = Arc::new(reader);
            Ok(reader)
        })
        .await;
        assert!(matches!(result, Err(EngineError::Subscribe { index: 1, .. })));
        // Both the subscribed reader and the refusing one are closed.
        assert_eq!(closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn connect_failure_is_fatal() {
        let closes = Arc::new(AtomicUsize::new(0));
        let shared = Arc::clone(&closes);
        let result = ConsumerEngine::open(options(3, true), Telemetry::new(TOPIC), move |index| {
            if index == 2 {
                Err(ClientError::Transport("refused".to_string()))
            } else {
                let reader: Arc<dyn ReadClient> = Arc::new(ScriptedReader::closing_into(&shared));
                Ok(reader)
            }
        })
        .await;
        assert!(matches!(result, Err(EngineError::Connect { index: 2, .. })));
        assert_eq!(closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn read_errors_do_not_stop_polling() {
        let reader = Arc::new(ScriptedReader {
            fail_commit: true,
            read_errors: AtomicUsize::new(3),
            record: parking_lot::Mutex::new(Some(WireMessage::new(
                TOPIC,
                Bytes::from_static(b"after errors"),
            ))),
            ..ScriptedReader::default()
        });
        let handle: Arc<dyn ReadClient> = reader.clone();
        let mut consumer = ConsumerEngine::open(options(1, false), Telemetry::new(TOPIC), move |_| {
            Ok(Arc::clone(&handle))
        })
        .await
        .expect("open");
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        consumer.register(from_fn(move |record| {
            assert_eq!(record.wire().payload, Bytes::from_static(b"after errors"));
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        consumer.run(&CancellationToken::new()).expect("run");

        wait_for(&calls, 1).await;
        consumer.close().await.expect("close");
        assert_eq!(reader.read_errors.load(Ordering::SeqCst), 0);
        assert_eq!(reader.commits.load(Ordering::SeqCst), 1);
        assert_eq!(consumer.received(), 1);
        assert_eq!(reader.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_ends_polling_without_cancel() {
        let broker = InMemoryBroker::new();
        let consumer = open(&broker, options(2, true)).await;
        let cancel = CancellationToken::new();
        consumer.run(&cancel).expect("run");
        tokio::time::timeout(Duration::from_secs(5), consumer.close())
            .await
            .expect("close in time")
            .expect("close");
        assert!(!cancel.is_cancelled());
    }
}
