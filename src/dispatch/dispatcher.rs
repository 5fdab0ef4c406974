//! Public submission facade.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tracing::trace;

use super::item::{Credential, ItemId, QueuedItem};
use super::queue::SubmissionQueue;
use super::worker::{run_worker, Counters, DispatchContext};
use crate::error::{DocpacerError, Result};
use crate::ratelimit::{RateLimitConfig, WindowTracker};
use crate::transport::{JsonSerializer, PayloadSerializer, Transport};

/// Status code the remote service answers a created document with.
pub const DEFAULT_SUCCESS_STATUS: u16 = 200;

#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    pub rate_limit: RateLimitConfig,
    /// The only status treated as delivered; anything else is retried.
    pub success_status: u16,
}

impl DispatcherConfig {
    pub fn new(rate_limit: RateLimitConfig) -> Self {
        Self {
            rate_limit,
            success_status: DEFAULT_SUCCESS_STATUS,
        }
    }

    pub fn with_success_status(mut self, status: u16) -> Self {
        self.success_status = status;
        self
    }
}

/// Lifecycle of the dispatcher's worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// No worker has ever run.
    Idle,
    Running,
    /// Queue and in-flight set were empty; the worker is releasing the flag.
    Draining,
    /// The worker exited. The next submit starts a new one.
    Stopped,
}

/// Point-in-time counters for one dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub submitted: u64,
    /// Transmissions issued, retries included
    pub sent: u64,
    pub delivered: u64,
    /// Failed transmissions that were requeued
    pub retried: u64,
    pub dropped_malformed: u64,
    pub workers_started: u64,
    pub queued: usize,
    pub in_flight: usize,
    pub window_occupancy: usize,
}

/// Rate-limited, fire-and-forget document submitter.
///
/// `submit` only queues; a single background worker, started on demand,
/// paces transmissions so that no window holds more sends than the
/// configured limit, and retries every failed send until it succeeds.
/// Clones share the same queue, window and worker.
pub struct Dispatcher<P> {
    ctx: Arc<DispatchContext<P>>,
}

impl<P> Clone for Dispatcher<P> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
        }
    }
}

impl<P: Serialize + Send + 'static> Dispatcher<P> {
    /// Create a dispatcher that sends payloads as JSON.
    ///
    /// Must be called from within a Tokio runtime; the worker and the
    /// transmissions are spawned onto it.
    pub fn new(config: DispatcherConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::with_serializer(config, transport, JsonSerializer)
    }
}

impl<P: Send + 'static> Dispatcher<P> {
    /// Create a dispatcher with a custom payload serializer.
    pub fn with_serializer<S>(
        config: DispatcherConfig,
        transport: Arc<dyn Transport>,
        serializer: S,
    ) -> Result<Self>
    where
        S: PayloadSerializer<P> + 'static,
    {
        let runtime = Handle::try_current().map_err(|e| {
            DocpacerError::Runtime(format!("dispatcher requires a Tokio runtime: {}", e))
        })?;
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (phase, _) = watch::channel(DispatcherState::Idle);

        let ctx = Arc::new(DispatchContext {
            queue: SubmissionQueue::new(),
            window: WindowTracker::new(config.rate_limit),
            in_flight: DashMap::new(),
            running: AtomicBool::new(false),
            phase,
            work_ready: Notify::new(),
            completion_tx,
            completion_rx: Arc::new(Mutex::new(completion_rx)),
            transport,
            serializer: Arc::new(serializer),
            success_status: config.success_status,
            counters: Counters::default(),
            runtime,
        });

        Ok(Self { ctx })
    }

    /// Queue a payload for transmission and return immediately.
    ///
    /// Never blocks on the network or the rate limit, and may be called
    /// from any thread. Failures after this point are retried internally
    /// and never reported back to the caller.
    pub fn submit(&self, payload: P, credential: impl Into<Credential>) -> ItemId {
        let item = QueuedItem::new(payload, credential.into());
        let id = item.id();

        self.ctx.queue.enqueue(item);
        self.ctx.counters.submitted.fetch_add(1, Ordering::SeqCst);
        trace!(item_id = %id, "Document queued");

        self.ctx.work_ready.notify_one();
        if self.ctx.try_start() {
            self.ctx.runtime.spawn(run_worker(self.ctx.clone()));
        }

        id
    }

    pub fn state(&self) -> DispatcherState {
        *self.ctx.phase.borrow()
    }

    pub fn stats(&self) -> DispatcherStats {
        self.ctx.stats()
    }

    /// Number of items waiting for admission.
    pub fn queued(&self) -> usize {
        self.ctx.queue.len()
    }

    /// Number of transmissions issued but not yet completed.
    pub fn in_flight(&self) -> usize {
        self.ctx.in_flight.len()
    }

    pub fn rate_limit(&self) -> &RateLimitConfig {
        self.ctx.window.config()
    }

    /// Wait until every submitted item has been delivered or dropped and
    /// the worker has stopped.
    ///
    /// Items submitted while waiting are waited for as well.
    pub async fn wait_until_drained(&self) {
        let mut phase = self.ctx.phase.subscribe();
        loop {
            if self.ctx.is_drained() {
                return;
            }
            if phase.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::worker::RunningGuard;
    use crate::error::{SerializationError, TransportError};
    use crate::ratelimit::TimeUnit;
    use crate::transport::{RawSerializer, TransportResponse};
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use std::collections::{HashMap, VecDeque};
    use std::time::Duration;
    use tokio::time::Instant;

    /// Records every send and answers from a per-body script (default 200).
    #[derive(Default)]
    struct ScriptedTransport {
        sends: SyncMutex<Vec<(String, Instant)>>,
        script: SyncMutex<HashMap<String, VecDeque<Outcome>>>,
    }

    #[derive(Clone, Copy)]
    enum Outcome {
        Status(u16),
        Error,
        Panic,
    }

    impl ScriptedTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn script(&self, body: &str, outcomes: &[Outcome]) {
            self.script
                .lock()
                .insert(body.to_string(), outcomes.iter().copied().collect());
        }

        fn bodies(&self) -> Vec<String> {
            self.sends.lock().iter().map(|(b, _)| b.clone()).collect()
        }

        fn times(&self) -> Vec<Instant> {
            self.sends.lock().iter().map(|(_, t)| *t).collect()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(
            &self,
            body: Vec<u8>,
            _credential: &Credential,
        ) -> std::result::Result<TransportResponse, TransportError> {
            let body = String::from_utf8(body).unwrap();
            self.sends.lock().push((body.clone(), Instant::now()));

            let outcome = self
                .script
                .lock()
                .get_mut(&body)
                .and_then(|outcomes| outcomes.pop_front())
                .unwrap_or(Outcome::Status(200));

            match outcome {
                Outcome::Status(status) => Ok(TransportResponse::new(status)),
                Outcome::Error => Err(TransportError::Connect("refused".to_string())),
                Outcome::Panic => panic!("transport blew up"),
            }
        }
    }

    fn dispatcher(
        transport: Arc<ScriptedTransport>,
        window: Duration,
        max: u32,
    ) -> Dispatcher<&'static str> {
        let config = DispatcherConfig::new(RateLimitConfig::new(window, max).unwrap());
        Dispatcher::with_serializer(config, transport, RawSerializer).unwrap()
    }

    /// No half-open interval of `window` holds more than `max` sends.
    fn assert_rate_bound(times: &[Instant], window: Duration, max: usize) {
        let mut sorted = times.to_vec();
        sorted.sort();
        for (i, start) in sorted.iter().enumerate() {
            let in_window = sorted[i..].iter().take_while(|t| **t - *start < window).count();
            assert!(
                in_window <= max,
                "{} sends within one window starting at index {}",
                in_window,
                i
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_paced_by_window() {
        let transport = ScriptedTransport::new();
        let dispatcher = dispatcher(transport.clone(), Duration::from_secs(1), 3);
        let start = Instant::now();

        for body in ["1", "2", "3", "4", "5"] {
            dispatcher.submit(body, "token");
        }
        dispatcher.wait_until_drained().await;

        let times = transport.times();
        assert_eq!(times.len(), 5);
        for t in &times[..3] {
            assert_eq!(*t, start);
        }
        for t in &times[3..] {
            assert!(*t >= start + Duration::from_secs(1));
        }
        assert_rate_bound(&times, Duration::from_secs(1), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_item_retried_behind_newer_items() {
        let transport = ScriptedTransport::new();
        transport.script("A", &[Outcome::Status(500)]);
        let dispatcher = dispatcher(transport.clone(), Duration::from_secs(1), 10);

        dispatcher.submit("A", "token");
        dispatcher.submit("B", "token");
        dispatcher.submit("C", "token");
        dispatcher.wait_until_drained().await;

        assert_eq!(transport.bodies(), vec!["A", "B", "C", "A"]);
        let stats = dispatcher.stats();
        assert_eq!(stats.submitted, 3);
        assert_eq!(stats.sent, 4);
        assert_eq!(stats.delivered, 3);
        assert_eq!(stats.retried, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let transport = ScriptedTransport::new();
        transport.script(
            "flaky",
            &[
                Outcome::Status(503),
                Outcome::Error,
                Outcome::Status(429),
                Outcome::Status(200),
            ],
        );
        let dispatcher = dispatcher(transport.clone(), Duration::from_millis(100), 1);

        dispatcher.submit("flaky", "token");
        dispatcher.wait_until_drained().await;

        assert_eq!(transport.bodies(), vec!["flaky"; 4]);
        assert_eq!(dispatcher.stats().delivered, 1);
        assert_eq!(dispatcher.stats().retried, 3);
        assert_rate_bound(&transport.times(), Duration::from_millis(100), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_panic_is_retried() {
        let transport = ScriptedTransport::new();
        transport.script("boom", &[Outcome::Panic]);
        let dispatcher = dispatcher(transport.clone(), Duration::from_secs(1), 5);

        dispatcher.submit("boom", "token");
        dispatcher.wait_until_drained().await;

        assert_eq!(transport.bodies(), vec!["boom", "boom"]);
        assert_eq!(dispatcher.stats().delivered, 1);
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_success_status() {
        let transport = ScriptedTransport::new();
        transport.script("doc", &[Outcome::Status(200), Outcome::Status(201)]);
        let config = DispatcherConfig::new(RateLimitConfig::per_unit(TimeUnit::Second, 5).unwrap())
            .with_success_status(201);
        let dispatcher: Dispatcher<&'static str> =
            Dispatcher::with_serializer(config, transport.clone(), RawSerializer).unwrap();

        dispatcher.submit("doc", "token");
        dispatcher.wait_until_drained().await;

        assert_eq!(transport.bodies(), vec!["doc", "doc"]);
    }

    struct RejectingSerializer;

    impl PayloadSerializer<&'static str> for RejectingSerializer {
        fn serialize(&self, payload: &&'static str) -> std::result::Result<Vec<u8>, SerializationError> {
            if *payload == "bad" {
                return Err(SerializationError("unsupported document".to_string()));
            }
            Ok(payload.as_bytes().to_vec())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_payload_dropped_without_consuming_quota() {
        let transport = ScriptedTransport::new();
        let config = DispatcherConfig::new(RateLimitConfig::new(Duration::from_secs(1), 1).unwrap());
        let dispatcher =
            Dispatcher::with_serializer(config, transport.clone(), RejectingSerializer).unwrap();
        let start = Instant::now();

        dispatcher.submit("bad", "token");
        dispatcher.submit("good", "token");
        dispatcher.wait_until_drained().await;

        assert_eq!(transport.bodies(), vec!["good"]);
        assert_eq!(transport.times(), vec![start]);
        let stats = dispatcher.stats();
        assert_eq!(stats.dropped_malformed, 1);
        assert_eq!(stats.delivered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_json_payloads() {
        let transport = ScriptedTransport::new();
        let config = DispatcherConfig::new(RateLimitConfig::new(Duration::from_secs(1), 5).unwrap());
        let dispatcher: Dispatcher<HashMap<&'static str, u32>> =
            Dispatcher::new(config, transport.clone()).unwrap();

        dispatcher.submit(HashMap::from([("doc_id", 7)]), "token");
        dispatcher.wait_until_drained().await;

        assert_eq!(transport.bodies(), vec![r#"{"doc_id":7}"#]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_worker_for_burst() {
        let transport = ScriptedTransport::new();
        let dispatcher = dispatcher(transport.clone(), Duration::from_millis(10), 4);

        let submitters: Vec<_> = (0..20)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    for _ in 0..5 {
                        dispatcher.submit("x", "token");
                    }
                })
            })
            .collect();
        for submitter in submitters {
            submitter.await.unwrap();
        }
        dispatcher.wait_until_drained().await;

        let stats = dispatcher.stats();
        assert_eq!(stats.delivered, 100);
        assert_eq!(stats.workers_started, 1);
        assert_rate_bound(&transport.times(), Duration::from_millis(10), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarts_after_drain() {
        let transport = ScriptedTransport::new();
        let dispatcher = dispatcher(transport.clone(), Duration::from_secs(1), 5);
        assert_eq!(dispatcher.state(), DispatcherState::Idle);

        dispatcher.submit("first", "token");
        dispatcher.wait_until_drained().await;
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);

        dispatcher.submit("second", "token");
        dispatcher.wait_until_drained().await;

        assert_eq!(transport.bodies(), vec!["first", "second"]);
        assert_eq!(dispatcher.stats().workers_started, 2);
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_while_sends_in_flight_wakes_worker() {
        struct SlowTransport;

        #[async_trait]
        impl Transport for SlowTransport {
            async fn send(
                &self,
                _body: Vec<u8>,
                _credential: &Credential,
            ) -> std::result::Result<TransportResponse, TransportError> {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(TransportResponse::new(200))
            }
        }

        let config = DispatcherConfig::new(RateLimitConfig::new(Duration::from_secs(1), 5).unwrap());
        let dispatcher: Dispatcher<&'static str> =
            Dispatcher::with_serializer(config, Arc::new(SlowTransport), RawSerializer).unwrap();

        dispatcher.submit("a", "token");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(dispatcher.in_flight(), 1);

        // The worker is parked on the in-flight send; new work must not wait
        // for it to complete.
        dispatcher.submit("b", "token");
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(dispatcher.in_flight(), 2);
        assert_eq!(dispatcher.stats().workers_started, 1);

        dispatcher.wait_until_drained().await;
        assert_eq!(dispatcher.stats().delivered, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submitters_lose_nothing() {
        let transport = ScriptedTransport::new();
        let dispatcher = dispatcher(transport.clone(), Duration::from_millis(20), 50);

        for round in 0..20 {
            let threads: Vec<_> = (0..4)
                .map(|_| {
                    let dispatcher = dispatcher.clone();
                    std::thread::spawn(move || {
                        for _ in 0..5 {
                            dispatcher.submit("x", "token");
                        }
                    })
                })
                .collect();
            for thread in threads {
                thread.join().unwrap();
            }

            tokio::time::timeout(Duration::from_secs(5), dispatcher.wait_until_drained())
                .await
                .unwrap_or_else(|_| panic!("round {} did not drain", round));
        }

        let stats = dispatcher.stats();
        assert_eq!(stats.submitted, 400);
        assert_eq!(stats.sent, 400);
        assert_eq!(stats.delivered, 400);
        assert_eq!(transport.bodies().len(), 400);
    }

    struct PanickingSerializer;

    impl PayloadSerializer<&'static str> for PanickingSerializer {
        fn serialize(&self, payload: &&'static str) -> std::result::Result<Vec<u8>, SerializationError> {
            if *payload == "boom" {
                panic!("serializer blew up");
            }
            Ok(payload.as_bytes().to_vec())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_serializer_panic_drops_item_and_keeps_worker() {
        let transport = ScriptedTransport::new();
        let config = DispatcherConfig::new(RateLimitConfig::new(Duration::from_secs(1), 5).unwrap());
        let dispatcher =
            Dispatcher::with_serializer(config, transport.clone(), PanickingSerializer).unwrap();

        dispatcher.submit("boom", "token");
        dispatcher.submit("after", "token");
        tokio::time::timeout(Duration::from_secs(30), dispatcher.wait_until_drained())
            .await
            .expect("dispatcher did not drain");

        assert_eq!(transport.bodies(), vec!["after"]);
        let stats = dispatcher.stats();
        assert_eq!(stats.dropped_malformed, 1);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.workers_started, 1);
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abnormal_worker_exit_restarts_for_queued_items() {
        let transport = ScriptedTransport::new();
        let dispatcher = dispatcher(transport.clone(), Duration::from_secs(1), 5);

        // Hold the flag so the submit below only queues.
        assert!(dispatcher.ctx.try_start());
        dispatcher.submit("stranded", "token");
        assert_eq!(dispatcher.stats().workers_started, 0);

        let ctx = dispatcher.ctx.clone();
        let crashed = tokio::spawn(async move {
            let _guard = RunningGuard::new(ctx);
            panic!("worker fault");
        });
        assert!(crashed.await.is_err());

        tokio::time::timeout(Duration::from_secs(30), dispatcher.wait_until_drained())
            .await
            .expect("queued item was stranded");

        assert_eq!(transport.bodies(), vec!["stranded"]);
        assert_eq!(dispatcher.stats().workers_started, 1);
        assert_eq!(dispatcher.stats().delivered, 1);
    }

    #[test]
    fn test_construction_requires_runtime() {
        let transport = ScriptedTransport::new();
        let config = DispatcherConfig::new(RateLimitConfig::new(Duration::from_secs(1), 1).unwrap());
        let result: Result<Dispatcher<&'static str>> =
            Dispatcher::with_serializer(config, transport, RawSerializer);
        assert!(matches!(result, Err(DocpacerError::Runtime(_))));
    }
}
