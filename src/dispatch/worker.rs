//! The single background worker that paces transmissions.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Mutex, Notify, OwnedMutexGuard};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use super::dispatcher::{DispatcherState, DispatcherStats};
use super::item::{ItemId, QueuedItem};
use super::queue::SubmissionQueue;
use crate::error::{SerializationError, TransportError};
use crate::ratelimit::{Admission, WindowTracker};
use crate::transport::{PayloadSerializer, Transport};

/// Message from a finished transmission back to the worker.
pub(crate) enum Completion<P> {
    Delivered(ItemId),
    Failed {
        item: QueuedItem<P>,
        reason: FailureReason,
    },
}

/// Why a transmission counts as failed.
#[derive(Debug)]
pub(crate) enum FailureReason {
    Status(u16),
    Transport(TransportError),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Status(status) => write!(f, "status {}", status),
            FailureReason::Transport(err) => write!(f, "{}", err),
        }
    }
}

#[derive(Default)]
pub(crate) struct Counters {
    pub submitted: AtomicU64,
    pub sent: AtomicU64,
    pub delivered: AtomicU64,
    pub retried: AtomicU64,
    pub dropped_malformed: AtomicU64,
    pub workers_started: AtomicU64,
}

/// State shared between the submitting callers, the worker and the
/// transmission tasks of one dispatcher instance.
pub(crate) struct DispatchContext<P> {
    pub queue: SubmissionQueue<P>,
    pub window: WindowTracker,
    /// Ids of items whose transmission has been issued, with the issue time.
    pub in_flight: DashMap<ItemId, Instant>,
    /// True while a worker owns the processing loop.
    pub running: AtomicBool,
    pub phase: watch::Sender<DispatcherState>,
    pub work_ready: Notify,
    pub completion_tx: mpsc::UnboundedSender<Completion<P>>,
    /// Held by the active worker for its whole lifetime.
    pub completion_rx: Arc<Mutex<mpsc::UnboundedReceiver<Completion<P>>>>,
    pub transport: Arc<dyn Transport>,
    pub serializer: Arc<dyn PayloadSerializer<P>>,
    pub success_status: u16,
    pub counters: Counters,
    pub runtime: Handle,
}

impl<P: Send + 'static> DispatchContext<P> {
    /// The `Idle -> Running` transition. Exactly one caller wins.
    pub fn try_start(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// The phase is read last: an item between dequeue and the in-flight
    /// insert is only covered by the worker still being `Running`.
    pub fn is_drained(&self) -> bool {
        self.queue.is_empty()
            && self.in_flight.is_empty()
            && matches!(
                *self.phase.borrow(),
                DispatcherState::Idle | DispatcherState::Stopped
            )
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            submitted: self.counters.submitted.load(Ordering::SeqCst),
            sent: self.counters.sent.load(Ordering::SeqCst),
            delivered: self.counters.delivered.load(Ordering::SeqCst),
            retried: self.counters.retried.load(Ordering::SeqCst),
            dropped_malformed: self.counters.dropped_malformed.load(Ordering::SeqCst),
            workers_started: self.counters.workers_started.load(Ordering::SeqCst),
            queued: self.queue.len(),
            in_flight: self.in_flight.len(),
            window_occupancy: self.window.occupancy(),
        }
    }

    fn set_phase(&self, phase: DispatcherState) {
        self.phase.send_replace(phase);
    }

    /// `Draining`: give up the running flag, then look once more for work
    /// that raced in. Returns `true` when the worker should exit.
    fn try_stop(&self) -> bool {
        self.set_phase(DispatcherState::Draining);
        self.running.store(false, Ordering::SeqCst);

        // A submit that enqueued before the store above either sees the flag
        // still set (and relies on us) or wins the CAS itself. Check for the
        // first case.
        if !self.queue.is_empty() && self.try_start() {
            debug!("Work arrived while draining, resuming");
            self.set_phase(DispatcherState::Running);
            return false;
        }

        self.set_phase(DispatcherState::Stopped);
        true
    }

    fn apply(&self, completion: Completion<P>) {
        match completion {
            Completion::Delivered(id) => {
                self.counters.delivered.fetch_add(1, Ordering::SeqCst);
                let issued = self.in_flight.remove(&id).map(|(_, at)| at);
                debug!(
                    item_id = %id,
                    latency_ms = issued.map(|at| at.elapsed().as_millis() as u64),
                    "Document delivered"
                );
            }
            Completion::Failed { item, reason } => {
                let id = item.id();
                self.counters.retried.fetch_add(1, Ordering::SeqCst);
                self.queue.enqueue(item);
                self.in_flight.remove(&id);
                warn!(item_id = %id, reason = %reason, "Send failed, requeued at tail");
            }
        }
    }

    /// Serialize, account for and launch one transmission.
    fn dispatch(&self, item: QueuedItem<P>) {
        let id = item.id();
        let serialized = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.serializer.serialize(item.payload())
        }))
        .unwrap_or_else(|_| Err(SerializationError("serializer panicked".to_string())));

        let body = match serialized {
            Ok(body) => body,
            Err(err) => {
                self.counters.dropped_malformed.fetch_add(1, Ordering::SeqCst);
                warn!(item_id = %id, error = %err, "Dropping document with malformed payload");
                return;
            }
        };

        let now = Instant::now();
        self.counters.sent.fetch_add(1, Ordering::SeqCst);
        self.window.record_at(now);
        self.in_flight.insert(id, now);
        trace!(item_id = %id, bytes = body.len(), "Issuing send");

        let transport = self.transport.clone();
        let completion_tx = self.completion_tx.clone();
        let success_status = self.success_status;

        self.runtime.spawn(async move {
            let result = AssertUnwindSafe(transport.send(body, item.credential()))
                .catch_unwind()
                .await;

            let completion = match result {
                Ok(Ok(response)) if response.status == success_status => {
                    Completion::Delivered(item.id())
                }
                Ok(Ok(response)) => Completion::Failed {
                    item,
                    reason: FailureReason::Status(response.status),
                },
                Ok(Err(err)) => Completion::Failed {
                    item,
                    reason: FailureReason::Transport(err),
                },
                Err(_) => Completion::Failed {
                    item,
                    reason: FailureReason::Transport(TransportError::Panicked),
                },
            };

            // The context owns a receiver, so this only fails once the whole
            // dispatcher is gone.
            let _ = completion_tx.send(completion);
        });
    }
}

/// Resets the running flag if the worker exits without draining, and
/// starts a replacement when items are still queued.
pub(crate) struct RunningGuard<P: Send + 'static> {
    ctx: Arc<DispatchContext<P>>,
    armed: bool,
}

impl<P: Send + 'static> RunningGuard<P> {
    pub(crate) fn new(ctx: Arc<DispatchContext<P>>) -> Self {
        Self { ctx, armed: true }
    }
}

impl<P: Send + 'static> Drop for RunningGuard<P> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!("Dispatcher worker exited abnormally, releasing running flag");
        self.ctx.set_phase(DispatcherState::Stopped);
        self.ctx.running.store(false, Ordering::SeqCst);

        // Queued items must not wait for the next submit.
        if !self.ctx.queue.is_empty() && self.ctx.try_start() {
            warn!(queued = self.ctx.queue.len(), "Restarting dispatcher worker");
            self.ctx.runtime.spawn(run_worker(self.ctx.clone()));
        }
    }
}

/// Main worker loop.
///
/// The worker:
/// - applies finished transmissions (requeue on failure)
/// - waits for the window to admit a send, never for a send to finish
/// - stops once the queue and the in-flight set are both empty
pub(crate) async fn run_worker<P: Send + 'static>(ctx: Arc<DispatchContext<P>>) {
    let mut guard = RunningGuard::new(ctx.clone());

    // A previous worker may still be between its final check and its exit.
    let mut completions = ctx.completion_rx.clone().lock_owned().await;

    ctx.set_phase(DispatcherState::Running);
    ctx.counters.workers_started.fetch_add(1, Ordering::SeqCst);
    info!(queued = ctx.queue.len(), "Dispatcher worker started");

    loop {
        while let Ok(completion) = completions.try_recv() {
            ctx.apply(completion);
        }

        if ctx.queue.is_empty() {
            if ctx.in_flight.is_empty() {
                if ctx.try_stop() {
                    break;
                }
                continue;
            }

            tokio::select! {
                Some(completion) = completions.recv() => ctx.apply(completion),
                _ = ctx.work_ready.notified() => {}
            }
            continue;
        }

        if let Admission::Wait(wait) = ctx.window.admit() {
            debug!(
                wait_ms = wait.as_millis() as u64,
                queued = ctx.queue.len(),
                "Rate limit reached, waiting for window"
            );
            sleep_applying_completions(&ctx, &mut completions, Instant::now() + wait).await;
            continue;
        }

        let Some(item) = ctx.queue.try_dequeue() else {
            continue;
        };
        ctx.dispatch(item);
    }

    guard.armed = false;
    info!("Dispatcher worker drained and stopped");
}

/// Sleep until `deadline`, applying completions as they arrive so retries
/// join the queue without waiting for the timer.
async fn sleep_applying_completions<P: Send + 'static>(
    ctx: &DispatchContext<P>,
    completions: &mut OwnedMutexGuard<mpsc::UnboundedReceiver<Completion<P>>>,
    deadline: Instant,
) {
    let sleep = sleep_until(deadline);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return,
            Some(completion) = completions.recv() => ctx.apply(completion),
        }
    }
}
