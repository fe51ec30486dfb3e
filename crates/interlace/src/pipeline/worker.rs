// Delivery Worker
//
// Shared pipeline state plus the background loop that drains it. A drain
// is triggered by the flush interval or by the queue reaching the batch
// size, whichever comes first. Deliveries are serialized by an async lock
// so a flush waits for whatever batch is already in flight.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::queue::{Batch, DeliveryQueue, QueueItem};
use super::retry::RetryPolicy;
use super::transport::Transport;
use super::{DeliveryNotice, PipelineStats};
use crate::logging::Diagnostics;

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    evicted: AtomicU64,
    in_flight: AtomicU64,
}

pub(crate) struct Shared {
    queue: Mutex<DeliveryQueue>,
    wake: Notify,
    delivery: tokio::sync::Mutex<()>,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    max_batch_size: usize,
    diagnostics: Diagnostics,
    notices: broadcast::Sender<DeliveryNotice>,
    counters: Counters,
    closed: AtomicBool,
}

impl Shared {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        retry: RetryPolicy,
        queue_capacity: usize,
        max_batch_size: usize,
        diagnostics: Diagnostics,
    ) -> Self {
        let (notices, _) = broadcast::channel(256);
        Self {
            queue: Mutex::new(DeliveryQueue::new(queue_capacity)),
            wake: Notify::new(),
            delivery: tokio::sync::Mutex::new(()),
            transport,
            retry,
            max_batch_size: max_batch_size.max(1),
            diagnostics,
            notices,
            counters: Counters::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<DeliveryNotice> {
        self.notices.subscribe()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn high_water_mark(&self) -> u64 {
        self.queue.lock().high_water_mark()
    }

    pub(crate) fn enqueue(&self, item: QueueItem) {
        if self.is_closed() {
            debug!(kind = item.kind(), id = %item.id(), "Pipeline closed, item ignored");
            return;
        }

        let (evicted, len) = {
            let mut queue = self.queue.lock();
            let evicted = queue.push(item);
            (evicted, queue.len())
        };
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);

        if let Some(evicted) = evicted {
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
            if self.diagnostics.is_debug() {
                warn!(kind = evicted.kind(), id = %evicted.id(), "Delivery queue full, oldest item evicted");
            } else {
                debug!(kind = evicted.kind(), id = %evicted.id(), "Delivery queue full, oldest item evicted");
            }
            let _ = self.notices.send(DeliveryNotice::Evicted {
                kind: evicted.kind(),
                id: evicted.id().to_string(),
            });
        }

        if len >= self.max_batch_size {
            self.wake.notify_one();
        }
    }

    /// Deliver every queued item pushed at or before `mark`
    pub(crate) async fn deliver_through(&self, mark: u64) {
        let _guard = self.delivery.lock().await;
        loop {
            let items = {
                let mut queue = self.queue.lock();
                let items = queue.drain_through(mark, self.max_batch_size);
                self.counters
                    .in_flight
                    .fetch_add(items.len() as u64, Ordering::Relaxed);
                items
            };
            if items.is_empty() {
                break;
            }
            self.deliver_batch(Batch::from_items(items)).await;
        }
    }

    async fn deliver_batch(&self, batch: Batch) {
        let size = batch.len() as u64;
        let mut attempt = 1;

        loop {
            match self.transport.send(&batch).await {
                Ok(()) => {
                    debug!(transport = self.transport.name(), batch_size = size, attempt, "Batch delivered");
                    self.counters.delivered.fetch_add(size, Ordering::Relaxed);
                    break;
                }
                Err(e) if e.is_transient() && self.retry.can_resend(attempt) => {
                    attempt += 1;
                    let delay = self.retry.wait_before(attempt);
                    debug!(
                        transport = self.transport.name(),
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Batch delivery failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    debug!(
                        transport = self.transport.name(),
                        error = %e,
                        batch_size = size,
                        attempts = attempt,
                        "Batch dropped"
                    );
                    self.diagnostics.absorb(&e, "batch delivery");
                    self.counters.dropped.fetch_add(size, Ordering::Relaxed);
                    let _ = self.notices.send(DeliveryNotice::Dropped {
                        items: size as usize,
                        attempts: attempt,
                        error: e,
                    });
                    break;
                }
            }
        }

        self.counters.in_flight.fetch_sub(size, Ordering::Relaxed);
    }

    pub(crate) fn stats(&self) -> PipelineStats {
        let queued = self.queue.lock().len() as u64;
        PipelineStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            pending: queued + self.counters.in_flight.load(Ordering::Relaxed),
        }
    }
}

/// Background drain loop; exits when `cancel` fires
pub(crate) async fn run(shared: Arc<Shared>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            _ = shared.wake.notified() => {}
        }

        let mark = shared.high_water_mark();
        shared.deliver_through(mark).await;
    }

    debug!("Delivery worker stopped");
}
