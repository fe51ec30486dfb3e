// Buffering & Delivery Pipeline
//
// Completed interactions, standalone events, signals and identify calls are
// queued in memory and delivered to the collector in batches by a
// background worker.
//
// Per batch: pending -> in-flight -> delivered, or
// in-flight -> retry-wait -> in-flight ... -> dropped. Permanent failures
// drop immediately. Evictions and drops are published as DeliveryNotices.

mod queue;
mod retry;
mod transport;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use interlace_core::{PluginHub, Result, TracerError};

use crate::config::TracerConfig;
use crate::logging::Diagnostics;

pub use queue::{Batch, DeliveryQueue, QueueItem};
pub use retry::RetryPolicy;
pub use transport::{HttpTransport, Transport};

use worker::Shared;

/// Failure-channel message for telemetry that will not reach the collector
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryNotice {
    /// The queue was full and its oldest item was discarded
    Evicted { kind: &'static str, id: String },
    /// A batch failed permanently or exhausted its retries
    Dropped {
        items: usize,
        attempts: u32,
        error: TracerError,
    },
}

/// Delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Items accepted into the queue
    pub enqueued: u64,
    /// Items acknowledged by the collector
    pub delivered: u64,
    /// Items in dropped batches
    pub dropped: u64,
    /// Items discarded by queue overflow
    pub evicted: u64,
    /// Items queued or in flight
    pub pending: u64,
}

/// Pipeline tuning taken from the tracer configuration
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub flush_interval: Duration,
    pub max_batch_size: usize,
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
    pub debug: bool,
}

impl PipelineSettings {
    pub fn from_config(config: &TracerConfig) -> Self {
        Self {
            flush_interval: config.flush_interval,
            max_batch_size: config.max_batch_size,
            queue_capacity: config.queue_capacity,
            retry: config.retry.clone(),
            debug: config.debug,
        }
    }
}

/// Owner of the delivery queue and its background worker
pub struct Pipeline {
    shared: Arc<Shared>,
    hub: Arc<PluginHub>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    closing: OnceCell<()>,
}

impl Pipeline {
    /// Start the pipeline; requires a Tokio runtime for the worker
    pub fn start(
        settings: PipelineSettings,
        transport: Arc<dyn Transport>,
        hub: Arc<PluginHub>,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            TracerError::config("the delivery pipeline must be started inside a Tokio runtime")
        })?;

        let shared = Arc::new(Shared::new(
            transport,
            settings.retry,
            settings.queue_capacity,
            settings.max_batch_size,
            Diagnostics::new(settings.debug),
        ));
        let cancel = CancellationToken::new();
        let worker = runtime.spawn(worker::run(
            shared.clone(),
            settings.flush_interval,
            cancel.clone(),
        ));

        Ok(Self {
            shared,
            hub,
            cancel,
            worker: Mutex::new(Some(worker)),
            closing: OnceCell::new(),
        })
    }

    /// Queue an item; a no-op once the pipeline is closed
    pub fn enqueue(&self, item: QueueItem) {
        self.shared.enqueue(item);
    }

    /// Deliver everything queued at the time of the call, then flush plugins
    ///
    /// Items enqueued while the flush runs wait for the next drain.
    pub async fn flush(&self) {
        let mark = self.shared.high_water_mark();
        self.shared.deliver_through(mark).await;
        if !self.hub.is_shut_down() {
            self.hub.flush().await;
        }
    }

    /// Flush, shut plugins down, then stop accepting items
    ///
    /// Idempotent; concurrent callers all wait for the first close.
    pub async fn close(&self) {
        self.closing
            .get_or_init(|| async {
                self.flush().await;
                self.hub.shutdown().await;
                self.shared.mark_closed();

                self.cancel.cancel();
                let worker = self.worker.lock().take();
                if let Some(worker) = worker {
                    let _ = worker.await;
                }

                // Anything that raced in between the flush and the close mark
                self.shared.deliver_through(u64::MAX).await;
                debug!(stats = ?self.shared.stats(), "Pipeline closed");
            })
            .await;
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.stats()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryNotice> {
        self.shared.subscribe()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stats", &self.stats())
            .field("closed", &self.is_closed())
            .finish()
    }
}
