//! Fire-and-forget ingestion path for usage records.
//!
//! Callers on the request path hand records to a bounded broadcast buffer and
//! return immediately. When the ingest task falls behind, the oldest buffered
//! records are overwritten; the loss is logged and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{SharedPerformanceTracker, UsageRecord};

#[derive(Clone)]
pub struct UsageSink {
    sender: broadcast::Sender<UsageRecord>,
    dropped: Arc<AtomicU64>,
}

impl UsageSink {
    /// Start the ingest task feeding `tracker`. The task exits once every
    /// sink clone has been dropped and the buffer is drained.
    pub fn spawn(tracker: SharedPerformanceTracker, capacity: usize) -> (Self, JoinHandle<()>) {
        let (sender, mut rx) = broadcast::channel::<UsageRecord>(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&dropped);

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(record) => {
                        let model_id = record.model_id.clone();
                        if let Err(e) = tracker.record(record) {
                            warn!(model_id = %model_id, error = %e, "Discarding malformed usage record");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        counter.fetch_add(skipped, Ordering::Relaxed);
                        warn!(skipped, "Usage buffer overflowed, oldest records dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Usage sink closed");
                        break;
                    }
                }
            }
        });

        (Self { sender, dropped }, handle)
    }

    /// Enqueue a record. Never blocks and never fails the caller.
    pub fn record(&self, record: UsageRecord) {
        if self.sender.send(record).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("Usage ingest task is gone, record dropped");
        }
    }

    /// Records lost to overflow or a stopped ingest task.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
