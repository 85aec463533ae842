//! Background indexing work queue.
//!
//! A bounded channel feeds one worker task that handles items strictly in
//! order, so background passes never overlap. A `watch` channel publishes
//! the number of items enqueued but not yet finished; `drain` waits for it
//! to reach zero.

use std::sync::{Arc, Weak};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

/// Default channel capacity.
pub const QUEUE_CAPACITY: usize = 64;

/// A unit of background indexing work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkItem {
    /// Reindex exactly these workspace-relative paths.
    Paths(Vec<String>),
    /// Drop these paths from the index.
    Remove(Vec<String>),
    /// Run a change-detection pass.
    Refresh { force: bool },
}

/// Consumer of work items.
#[async_trait]
pub trait WorkHandler: Send + Sync + 'static {
    async fn handle(&self, item: WorkItem) -> Result<()>;
}

#[derive(Debug, thiserror::Error)]
#[error("work queue closed")]
pub struct QueueClosed;

pub struct WorkQueue {
    tx: mpsc::Sender<WorkItem>,
    pending: Arc<watch::Sender<usize>>,
}

impl WorkQueue {
    /// Spawn the worker. It stops when the handler is dropped or every
    /// queue handle is gone.
    pub fn spawn(capacity: usize, handler: Weak<dyn WorkHandler>) -> Self {
        let (tx, mut rx) = mpsc::channel::<WorkItem>(capacity.max(1));
        let (pending, _) = watch::channel(0usize);
        let pending = Arc::new(pending);

        let worker_pending = pending.clone();
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                let Some(handler) = handler.upgrade() else {
                    debug!("Work handler dropped, stopping worker");
                    break;
                };
                debug!(?item, "Processing background work");
                if let Err(e) = handler.handle(item).await {
                    error!("Background indexing failed: {:#}", e);
                }
                drop(handler);
                worker_pending.send_modify(|n| *n = n.saturating_sub(1));
            }
            // Whatever is left will never run.
            worker_pending.send_replace(0);
        });

        Self { tx, pending }
    }

    /// Enqueue an item, waiting for room when the queue is full.
    pub async fn enqueue(&self, item: WorkItem) -> Result<(), QueueClosed> {
        self.pending.send_modify(|n| *n += 1);
        if self.tx.send(item).await.is_err() {
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
            return Err(QueueClosed);
        }
        Ok(())
    }

    /// Items enqueued but not finished.
    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Wait until every enqueued item has been handled.
    pub async fn drain(&self) {
        let mut rx = self.pending.subscribe();
        // The sender lives in `self`, so this cannot fail.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}
