// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Closable bounded FIFO used between every pair of relay stages.
//!
//! Producers only ever call [`QueueSender::try_enqueue`], which never waits: an item is either
//! accepted or handed back as [`Rejected`]. Consumers suspend in [`QueueReceiver::dequeue`] until
//! an item arrives or the queue is closed and drained. Closing is the shutdown signal that
//! travels downstream from stage to stage.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::errors::Rejected;

/// Drops are logged on the first occurrence and then once per this many.
const DROP_LOG_EVERY: u64 = 1000;

/// Creates a queue holding at most `capacity` items.
///
/// A capacity of zero is raised to one; configuration validation rejects zero before we get here.
pub fn bounded<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let closed = CancellationToken::new();
    (
        QueueSender {
            tx,
            closed: closed.clone(),
        },
        QueueReceiver {
            rx,
            closed,
            closing: false,
        },
    )
}

/// Producer half. Cheap to clone; `close` on any clone closes the queue for all of them.
pub struct QueueSender<T> {
    tx: mpsc::Sender<T>,
    closed: CancellationToken,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            closed: self.closed.clone(),
        }
    }
}

impl<T> QueueSender<T> {
    /// Offers `item` to the queue without waiting.
    pub fn try_enqueue(&self, item: T) -> Result<(), Rejected<T>> {
        if self.closed.is_cancelled() {
            return Err(Rejected::Closed(item));
        }
        self.tx.try_send(item).map_err(|e| match e {
            TrySendError::Full(item) => Rejected::Full(item),
            TrySendError::Closed(item) => Rejected::Closed(item),
        })
    }

    /// Stops accepting items. Already queued items stay available to the consumer.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Number of items currently buffered.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Consumer half. There is exactly one per queue.
pub struct QueueReceiver<T> {
    rx: mpsc::Receiver<T>,
    closed: CancellationToken,
    closing: bool,
}

impl<T> QueueReceiver<T> {
    /// Waits for the next item.
    ///
    /// Returns `None` once the queue has been closed (or every sender dropped) and every item
    /// accepted before that has been handed out. Cancel safe.
    pub async fn dequeue(&mut self) -> Option<T> {
        if !self.closing {
            tokio::select! {
                biased;
                item = self.rx.recv() => return item,
                _ = self.closed.cancelled() => {
                    // From here on the channel refuses new items and recv drains what is left.
                    self.closing = true;
                    self.rx.close();
                }
            }
        }
        self.rx.recv().await
    }

    /// Closes the queue from the consumer side.
    pub fn close(&mut self) {
        self.closed.cancel();
        self.closing = true;
        self.rx.close();
    }
}

/// Counts items discarded by the drop-on-full policy and logs at a sampled rate.
#[derive(Debug, Clone)]
pub struct DropCounter {
    what: &'static str,
    dropped: Arc<AtomicU64>,
}

impl DropCounter {
    pub fn new(what: &'static str) -> Self {
        Self {
            what,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn record<T>(&self, rejected: &Rejected<T>) {
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if total == 1 || total % DROP_LOG_EVERY == 0 {
            warn!(
                dropped_total = total,
                "{} queue rejected item ({}), dropping data", self.what, rejected
            );
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
