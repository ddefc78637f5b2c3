// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batched, transactional writes to the persistence sink.
//!
//! Records accumulate in a batch owned by the writer task alone. The batch is flushed when it
//! reaches `batch_size`, when the flush interval elapses, and one last time when the input queue
//! is closed. Each flush is one transaction whose rows share a single timestamp.
//!
//! Delivery is at most once: after every flush attempt the batch is empty again. A failed flush
//! loses exactly the records it contained; they are neither retried nor split into smaller
//! writes, and the writer carries on with the next record.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::errors::PersistenceError;
use crate::frame::Record;
use crate::queue::QueueReceiver;
use crate::sink::{InsertRow, PersistenceSink};

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct BatchWriterConfig {
    pub table_name: String,
    /// Flush as soon as this many records are batched
    pub batch_size: usize,
    /// Flush whatever is batched this often
    pub flush_interval: Duration,
    /// Upper bound for one flush; an expired flush is rolled back and discarded
    pub flush_timeout: Duration,
}

impl Default for BatchWriterConfig {
    fn default() -> Self {
        Self {
            table_name: "udp_binary_data".to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Accumulating,
    /// Input closed; the final flush is in progress.
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushTrigger {
    Size,
    Interval,
    Drain,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchWriterStats {
    pub flushes: u64,
    pub failed_flushes: u64,
    pub records_written: u64,
    pub records_discarded: u64,
}

enum Event {
    Received(Option<Record>),
    IntervalElapsed,
}

pub struct BatchWriter<S: PersistenceSink> {
    sink: Arc<S>,
    config: BatchWriterConfig,
    input: QueueReceiver<Record>,
    batch: Vec<Record>,
    state: WriterState,
    stats: BatchWriterStats,
}

impl<S: PersistenceSink> BatchWriter<S> {
    pub fn new(sink: Arc<S>, config: BatchWriterConfig, input: QueueReceiver<Record>) -> Self {
        let batch_size = config.batch_size.max(1);
        Self {
            sink,
            config: BatchWriterConfig {
                batch_size,
                ..config
            },
            input,
            batch: Vec::with_capacity(batch_size),
            state: WriterState::Accumulating,
            stats: BatchWriterStats::default(),
        }
    }

    /// Runs until the input queue is closed and drained, then performs the final flush.
    pub async fn run(mut self) -> BatchWriterStats {
        debug!(
            "Batch writer started (batch size {}, flush interval {:?})",
            self.config.batch_size, self.config.flush_interval
        );

        let period = self.config.flush_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.state == WriterState::Accumulating {
            let event = tokio::select! {
                record = self.input.dequeue() => Event::Received(record),
                _ = ticker.tick() => Event::IntervalElapsed,
            };

            match event {
                Event::Received(Some(record)) => {
                    self.batch.push(record);
                    if self.batch.len() >= self.config.batch_size {
                        self.flush(FlushTrigger::Size).await;
                        ticker.reset();
                    }
                }
                Event::Received(None) => self.state = WriterState::Draining,
                Event::IntervalElapsed => self.flush(FlushTrigger::Interval).await,
            }
        }

        self.flush(FlushTrigger::Drain).await;
        self.state = WriterState::Stopped;

        info!(
            "Batch writer stopped ({} records written in {} flushes, {} discarded)",
            self.stats.records_written, self.stats.flushes, self.stats.records_discarded
        );
        self.stats
    }

    /// Writes the current batch in one transaction. The batch is empty afterwards either way.
    async fn flush(&mut self, trigger: FlushTrigger) {
        if self.batch.is_empty() {
            return;
        }
        let records = std::mem::replace(
            &mut self.batch,
            Vec::with_capacity(self.config.batch_size),
        );
        let count = records.len() as u64;
        let timestamp = Utc::now();

        let result = match tokio::time::timeout(
            self.config.flush_timeout,
            write_batch(&*self.sink, &self.config.table_name, &records, timestamp),
        )
        .await
        {
            Ok(result) => result,
            // dropping the write future dropped its open batch, which rolls it back
            Err(_) => Err(PersistenceError::Timeout(self.config.flush_timeout)),
        };

        match result {
            Ok(()) => {
                self.stats.flushes += 1;
                self.stats.records_written += count;
                debug!("Batch inserted {} records ({:?} flush)", count, trigger);
            }
            Err(e) => {
                self.stats.failed_flushes += 1;
                self.stats.records_discarded += count;
                error!(
                    "Failed to batch insert, discarding {} records ({:?} flush): {}",
                    count, trigger, e
                );
            }
        }
    }
}

async fn write_batch<S: PersistenceSink + ?Sized>(
    sink: &S,
    table: &str,
    records: &[Record],
    timestamp: DateTime<Utc>,
) -> Result<(), PersistenceError> {
    let mut batch = sink.begin_batch().await?;

    for record in records {
        let inserted = match i32::try_from(record.payload.len()) {
            Ok(size) => {
                let row = InsertRow {
                    source_address: &record.source_address,
                    size,
                    raw_data: &record.payload,
                    timestamp,
                };
                sink.insert(&mut batch, table, row).await
            }
            Err(_) => Err(PersistenceError::PayloadTooLarge(record.payload.len())),
        };

        if let Err(e) = inserted {
            if let Err(rollback_error) = sink.rollback(batch).await {
                warn!("Failed to roll back batch: {}", rollback_error);
            }
            return Err(e);
        }
    }

    sink.commit(batch).await
}
