// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory sinks for exercising the pipeline without a broker or a database.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::errors::{PersistenceError, PublishError};
use crate::sink::{InsertRow, PersistenceSink, PubSubSink, Qos, StoredRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub qos: Qos,
    pub retain: bool,
    pub payload: Vec<u8>,
}

/// Pub/sub sink that remembers every successful publish.
pub struct RecordingPubSub {
    published: Mutex<Vec<PublishedMessage>>,
    failing_payload: Mutex<Option<Vec<u8>>>,
    count_tx: watch::Sender<usize>,
}

impl Default for RecordingPubSub {
    fn default() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            failing_payload: Mutex::new(None),
            count_tx: watch::Sender::new(0),
        }
    }
}

impl RecordingPubSub {
    /// Makes every publish of exactly `payload` fail.
    pub fn fail_payload(&self, payload: &[u8]) {
        *self.failing_payload.lock().unwrap() = Some(payload.to_vec());
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().unwrap().clone()
    }

    /// Resolves once at least `count` messages have been published.
    pub async fn wait_for(&self, count: usize) {
        let mut rx = self.count_tx.subscribe();
        let _ = rx.wait_for(|published| *published >= count).await;
    }
}

#[async_trait]
impl PubSubSink for RecordingPubSub {
    async fn publish(
        &self,
        topic: &str,
        qos: Qos,
        retain: bool,
        payload: &[u8],
    ) -> Result<(), PublishError> {
        if self.failing_payload.lock().unwrap().as_deref() == Some(payload) {
            return Err(PublishError::Rejected("simulated broker failure".to_string()));
        }
        let count = {
            let mut published = self.published.lock().unwrap();
            published.push(PublishedMessage {
                topic: topic.to_string(),
                qos,
                retain,
                payload: payload.to_vec(),
            });
            published.len()
        };
        self.count_tx.send_replace(count);
        Ok(())
    }
}

/// Uncommitted rows of one flush.
#[derive(Debug, Default)]
pub struct MemoryBatch {
    rows: Vec<StoredRecord>,
}

/// Persistence sink keeping committed batches in memory.
pub struct MemoryStore {
    committed: Mutex<Vec<Vec<StoredRecord>>>,
    failing_payload: Mutex<Option<Vec<u8>>>,
    fail_commit: Mutex<bool>,
    rollbacks: AtomicUsize,
    schemas: Mutex<Vec<String>>,
    batches_tx: watch::Sender<usize>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            committed: Mutex::new(Vec::new()),
            failing_payload: Mutex::new(None),
            fail_commit: Mutex::new(false),
            rollbacks: AtomicUsize::new(0),
            schemas: Mutex::new(Vec::new()),
            batches_tx: watch::Sender::new(0),
        }
    }
}

impl MemoryStore {
    /// Makes inserting a row with exactly `payload` fail.
    pub fn fail_payload(&self, payload: &[u8]) {
        *self.failing_payload.lock().unwrap() = Some(payload.to_vec());
    }

    pub fn clear_failures(&self) {
        *self.failing_payload.lock().unwrap() = None;
        *self.fail_commit.lock().unwrap() = false;
    }

    pub fn fail_commits(&self) {
        *self.fail_commit.lock().unwrap() = true;
    }

    /// Committed batches, oldest first.
    pub fn committed(&self) -> Vec<Vec<StoredRecord>> {
        self.committed.lock().unwrap().clone()
    }

    /// Payloads of every committed batch, oldest first.
    pub fn committed_payloads(&self) -> Vec<Vec<Vec<u8>>> {
        self.committed()
            .into_iter()
            .map(|batch| batch.into_iter().map(|row| row.raw_data).collect())
            .collect()
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub fn schemas(&self) -> Vec<String> {
        self.schemas.lock().unwrap().clone()
    }

    /// Resolves once at least `count` batches have been committed.
    pub async fn wait_for_batches(&self, count: usize) {
        let mut rx = self.batches_tx.subscribe();
        let _ = rx.wait_for(|committed| *committed >= count).await;
    }
}

#[async_trait]
impl PersistenceSink for MemoryStore {
    type Batch = MemoryBatch;

    async fn ensure_schema(&self, table: &str) -> Result<(), PersistenceError> {
        let mut schemas = self.schemas.lock().unwrap();
        if !schemas.iter().any(|existing| existing == table) {
            schemas.push(table.to_string());
        }
        Ok(())
    }

    async fn begin_batch(&self) -> Result<Self::Batch, PersistenceError> {
        Ok(MemoryBatch::default())
    }

    async fn insert(
        &self,
        batch: &mut Self::Batch,
        table: &str,
        row: InsertRow<'_>,
    ) -> Result<(), PersistenceError> {
        if !self.schemas.lock().unwrap().iter().any(|t| t == table) {
            return Err(PersistenceError::Backend(format!(
                "relation \"{table}\" does not exist"
            )));
        }
        if self.failing_payload.lock().unwrap().as_deref() == Some(row.raw_data) {
            return Err(PersistenceError::Backend(
                "simulated insert failure".to_string(),
            ));
        }
        batch.rows.push(StoredRecord {
            source_address: row.source_address.to_string(),
            raw_data: row.raw_data.to_vec(),
            time: row.timestamp,
        });
        Ok(())
    }

    async fn commit(&self, batch: Self::Batch) -> Result<(), PersistenceError> {
        if *self.fail_commit.lock().unwrap() {
            return Err(PersistenceError::Backend(
                "simulated commit failure".to_string(),
            ));
        }
        let count = {
            let mut committed = self.committed.lock().unwrap();
            committed.push(batch.rows);
            committed.len()
        };
        self.batches_tx.send_replace(count);
        Ok(())
    }

    async fn rollback(&self, _batch: Self::Batch) -> Result<(), PersistenceError> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn query_recent(
        &self,
        table: &str,
        limit: i64,
    ) -> Result<Vec<StoredRecord>, PersistenceError> {
        if !self.schemas.lock().unwrap().iter().any(|t| t == table) {
            return Err(PersistenceError::Backend(format!(
                "relation \"{table}\" does not exist"
            )));
        }
        let committed = self.committed.lock().unwrap();
        let limit = usize::try_from(limit).unwrap_or(0);
        // rows of a batch share a timestamp, so newest batch first then reverse insertion order
        Ok(committed
            .iter()
            .rev()
            .flat_map(|batch| batch.iter().rev().cloned())
            .take(limit)
            .collect())
    }
}
