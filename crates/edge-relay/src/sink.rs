// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Contracts the relay core needs from its two sinks.
//!
//! The concrete implementations live in [`crate::mqtt`] and [`crate::timescale`]; tests use the
//! in-memory ones from `test_support`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::{PersistenceError, PublishError};

/// MQTT delivery guarantee requested for a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for Qos {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(format!("QoS must be 0, 1 or 2, got {other}")),
        }
    }
}

#[async_trait]
pub trait PubSubSink: Send + Sync {
    /// Publishes one payload and waits for the client to accept it.
    ///
    /// Acceptance is not delivery: with QoS 1 or 2 the broker's acknowledgement arrives later
    /// and a publish it never acknowledges is not reported here.
    async fn publish(
        &self,
        topic: &str,
        qos: Qos,
        retain: bool,
        payload: &[u8],
    ) -> Result<(), PublishError>;
}

/// One row handed to the persistence sink.
#[derive(Debug, Clone, Copy)]
pub struct InsertRow<'a> {
    pub source_address: &'a str,
    pub size: i32,
    pub raw_data: &'a [u8],
    pub timestamp: DateTime<Utc>,
}

/// A row read back by the diagnostic query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredRecord {
    pub source_address: String,
    pub raw_data: Vec<u8>,
    pub time: DateTime<Utc>,
}

/// Transactional row store.
///
/// Implementations must roll back a `Batch` that is dropped without being committed, so that an
/// aborted flush never leaves a transaction open.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    type Batch: Send;

    /// Creates `table` if it is missing. Safe to call repeatedly.
    async fn ensure_schema(&self, table: &str) -> Result<(), PersistenceError>;

    async fn begin_batch(&self) -> Result<Self::Batch, PersistenceError>;

    async fn insert(
        &self,
        batch: &mut Self::Batch,
        table: &str,
        row: InsertRow<'_>,
    ) -> Result<(), PersistenceError>;

    async fn commit(&self, batch: Self::Batch) -> Result<(), PersistenceError>;

    async fn rollback(&self, batch: Self::Batch) -> Result<(), PersistenceError>;

    /// Latest rows of `table`, most recent first.
    async fn query_recent(
        &self,
        table: &str,
        limit: i64,
    ) -> Result<Vec<StoredRecord>, PersistenceError>;
}
