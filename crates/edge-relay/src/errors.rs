// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types shared by the relay components and their sinks.

use std::fmt;

/// Returned by [`crate::queue::QueueSender::try_enqueue`] when an item is not accepted.
///
/// The rejected item is handed back to the caller, which decides whether to drop it.
pub enum Rejected<T> {
    /// The queue is at capacity.
    Full(T),
    /// The queue was closed, or its consumer went away.
    Closed(T),
}

impl<T> Rejected<T> {
    pub fn into_inner(self) -> T {
        match self {
            Rejected::Full(item) | Rejected::Closed(item) => item,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, Rejected::Full(_))
    }
}

impl<T> fmt::Debug for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejected::Full(_) => f.write_str("Full(..)"),
            Rejected::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T> fmt::Display for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejected::Full(_) => f.write_str("queue is full"),
            Rejected::Closed(_) => f.write_str("queue is closed"),
        }
    }
}

impl<T> std::error::Error for Rejected<T> {}

/// Failure to reach a sink at startup. Always fatal for the process.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid MQTT broker address '{0}'")]
    InvalidBroker(String),

    #[error("MQTT connection failed: {0}")]
    Mqtt(#[from] rumqttc::ConnectionError),

    #[error("timed out waiting for MQTT CONNACK")]
    MqttTimeout,

    #[error("database connection failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("timed out pinging database")]
    DatabaseTimeout,
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("publish timed out")]
    Timeout,

    #[error("publish rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("payload of {0} bytes does not fit the data_size column")]
    PayloadTooLarge(usize),

    #[error("flush timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("listener already started")]
    AlreadyStarted,

    #[error("listener is closed")]
    Closed,

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}
