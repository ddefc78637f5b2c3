// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use edge_relay::errors::{ConnectError, ListenerError, PersistenceError};

/// Errors that can occur when configuring, starting or stopping the relay
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to connect to the MQTT broker: {0}")]
    PublisherConnect(#[source] ConnectError),

    #[error("Failed to connect to the database: {0}")]
    PersistenceConnect(#[source] ConnectError),

    #[error("Failed to prepare the database table: {0}")]
    Schema(#[source] PersistenceError),

    #[error("Failed to start the UDP listener: {0}")]
    ListenerStart(#[from] ListenerError),

    #[error("Persistence is disabled")]
    PersistenceDisabled,

    #[error("Failed to query stored records: {0}")]
    Query(#[source] PersistenceError),

    #[error("Shutdown timeout exceeded")]
    ShutdownTimeout,
}
