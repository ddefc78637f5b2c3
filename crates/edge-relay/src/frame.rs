// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;

use chrono::{DateTime, Utc};

/// One received datagram.
///
/// `payload` is an owned copy; it never shares memory with the listener's receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
    pub peer: SocketAddr,
}

impl RawFrame {
    pub fn new(payload: &[u8], peer: SocketAddr) -> Self {
        Self {
            payload: payload.to_vec(),
            received_at: Utc::now(),
            peer,
        }
    }
}

/// A frame tagged for persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub source_address: String,
    pub payload: Vec<u8>,
    /// When the converter built this record. The stored row time is the batch timestamp.
    pub inserted_at: DateTime<Utc>,
}

/// Longest tag a record carries; the width of the `source_addr` column.
pub const MAX_SOURCE_ADDRESS_LEN: usize = 50;

/// Which address a record is tagged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceAddress {
    /// The address the relay's listener is bound to.
    #[default]
    Listener,
    /// The address the datagram was sent from.
    Peer,
}

impl SourceAddress {
    /// Tag for `frame` received on `local_addr`, at most [`MAX_SOURCE_ADDRESS_LEN`] characters.
    pub fn resolve(&self, frame: &RawFrame, local_addr: SocketAddr) -> String {
        let addr = match self {
            SourceAddress::Listener => local_addr,
            SourceAddress::Peer => frame.peer,
        };
        let mut tag = addr.to_string();
        // a scoped IPv6 address can run past the column
        if let Some((cut, _)) = tag.char_indices().nth(MAX_SOURCE_ADDRESS_LEN) {
            tag.truncate(cut);
        }
        tag
    }
}
