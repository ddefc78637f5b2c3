// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;

use tracing::{debug, info};

use crate::frame::{RawFrame, Record, SourceAddress};
use crate::queue::{DropCounter, QueueReceiver, QueueSender};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConverterStats {
    pub converted: u64,
    pub dropped: u64,
}

/// Turns raw frames into persistence records and relays them to the batch writer.
///
/// Shares the listener's drop-on-full policy: a full record queue costs the record, never a wait.
pub struct Converter {
    source_address: SourceAddress,
    local_addr: SocketAddr,
    input: QueueReceiver<RawFrame>,
    output: QueueSender<Record>,
    drops: DropCounter,
}

impl Converter {
    /// `local_addr` is the address the listener is bound to.
    pub fn new(
        source_address: SourceAddress,
        local_addr: SocketAddr,
        input: QueueReceiver<RawFrame>,
        output: QueueSender<Record>,
    ) -> Self {
        Self {
            source_address,
            local_addr,
            input,
            output,
            drops: DropCounter::new("record"),
        }
    }

    /// Runs until the input is closed and drained, then closes the record queue.
    pub async fn run(mut self) -> ConverterStats {
        debug!("Data converter started");
        let mut stats = ConverterStats::default();

        while let Some(frame) = self.input.dequeue().await {
            let record = Record {
                source_address: self.source_address.resolve(&frame, self.local_addr),
                payload: frame.payload,
                inserted_at: chrono::Utc::now(),
            };
            match self.output.try_enqueue(record) {
                Ok(()) => stats.converted += 1,
                Err(rejected) => {
                    self.drops.record(&rejected);
                    stats.dropped += 1;
                }
            }
        }

        self.output.close();
        info!(
            "Data converter stopped ({} converted, {} dropped)",
            stats.converted, stats.dropped
        );
        stats
    }
}
