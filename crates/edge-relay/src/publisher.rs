// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::frame::RawFrame;
use crate::queue::QueueReceiver;
use crate::sink::{PubSubSink, Qos};

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub topic: String,
    /// Requested delivery guarantee. Only rejected or timed-out hand-offs to the client count
    /// as failed; acknowledgements are not awaited.
    pub qos: Qos,
    pub retain: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub published: u64,
    pub failed: u64,
}

/// Drains frames into the pub/sub sink, one publish at a time.
///
/// A failed publish is logged and the frame is gone; nothing is retried or requeued. The sink
/// connection belongs to whoever created it and is left open when the publisher stops.
pub struct Publisher {
    sink: Arc<dyn PubSubSink>,
    config: PublisherConfig,
    input: QueueReceiver<RawFrame>,
}

impl Publisher {
    pub fn new(
        sink: Arc<dyn PubSubSink>,
        config: PublisherConfig,
        input: QueueReceiver<RawFrame>,
    ) -> Self {
        Self {
            sink,
            config,
            input,
        }
    }

    pub async fn run(mut self) -> PublisherStats {
        debug!("Publisher started for topic {}", self.config.topic);
        let mut stats = PublisherStats::default();

        while let Some(frame) = self.input.dequeue().await {
            match self
                .sink
                .publish(
                    &self.config.topic,
                    self.config.qos,
                    self.config.retain,
                    &frame.payload,
                )
                .await
            {
                Ok(()) => stats.published += 1,
                Err(e) => {
                    stats.failed += 1;
                    error!("Failed to publish message: {}", e);
                }
            }
        }

        info!(
            "Publisher stopped ({} published, {} failed)",
            stats.published, stats.failed
        );
        stats
    }
}
