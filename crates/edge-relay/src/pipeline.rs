// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wires the listener to the enabled sink paths and tears it all down again.
//!
//! ```text
//! socket -> Listener -+-> publish queue -> Publisher -> PubSubSink
//!                     |
//!                     +-> persist queue -> Converter -> record queue -> BatchWriter -> PersistenceSink
//! ```
//!
//! Each path gets its own frame queue so that both see every accepted datagram and a stalled
//! path only ever costs itself frames.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::batch_writer::{BatchWriter, BatchWriterConfig, BatchWriterStats};
use crate::converter::{Converter, ConverterStats};
use crate::errors::ListenerError;
use crate::frame::{RawFrame, SourceAddress};
use crate::listener::{FrameTarget, Listener, ListenerConfig, ListenerStats};
use crate::publisher::{Publisher, PublisherConfig, PublisherStats};
use crate::queue::{bounded, QueueSender};
use crate::sink::{PersistenceSink, PubSubSink};

pub const DEFAULT_FRAME_QUEUE_CAPACITY: usize = 100;
pub const DEFAULT_RECORD_QUEUE_CAPACITY: usize = 200;

pub struct PublishStage {
    pub sink: Arc<dyn PubSubSink>,
    pub config: PublisherConfig,
    pub queue_capacity: usize,
}

pub struct PersistStage<S> {
    pub sink: Arc<S>,
    pub writer: BatchWriterConfig,
    pub frame_queue_capacity: usize,
    pub record_queue_capacity: usize,
}

/// What every stage reported on its way out. `None` means the stage was not enabled, or was
/// aborted before it finished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub listener: ListenerStats,
    pub publisher: Option<PublisherStats>,
    pub converter: Option<ConverterStats>,
    pub writer: Option<BatchWriterStats>,
    /// Some stage had to be aborted when the grace period ran out
    pub timed_out: bool,
}

pub struct Pipeline {
    listener: Listener,
    local_addr: SocketAddr,
    frame_queues: Vec<QueueSender<RawFrame>>,
    publisher: Option<JoinHandle<PublisherStats>>,
    converter: Option<JoinHandle<ConverterStats>>,
    writer: Option<JoinHandle<BatchWriterStats>>,
}

impl Pipeline {
    /// Starts the listener, then spawns the stages of every enabled path.
    ///
    /// Frames received before a stage is running wait in its queue. If the socket cannot be
    /// bound nothing is spawned.
    pub async fn spawn<S>(
        listener_config: ListenerConfig,
        source_address: SourceAddress,
        publish: Option<PublishStage>,
        persist: Option<PersistStage<S>>,
    ) -> Result<Self, ListenerError>
    where
        S: PersistenceSink + 'static,
    {
        let mut targets = Vec::new();
        let mut frame_queues = Vec::new();

        let publish = publish.map(|stage| {
            let (tx, rx) = bounded(stage.queue_capacity);
            frame_queues.push(tx.clone());
            targets.push(FrameTarget::new("publish", tx));
            (stage, rx)
        });

        let persist = persist.map(|stage| {
            let (frame_tx, frame_rx) = bounded(stage.frame_queue_capacity);
            frame_queues.push(frame_tx.clone());
            targets.push(FrameTarget::new("persist", frame_tx));
            (stage, frame_rx)
        });

        let listener = Listener::new(listener_config);
        let local_addr = listener.start(targets).await?;

        let publisher = publish.map(|(stage, rx)| {
            tokio::spawn(Publisher::new(stage.sink, stage.config, rx).run())
        });

        let (converter, writer) = match persist {
            Some((stage, frame_rx)) => {
                let (record_tx, record_rx) = bounded(stage.record_queue_capacity);
                let converter = Converter::new(source_address, local_addr, frame_rx, record_tx);
                let writer = BatchWriter::new(stage.sink, stage.writer, record_rx);
                (
                    Some(tokio::spawn(converter.run())),
                    Some(tokio::spawn(writer.run())),
                )
            }
            None => (None, None),
        };

        debug!("Pipeline running with {} sink path(s)", frame_queues.len());
        Ok(Self {
            listener,
            local_addr,
            frame_queues,
            publisher,
            converter,
            writer,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn listener_stats(&self) -> ListenerStats {
        self.listener.stats()
    }

    /// Stops the listener, lets the stages drain and waits for them for at most `grace`.
    ///
    /// Stages still running at the deadline are aborted. An aborted batch writer drops its open
    /// batch, which rolls the transaction back.
    pub async fn shutdown(mut self, grace: Duration) -> ShutdownReport {
        info!("Shutting down relay pipeline");
        let deadline = Instant::now() + grace;

        self.listener.close().await;
        for queue in &self.frame_queues {
            queue.close();
        }

        let mut timed_out = false;
        let publisher =
            join_stage("publisher", self.publisher.take(), deadline, &mut timed_out).await;
        let converter =
            join_stage("converter", self.converter.take(), deadline, &mut timed_out).await;
        let writer =
            join_stage("batch writer", self.writer.take(), deadline, &mut timed_out).await;

        ShutdownReport {
            listener: self.listener.stats(),
            publisher,
            converter,
            writer,
            timed_out,
        }
    }
}

async fn join_stage<T>(
    name: &str,
    handle: Option<JoinHandle<T>>,
    deadline: Instant,
    timed_out: &mut bool,
) -> Option<T> {
    let mut handle = handle?;
    match tokio::time::timeout_at(deadline, &mut handle).await {
        Ok(Ok(stats)) => Some(stats),
        Ok(Err(e)) => {
            error!("Relay {} task failed: {}", name, e);
            None
        }
        Err(_) => {
            warn!("Relay {} did not finish in time, aborting", name);
            handle.abort();
            *timed_out = true;
            None
        }
    }
}
