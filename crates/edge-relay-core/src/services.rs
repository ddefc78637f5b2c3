// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edge_relay::errors::PersistenceError;
use edge_relay::mqtt::MqttSink;
use edge_relay::pipeline::{PersistStage, Pipeline, PublishStage, ShutdownReport};
use edge_relay::sink::{PersistenceSink, PubSubSink, StoredRecord};
use edge_relay::timescale::TimescaleSink;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{config::RelayConfig, error::RelayError};

/// Status of the relay services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Sinks are being connected.
    Starting,
    /// The listener is receiving and both paths are flowing.
    Running,
    /// The pipeline is draining.
    Stopping,
    /// Everything has been shut down.
    Stopped,
}

// Type-erased access to the diagnostic query of whichever persistence sink is in use.
#[async_trait]
trait RecentRecords: Send + Sync {
    async fn recent(&self, table: &str, limit: i64) -> Result<Vec<StoredRecord>, PersistenceError>;
}

#[async_trait]
impl<S: PersistenceSink> RecentRecords for S {
    async fn recent(&self, table: &str, limit: i64) -> Result<Vec<StoredRecord>, PersistenceError> {
        self.query_recent(table, limit).await
    }
}

// Connections opened by `RelayServices::start`, released once the pipeline has stopped.
#[derive(Default)]
struct OwnedSinks {
    mqtt: Option<Arc<MqttSink>>,
    timescale: Option<Arc<TimescaleSink>>,
    disconnect_timeout: Duration,
}

impl OwnedSinks {
    async fn close(&self) {
        if let Some(mqtt) = &self.mqtt {
            mqtt.disconnect(self.disconnect_timeout).await;
        }
        if let Some(timescale) = &self.timescale {
            timescale.close().await;
        }
    }
}

/// Handle to the running relay.
///
/// Cheap to clone; every clone controls the same relay.
#[derive(Clone)]
pub struct RelayHandle {
    status: Arc<RwLock<ServiceStatus>>,
    status_tx: broadcast::Sender<ServiceStatus>,
    local_addr: SocketAddr,
    pipeline: Arc<Mutex<Option<Pipeline>>>,
    sinks: Arc<OwnedSinks>,
    records: Option<Arc<dyn RecentRecords>>,
    table_name: String,
    shutdown_grace: Duration,
}

impl RelayHandle {
    pub async fn status(&self) -> ServiceStatus {
        *self.status.read().await
    }

    /// Check if the relay is currently running.
    pub async fn is_running(&self) -> bool {
        matches!(*self.status.read().await, ServiceStatus::Running)
    }

    /// Get a receiver for status updates.
    pub fn status_receiver(&self) -> broadcast::Receiver<ServiceStatus> {
        self.status_tx.subscribe()
    }

    /// Address the UDP listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Latest stored rows, most recent first.
    pub async fn recent_records(&self, limit: i64) -> Result<Vec<StoredRecord>, RelayError> {
        let records = self
            .records
            .as_ref()
            .ok_or(RelayError::PersistenceDisabled)?;
        records
            .recent(&self.table_name, limit)
            .await
            .map_err(RelayError::Query)
    }

    /// Stop the relay.
    ///
    /// Drains the pipeline for at most the configured grace period, then releases the sink
    /// connections. Stopping again, or concurrently, is a no-op. Returns
    /// [`RelayError::ShutdownTimeout`] if some stage had to be aborted.
    pub async fn stop(&self) -> Result<(), RelayError> {
        let mut pipeline = self.pipeline.lock().await;
        let Some(running) = pipeline.take() else {
            return Ok(());
        };

        self.set_status(ServiceStatus::Stopping).await;
        let report = running.shutdown(self.shutdown_grace).await;
        log_report(&report);

        self.sinks.close().await;
        self.set_status(ServiceStatus::Stopped).await;
        info!("Relay stopped");

        if report.timed_out {
            return Err(RelayError::ShutdownTimeout);
        }
        Ok(())
    }

    async fn set_status(&self, status: ServiceStatus) {
        *self.status.write().await = status;
        let _ = self.status_tx.send(status);
    }
}

fn log_report(report: &ShutdownReport) {
    info!(
        "UDP listener received {} datagrams ({} read errors)",
        report.listener.received, report.listener.receive_errors
    );
    for (path, dropped) in &report.listener.dropped {
        if *dropped > 0 {
            warn!("{} path dropped {} frames on a full queue", path, dropped);
        }
    }
    if let Some(publisher) = report.publisher {
        info!(
            "Published {} messages, {} failed",
            publisher.published, publisher.failed
        );
    }
    if let Some(converter) = report.converter {
        debug!(
            "Converted {} frames, {} dropped",
            converter.converted, converter.dropped
        );
    }
    if let Some(writer) = report.writer {
        info!(
            "Stored {} records in {} batches, {} discarded",
            writer.records_written, writer.flushes, writer.records_discarded
        );
    }
}

/// Relay services coordinator.
///
/// Connects the sinks, starts the pipeline and hands back a [`RelayHandle`].
#[derive(Debug)]
pub struct RelayServices {
    config: RelayConfig,
}

impl RelayServices {
    /// Create a new RelayServices instance.
    pub fn new(config: RelayConfig) -> Self {
        Self { config }
    }

    /// Connect to the configured MQTT broker and database, then start relaying.
    ///
    /// Any connection failure is fatal; connections already opened are released again.
    pub async fn start(self) -> Result<RelayHandle, RelayError> {
        self.config.validate()?;

        let mqtt = match &self.config.mqtt {
            Some(mqtt_config) => {
                debug!("Connecting to MQTT broker {}", mqtt_config.broker);
                let sink = MqttSink::connect(mqtt_config)
                    .await
                    .map_err(RelayError::PublisherConnect)?;
                Some(Arc::new(sink))
            }
            None => {
                info!("MQTT disabled");
                None
            }
        };

        let mut sinks = OwnedSinks {
            mqtt,
            timescale: None,
            disconnect_timeout: self.config.mqtt_disconnect_timeout,
        };

        if let Some(db_config) = &self.config.timescale {
            debug!("Connecting to TimescaleDB at {}", db_config.host);
            match TimescaleSink::connect(db_config).await {
                Ok(sink) => sinks.timescale = Some(Arc::new(sink)),
                Err(e) => {
                    sinks.close().await;
                    return Err(RelayError::PersistenceConnect(e));
                }
            }
        } else {
            info!("TimescaleDB disabled");
        }

        let pubsub = sinks
            .mqtt
            .clone()
            .map(|sink| sink as Arc<dyn PubSubSink>);
        let store = sinks.timescale.clone();
        let sinks = Arc::new(sinks);

        match self.launch(pubsub, store, Arc::clone(&sinks)).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                sinks.close().await;
                Err(e)
            }
        }
    }

    /// Start relaying into sinks the caller already connected.
    ///
    /// A path is enabled when its sink is given. The connection settings in the configuration
    /// are not used, and the sinks are left open when the relay stops.
    pub async fn start_with_sinks<S>(
        self,
        pubsub: Option<Arc<dyn PubSubSink>>,
        store: Option<Arc<S>>,
    ) -> Result<RelayHandle, RelayError>
    where
        S: PersistenceSink + 'static,
    {
        if pubsub.is_none() && store.is_none() {
            return Err(RelayError::InvalidConfig(
                "at least one sink is required".to_string(),
            ));
        }
        self.config.validate()?;
        self.launch(pubsub, store, Arc::new(OwnedSinks::default()))
            .await
    }

    async fn launch<S>(
        self,
        pubsub: Option<Arc<dyn PubSubSink>>,
        store: Option<Arc<S>>,
        sinks: Arc<OwnedSinks>,
    ) -> Result<RelayHandle, RelayError>
    where
        S: PersistenceSink + 'static,
    {
        let config = self.config;
        let status = Arc::new(RwLock::new(ServiceStatus::Starting));
        let (status_tx, _status_rx) = broadcast::channel(16);

        if let Some(store) = &store {
            store
                .ensure_schema(&config.writer.table_name)
                .await
                .map_err(RelayError::Schema)?;
        }

        let records = store
            .clone()
            .map(|store| store as Arc<dyn RecentRecords>);

        let publish = pubsub.map(|sink| PublishStage {
            sink,
            config: config.publisher.clone(),
            queue_capacity: config.publish_queue_capacity,
        });
        let persist = store.map(|sink| PersistStage {
            sink,
            writer: config.writer.clone(),
            frame_queue_capacity: config.persist_queue_capacity,
            record_queue_capacity: config.record_queue_capacity,
        });

        let pipeline = Pipeline::spawn(
            config.listener_config(),
            config.source_address(),
            publish,
            persist,
        )
        .await?;
        let local_addr = pipeline.local_addr();

        let handle = RelayHandle {
            status,
            status_tx,
            local_addr,
            pipeline: Arc::new(Mutex::new(Some(pipeline))),
            sinks,
            records,
            table_name: config.writer.table_name,
            shutdown_grace: config.shutdown_grace,
        };
        handle.set_status(ServiceStatus::Running).await;
        info!("edge-relay: listening for UDP telemetry on {}", local_addr);

        Ok(handle)
    }
}
