// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! MQTT implementation of [`PubSubSink`] on top of `rumqttc`.
//!
//! `rumqttc` splits a connection into an [`AsyncClient`] handle, which only queues requests, and
//! an [`EventLoop`] that has to be polled for anything to reach the broker. The sink polls the
//! event loop on a background task for as long as it lives. A poll error means the connection
//! dropped; the next poll reconnects.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::{ConnectError, PublishError};
use crate::sink::{PubSubSink, Qos};

pub const DEFAULT_BROKER: &str = "tcp://localhost:1883";
const DEFAULT_PORT: u16 = 1883;
const KEEP_ALIVE: Duration = Duration::from_secs(60);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
// Pending requests between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct MqttConfig {
    /// `tcp://host:port`, `mqtt://host:port` or `host[:port]`
    pub broker: String,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Defaults to `edge_gateway_<unix seconds>`
    pub client_id: Option<String>,
    pub connect_timeout: Duration,
    pub publish_timeout: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: DEFAULT_BROKER.to_string(),
            user: None,
            password: None,
            client_id: None,
            connect_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(5),
        }
    }
}

impl fmt::Debug for MqttConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttConfig")
            .field("broker", &self.broker)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("client_id", &self.client_id)
            .field("connect_timeout", &self.connect_timeout)
            .field("publish_timeout", &self.publish_timeout)
            .finish()
    }
}

/// Splits a broker URL into host and port.
///
/// ```
/// use edge_relay::mqtt::parse_broker_url;
///
/// assert_eq!(parse_broker_url("tcp://10.0.0.5:1884").unwrap(), ("10.0.0.5".to_string(), 1884));
/// assert_eq!(parse_broker_url("broker.local").unwrap(), ("broker.local".to_string(), 1883));
/// assert!(parse_broker_url("ws://broker.local").is_err());
/// ```
pub fn parse_broker_url(broker: &str) -> Result<(String, u16), ConnectError> {
    let invalid = || ConnectError::InvalidBroker(broker.to_string());

    let rest = match broker.split_once("://") {
        Some(("tcp" | "mqtt", rest)) => rest,
        Some(_) => return Err(invalid()),
        None => broker,
    };
    let rest = rest.trim_end_matches('/');

    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
        None => (rest, DEFAULT_PORT),
    };
    if host.is_empty() || port == 0 || host.contains('/') {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

fn default_client_id() -> String {
    format!("edge_gateway_{}", chrono::Utc::now().timestamp())
}

fn to_rumqttc_qos(qos: Qos) -> rumqttc::QoS {
    match qos {
        Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
        Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        Qos::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

pub struct MqttSink {
    client: AsyncClient,
    publish_timeout: Duration,
    cancel_token: CancellationToken,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    disconnected: AtomicBool,
}

impl MqttSink {
    /// Connects to the broker and waits for its CONNACK.
    pub async fn connect(config: &MqttConfig) -> Result<Self, ConnectError> {
        let (host, port) = parse_broker_url(&config.broker)?;
        let client_id = config.client_id.clone().unwrap_or_else(default_client_id);

        let mut options = MqttOptions::new(client_id.clone(), host, port);
        options.set_keep_alive(KEEP_ALIVE);
        if let Some(user) = &config.user {
            options.set_credentials(user, config.password.clone().unwrap_or_default());
        }

        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);

        tokio::time::timeout(config.connect_timeout, wait_for_connack(&mut event_loop))
            .await
            .map_err(|_| ConnectError::MqttTimeout)??;
        info!(
            "Connected to MQTT broker {} as {}",
            config.broker, client_id
        );

        let cancel_token = CancellationToken::new();
        let task = tokio::spawn(drive_event_loop(event_loop, cancel_token.clone()));

        Ok(Self {
            client,
            publish_timeout: config.publish_timeout,
            cancel_token,
            event_loop: Mutex::new(Some(task)),
            disconnected: AtomicBool::new(false),
        })
    }

    /// Sends DISCONNECT and waits up to `timeout` for the event loop to wind down.
    ///
    /// Calling it again is a no-op.
    pub async fn disconnect(&self, timeout: Duration) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(mut task) = self.event_loop.lock().await.take() else {
            return;
        };

        if let Err(e) = self.client.try_disconnect() {
            debug!("MQTT disconnect request not queued: {}", e);
            self.cancel_token.cancel();
        }
        if tokio::time::timeout(timeout, &mut task).await.is_err() {
            warn!("MQTT event loop did not stop within {:?}", timeout);
            self.cancel_token.cancel();
            task.abort();
        }
        info!("Disconnected from MQTT broker");
    }
}

async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<(), ConnectError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(_)) = event_loop.poll().await? {
            return Ok(());
        }
    }
}

async fn drive_event_loop(mut event_loop: EventLoop, cancel_token: CancellationToken) {
    loop {
        let polled = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            polled = event_loop.poll() => polled,
        };

        match polled {
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(Event::Incoming(Packet::ConnAck(_))) => info!("Reconnected to MQTT broker"),
            Ok(_) => {}
            Err(e) => {
                error!(
                    "Connection to MQTT broker lost: {}, retrying in {:?}",
                    e, RECONNECT_DELAY
                );
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }
    debug!("MQTT event loop stopped");
}

// `AsyncClient::publish` only queues the request for the event loop; PUBACK/PUBCOMP are
// handled there and never reach the caller.
#[async_trait]
impl PubSubSink for MqttSink {
    async fn publish(
        &self,
        topic: &str,
        qos: Qos,
        retain: bool,
        payload: &[u8],
    ) -> Result<(), PublishError> {
        tokio::time::timeout(
            self.publish_timeout,
            self.client
                .publish(topic, to_rumqttc_qos(qos), retain, payload.to_vec()),
        )
        .await
        .map_err(|_| PublishError::Timeout)??;
        Ok(())
    }
}

impl Drop for MqttSink {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_broker_url() {
        assert_eq!(
            parse_broker_url("tcp://localhost:1883").unwrap(),
            ("localhost".to_string(), 1883)
        );
        assert_eq!(
            parse_broker_url("mqtt://192.168.1.20:8883/").unwrap(),
            ("192.168.1.20".to_string(), 8883)
        );
        assert_eq!(
            parse_broker_url("broker.local:1999").unwrap(),
            ("broker.local".to_string(), 1999)
        );
        assert_eq!(
            parse_broker_url("tcp://broker.local").unwrap(),
            ("broker.local".to_string(), 1883)
        );
    }

    #[test]
    fn test_parse_broker_url_rejects_garbage() {
        for broker in [
            "",
            "tcp://",
            "tcp://:1883",
            "tcp://host:port",
            "tcp://host:0",
            "tcp://host:70000",
            "ssl://host:8883",
            "tcp://host/path:1883",
        ] {
            assert!(
                matches!(parse_broker_url(broker), Err(ConnectError::InvalidBroker(_))),
                "{broker} should be rejected"
            );
        }
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(to_rumqttc_qos(Qos::AtMostOnce), rumqttc::QoS::AtMostOnce);
        assert_eq!(to_rumqttc_qos(Qos::AtLeastOnce), rumqttc::QoS::AtLeastOnce);
        assert_eq!(to_rumqttc_qos(Qos::ExactlyOnce), rumqttc::QoS::ExactlyOnce);
    }

    #[test]
    fn test_default_client_id() {
        let id = default_client_id();
        let seconds = id.strip_prefix("edge_gateway_").unwrap();
        assert!(seconds.parse::<i64>().unwrap() > 0);
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = MqttConfig {
            user: Some("gateway".to_string()),
            password: Some("hunter2".to_string()),
            ..Default::default()
        };
        let debug = format!("{config:?}");
        assert!(debug.contains("gateway"));
        assert!(!debug.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_broker() {
        let config = MqttConfig {
            broker: "ws://localhost".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            MqttSink::connect(&config).await,
            Err(ConnectError::InvalidBroker(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_fails_without_broker() {
        // nothing listens on this freshly released port
        let port = {
            let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            socket.local_addr().unwrap().port()
        };
        let config = MqttConfig {
            broker: format!("tcp://127.0.0.1:{port}"),
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        assert!(matches!(
            MqttSink::connect(&config).await,
            Err(ConnectError::Mqtt(_) | ConnectError::MqttTimeout)
        ));
    }
}
