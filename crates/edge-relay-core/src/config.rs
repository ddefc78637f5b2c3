// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::str::FromStr;
use std::time::Duration;

use edge_relay::batch_writer::BatchWriterConfig;
use edge_relay::frame::SourceAddress;
use edge_relay::listener::{ListenerConfig, DEFAULT_MAX_DATAGRAM_SIZE};
use edge_relay::mqtt::{parse_broker_url, MqttConfig};
use edge_relay::pipeline::{DEFAULT_FRAME_QUEUE_CAPACITY, DEFAULT_RECORD_QUEUE_CAPACITY};
use edge_relay::publisher::PublisherConfig;
use edge_relay::sink::Qos;
use edge_relay::timescale::{parse_ssl_mode, validate_table_name, TimescaleConfig};

use crate::error::RelayError;

const ENV_PREFIX: &str = "EDGE_RELAY_";
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// What persisted rows are tagged with in the `source_addr` column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceAddressMode {
    /// The relay's own listen address
    #[default]
    Listener,
    /// The address each datagram came from
    Peer,
}

impl FromStr for SourceAddressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "listener" => Ok(SourceAddressMode::Listener),
            "peer" => Ok(SourceAddressMode::Peer),
            other => Err(format!("expected 'listener' or 'peer', got '{other}'")),
        }
    }
}

/// Configuration for the relay services
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// UDP address to listen on
    pub listen_addr: String,
    /// Receive buffer size; longer datagrams are truncated
    pub max_datagram_size: usize,
    pub source_address: SourceAddressMode,
    /// MQTT connection. `None` disables the publish path.
    pub mqtt: Option<MqttConfig>,
    pub publisher: PublisherConfig,
    /// How long to wait for the broker to acknowledge DISCONNECT on shutdown
    pub mqtt_disconnect_timeout: Duration,
    /// Database connection. `None` disables the persistence path.
    pub timescale: Option<TimescaleConfig>,
    pub writer: BatchWriterConfig,
    pub publish_queue_capacity: usize,
    pub persist_queue_capacity: usize,
    pub record_queue_capacity: usize,
    /// Upper bound for draining the pipeline on stop
    pub shutdown_grace: Duration,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8888".to_string(),
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            source_address: SourceAddressMode::Listener,
            mqtt: Some(MqttConfig::default()),
            publisher: PublisherConfig {
                topic: "edge/telemetry".to_string(),
                qos: Qos::AtMostOnce,
                retain: false,
            },
            mqtt_disconnect_timeout: Duration::from_millis(250),
            timescale: Some(TimescaleConfig::default()),
            writer: BatchWriterConfig::default(),
            publish_queue_capacity: DEFAULT_FRAME_QUEUE_CAPACITY,
            persist_queue_capacity: DEFAULT_FRAME_QUEUE_CAPACITY,
            record_queue_capacity: DEFAULT_RECORD_QUEUE_CAPACITY,
            shutdown_grace: Duration::from_secs(2),
            log_level: "info".to_string(),
        }
    }
}

// Reads `EDGE_RELAY_<name>` through the lookup and parses it, falling back to `default` when
// the variable is unset or empty.
struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn raw(&self, name: &str) -> Option<String> {
        self.secret(name)
            .map(|val| val.trim().to_string())
            .filter(|val| !val.is_empty())
    }

    // Credentials are taken verbatim: surrounding whitespace is part of the secret.
    fn secret(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{name}")).filter(|val| !val.is_empty())
    }

    fn string(&self, name: &str, default: &str) -> String {
        self.raw(name).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, name: &str, default: T) -> Result<T, RelayError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.raw(name) {
            Some(val) => val.parse().map_err(|e| {
                RelayError::InvalidConfig(format!("{ENV_PREFIX}{name}='{val}': {e}"))
            }),
            None => Ok(default),
        }
    }

    fn flag(&self, name: &str, default: bool) -> Result<bool, RelayError> {
        match self.raw(name).map(|val| val.to_lowercase()) {
            None => Ok(default),
            Some(val) => match val.as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(RelayError::InvalidConfig(format!(
                    "{ENV_PREFIX}{name}='{val}' is not a boolean"
                ))),
            },
        }
    }

    fn millis(&self, name: &str, default: Duration) -> Result<Duration, RelayError> {
        let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse(name, default_ms).map(Duration::from_millis)
    }
}

impl RelayConfig {
    /// Create configuration from `EDGE_RELAY_*` environment variables
    pub fn from_env() -> Result<Self, RelayError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create configuration from any key/value source, e.g. a map in tests
    pub fn from_lookup<F>(lookup: F) -> Result<Self, RelayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let defaults = Self::default();

        let mqtt = if env.flag("USE_MQTT", true)? {
            let mqtt_defaults = MqttConfig::default();
            Some(MqttConfig {
                broker: env.string("MQTT_BROKER", &mqtt_defaults.broker),
                user: env.raw("MQTT_USER"),
                password: env.secret("MQTT_PASSWORD"),
                client_id: env.raw("MQTT_CLIENT_ID"),
                ..mqtt_defaults
            })
        } else {
            None
        };

        let qos = env.parse::<u8>("MQTT_QOS", 0)?;
        let qos = Qos::try_from(qos)
            .map_err(|e| RelayError::InvalidConfig(format!("{ENV_PREFIX}MQTT_QOS: {e}")))?;
        let publisher = PublisherConfig {
            topic: env.string("MQTT_TOPIC", &defaults.publisher.topic),
            qos,
            retain: env.flag("MQTT_RETAIN", false)?,
        };

        let timescale = if env.flag("USE_TIMESCALE", true)? {
            let db_defaults = TimescaleConfig::default();
            Some(TimescaleConfig {
                host: env.string("DB_HOST", &db_defaults.host),
                port: env.parse("DB_PORT", db_defaults.port)?,
                user: env.string("DB_USER", &db_defaults.user),
                password: env.secret("DB_PASSWORD").unwrap_or_default(),
                database: env.string("DB_NAME", &db_defaults.database),
                ssl_mode: env.string("DB_SSLMODE", &db_defaults.ssl_mode).to_lowercase(),
                ..db_defaults
            })
        } else {
            None
        };

        let writer = BatchWriterConfig {
            table_name: env.string("DB_TABLE", &defaults.writer.table_name),
            batch_size: env.parse("BATCH_SIZE", defaults.writer.batch_size)?,
            flush_interval: env.millis("FLUSH_INTERVAL_MS", defaults.writer.flush_interval)?,
            flush_timeout: env.millis("FLUSH_TIMEOUT_MS", defaults.writer.flush_timeout)?,
        };

        let config = Self {
            listen_addr: env.string("LISTEN_ADDR", &defaults.listen_addr),
            max_datagram_size: env.parse("MAX_DATAGRAM_SIZE", defaults.max_datagram_size)?,
            source_address: env.parse("SOURCE_ADDRESS", defaults.source_address)?,
            mqtt,
            publisher,
            mqtt_disconnect_timeout: env
                .millis("MQTT_DISCONNECT_TIMEOUT_MS", defaults.mqtt_disconnect_timeout)?,
            timescale,
            writer,
            publish_queue_capacity: env
                .parse("PUBLISH_QUEUE_CAPACITY", defaults.publish_queue_capacity)?,
            persist_queue_capacity: env
                .parse("PERSIST_QUEUE_CAPACITY", defaults.persist_queue_capacity)?,
            record_queue_capacity: env
                .parse("RECORD_QUEUE_CAPACITY", defaults.record_queue_capacity)?,
            shutdown_grace: env.millis("SHUTDOWN_GRACE_MS", defaults.shutdown_grace)?,
            log_level: env.string("LOG_LEVEL", &defaults.log_level).to_lowercase(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), RelayError> {
        let invalid = |msg: String| Err(RelayError::InvalidConfig(msg));

        if self.mqtt.is_none() && self.timescale.is_none() {
            return invalid("MQTT and TimescaleDB are both disabled, nothing to relay to".into());
        }

        let port = self
            .listen_addr
            .rsplit_once(':')
            .and_then(|(host, port)| (!host.is_empty()).then_some(port))
            .and_then(|port| port.parse::<u16>().ok());
        if port.is_none() {
            return invalid(format!(
                "listen address '{}' must be host:port",
                self.listen_addr
            ));
        }

        for (name, value) in [
            ("max datagram size", self.max_datagram_size),
            ("publish queue capacity", self.publish_queue_capacity),
            ("persist queue capacity", self.persist_queue_capacity),
            ("record queue capacity", self.record_queue_capacity),
            ("batch size", self.writer.batch_size),
        ] {
            if value == 0 {
                return invalid(format!("{name} must be greater than 0"));
            }
        }
        // largest payload a UDP datagram can carry
        if self.max_datagram_size > 65_507 {
            return invalid("max datagram size cannot exceed 65507 bytes".into());
        }

        for (name, value) in [
            ("flush interval", self.writer.flush_interval),
            ("flush timeout", self.writer.flush_timeout),
            ("shutdown grace period", self.shutdown_grace),
        ] {
            if value.is_zero() {
                return invalid(format!("{name} must be greater than 0"));
            }
        }

        if let Some(mqtt) = &self.mqtt {
            parse_broker_url(&mqtt.broker).map_err(|e| RelayError::InvalidConfig(e.to_string()))?;
            if mqtt.client_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
                return invalid("MQTT client id cannot be blank".into());
            }
            if self.publisher.topic.trim().is_empty() {
                return invalid("MQTT topic cannot be empty".into());
            }
            if self.publisher.topic.contains(['+', '#']) {
                return invalid(format!(
                    "MQTT topic '{}' cannot contain wildcards",
                    self.publisher.topic
                ));
            }
        }

        if let Some(timescale) = &self.timescale {
            if timescale.port == 0 {
                return invalid("database port must be greater than 0".into());
            }
            if timescale.host.trim().is_empty() {
                return invalid("database host cannot be empty".into());
            }
            parse_ssl_mode(&timescale.ssl_mode).map_err(RelayError::InvalidConfig)?;
            validate_table_name(&self.writer.table_name).map_err(RelayError::InvalidConfig)?;
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            ));
        }

        Ok(())
    }

    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            addr: self.listen_addr.clone(),
            max_datagram_size: self.max_datagram_size,
        }
    }

    pub fn source_address(&self) -> SourceAddress {
        match self.source_address {
            SourceAddressMode::Listener => SourceAddress::Listener,
            SourceAddressMode::Peer => SourceAddress::Peer,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_vars(vars: &[(&str, &str)]) -> Result<RelayConfig, RelayError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (format!("EDGE_RELAY_{k}"), v.to_string()))
            .collect();
        RelayConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_defaults() {
        let config = from_vars(&[]).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:8888");
        assert_eq!(config.max_datagram_size, 1024);
        assert_eq!(config.source_address, SourceAddressMode::Listener);
        assert_eq!(config.mqtt.as_ref().unwrap().broker, "tcp://localhost:1883");
        assert_eq!(config.publisher.topic, "edge/telemetry");
        assert_eq!(config.publisher.qos, Qos::AtMostOnce);
        assert!(!config.publisher.retain);
        assert_eq!(config.mqtt_disconnect_timeout, Duration::from_millis(250));
        let db = config.timescale.as_ref().unwrap();
        assert_eq!(db.host, "localhost");
        assert_eq!(db.port, 5432);
        assert_eq!(db.user, "postgres");
        assert_eq!(db.password, "");
        assert_eq!(db.database, "postgres");
        assert_eq!(db.ssl_mode, "disable");
        assert_eq!(config.writer.table_name, "udp_binary_data");
        assert_eq!(config.writer.batch_size, 100);
        assert_eq!(config.writer.flush_interval, Duration::from_secs(5));
        assert_eq!(config.writer.flush_timeout, Duration::from_secs(10));
        assert_eq!(config.publish_queue_capacity, 100);
        assert_eq!(config.persist_queue_capacity, 100);
        assert_eq!(config.record_queue_capacity, 200);
        assert_eq!(config.shutdown_grace, Duration::from_secs(2));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = from_vars(&[
            ("LISTEN_ADDR", "0.0.0.0:9999"),
            ("SOURCE_ADDRESS", "Peer"),
            ("MQTT_BROKER", "tcp://10.0.0.2:1884"),
            ("MQTT_USER", "gw"),
            ("MQTT_PASSWORD", "pw"),
            ("MQTT_TOPIC", "root/root_01/navigation/gps/v1.0/report"),
            ("MQTT_QOS", "1"),
            ("MQTT_RETAIN", "true"),
            ("DB_HOST", "db.internal"),
            ("DB_PORT", "6543"),
            ("DB_SSLMODE", "REQUIRE"),
            ("DB_TABLE", "telemetry.frames"),
            ("BATCH_SIZE", "500"),
            ("FLUSH_INTERVAL_MS", "250"),
            ("LOG_LEVEL", "DEBUG"),
        ])
        .unwrap();

        assert_eq!(config.listen_addr, "0.0.0.0:9999");
        assert_eq!(config.source_address, SourceAddressMode::Peer);
        let mqtt = config.mqtt.as_ref().unwrap();
        assert_eq!(mqtt.broker, "tcp://10.0.0.2:1884");
        assert_eq!(mqtt.user.as_deref(), Some("gw"));
        assert_eq!(mqtt.password.as_deref(), Some("pw"));
        assert_eq!(config.publisher.qos, Qos::AtLeastOnce);
        assert!(config.publisher.retain);
        let db = config.timescale.as_ref().unwrap();
        assert_eq!(db.host, "db.internal");
        assert_eq!(db.port, 6543);
        assert_eq!(db.ssl_mode, "require");
        assert_eq!(config.writer.table_name, "telemetry.frames");
        assert_eq!(config.writer.batch_size, 500);
        assert_eq!(config.writer.flush_interval, Duration::from_millis(250));
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.source_address(), SourceAddress::Peer);
    }

    #[test]
    fn test_passwords_keep_surrounding_whitespace() {
        let config = from_vars(&[
            ("MQTT_USER", " gw "),
            ("MQTT_PASSWORD", " pass "),
            ("DB_PASSWORD", "secret "),
        ])
        .unwrap();

        let mqtt = config.mqtt.as_ref().unwrap();
        assert_eq!(mqtt.user.as_deref(), Some("gw"));
        assert_eq!(mqtt.password.as_deref(), Some(" pass "));
        assert_eq!(config.timescale.as_ref().unwrap().password, "secret ");
    }

    #[test]
    fn test_disabling_one_path() {
        let config = from_vars(&[("USE_MQTT", "false")]).unwrap();
        assert!(config.mqtt.is_none());
        assert!(config.timescale.is_some());

        let config = from_vars(&[("USE_TIMESCALE", "0")]).unwrap();
        assert!(config.timescale.is_none());
        // no database, so the table name is not checked
        let config = RelayConfig {
            writer: BatchWriterConfig {
                table_name: "not a table".to_string(),
                ..Default::default()
            },
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_both_paths_disabled_is_rejected() {
        let result = from_vars(&[("USE_MQTT", "false"), ("USE_TIMESCALE", "false")]);
        assert!(matches!(result, Err(RelayError::InvalidConfig(_))));
    }

    #[test]
    fn test_unparsable_values_are_rejected() {
        for (key, value) in [
            ("BATCH_SIZE", "lots"),
            ("DB_PORT", "70000"),
            ("MQTT_QOS", "3"),
            ("MQTT_RETAIN", "maybe"),
            ("FLUSH_INTERVAL_MS", "-5"),
            ("SOURCE_ADDRESS", "everywhere"),
            ("USE_MQTT", "perhaps"),
        ] {
            assert!(
                matches!(from_vars(&[(key, value)]), Err(RelayError::InvalidConfig(_))),
                "{key}={value} should be rejected"
            );
        }
    }

    #[test]
    fn test_validate_zero_values() {
        for config in [
            RelayConfig {
                max_datagram_size: 0,
                ..Default::default()
            },
            RelayConfig {
                record_queue_capacity: 0,
                ..Default::default()
            },
            RelayConfig {
                writer: BatchWriterConfig {
                    batch_size: 0,
                    ..Default::default()
                },
                ..Default::default()
            },
            RelayConfig {
                writer: BatchWriterConfig {
                    flush_interval: Duration::ZERO,
                    ..Default::default()
                },
                ..Default::default()
            },
            RelayConfig {
                shutdown_grace: Duration::ZERO,
                ..Default::default()
            },
        ] {
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_validate_connection_settings() {
        for config in [
            RelayConfig {
                listen_addr: "8888".to_string(),
                ..Default::default()
            },
            RelayConfig {
                mqtt: Some(MqttConfig {
                    broker: "ws://localhost".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            RelayConfig {
                mqtt: Some(MqttConfig {
                    client_id: Some("  ".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            RelayConfig {
                publisher: PublisherConfig {
                    topic: "edge/#".to_string(),
                    qos: Qos::AtMostOnce,
                    retain: false,
                },
                ..Default::default()
            },
            RelayConfig {
                timescale: Some(TimescaleConfig {
                    ssl_mode: "sometimes".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            RelayConfig {
                writer: BatchWriterConfig {
                    table_name: "frames; DROP TABLE users".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
        ] {
            assert!(
                matches!(config.validate(), Err(RelayError::InvalidConfig(_))),
                "{config:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_valid_log_levels() {
        for level in VALID_LOG_LEVELS {
            let config = RelayConfig {
                log_level: level.to_string(),
                ..Default::default()
            };
            assert!(
                config.validate().is_ok(),
                "Log level '{}' should be valid",
                level
            );
        }
        let config = RelayConfig {
            log_level: "verbose".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_source_address_defaults_to_listener() {
        let config = RelayConfig::default();
        assert_eq!(config.source_address(), SourceAddress::Listener);
        assert_eq!(config.listener_config().max_datagram_size, 1024);
    }
}
