// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! TimescaleDB implementation of [`PersistenceSink`] on a `sqlx` Postgres pool.
//!
//! A batch is a database transaction. `sqlx` rolls back a transaction that is dropped without
//! being committed, so an aborted or timed out flush never leaves one open.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, info};

use crate::errors::{ConnectError, PersistenceError};
use crate::frame::MAX_SOURCE_ADDRESS_LEN;
use crate::sink::{InsertRow, PersistenceSink, StoredRecord};

pub const DEFAULT_TABLE: &str = "udp_binary_data";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 25;
const MAX_CONNECTION_LIFETIME: Duration = Duration::from_secs(5 * 60);
// Postgres truncates identifiers longer than this.
const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(Clone)]
pub struct TimescaleConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    /// One of libpq's `sslmode` values, e.g. `disable` or `require`
    pub ssl_mode: String,
    pub max_connections: u32,
    /// Bounds both acquiring a connection and the startup ping
    pub connect_timeout: Duration,
}

impl Default for TimescaleConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            database: "postgres".to_string(),
            ssl_mode: "disable".to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl fmt::Debug for TimescaleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimescaleConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("ssl_mode", &self.ssl_mode)
            .field("max_connections", &self.max_connections)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

pub fn parse_ssl_mode(mode: &str) -> Result<PgSslMode, String> {
    PgSslMode::from_str(mode).map_err(|_| format!("unknown SSL mode '{mode}'"))
}

/// Checks that `name` can be spliced into SQL as a table name.
///
/// Accepts `table` or `schema.table` where each part is a plain, unquoted Postgres identifier.
///
/// ```
/// use edge_relay::timescale::validate_table_name;
///
/// assert!(validate_table_name("udp_binary_data").is_ok());
/// assert!(validate_table_name("telemetry.raw_frames").is_ok());
/// assert!(validate_table_name("data; DROP TABLE users").is_err());
/// ```
pub fn validate_table_name(name: &str) -> Result<(), String> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 {
        return Err(format!("table name '{name}' has too many parts"));
    }
    for part in parts {
        let mut chars = part.chars();
        let valid_start = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        if !valid_start
            || part.len() > MAX_IDENTIFIER_LEN
            || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(format!("invalid table name '{name}'"));
        }
    }
    Ok(())
}

fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (\
         time TIMESTAMPTZ NOT NULL, \
         source_addr VARCHAR({MAX_SOURCE_ADDRESS_LEN}), \
         data_size INTEGER, \
         raw_data BYTEA, \
         created_at TIMESTAMPTZ DEFAULT NOW())"
    )
}

const CREATE_HYPERTABLE_SQL: &str =
    "SELECT create_hypertable($1::regclass, 'time', if_not_exists => TRUE)";

fn insert_sql(table: &str) -> String {
    format!("INSERT INTO {table} (time, source_addr, data_size, raw_data) VALUES ($1, $2, $3, $4)")
}

fn query_recent_sql(table: &str) -> String {
    format!("SELECT time, source_addr, raw_data FROM {table} ORDER BY time DESC LIMIT $1")
}

pub struct TimescaleSink {
    pool: PgPool,
}

impl TimescaleSink {
    /// Opens the pool and pings the database once.
    pub async fn connect(config: &TimescaleConfig) -> Result<Self, ConnectError> {
        let ssl_mode = parse_ssl_mode(&config.ssl_mode)
            .map_err(|e| ConnectError::Database(sqlx::Error::Configuration(e.into())))?;
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.database)
            .ssl_mode(ssl_mode);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .max_lifetime(MAX_CONNECTION_LIFETIME)
            .acquire_timeout(config.connect_timeout)
            .connect_with(options)
            .await?;

        tokio::time::timeout(
            config.connect_timeout,
            sqlx::query("SELECT 1").execute(&pool),
        )
        .await
        .map_err(|_| ConnectError::DatabaseTimeout)??;

        info!(
            "Connected to TimescaleDB at {}:{}/{}",
            config.host, config.port, config.database
        );
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
        debug!("TimescaleDB pool closed");
    }
}

#[async_trait]
impl PersistenceSink for TimescaleSink {
    type Batch = Transaction<'static, Postgres>;

    async fn ensure_schema(&self, table: &str) -> Result<(), PersistenceError> {
        validate_table_name(table).map_err(PersistenceError::Backend)?;
        sqlx::query(&create_table_sql(table))
            .execute(&self.pool)
            .await?;

        // Plain Postgres without the extension keeps working with a regular table.
        if let Err(e) = sqlx::query(CREATE_HYPERTABLE_SQL)
            .bind(table)
            .execute(&self.pool)
            .await
        {
            info!("Could not create hypertable {}, using a plain table: {}", table, e);
        }
        debug!("Table {} is ready", table);
        Ok(())
    }

    async fn begin_batch(&self) -> Result<Self::Batch, PersistenceError> {
        Ok(self.pool.begin().await?)
    }

    async fn insert(
        &self,
        batch: &mut Self::Batch,
        table: &str,
        row: InsertRow<'_>,
    ) -> Result<(), PersistenceError> {
        sqlx::query(&insert_sql(table))
            .bind(row.timestamp)
            .bind(row.source_address)
            .bind(row.size)
            .bind(row.raw_data)
            .execute(&mut **batch)
            .await?;
        Ok(())
    }

    async fn commit(&self, batch: Self::Batch) -> Result<(), PersistenceError> {
        Ok(batch.commit().await?)
    }

    async fn rollback(&self, batch: Self::Batch) -> Result<(), PersistenceError> {
        Ok(batch.rollback().await?)
    }

    async fn query_recent(
        &self,
        table: &str,
        limit: i64,
    ) -> Result<Vec<StoredRecord>, PersistenceError> {
        validate_table_name(table).map_err(PersistenceError::Backend)?;
        let rows = sqlx::query(&query_recent_sql(table))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<StoredRecord, PersistenceError> {
                Ok(StoredRecord {
                    source_address: row
                        .try_get::<Option<String>, _>("source_addr")?
                        .unwrap_or_default(),
                    raw_data: row
                        .try_get::<Option<Vec<u8>>, _>("raw_data")?
                        .unwrap_or_default(),
                    time: row.try_get("time")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_table_name() {
        for name in ["udp_binary_data", "_t1", "public.frames", "Frames2024"] {
            assert!(validate_table_name(name).is_ok(), "{name}");
        }
        let too_long = "t".repeat(MAX_IDENTIFIER_LEN + 1);
        for name in [
            "",
            "1frames",
            "frames-2024",
            "a.b.c",
            ".frames",
            "frames;",
            "\"quoted\"",
            "with space",
            too_long.as_str(),
        ] {
            assert!(validate_table_name(name).is_err(), "{name}");
        }
    }

    #[test]
    fn test_parse_ssl_mode() {
        assert!(matches!(parse_ssl_mode("disable"), Ok(PgSslMode::Disable)));
        assert!(matches!(parse_ssl_mode("require"), Ok(PgSslMode::Require)));
        assert!(matches!(
            parse_ssl_mode("verify-full"),
            Ok(PgSslMode::VerifyFull)
        ));
        assert!(parse_ssl_mode("sometimes").is_err());
    }

    #[test]
    fn test_sql_statements() {
        let create = create_table_sql("udp_binary_data");
        assert!(create.starts_with("CREATE TABLE IF NOT EXISTS udp_binary_data ("));
        assert!(create.contains("time TIMESTAMPTZ NOT NULL"));
        assert!(create.contains("source_addr VARCHAR(50)"));
        assert!(create.contains("data_size INTEGER"));
        assert!(create.contains("raw_data BYTEA"));
        assert!(create.contains("created_at TIMESTAMPTZ DEFAULT NOW()"));

        assert_eq!(
            insert_sql("t"),
            "INSERT INTO t (time, source_addr, data_size, raw_data) VALUES ($1, $2, $3, $4)"
        );
        assert_eq!(
            query_recent_sql("t"),
            "SELECT time, source_addr, raw_data FROM t ORDER BY time DESC LIMIT $1"
        );
        assert!(CREATE_HYPERTABLE_SQL.contains("if_not_exists => TRUE"));
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = TimescaleConfig {
            password: "s3cret".to_string(),
            ..Default::default()
        };
        let debug = format!("{config:?}");
        assert!(debug.contains("localhost"));
        assert!(!debug.contains("s3cret"));
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_ssl_mode() {
        let config = TimescaleConfig {
            ssl_mode: "sometimes".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            TimescaleSink::connect(&config).await,
            Err(ConnectError::Database(sqlx::Error::Configuration(_)))
        ));
    }

    #[tokio::test]
    async fn test_connect_fails_without_database() {
        let port = {
            let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            socket.local_addr().unwrap().port()
        };
        let config = TimescaleConfig {
            host: "127.0.0.1".to_string(),
            port,
            connect_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(TimescaleSink::connect(&config).await.is_err());
    }
}
