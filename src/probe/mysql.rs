//! MySQL / MariaDB probe client built on a short-lived sqlx pool.

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::Row;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use super::client::{connect_error, query_error, DatabaseClient, DatabaseSession};
use super::ProbeError;
use crate::config::ProbeSettings;
use crate::db::BackendType;
use crate::metrics::{RawReplication, RawServerStatus, RawStorageStats};

/// `SHOW GLOBAL STATUS` variables passed through as operation counters.
const STATUS_COUNTERS: [&str; 7] = [
    "Com_select",
    "Com_insert",
    "Com_update",
    "Com_delete",
    "Questions",
    "Queries",
    "Slow_queries",
];

/// Map `SHOW GLOBAL STATUS` variables onto the raw status shape.
/// Replication is filled in separately.
fn status_from_globals(
    status: &HashMap<String, String>,
    version: Option<String>,
    max_connections: Option<i64>,
) -> RawServerStatus {
    let counter = |name: &str| status.get(name).and_then(|v| v.parse::<i64>().ok());
    let active = counter("Threads_connected");

    let op_counters: BTreeMap<String, i64> = STATUS_COUNTERS
        .iter()
        .filter_map(|name| counter(*name).map(|v| (name.to_string(), v)))
        .collect();

    RawServerStatus {
        version,
        connections_current: active,
        connections_available: match (max_connections, active) {
            (Some(max), Some(active)) => Some(max - active),
            _ => None,
        },
        uptime_seconds: counter("Uptime").map(|v| v as f64),
        op_counters: Some(op_counters).filter(|c| !c.is_empty()),
        replication: None,
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlClient;

#[async_trait]
impl DatabaseClient for MySqlClient {
    fn backend(&self) -> BackendType {
        BackendType::MySql
    }

    async fn connect(
        &self,
        secret: &str,
        settings: &ProbeSettings,
    ) -> Result<Box<dyn DatabaseSession>, ProbeError> {
        let options = MySqlConnectOptions::from_str(secret)
            .map_err(|e| ProbeError::Connect(format!("invalid connection string: {}", e)))?;

        let pool = MySqlPoolOptions::new()
            .max_connections(settings.max_pool_size)
            .min_connections(0)
            .acquire_timeout(settings.server_selection_timeout)
            .connect_with(options)
            .await
            .map_err(|e| connect_error(e, settings))?;

        Ok(Box::new(MySqlSession { pool }))
    }
}

struct MySqlSession {
    pool: MySqlPool,
}

impl MySqlSession {
    async fn global_status(&self) -> Result<HashMap<String, String>, ProbeError> {
        // SHOW statements are not preparable on every server version
        let rows = sqlx::raw_sql("SHOW GLOBAL STATUS")
            .fetch_all(&self.pool)
            .await
            .map_err(query_error)?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let name: String = row.try_get(0).ok()?;
                let value: String = row.try_get(1).ok()?;
                Some((name, value))
            })
            .collect())
    }

    async fn replication(&self) -> Option<RawReplication> {
        // A server that is not a replica returns no row, which fetch_one reports as an error
        if let Ok(row) = sqlx::raw_sql("SHOW REPLICA STATUS").fetch_one(&self.pool).await {
            return Some(RawReplication {
                set_name: None,
                is_primary: false,
                primary: row.try_get::<String, _>("Source_Host").ok(),
                hosts: Vec::new(),
            });
        }

        let hosts: Vec<String> = sqlx::raw_sql("SHOW REPLICAS")
            .fetch_all(&self.pool)
            .await
            .unwrap_or_default()
            .iter()
            .filter_map(|row| row.try_get::<String, _>("Host").ok())
            .collect();

        if hosts.is_empty() {
            return None;
        }

        Some(RawReplication {
            set_name: None,
            is_primary: true,
            primary: None,
            hosts,
        })
    }
}

#[async_trait]
impl DatabaseSession for MySqlSession {
    async fn select_server(&self) -> Result<String, ProbeError> {
        let name = sqlx::query_scalar::<_, Option<String>>("SELECT DATABASE()")
            .fetch_one(&self.pool)
            .await
            .map_err(query_error)?;
        Ok(name.unwrap_or_default())
    }

    async fn server_status(&self) -> Result<RawServerStatus, ProbeError> {
        let status = self.global_status().await?;

        let version = sqlx::query_scalar::<_, String>("SELECT VERSION()")
            .fetch_one(&self.pool)
            .await
            .ok();
        let max_connections = sqlx::query_scalar::<_, i64>("SELECT CAST(@@max_connections AS SIGNED)")
            .fetch_one(&self.pool)
            .await
            .ok();

        Ok(RawServerStatus {
            replication: self.replication().await,
            ..status_from_globals(&status, version, max_connections)
        })
    }

    async fn list_collections(&self) -> Result<Vec<String>, ProbeError> {
        sqlx::query_scalar::<_, String>(
            "SELECT CAST(table_name AS CHAR) FROM information_schema.tables
             WHERE table_schema = DATABASE() ORDER BY table_name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(query_error)
    }

    async fn storage_stats(&self) -> Result<RawStorageStats, ProbeError> {
        let row = sqlx::query(
            "SELECT CAST(COALESCE(SUM(data_length + index_length), 0) AS SIGNED) AS storage,
                    CAST(COALESCE(SUM(data_length), 0) AS SIGNED) AS data,
                    CAST(COALESCE(SUM(table_rows), 0) AS SIGNED) AS objects
             FROM information_schema.tables WHERE table_schema = DATABASE()",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(query_error)?;

        Ok(RawStorageStats {
            storage_size: row.try_get::<i64, _>("storage").ok().map(|v| v as f64),
            data_size: row.try_get::<i64, _>("data").ok().map(|v| v as f64),
            objects: row.try_get("objects").ok(),
        })
    }

    async fn close(self: Box<Self>) -> Result<(), ProbeError> {
        self.pool.close().await;
        Ok(())
    }
}
