//! PostgreSQL probe client built on a short-lived sqlx pool.

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::Row;
use std::collections::BTreeMap;
use std::str::FromStr;

use super::client::{connect_error, query_error, DatabaseClient, DatabaseSession};
use super::ProbeError;
use crate::config::ProbeSettings;
use crate::db::BackendType;
use crate::metrics::{RawReplication, RawServerStatus, RawStorageStats};

const STAT_COUNTERS: [&str; 7] = [
    "xact_commit",
    "xact_rollback",
    "tup_returned",
    "tup_fetched",
    "tup_inserted",
    "tup_updated",
    "tup_deleted",
];

#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresClient;

#[async_trait]
impl DatabaseClient for PostgresClient {
    fn backend(&self) -> BackendType {
        BackendType::Postgres
    }

    async fn connect(
        &self,
        secret: &str,
        settings: &ProbeSettings,
    ) -> Result<Box<dyn DatabaseSession>, ProbeError> {
        let options = PgConnectOptions::from_str(secret)
            .map_err(|e| ProbeError::Connect(format!("invalid connection string: {}", e)))?;

        let pool = PgPoolOptions::new()
            .max_connections(settings.max_pool_size)
            .min_connections(0)
            .acquire_timeout(settings.server_selection_timeout)
            .connect_with(options)
            .await
            .map_err(|e| connect_error(e, settings))?;

        Ok(Box::new(PostgresSession { pool }))
    }
}

struct PostgresSession {
    pool: PgPool,
}

impl PostgresSession {
    async fn op_counters(&self) -> Result<Option<BTreeMap<String, i64>>, ProbeError> {
        let row = sqlx::query(
            "SELECT xact_commit, xact_rollback, tup_returned, tup_fetched, tup_inserted, tup_updated, tup_deleted
             FROM pg_stat_database WHERE datname = current_database()",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut counters = BTreeMap::new();
        for name in STAT_COUNTERS {
            if let Ok(Some(value)) = row.try_get::<Option<i64>, _>(name) {
                counters.insert(name.to_string(), value);
            }
        }
        Ok(Some(counters))
    }

    async fn replication(&self, in_recovery: bool, cluster_name: Option<String>) -> Option<RawReplication> {
        if in_recovery {
            // Standby: report the upstream it streams from
            let primary = sqlx::query_scalar::<_, Option<String>>(
                "SELECT sender_host || ':' || sender_port FROM pg_stat_wal_receiver",
            )
            .fetch_optional(&self.pool)
            .await
            .ok()
            .flatten()
            .flatten();

            return Some(RawReplication {
                set_name: cluster_name,
                is_primary: false,
                primary,
                hosts: Vec::new(),
            });
        }

        let hosts = sqlx::query_scalar::<_, Option<String>>(
            "SELECT COALESCE(client_addr::text, application_name) FROM pg_stat_replication",
        )
        .fetch_all(&self.pool)
        .await
        .unwrap_or_default()
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();

        if hosts.is_empty() {
            return None;
        }

        Some(RawReplication {
            set_name: cluster_name,
            is_primary: true,
            primary: None,
            hosts,
        })
    }
}

#[async_trait]
impl DatabaseSession for PostgresSession {
    async fn select_server(&self) -> Result<String, ProbeError> {
        sqlx::query_scalar::<_, String>("SELECT current_database()::text")
            .fetch_one(&self.pool)
            .await
            .map_err(query_error)
    }

    async fn server_status(&self) -> Result<RawServerStatus, ProbeError> {
        let row = sqlx::query(
            "SELECT current_setting('server_version') AS version,
                    (SELECT count(*) FROM pg_stat_activity)::bigint AS active,
                    current_setting('max_connections')::bigint AS max_connections,
                    EXTRACT(EPOCH FROM (now() - pg_postmaster_start_time()))::float8 AS uptime,
                    pg_is_in_recovery() AS in_recovery,
                    current_setting('cluster_name') AS cluster_name",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(query_error)?;

        let active: Option<i64> = row.try_get("active").ok();
        let max_connections: Option<i64> = row.try_get("max_connections").ok();
        let in_recovery: bool = row.try_get("in_recovery").unwrap_or(false);
        let cluster_name: Option<String> = row.try_get("cluster_name").ok();

        let op_counters = match self.op_counters().await {
            Ok(counters) => counters,
            Err(e) => {
                tracing::debug!("pg_stat_database unavailable: {}", e);
                None
            }
        };

        Ok(RawServerStatus {
            version: row.try_get("version").ok(),
            connections_current: active,
            connections_available: match (max_connections, active) {
                (Some(max), Some(active)) => Some(max - active),
                _ => None,
            },
            uptime_seconds: row.try_get("uptime").ok(),
            op_counters,
            replication: self.replication(in_recovery, cluster_name).await,
        })
    }

    async fn list_collections(&self) -> Result<Vec<String>, ProbeError> {
        sqlx::query_scalar::<_, String>(
            "SELECT (table_schema || '.' || table_name)::text FROM information_schema.tables
             WHERE table_schema NOT IN ('pg_catalog', 'information_schema')
             ORDER BY 1",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(query_error)
    }

    async fn storage_stats(&self) -> Result<RawStorageStats, ProbeError> {
        let row = sqlx::query(
            "SELECT pg_database_size(current_database())::float8 AS storage,
                    COALESCE((SELECT sum(pg_relation_size(c.oid))
                              FROM pg_class c JOIN pg_namespace n ON n.oid = c.relnamespace
                              WHERE c.relkind = 'r' AND n.nspname NOT IN ('pg_catalog', 'information_schema')), 0)::float8 AS data,
                    COALESCE((SELECT sum(n_live_tup) FROM pg_stat_user_tables), 0)::bigint AS objects",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(query_error)?;

        Ok(RawStorageStats {
            storage_size: row.try_get("storage").ok(),
            data_size: row.try_get("data").ok(),
            objects: row.try_get("objects").ok(),
        })
    }

    async fn close(self: Box<Self>) -> Result<(), ProbeError> {
        self.pool.close().await;
        Ok(())
    }
}
