//! MongoDB probe client built on the official driver with a two-connection pool.

use async_trait::async_trait;
use mongodb::bson::{doc, Bson, Document};
use mongodb::error::{Error as MongoError, ErrorKind};
use mongodb::options::ClientOptions;
use mongodb::{Client, Database};
use std::collections::BTreeMap;

use super::client::{DatabaseClient, DatabaseSession};
use super::{ProbeError, ProbePhase};
use crate::config::ProbeSettings;
use crate::db::BackendType;
use crate::metrics::{RawReplication, RawServerStatus, RawStorageStats};

/// Database used when the connection string names none.
const DEFAULT_DATABASE: &str = "test";

#[derive(Debug, Default, Clone, Copy)]
pub struct MongoClient;

#[async_trait]
impl DatabaseClient for MongoClient {
    fn backend(&self) -> BackendType {
        BackendType::MongoDb
    }

    async fn connect(
        &self,
        secret: &str,
        settings: &ProbeSettings,
    ) -> Result<Box<dyn DatabaseSession>, ProbeError> {
        let mut options = ClientOptions::parse(secret)
            .await
            .map_err(|e| ProbeError::Connect(format!("invalid connection string: {}", e)))?;

        options.app_name = Some(concat!("dbsync/", env!("CARGO_PKG_VERSION")).to_string());
        options.max_pool_size = Some(settings.max_pool_size);
        options.min_pool_size = Some(0);
        options.connect_timeout = Some(settings.connect_timeout);
        options.server_selection_timeout = Some(settings.server_selection_timeout);

        let client = Client::with_options(options).map_err(|e| ProbeError::Connect(e.to_string()))?;

        // The driver connects lazily; a ping forces the first connection
        if let Err(e) = client.database("admin").run_command(doc! { "ping": 1 }).await {
            client.shutdown().await;
            return Err(connect_error(e, settings));
        }

        let database = client
            .default_database()
            .unwrap_or_else(|| client.database(DEFAULT_DATABASE));

        Ok(Box::new(MongoSession { client, database }))
    }
}

struct MongoSession {
    client: Client,
    database: Database,
}

#[async_trait]
impl DatabaseSession for MongoSession {
    async fn select_server(&self) -> Result<String, ProbeError> {
        self.database
            .run_command(doc! { "hello": 1 })
            .await
            .map_err(query_error)?;
        Ok(self.database.name().to_string())
    }

    async fn server_status(&self) -> Result<RawServerStatus, ProbeError> {
        let status = self
            .client
            .database("admin")
            .run_command(doc! { "serverStatus": 1 })
            .await
            .map_err(query_error)?;
        Ok(status_from_document(&status))
    }

    async fn list_collections(&self) -> Result<Vec<String>, ProbeError> {
        let mut names = self.database.list_collection_names().await.map_err(query_error)?;
        names.sort();
        Ok(names)
    }

    async fn storage_stats(&self) -> Result<RawStorageStats, ProbeError> {
        let stats = self
            .database
            .run_command(doc! { "dbStats": 1 })
            .await
            .map_err(query_error)?;
        Ok(stats_from_document(&stats))
    }

    async fn close(self: Box<Self>) -> Result<(), ProbeError> {
        self.client.shutdown().await;
        Ok(())
    }
}

fn connect_error(e: MongoError, settings: &ProbeSettings) -> ProbeError {
    match *e.kind {
        ErrorKind::ServerSelection { .. } => ProbeError::Timeout {
            phase: ProbePhase::ServerSelection,
            budget: settings.server_selection_timeout,
        },
        _ => ProbeError::Connect(e.to_string()),
    }
}

fn query_error(e: MongoError) -> ProbeError {
    ProbeError::Query(e.to_string())
}

/// Numeric field of any BSON width.
fn number(doc: &Document, key: &str) -> Option<f64> {
    match doc.get(key)? {
        Bson::Int32(v) => Some(f64::from(*v)),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}

fn integer(doc: &Document, key: &str) -> Option<i64> {
    number(doc, key).map(|v| v as i64)
}

/// Map a `serverStatus` reply onto the raw status shape.
fn status_from_document(status: &Document) -> RawServerStatus {
    let connections = status.get_document("connections").ok();

    let op_counters = status.get_document("opcounters").ok().map(|counters| {
        counters
            .keys()
            .filter_map(|key| integer(counters, key).map(|v| (key.clone(), v)))
            .collect::<BTreeMap<_, _>>()
    });

    RawServerStatus {
        version: status.get_str("version").ok().map(str::to_string),
        connections_current: connections.and_then(|c| integer(c, "current")),
        connections_available: connections.and_then(|c| integer(c, "available")),
        uptime_seconds: number(status, "uptime"),
        op_counters,
        replication: status.get_document("repl").ok().map(replication_from_document),
    }
}

fn replication_from_document(repl: &Document) -> RawReplication {
    let is_primary = repl
        .get_bool("isWritablePrimary")
        .or_else(|_| repl.get_bool("ismaster"))
        .unwrap_or(false);

    let hosts = repl
        .get_array("hosts")
        .map(|hosts| {
            hosts
                .iter()
                .filter_map(|h| h.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    RawReplication {
        set_name: repl.get_str("setName").ok().map(str::to_string),
        is_primary,
        primary: repl.get_str("primary").ok().map(str::to_string),
        hosts,
    }
}

/// Map a `dbStats` reply onto the raw storage shape.
fn stats_from_document(stats: &Document) -> RawStorageStats {
    RawStorageStats {
        storage_size: number(stats, "storageSize"),
        data_size: number(stats, "dataSize"),
        objects: integer(stats, "objects"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_replica_set_member() {
        let status = doc! {
            "version": "7.0.5",
            "uptime": 3600.5,
            "connections": { "current": 7, "available": 51193_i64 },
            "opcounters": {
                "insert": 10_i64,
                "query": 250,
                "update": 4.0,
                "note": "ignored",
            },
            "repl": {
                "setName": "rs0",
                "isWritablePrimary": true,
                "primary": "a:27017",
                "hosts": ["a:27017", "b:27017", 5],
            },
        };

        let raw = status_from_document(&status);
        assert_eq!(raw.version.as_deref(), Some("7.0.5"));
        assert_eq!(raw.uptime_seconds, Some(3600.5));
        assert_eq!(raw.connections_current, Some(7));
        assert_eq!(raw.connections_available, Some(51193));

        let counters = raw.op_counters.unwrap();
        assert_eq!(counters.len(), 3);
        assert_eq!(counters["query"], 250);
        assert_eq!(counters["update"], 4);

        let repl = raw.replication.unwrap();
        assert_eq!(repl.set_name.as_deref(), Some("rs0"));
        assert!(repl.is_primary);
        assert_eq!(repl.primary.as_deref(), Some("a:27017"));
        assert_eq!(repl.hosts, vec!["a:27017", "b:27017"]);
    }

    #[test]
    fn test_status_from_standalone() {
        let raw = status_from_document(&doc! { "version": "6.0.0", "uptime": 12 });
        assert_eq!(raw.uptime_seconds, Some(12.0));
        assert_eq!(raw.connections_current, None);
        assert!(raw.op_counters.is_none());
        assert!(raw.replication.is_none());

        let legacy = replication_from_document(&doc! { "setName": "rs0", "ismaster": false });
        assert!(!legacy.is_primary);
        assert!(legacy.hosts.is_empty());
    }

    #[test]
    fn test_stats_from_document() {
        let stats = stats_from_document(&doc! {
            "db": "inventory",
            "storageSize": 8192.0,
            "dataSize": 4096,
            "objects": 42_i64,
        });
        assert_eq!(stats.storage_size, Some(8192.0));
        assert_eq!(stats.data_size, Some(4096.0));
        assert_eq!(stats.objects, Some(42));
    }
}
