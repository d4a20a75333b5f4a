//! Normalization of backend statistics into canonical metrics.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

use super::sampler::{round2, ResourceSnapshot};

/// Server status as reported by a backend. `None` means "not reported".
#[derive(Debug, Clone, Default)]
pub struct RawServerStatus {
    pub version: Option<String>,
    pub connections_current: Option<i64>,
    pub connections_available: Option<i64>,
    pub uptime_seconds: Option<f64>,
    /// Backend-native operation counters, passed through untouched.
    pub op_counters: Option<BTreeMap<String, i64>>,
    /// Present only when the server is part of a replicated deployment.
    pub replication: Option<RawReplication>,
}

#[derive(Debug, Clone, Default)]
pub struct RawReplication {
    pub set_name: Option<String>,
    pub is_primary: bool,
    pub primary: Option<String>,
    pub hosts: Vec<String>,
}

/// Storage statistics for the selected database.
#[derive(Debug, Clone, Default)]
pub struct RawStorageStats {
    pub storage_size: Option<f64>,
    pub data_size: Option<f64>,
    pub objects: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationInfo {
    pub set_name: String,
    pub is_primary: bool,
    pub primary_address: Option<String>,
    pub member_hosts: Vec<String>,
}

/// Canonical, backend-agnostic metrics for one probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub active_connections: i64,
    pub available_connections: i64,
    pub operation_counters: Option<BTreeMap<String, i64>>,
    pub uptime_seconds: u64,
    pub backend_version: String,
    pub storage_bytes: f64,
    pub data_bytes: f64,
    pub object_count: i64,
    pub replication_info: Option<ReplicationInfo>,
    pub latency_ms: u64,
    pub host_resource_snapshot: ResourceSnapshot,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            active_connections: 0,
            available_connections: 0,
            operation_counters: None,
            uptime_seconds: 0,
            backend_version: "unknown".to_string(),
            storage_bytes: 0.0,
            data_bytes: 0.0,
            object_count: 0,
            replication_info: None,
            latency_ms: 0,
            host_resource_snapshot: ResourceSnapshot::default(),
        }
    }
}

/// Build canonical metrics from whatever the backend managed to report.
pub fn normalize(
    status: Option<&RawServerStatus>,
    stats: Option<&RawStorageStats>,
    snapshot: ResourceSnapshot,
    latency: Duration,
) -> Metrics {
    let mut metrics = Metrics {
        latency_ms: latency.as_millis() as u64,
        host_resource_snapshot: snapshot,
        ..Default::default()
    };

    if let Some(status) = status {
        metrics.active_connections = status.connections_current.unwrap_or(0).max(0);
        metrics.available_connections = status.connections_available.unwrap_or(0).max(0);
        metrics.operation_counters = status.op_counters.clone();
        metrics.uptime_seconds = status
            .uptime_seconds
            .filter(|s| s.is_finite() && *s > 0.0)
            .map(|s| s as u64)
            .unwrap_or(0);
        if let Some(version) = status.version.as_deref().filter(|v| !v.is_empty()) {
            metrics.backend_version = version.to_string();
        }
        metrics.replication_info = status.replication.as_ref().map(|repl| ReplicationInfo {
            set_name: repl
                .set_name
                .clone()
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| "unknown".to_string()),
            is_primary: repl.is_primary,
            primary_address: repl.primary.clone(),
            member_hosts: repl.hosts.clone(),
        });
    }

    if let Some(stats) = stats {
        metrics.storage_bytes = size(stats.storage_size);
        metrics.data_bytes = size(stats.data_size);
        metrics.object_count = stats.objects.unwrap_or(0).max(0);
    }

    metrics
}

fn size(value: Option<f64>) -> f64 {
    match value {
        Some(v) if v.is_finite() && v > 0.0 => round2(v),
        _ => 0.0,
    }
}
