//! Configuration module for dbsync.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::time::Duration;

/// Budgets applied to every probe.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    /// Time allowed to establish the first connection (default: 8s)
    pub connect_timeout: Duration,
    /// Time allowed for the server to answer once connected (default: 8s)
    pub server_selection_timeout: Duration,
    /// Upper bound on connections per probe pool (always 2)
    pub max_pool_size: u32,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(8),
            server_selection_timeout: Duration::from_secs(8),
            max_pool_size: 2,
        }
    }
}

/// Event log retention.
#[derive(Debug, Clone)]
pub struct RetentionSettings {
    /// How often the sweep runs (default: 1h)
    pub interval: Duration,
    /// Events older than this are deleted (default: 24h)
    pub horizon: Duration,
    /// Maximum rows removed per delete transaction
    pub batch_size: usize,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            horizon: Duration::from_secs(24 * 3600),
            batch_size: 5000,
        }
    }
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the control and admin endpoints (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "dbsync.db")
    pub db_path: String,
    /// Passphrase for sealing connection secrets at rest
    pub secret_key: Option<String>,
    pub probe: ProbeSettings,
    pub retention: RetentionSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "dbsync.db".to_string(),
            secret_key: None,
            probe: ProbeSettings::default(),
            retention: RetentionSettings::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `DBSYNC_HTTP_PORT`: HTTP port (default: 8080)
    /// - `DBSYNC_DB_PATH`: Database file path (default: "dbsync.db")
    /// - `DBSYNC_SECRET_KEY`: enables AES-256-GCM sealing of stored secrets
    /// - `DBSYNC_CONNECT_TIMEOUT_MS`: connect budget (default: 8000)
    /// - `DBSYNC_SERVER_SELECTION_TIMEOUT_MS`: server selection budget (default: 8000)
    /// - `DBSYNC_RETENTION_INTERVAL_SECS`: sweep period (default: 3600)
    /// - `DBSYNC_RETENTION_HORIZON_SECS`: event horizon (default: 86400)
    pub fn load() -> Self {
        Self::load_from(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn load_from<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(port) = lookup("DBSYNC_HTTP_PORT").and_then(|s| s.parse().ok()) {
            cfg.http_port = port;
        }

        if let Some(db_path) = lookup("DBSYNC_DB_PATH") {
            cfg.db_path = db_path;
        }

        cfg.secret_key = lookup("DBSYNC_SECRET_KEY").filter(|k| !k.is_empty());

        if let Some(ms) = parse_positive(lookup("DBSYNC_CONNECT_TIMEOUT_MS")) {
            cfg.probe.connect_timeout = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_positive(lookup("DBSYNC_SERVER_SELECTION_TIMEOUT_MS")) {
            cfg.probe.server_selection_timeout = Duration::from_millis(ms);
        }

        if let Some(secs) = parse_positive(lookup("DBSYNC_RETENTION_INTERVAL_SECS")) {
            cfg.retention.interval = Duration::from_secs(secs);
        }

        if let Some(secs) = parse_positive(lookup("DBSYNC_RETENTION_HORIZON_SECS")) {
            cfg.retention.horizon = Duration::from_secs(secs);
        }

        cfg
    }
}

fn parse_positive(value: Option<String>) -> Option<u64> {
    value.and_then(|s| s.parse::<u64>().ok()).filter(|v| *v > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.db_path, "dbsync.db");
        assert_eq!(cfg.probe.connect_timeout, Duration::from_secs(8));
        assert_eq!(cfg.probe.server_selection_timeout, Duration::from_secs(8));
        assert_eq!(cfg.probe.max_pool_size, 2);
        assert_eq!(cfg.retention.interval, Duration::from_secs(3600));
        assert_eq!(cfg.retention.horizon, Duration::from_secs(86400));
        assert!(cfg.secret_key.is_none());
    }

    #[test]
    fn test_load_overrides() {
        let vars: HashMap<&str, &str> = [
            ("DBSYNC_HTTP_PORT", "9090"),
            ("DBSYNC_DB_PATH", "/tmp/x.db"),
            ("DBSYNC_SECRET_KEY", "hunter2"),
            ("DBSYNC_CONNECT_TIMEOUT_MS", "1500"),
            ("DBSYNC_RETENTION_HORIZON_SECS", "60"),
        ]
        .into_iter()
        .collect();

        let cfg = ServerConfig::load_from(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.http_port, 9090);
        assert_eq!(cfg.db_path, "/tmp/x.db");
        assert_eq!(cfg.secret_key.as_deref(), Some("hunter2"));
        assert_eq!(cfg.probe.connect_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.probe.server_selection_timeout, Duration::from_secs(8));
        assert_eq!(cfg.retention.horizon, Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let cfg = ServerConfig::load_from(|k| match k {
            "DBSYNC_HTTP_PORT" => Some("not-a-port".to_string()),
            "DBSYNC_CONNECT_TIMEOUT_MS" => Some("0".to_string()),
            "DBSYNC_SECRET_KEY" => Some(String::new()),
            _ => None,
        });
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.probe.connect_timeout, Duration::from_secs(8));
        assert!(cfg.secret_key.is_none());
    }
}
