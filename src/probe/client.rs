//! Database client capabilities, one per backend type.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::ProbeError;
use crate::config::ProbeSettings;
use crate::db::BackendType;
use crate::metrics::{RawServerStatus, RawStorageStats};

/// Ability to open probe sessions against one backend type.
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    fn backend(&self) -> BackendType;

    /// False for placeholders that can never connect.
    fn is_available(&self) -> bool {
        true
    }

    /// Dial the target. The returned session owns a pool of at most
    /// `settings.max_pool_size` connections.
    async fn connect(
        &self,
        secret: &str,
        settings: &ProbeSettings,
    ) -> Result<Box<dyn DatabaseSession>, ProbeError>;
}

/// An open connection to a target, queried by a single probe.
#[async_trait]
pub trait DatabaseSession: Send + Sync {
    /// Round-trip to the server and return the selected database name.
    async fn select_server(&self) -> Result<String, ProbeError>;

    async fn server_status(&self) -> Result<RawServerStatus, ProbeError>;

    async fn list_collections(&self) -> Result<Vec<String>, ProbeError>;

    async fn storage_stats(&self) -> Result<RawStorageStats, ProbeError>;

    async fn close(self: Box<Self>) -> Result<(), ProbeError>;
}

/// Stand-in for a backend whose driver is not part of this build.
#[derive(Debug, Clone, Copy)]
pub struct NullClient {
    backend: BackendType,
}

impl NullClient {
    pub fn new(backend: BackendType) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl DatabaseClient for NullClient {
    fn backend(&self) -> BackendType {
        self.backend
    }

    fn is_available(&self) -> bool {
        false
    }

    async fn connect(
        &self,
        _secret: &str,
        _settings: &ProbeSettings,
    ) -> Result<Box<dyn DatabaseSession>, ProbeError> {
        Err(ProbeError::DriverUnavailable(self.backend))
    }
}

/// Clients registered per backend type. Every backend always resolves to
/// some client; missing drivers resolve to [`NullClient`].
#[derive(Clone)]
pub struct ClientRegistry {
    clients: HashMap<BackendType, Arc<dyn DatabaseClient>>,
}

impl ClientRegistry {
    /// A registry where every backend is unavailable.
    pub fn new() -> Self {
        let clients = BackendType::ALL
            .into_iter()
            .map(|b| (b, Arc::new(NullClient::new(b)) as Arc<dyn DatabaseClient>))
            .collect();
        Self { clients }
    }

    /// A registry with every driver compiled into this build.
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();

        #[cfg(feature = "mongodb")]
        registry.register(Arc::new(super::MongoClient));

        #[cfg(feature = "postgres")]
        registry.register(Arc::new(super::PostgresClient));

        #[cfg(feature = "mysql")]
        registry.register(Arc::new(super::MySqlClient));

        for (backend, available) in registry.drivers() {
            tracing::info!("Driver for {}: {}", backend, if available { "registered" } else { "unavailable" });
        }

        registry
    }

    /// Register (or replace) the client for its backend.
    pub fn register(&mut self, client: Arc<dyn DatabaseClient>) {
        self.clients.insert(client.backend(), client);
    }

    pub fn get(&self, backend: BackendType) -> Arc<dyn DatabaseClient> {
        self.clients
            .get(&backend)
            .cloned()
            .unwrap_or_else(|| Arc::new(NullClient::new(backend)))
    }

    /// Whether any real driver is registered.
    pub fn driver_available(&self) -> bool {
        self.clients.values().any(|c| c.is_available())
    }

    pub fn drivers(&self) -> BTreeMap<BackendType, bool> {
        BackendType::ALL
            .into_iter()
            .map(|b| (b, self.get(b).is_available()))
            .collect()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(feature = "postgres", feature = "mysql"))]
pub(crate) fn connect_error(e: sqlx::Error, settings: &ProbeSettings) -> ProbeError {
    match e {
        sqlx::Error::PoolTimedOut => ProbeError::Timeout {
            phase: super::ProbePhase::ServerSelection,
            budget: settings.server_selection_timeout,
        },
        other => ProbeError::Connect(other.to_string()),
    }
}

#[cfg(any(feature = "postgres", feature = "mysql"))]
pub(crate) fn query_error(e: sqlx::Error) -> ProbeError {
    ProbeError::Query(e.to_string())
}
