//! Probe module for database health monitoring.
//!
//! A probe dials one target under two independent time budgets, gathers
//! server status, collection names and storage statistics concurrently, and
//! always releases its connection pool before returning.

mod client;
#[cfg(feature = "mongodb")]
mod mongo;
#[cfg(feature = "mysql")]
mod mysql;
#[cfg(feature = "postgres")]
mod postgres;

pub use client::*;
#[cfg(feature = "mongodb")]
pub use mongo::*;
#[cfg(feature = "mysql")]
pub use mysql::*;
#[cfg(feature = "postgres")]
pub use postgres::*;

use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::timeout;

use crate::config::ProbeSettings;
use crate::db::{BackendType, EventKind, EventRecorder};
use crate::metrics::{normalize, Metrics, SystemSampler};

/// Which budget a timeout exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbePhase {
    Connect,
    ServerSelection,
}

impl fmt::Display for ProbePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbePhase::Connect => f.write_str("connection establishment"),
            ProbePhase::ServerSelection => f.write_str("server selection"),
        }
    }
}

/// Probe error types.
#[derive(Error, Debug, Clone)]
pub enum ProbeError {
    #[error("No connectionString provided")]
    InvalidTarget,
    #[error("DriverUnavailable: no client registered for backend '{0}'")]
    DriverUnavailable(BackendType),
    #[error("DriverUnavailable: {0}")]
    UnknownBackend(String),
    #[error("Timeout: {phase} exceeded {budget:?}")]
    Timeout { phase: ProbePhase, budget: Duration },
    #[error("ConnectFailure: {0}")]
    Connect(String),
    #[error("query failed: {0}")]
    Query(String),
}

/// Outcome of one probe. Never cached or shared.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub ok: bool,
    pub target_db_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_names: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub failure: Option<ProbeError>,
}

impl ProbeResult {
    fn succeeded(target_db_name: Option<String>, metrics: Metrics, collection_names: Vec<String>) -> Self {
        Self {
            ok: true,
            target_db_name,
            metrics: Some(metrics),
            collection_names: Some(collection_names),
            error: None,
            failure: None,
        }
    }

    pub(crate) fn failed(target_db_name: Option<String>, error: ProbeError) -> Self {
        Self {
            ok: false,
            target_db_name,
            metrics: None,
            collection_names: None,
            error: Some(error.to_string()),
            failure: Some(error),
        }
    }
}

/// Runs bounded, fault-tolerant probes against database targets.
pub struct ConnectionProbe {
    registry: ClientRegistry,
    sampler: Box<dyn SystemSampler>,
    recorder: Option<Arc<dyn EventRecorder>>,
    settings: ProbeSettings,
}

impl ConnectionProbe {
    pub fn new(registry: ClientRegistry, sampler: Box<dyn SystemSampler>, settings: ProbeSettings) -> Self {
        Self {
            registry,
            sampler,
            recorder: None,
            settings,
        }
    }

    /// Record a `Probed`/`Error` event for every completed probe.
    pub fn with_recorder(mut self, recorder: Arc<dyn EventRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &ProbeSettings {
        &self.settings
    }

    /// Probe with the configured budgets.
    pub async fn probe(&self, secret: &str, backend: BackendType, target_id: Option<&str>) -> ProbeResult {
        self.probe_with(secret, backend, target_id, &self.settings).await
    }

    /// Fail a probe whose backend could not be resolved, without any I/O.
    ///
    /// The failure is logged and recorded like any other probe outcome.
    pub fn reject(&self, secret: &str, reason: impl Into<String>, target_id: Option<&str>) -> ProbeResult {
        let result = if secret.trim().is_empty() {
            ProbeResult::failed(None, ProbeError::InvalidTarget)
        } else {
            ProbeResult::failed(database_name_from_secret(secret), ProbeError::UnknownBackend(reason.into()))
        };

        tracing::warn!(
            target_id = target_id.unwrap_or("-"),
            "Probe rejected: {}",
            result.error.as_deref().unwrap_or("-")
        );
        self.record(target_id, &result);
        result
    }

    /// Probe with explicit budgets.
    pub async fn probe_with(
        &self,
        secret: &str,
        backend: BackendType,
        target_id: Option<&str>,
        settings: &ProbeSettings,
    ) -> ProbeResult {
        let result = self.run(secret, backend, settings).await;

        match &result.error {
            None => tracing::debug!(target_id = target_id.unwrap_or("-"), %backend, "Probe succeeded"),
            Some(e) => tracing::warn!(target_id = target_id.unwrap_or("-"), %backend, "Probe failed: {}", e),
        }

        self.record(target_id, &result);
        result
    }

    async fn run(&self, secret: &str, backend: BackendType, settings: &ProbeSettings) -> ProbeResult {
        if secret.trim().is_empty() {
            return ProbeResult::failed(None, ProbeError::InvalidTarget);
        }

        let hint = database_name_from_secret(secret);
        let client = self.registry.get(backend);
        if !client.is_available() {
            return ProbeResult::failed(hint, ProbeError::DriverUnavailable(backend));
        }

        let started = Instant::now();
        let session = match timeout(settings.connect_timeout, client.connect(secret, settings)).await {
            Ok(Ok(session)) => SessionGuard::new(session),
            Ok(Err(e)) => return ProbeResult::failed(hint, e),
            Err(_) => {
                return ProbeResult::failed(
                    hint,
                    ProbeError::Timeout {
                        phase: ProbePhase::Connect,
                        budget: settings.connect_timeout,
                    },
                )
            }
        };

        let latency = started.elapsed();

        let outcome = self.collect(&session, latency, settings).await;
        session.release().await;

        match outcome {
            Ok((db_name, metrics, collections)) => {
                let db_name = Some(db_name).filter(|n| !n.is_empty()).or(hint);
                ProbeResult::succeeded(db_name, metrics, collections)
            }
            Err(e) => ProbeResult::failed(hint, e),
        }
    }

    async fn collect(
        &self,
        guard: &SessionGuard,
        latency: Duration,
        settings: &ProbeSettings,
    ) -> Result<(String, Metrics, Vec<String>), ProbeError> {
        let session = guard.session()?;
        let budget = settings.server_selection_timeout;

        let db_name = match timeout(budget, session.select_server()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ProbeError::Timeout {
                    phase: ProbePhase::ServerSelection,
                    budget,
                })
            }
        };

        let (status, collections, stats) = tokio::join!(
            degrade("server status", budget, session.server_status()),
            degrade("collection enumeration", budget, session.list_collections()),
            degrade("storage statistics", budget, session.storage_stats()),
        );

        let metrics = normalize(status.as_ref(), stats.as_ref(), self.sampler.sample(), latency);
        Ok((db_name, metrics, collections.unwrap_or_default()))
    }

    fn record(&self, target_id: Option<&str>, result: &ProbeResult) {
        let Some(recorder) = &self.recorder else {
            return;
        };

        if result.ok {
            let latency = result.metrics.as_ref().map(|m| m.latency_ms).unwrap_or(0);
            let db_name = result.target_db_name.as_deref().unwrap_or("unknown");
            recorder.record(
                target_id,
                EventKind::Probed,
                &format!("Probe succeeded in {}ms (database: {})", latency, db_name),
            );
        } else {
            let error = result.error.as_deref().unwrap_or("unknown error");
            recorder.record(target_id, EventKind::Error, &format!("Probe failed: {}", error));
        }
    }
}

/// Run one sub-query, turning failure into `None`.
async fn degrade<T, F>(what: &str, budget: Duration, query: F) -> Option<T>
where
    F: Future<Output = Result<T, ProbeError>>,
{
    match timeout(budget, query).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            tracing::warn!("PartialDegradation: {} unavailable: {}", what, e);
            None
        }
        Err(_) => {
            tracing::warn!("PartialDegradation: {} timed out after {:?}", what, budget);
            None
        }
    }
}

/// Owns an open session until it is released.
///
/// If the guard is dropped without `release` (the probe future was
/// abandoned), the session is closed on a background task.
struct SessionGuard {
    session: Option<Box<dyn DatabaseSession>>,
}

impl SessionGuard {
    fn new(session: Box<dyn DatabaseSession>) -> Self {
        Self {
            session: Some(session),
        }
    }

    fn session(&self) -> Result<&dyn DatabaseSession, ProbeError> {
        self.session
            .as_deref()
            .ok_or_else(|| ProbeError::Connect("session already released".to_string()))
    }

    async fn release(mut self) {
        if let Some(session) = self.session.take() {
            close_quietly(session).await;
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(close_quietly(session));
                }
                Err(_) => tracing::warn!("Probe session dropped outside a runtime; not closed"),
            }
        }
    }
}

async fn close_quietly(session: Box<dyn DatabaseSession>) {
    if let Err(e) = session.close().await {
        tracing::debug!("Ignoring error while releasing probe session: {}", e);
    }
}

/// Best-effort database name from a connection string.
///
/// Handles URL forms (`scheme://host/db?opts`, including multi-host lists)
/// and `Key=Value;` forms (`Database=` / `Initial Catalog=`).
pub fn database_name_from_secret(secret: &str) -> Option<String> {
    let secret = secret.trim();

    if let Ok(url) = url::Url::parse(secret) {
        if url.has_host() {
            return url
                .path_segments()
                .and_then(|mut segments| segments.next())
                .filter(|name| !name.is_empty())
                .map(|name| name.to_string());
        }
    }

    if let Some((_, rest)) = secret.split_once("://") {
        let rest = rest.split(['?', '#']).next().unwrap_or(rest);
        return rest
            .split_once('/')
            .map(|(_, db)| db.trim_matches('/'))
            .filter(|db| !db.is_empty())
            .map(|db| db.to_string());
    }

    secret
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| {
            matches!(
                key.trim().to_ascii_lowercase().as_str(),
                "database" | "initial catalog"
            )
        })
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
