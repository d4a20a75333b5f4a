//! Routes control requests to engine operations.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::{Channel, ControlRequest, ControlResponse, DispatchError, Responder, ResponseBody, ResultCode};
use crate::config::ProbeSettings;
use crate::db::{BackendType, DatabaseDefinition, SettingsStore, DEFAULT_EVENT_LIMIT};
use crate::probe::{ConnectionProbe, ProbeError};

/// Upper bound on `listEvents` page size.
pub const MAX_EVENT_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    ListTargets,
    ProbeTarget,
    AddTarget,
    UpdateTarget,
    RemoveTarget,
    ListEvents,
    Ping,
    ProbeSecret,
}

fn route(action: &str, operation: &str) -> Option<Route> {
    match (action, operation) {
        ("dbsync", "listTargets" | "list") => Some(Route::ListTargets),
        ("dbsync", "probeTarget" | "probe") => Some(Route::ProbeTarget),
        ("dbsync", "addTarget") => Some(Route::AddTarget),
        ("dbsync", "updateTarget") => Some(Route::UpdateTarget),
        ("dbsync", "removeTarget") => Some(Route::RemoveTarget),
        ("dbsync", "listEvents") => Some(Route::ListEvents),
        ("dbsync" | "plugin" | "admin", "ping") => Some(Route::Ping),
        ("admin", "probe") => Some(Route::ProbeSecret),
        _ => None,
    }
}

struct Reply {
    result: ResultCode,
    body: ResponseBody,
}

impl Reply {
    fn ok(body: ResponseBody) -> Self {
        Self {
            result: ResultCode::Ok,
            body,
        }
    }

    fn not_found(message: String) -> Self {
        Self {
            result: ResultCode::NotFound,
            body: ResponseBody {
                error: Some(message),
                ..Default::default()
            },
        }
    }
}

/// Sends exactly one correlated response per request, whatever the
/// handler does.
pub struct ControlDispatcher {
    store: SettingsStore,
    probe: Arc<ConnectionProbe>,
}

impl ControlDispatcher {
    pub fn new(store: SettingsStore, probe: Arc<ConnectionProbe>) -> Self {
        Self { store, probe }
    }

    pub fn store(&self) -> &SettingsStore {
        &self.store
    }

    /// Handle one request and deliver its response through `responder`.
    ///
    /// Handler failures, including panics, become `error` responses. The
    /// only error returned is a responder that could not deliver.
    pub async fn dispatch(
        &self,
        request: ControlRequest,
        channel: Channel,
        responder: Box<dyn Responder>,
    ) -> Result<(), DispatchError> {
        let outcome = AssertUnwindSafe(self.handle(&request)).catch_unwind().await;

        let (result, body) = match outcome {
            Ok(Ok(reply)) => (reply.result, reply.body),
            Ok(Err(e)) => {
                let code = match (&e, channel) {
                    (DispatchError::Unrecognized { .. }, Channel::Push) => ResultCode::Unsupported,
                    _ => ResultCode::Error,
                };
                tracing::warn!(
                    action = %request.action,
                    operation = %request.operation,
                    "Request failed: {}",
                    e
                );
                (code, error_body(e.to_string()))
            }
            Err(panic) => {
                let e = DispatchError::Internal(panic_message(&*panic));
                tracing::error!(
                    action = %request.action,
                    operation = %request.operation,
                    "Handler panicked: {}",
                    e
                );
                (ResultCode::Error, error_body(e.to_string()))
            }
        };

        responder
            .send(ControlResponse::for_request(&request, result, body))
            .await
    }

    async fn handle(&self, request: &ControlRequest) -> Result<Reply, DispatchError> {
        let route = route(&request.action, &request.operation).ok_or_else(|| DispatchError::Unrecognized {
            action: request.action.clone(),
            operation: request.operation.clone(),
        })?;

        match route {
            Route::ListTargets => self.list_targets(),
            Route::ProbeTarget => self.probe_target(request).await,
            Route::AddTarget => self.add_target(request),
            Route::UpdateTarget => self.update_target(request),
            Route::RemoveTarget => self.remove_target(request),
            Route::ListEvents => self.list_events(request),
            Route::Ping => Ok(self.ping()),
            Route::ProbeSecret => self.probe_secret(request).await,
        }
    }

    fn list_targets(&self) -> Result<Reply, DispatchError> {
        let databases = self
            .store
            .list_definitions()?
            .iter()
            .map(DatabaseDefinition::summary)
            .collect();

        Ok(Reply::ok(ResponseBody {
            databases: Some(databases),
            ..Default::default()
        }))
    }

    async fn probe_target(&self, request: &ControlRequest) -> Result<Reply, DispatchError> {
        let id = required_id(request)?;
        let Some(def) = self.store.get_definition(&id)? else {
            return Ok(Reply::not_found(format!("Target '{}' not found", id)));
        };

        let settings = self.probe_settings(request);
        let result = self
            .probe
            .probe_with(&def.connection_secret, def.backend_type, Some(&def.id), &settings)
            .await;

        let status = if result.ok { "online" } else { "error" };
        self.store.record_probe_outcome(
            &def.id,
            status,
            result.target_db_name.as_deref(),
            result.error.as_deref(),
        );

        Ok(Reply {
            result: if result.ok { ResultCode::Ok } else { ResultCode::Error },
            body: ResponseBody {
                metrics: result.metrics,
                collections: result.collection_names,
                db_name: result.target_db_name,
                error: result.error,
                ..Default::default()
            },
        })
    }

    fn add_target(&self, request: &ControlRequest) -> Result<Reply, DispatchError> {
        let secret = request
            .str_field(&["connectionString", "connectionSecret"])
            .ok_or_else(|| DispatchError::InvalidInput(ProbeError::InvalidTarget.to_string()))?;
        let backend = backend_for(request, &secret)?
            .ok_or_else(|| DispatchError::InvalidInput("cannot infer backendType from connectionString".to_string()))?;

        let id = request
            .str_field(&["id"])
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let label = request
            .str_field(&["label", "name"])
            .unwrap_or_else(|| id.clone());

        let def = DatabaseDefinition::new(id, label, secret, backend);
        if !self.store.add_definition(&def) {
            return Err(DispatchError::Store(format!("could not add target '{}'", def.id)));
        }

        tracing::info!(target_id = %def.id, backend = %def.backend_type, "Target added");
        Ok(Reply::ok(ResponseBody {
            target: Some(def.summary()),
            ..Default::default()
        }))
    }

    fn update_target(&self, request: &ControlRequest) -> Result<Reply, DispatchError> {
        let id = required_id(request)?;
        let Some(mut def) = self.store.get_definition(&id)? else {
            return Ok(Reply::not_found(format!("Target '{}' not found", id)));
        };

        if let Some(label) = request.str_field(&["label", "name"]) {
            def.label = label;
        }
        if let Some(secret) = request.str_field(&["connectionString", "connectionSecret"]) {
            if let Some(backend) = backend_for(request, &secret)? {
                def.backend_type = backend;
            }
            def.connection_secret = secret;
        } else if let Some(backend) = backend_for(request, "")? {
            def.backend_type = backend;
        }

        if !self.store.update_definition(&id, &def) {
            return Err(DispatchError::Store(format!("could not update target '{}'", id)));
        }

        let target = self.store.get_definition(&id)?.map(|d| d.summary());
        Ok(Reply::ok(ResponseBody {
            target,
            ..Default::default()
        }))
    }

    fn remove_target(&self, request: &ControlRequest) -> Result<Reply, DispatchError> {
        let id = required_id(request)?;
        if !self.store.remove_definition(&id)? {
            return Ok(Reply::not_found(format!("Target '{}' not found", id)));
        }

        tracing::info!(target_id = %id, "Target removed");
        Ok(Reply::ok(ResponseBody::default()))
    }

    fn list_events(&self, request: &ControlRequest) -> Result<Reply, DispatchError> {
        let target_id = request.str_field(&["targetId", "id"]);
        let limit = request
            .usize_field("limit")
            .unwrap_or(DEFAULT_EVENT_LIMIT)
            .clamp(1, MAX_EVENT_LIMIT);

        let events = self.store.list_events(target_id.as_deref(), limit)?;
        Ok(Reply::ok(ResponseBody {
            events: Some(events),
            ..Default::default()
        }))
    }

    fn ping(&self) -> Reply {
        let registry = self.probe.registry();
        Reply::ok(ResponseBody {
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            driver_available: Some(registry.driver_available()),
            drivers: Some(registry.drivers()),
            ..Default::default()
        })
    }

    /// Probe an ad hoc connection string that is not stored as a target.
    ///
    /// Always answers with a probe result, even when the backend cannot be
    /// resolved.
    async fn probe_secret(&self, request: &ControlRequest) -> Result<Reply, DispatchError> {
        let secret = request
            .str_field(&["connectionString", "connectionSecret"])
            .unwrap_or_default();

        let backend = match request.str_field(&["backendType"]) {
            Some(name) => name.parse::<BackendType>(),
            None => BackendType::infer(&secret)
                .ok_or_else(|| "cannot infer backendType from connectionString".to_string()),
        };

        let result = match backend {
            Ok(backend) if !secret.is_empty() => {
                let settings = self.probe_settings(request);
                self.probe.probe_with(&secret, backend, None, &settings).await
            }
            Ok(_) => self.probe.reject(&secret, "", None),
            Err(reason) => self.probe.reject(&secret, reason, None),
        };

        Ok(Reply {
            result: if result.ok { ResultCode::Ok } else { ResultCode::Error },
            body: ResponseBody {
                probe: Some(result),
                ..Default::default()
            },
        })
    }

    /// Configured budgets, optionally replaced by a per-request `timeoutMs`.
    fn probe_settings(&self, request: &ControlRequest) -> ProbeSettings {
        let mut settings = self.probe.settings().clone();
        if let Some(ms) = request.usize_field("timeoutMs").filter(|ms| *ms > 0) {
            let budget = Duration::from_millis(ms as u64);
            settings.connect_timeout = budget;
            settings.server_selection_timeout = budget;
        }
        settings
    }
}

fn required_id(request: &ControlRequest) -> Result<String, DispatchError> {
    request
        .str_field(&["id", "targetId"])
        .ok_or_else(|| DispatchError::InvalidInput("id is required".to_string()))
}

/// Explicit `backendType` if given, else inferred from `secret`.
fn backend_for(request: &ControlRequest, secret: &str) -> Result<Option<BackendType>, DispatchError> {
    match request.str_field(&["backendType"]) {
        Some(name) => name.parse().map(Some).map_err(DispatchError::InvalidInput),
        None => Ok(BackendType::infer(secret)),
    }
}

fn error_body(message: String) -> ResponseBody {
    ResponseBody {
        error: Some(message),
        ..Default::default()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ChannelResponder, OneshotResponder};
    use crate::db::{EventKind, SecretCodec};
    use crate::metrics::{NullSampler, RawServerStatus, RawStorageStats};
    use crate::probe::{ClientRegistry, DatabaseClient, DatabaseSession};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::NamedTempFile;
    use tokio::sync::mpsc;

    struct StubClient {
        dials: Arc<AtomicUsize>,
    }

    struct StubSession;

    #[async_trait]
    impl DatabaseClient for StubClient {
        fn backend(&self) -> BackendType {
            BackendType::Postgres
        }

        async fn connect(&self, _secret: &str, _settings: &ProbeSettings) -> Result<Box<dyn DatabaseSession>, ProbeError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(StubSession))
        }
    }

    #[async_trait]
    impl DatabaseSession for StubSession {
        async fn select_server(&self) -> Result<String, ProbeError> {
            Ok("inventory".to_string())
        }

        async fn server_status(&self) -> Result<RawServerStatus, ProbeError> {
            Ok(RawServerStatus {
                version: Some("16.2".to_string()),
                ..Default::default()
            })
        }

        async fn list_collections(&self) -> Result<Vec<String>, ProbeError> {
            Ok(vec!["public.orders".to_string()])
        }

        async fn storage_stats(&self) -> Result<RawStorageStats, ProbeError> {
            Ok(RawStorageStats::default())
        }

        async fn close(self: Box<Self>) -> Result<(), ProbeError> {
            Ok(())
        }
    }

    struct PanickingClient;

    #[async_trait]
    impl DatabaseClient for PanickingClient {
        fn backend(&self) -> BackendType {
            BackendType::MySql
        }

        async fn connect(&self, _secret: &str, _settings: &ProbeSettings) -> Result<Box<dyn DatabaseSession>, ProbeError> {
            panic!("driver exploded");
        }
    }

    struct Fixture {
        dispatcher: Arc<ControlDispatcher>,
        dials: Arc<AtomicUsize>,
        _tmp: NamedTempFile,
    }

    fn fixture(with_drivers: bool) -> Fixture {
        let tmp = NamedTempFile::new().unwrap();
        let store = SettingsStore::open(tmp.path(), SecretCodec::Base64).unwrap();
        let dials = Arc::new(AtomicUsize::new(0));

        let mut registry = ClientRegistry::new();
        if with_drivers {
            registry.register(Arc::new(StubClient { dials: dials.clone() }));
            registry.register(Arc::new(PanickingClient));
        }

        let probe = ConnectionProbe::new(registry, Box::new(NullSampler), ProbeSettings::default())
            .with_recorder(Arc::new(store.clone()));

        Fixture {
            dispatcher: Arc::new(ControlDispatcher::new(store, Arc::new(probe))),
            dials,
            _tmp: tmp,
        }
    }

    async fn call(dispatcher: &ControlDispatcher, request: ControlRequest, channel: Channel) -> ControlResponse {
        let (responder, rx) = OneshotResponder::new();
        dispatcher.dispatch(request, channel, Box::new(responder)).await.unwrap();
        rx.await.unwrap()
    }

    fn req(action: &str, operation: &str) -> ControlRequest {
        ControlRequest::new(action, operation).with_correlation_id("c-1")
    }

    #[tokio::test]
    async fn test_plugin_ping_reports_drivers() {
        let fx = fixture(true);
        let resp = call(&fx.dispatcher, req("plugin", "ping"), Channel::Push).await;
        assert_eq!(resp.result, ResultCode::Ok);
        assert_eq!(resp.body.version.as_deref(), Some(env!("CARGO_PKG_VERSION")));
        assert_eq!(resp.body.driver_available, Some(true));
        assert_eq!(resp.body.drivers.unwrap()[&BackendType::Postgres], true);

        let fx = fixture(false);
        let resp = call(&fx.dispatcher, req("plugin", "ping"), Channel::Admin).await;
        assert_eq!(resp.result, ResultCode::Ok);
        assert_eq!(resp.body.driver_available, Some(false));
    }

    #[tokio::test]
    async fn test_unknown_route_depends_on_channel() {
        let fx = fixture(true);

        let resp = call(&fx.dispatcher, req("dbsync", "dropDatabase"), Channel::Push).await;
        assert_eq!(resp.result, ResultCode::Unsupported);
        assert_eq!(resp.correlation_id, json!("c-1"));

        let resp = call(&fx.dispatcher, req("plugin", "listTargets"), Channel::Admin).await;
        assert_eq!(resp.result, ResultCode::Error);
        assert_eq!(resp.correlation_id, json!("c-1"));
        assert!(resp.body.error.unwrap().starts_with("Unrecognized"));
    }

    #[tokio::test]
    async fn test_add_list_and_remove_target() {
        let fx = fixture(true);

        let add = req("dbsync", "addTarget")
            .with_field("id", "db1")
            .with_field("label", "Primary")
            .with_field("connectionString", "postgres://monitor@db.internal/inventory");
        let resp = call(&fx.dispatcher, add, Channel::Push).await;
        assert_eq!(resp.result, ResultCode::Ok);
        let target = resp.body.target.unwrap();
        assert_eq!(target.backend_type, BackendType::Postgres);
        assert!(target.has_connection_string);

        let resp = call(&fx.dispatcher, req("dbsync", "list"), Channel::Push).await;
        let databases = resp.body.databases.unwrap();
        assert_eq!(databases.len(), 1);
        assert_eq!(databases[0].id, "db1");
        let wire = serde_json::to_string(&databases).unwrap();
        assert!(!wire.contains("db.internal"));

        let remove = req("dbsync", "removeTarget").with_field("id", "db1");
        assert_eq!(call(&fx.dispatcher, remove.clone(), Channel::Push).await.result, ResultCode::Ok);
        assert_eq!(call(&fx.dispatcher, remove, Channel::Push).await.result, ResultCode::NotFound);

        let events = fx.dispatcher.store().list_events(Some("db1"), 10).unwrap();
        assert_eq!(events[0].kind, EventKind::Disconnected);
    }

    #[tokio::test]
    async fn test_add_target_validation() {
        let fx = fixture(true);

        let resp = call(&fx.dispatcher, req("dbsync", "addTarget").with_field("id", "x"), Channel::Push).await;
        assert_eq!(resp.result, ResultCode::Error);
        assert!(resp.body.error.unwrap().contains("No connectionString provided"));

        let unknown = req("dbsync", "addTarget").with_field("connectionString", "redis://localhost");
        let resp = call(&fx.dispatcher, unknown, Channel::Push).await;
        assert_eq!(resp.result, ResultCode::Error);

        let generated = req("dbsync", "addTarget").with_field("connectionString", "mysql://root@localhost/app");
        let resp = call(&fx.dispatcher, generated, Channel::Push).await;
        assert_eq!(resp.result, ResultCode::Ok);
        let target = resp.body.target.unwrap();
        assert_eq!(target.label, target.id);
        assert_eq!(target.backend_type, BackendType::MySql);
    }

    #[tokio::test]
    async fn test_update_target_merges_fields() {
        let fx = fixture(true);
        let add = req("dbsync", "addTarget")
            .with_field("id", "db1")
            .with_field("label", "Primary")
            .with_field("connectionString", "mongodb://localhost/test");
        call(&fx.dispatcher, add, Channel::Push).await;

        let update = req("dbsync", "updateTarget")
            .with_field("id", "db1")
            .with_field("connectionString", "postgres://u@h/app");
        let resp = call(&fx.dispatcher, update, Channel::Push).await;
        assert_eq!(resp.result, ResultCode::Ok);
        let target = resp.body.target.unwrap();
        assert_eq!(target.label, "Primary");
        assert_eq!(target.backend_type, BackendType::Postgres);

        let missing = req("dbsync", "updateTarget").with_field("id", "nope").with_field("label", "x");
        assert_eq!(call(&fx.dispatcher, missing, Channel::Push).await.result, ResultCode::NotFound);
    }

    #[tokio::test]
    async fn test_probe_unknown_target_is_notfound_without_dial() {
        let fx = fixture(true);
        let resp = call(&fx.dispatcher, req("dbsync", "probeTarget").with_field("id", "ghost"), Channel::Push).await;
        assert_eq!(resp.result, ResultCode::NotFound);
        assert_eq!(fx.dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_probe_target_records_outcome() {
        let fx = fixture(true);
        let add = req("dbsync", "addTarget")
            .with_field("id", "db1")
            .with_field("connectionString", "postgres://monitor@db.internal/inventory");
        call(&fx.dispatcher, add, Channel::Push).await;

        let resp = call(&fx.dispatcher, req("dbsync", "probe").with_field("id", "db1"), Channel::Push).await;
        assert_eq!(resp.result, ResultCode::Ok, "{:?}", resp.body.error);
        assert_eq!(resp.body.collections, Some(vec!["public.orders".to_string()]));
        assert_eq!(resp.body.metrics.unwrap().backend_version, "16.2");
        assert_eq!(resp.body.db_name.as_deref(), Some("inventory"));
        assert_eq!(fx.dials.load(Ordering::SeqCst), 1);

        let def = fx.dispatcher.store().get_definition("db1").unwrap().unwrap();
        assert_eq!(def.status, "online");
        assert_eq!(def.last_known_db_name.as_deref(), Some("inventory"));
        assert_eq!(def.last_error, None);

        let events = fx.dispatcher.store().list_events(Some("db1"), 10).unwrap();
        assert_eq!(events[0].kind, EventKind::Probed);
    }

    #[tokio::test]
    async fn test_failed_probe_keeps_last_error() {
        let fx = fixture(true);
        let add = req("dbsync", "addTarget")
            .with_field("id", "doc")
            .with_field("connectionString", "mssql://sa@h/billing");
        call(&fx.dispatcher, add, Channel::Push).await;

        let resp = call(&fx.dispatcher, req("dbsync", "probe").with_field("id", "doc"), Channel::Push).await;
        assert_eq!(resp.result, ResultCode::Error);

        let resp = call(&fx.dispatcher, req("dbsync", "list"), Channel::Push).await;
        let summary = resp
            .body
            .databases
            .unwrap()
            .into_iter()
            .find(|d| d.id == "doc")
            .unwrap();
        assert_eq!(summary.status, "error");
        assert!(summary.last_error.unwrap().starts_with("DriverUnavailable"));
    }

    #[tokio::test]
    async fn test_concurrent_removes_have_one_winner() {
        let fx = fixture(true);
        let add = req("dbsync", "addTarget")
            .with_field("id", "db1")
            .with_field("connectionString", "postgres://u@h/inventory");
        call(&fx.dispatcher, add, Channel::Push).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let dispatcher = fx.dispatcher.clone();
            handles.push(tokio::spawn(async move {
                call(&dispatcher, req("dbsync", "removeTarget").with_field("id", "db1"), Channel::Push).await
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().result);
        }
        assert_eq!(results.iter().filter(|r| **r == ResultCode::Ok).count(), 1);
        assert_eq!(results.iter().filter(|r| **r == ResultCode::NotFound).count(), 7);
    }

    #[tokio::test]
    async fn test_list_events_limit() {
        let fx = fixture(true);
        for i in 0..5 {
            fx.dispatcher
                .store()
                .append_event(Some("db1"), EventKind::System, &format!("event {}", i));
        }

        let resp = call(
            &fx.dispatcher,
            req("dbsync", "listEvents").with_field("targetId", "db1").with_field("limit", 3),
            Channel::Push,
        )
        .await;
        let events = resp.body.events.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].message, "event 4");
    }

    #[tokio::test]
    async fn test_admin_probe_without_secret() {
        let fx = fixture(true);
        let resp = call(&fx.dispatcher, req("admin", "probe"), Channel::Admin).await;
        assert_eq!(resp.result, ResultCode::Error);

        let probe = resp.body.probe.unwrap();
        assert!(!probe.ok);
        assert_eq!(probe.error.as_deref(), Some("No connectionString provided"));
        assert_eq!(fx.dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_admin_probe_with_secret() {
        let fx = fixture(true);
        let request = req("admin", "probe").with_field("connectionString", "postgres://u@h/inventory");
        let resp = call(&fx.dispatcher, request, Channel::Admin).await;
        assert_eq!(resp.result, ResultCode::Ok);
        assert!(resp.body.probe.unwrap().ok);
    }

    #[tokio::test]
    async fn test_admin_probe_unresolved_backend_is_probe_result() {
        let fx = fixture(true);

        let request = req("admin", "probe").with_field("connectionString", "redis://localhost:6379/0");
        let resp = call(&fx.dispatcher, request, Channel::Admin).await;
        assert_eq!(resp.result, ResultCode::Error);
        let result = resp.body.probe.unwrap();
        assert!(!result.ok);
        assert!(result.error.unwrap().starts_with("DriverUnavailable"));

        let request = req("admin", "probe")
            .with_field("connectionString", "postgres://u@h/inventory")
            .with_field("backendType", "oracle");
        let resp = call(&fx.dispatcher, request, Channel::Admin).await;
        let result = resp.body.probe.unwrap();
        assert!(!result.ok);
        assert_eq!(result.target_db_name.as_deref(), Some("inventory"));
        assert!(result.error.unwrap().contains("oracle"));
        assert_eq!(fx.dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handler_panic_still_responds() {
        let fx = fixture(true);
        let add = req("dbsync", "addTarget")
            .with_field("id", "boom")
            .with_field("connectionString", "mysql://root@localhost/app");
        call(&fx.dispatcher, add, Channel::Push).await;

        let resp = call(&fx.dispatcher, req("dbsync", "probeTarget").with_field("id", "boom"), Channel::Push).await;
        assert_eq!(resp.result, ResultCode::Error);
        assert_eq!(resp.correlation_id, json!("c-1"));
        let error = resp.body.error.unwrap();
        assert!(error.starts_with("Internal"));
        assert!(error.contains("driver exploded"));
    }

    #[tokio::test]
    async fn test_concurrent_requests_each_get_one_response() {
        let fx = fixture(true);
        let add = req("dbsync", "addTarget")
            .with_field("id", "db1")
            .with_field("connectionString", "postgres://u@h/inventory");
        call(&fx.dispatcher, add, Channel::Push).await;

        const N: usize = 32;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handles = Vec::new();
        for i in 0..N {
            let dispatcher = fx.dispatcher.clone();
            let responder = ChannelResponder::new(tx.clone());
            let request = match i % 3 {
                0 => ControlRequest::new("dbsync", "probeTarget").with_field("id", "db1"),
                1 => ControlRequest::new("plugin", "ping"),
                _ => ControlRequest::new("dbsync", "nonsense"),
            }
            .with_correlation_id(i as u64);
            handles.push(tokio::spawn(async move {
                dispatcher.dispatch(request, Channel::Push, Box::new(responder)).await
            }));
        }
        drop(tx);

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mut seen = HashSet::new();
        while let Some(resp) = rx.recv().await {
            assert!(seen.insert(resp.correlation_id.as_u64().unwrap()));
        }
        assert_eq!(seen.len(), N);
        assert_eq!(seen, (0..N as u64).collect());
    }

    #[test]
    fn test_route_table() {
        assert_eq!(route("dbsync", "list"), Some(Route::ListTargets));
        assert_eq!(route("dbsync", "probe"), Some(Route::ProbeTarget));
        assert_eq!(route("admin", "probe"), Some(Route::ProbeSecret));
        assert_eq!(route("admin", "ping"), Some(Route::Ping));
        assert_eq!(route("plugin", "addTarget"), None);
        assert_eq!(route("", ""), None);
    }
}
