//! End-to-end engine scenarios driven through the dispatcher.

use dbsync::config::ServerConfig;
use dbsync::control::{Channel, ControlRequest, ControlResponse, OneshotResponder, ResultCode};
use dbsync::db::{BackendType, DatabaseDefinition, EventKind};
use dbsync::engine::Engine;
use dbsync::metrics::NullSampler;
use dbsync::probe::{ClientRegistry, ConnectionProbe};
use serde_json::json;
use std::time::Duration;
use tempfile::NamedTempFile;

fn open_engine(tmp: &NamedTempFile) -> Engine {
    let cfg = ServerConfig {
        db_path: tmp.path().to_string_lossy().into_owned(),
        ..Default::default()
    };
    Engine::open_with(&cfg, ClientRegistry::with_defaults(), Box::new(NullSampler)).unwrap()
}

async fn call(engine: &Engine, request: ControlRequest) -> ControlResponse {
    let (responder, rx) = OneshotResponder::new();
    engine
        .dispatcher()
        .dispatch(request, Channel::Push, Box::new(responder))
        .await
        .unwrap();
    rx.await.unwrap()
}

#[tokio::test]
async fn add_then_list_returns_decoded_secret() {
    let tmp = NamedTempFile::new().unwrap();
    let engine = open_engine(&tmp);

    let def = DatabaseDefinition::new("db1", "Primary", "mongodb://localhost/test", BackendType::MongoDb);
    assert!(engine.store().add_definition(&def));

    let defs = engine.store().list_definitions().unwrap();
    assert_eq!(defs.len(), 1);
    assert_eq!(defs[0].connection_secret, "mongodb://localhost/test");

    engine.shutdown().await;
}

#[tokio::test]
async fn empty_secret_probe_fails_fast() {
    let probe = ConnectionProbe::new(
        ClientRegistry::with_defaults(),
        Box::new(NullSampler),
        Default::default(),
    );

    let result = tokio::time::timeout(Duration::from_millis(500), probe.probe("", BackendType::Postgres, None))
        .await
        .unwrap();
    assert!(!result.ok);
    assert_eq!(result.error.as_deref(), Some("No connectionString provided"));
}

#[tokio::test]
async fn events_are_bounded_and_newest_first() {
    let tmp = NamedTempFile::new().unwrap();
    let engine = open_engine(&tmp);

    for i in 0..15 {
        engine
            .store()
            .append_event(Some("db1"), EventKind::Probed, &format!("probe {}", i));
    }

    let events = engine.store().list_events(Some("db1"), 10).unwrap();
    assert_eq!(events.len(), 10);
    assert!(events
        .windows(2)
        .all(|w| (w[0].timestamp, w[0].id) > (w[1].timestamp, w[1].id)));
    assert_eq!(events[0].message, "probe 14");

    engine.shutdown().await;
}

#[tokio::test]
async fn remove_records_disconnected_event() {
    let tmp = NamedTempFile::new().unwrap();
    let engine = open_engine(&tmp);

    let add = ControlRequest::new("dbsync", "addTarget")
        .with_correlation_id(1)
        .with_field("id", "db1")
        .with_field("label", "Primary")
        .with_field("connectionString", "mongodb://localhost/test");
    assert_eq!(call(&engine, add).await.result, ResultCode::Ok);

    let remove = ControlRequest::new("dbsync", "removeTarget")
        .with_correlation_id(2)
        .with_field("id", "db1");
    let resp = call(&engine, remove).await;
    assert_eq!(resp.result, ResultCode::Ok);
    assert_eq!(resp.correlation_id, json!(2));

    assert!(engine.store().list_definitions().unwrap().is_empty());
    let events = engine.store().list_events(Some("db1"), 100).unwrap();
    assert_eq!(events[0].kind, EventKind::Disconnected);

    engine.shutdown().await;
}

#[tokio::test]
async fn plugin_ping_reflects_registered_drivers() {
    let tmp = NamedTempFile::new().unwrap();
    let engine = open_engine(&tmp);

    let resp = call(&engine, ControlRequest::new("plugin", "ping").with_correlation_id("p")).await;
    assert_eq!(resp.result, ResultCode::Ok);
    assert_eq!(resp.body.version.as_deref(), Some(env!("CARGO_PKG_VERSION")));
    assert_eq!(
        resp.body.driver_available,
        Some(cfg!(any(feature = "mongodb", feature = "postgres", feature = "mysql")))
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn probing_sql_server_reports_missing_driver() {
    let tmp = NamedTempFile::new().unwrap();
    let engine = open_engine(&tmp);

    let add = ControlRequest::new("dbsync", "addTarget")
        .with_field("id", "billing")
        .with_field("connectionString", "Server=tcp:h,1433;Database=billing;User Id=sa");
    call(&engine, add).await;

    let resp = call(&engine, ControlRequest::new("dbsync", "probeTarget").with_field("id", "billing")).await;
    assert_eq!(resp.result, ResultCode::Error);
    let error = resp.body.error.unwrap();
    assert!(error.starts_with("DriverUnavailable"));
    assert!(resp.body.metrics.is_none());
    assert_eq!(resp.body.db_name.as_deref(), Some("billing"));

    let def = engine.store().get_definition("billing").unwrap().unwrap();
    assert_eq!(def.status, "error");
    assert_eq!(def.last_error.as_deref(), Some(error.as_str()));
    let events = engine.store().list_events(Some("billing"), 1).unwrap();
    assert_eq!(events[0].kind, EventKind::Error);

    engine.shutdown().await;
}
