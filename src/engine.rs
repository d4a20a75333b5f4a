//! Engine context: owns the store, the probe and the retention task.

use std::sync::Arc;
use thiserror::Error;

use crate::config::ServerConfig;
use crate::control::ControlDispatcher;
use crate::db::{DbError, EventKind, SecretCodec, SecretError, SettingsStore};
use crate::metrics::{platform_sampler, SystemSampler};
use crate::probe::{ClientRegistry, ConnectionProbe};
use crate::scheduler::RetentionManager;

/// Startup error types.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to open settings store: {0}")]
    Store(#[from] DbError),
    #[error("invalid secret key: {0}")]
    Secret(#[from] SecretError),
}

/// A running monitoring engine.
pub struct Engine {
    store: SettingsStore,
    dispatcher: Arc<ControlDispatcher>,
    retention: RetentionManager,
}

impl Engine {
    /// Open the engine with every driver compiled into this build.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(config: &ServerConfig) -> Result<Self, EngineError> {
        Self::open_with(config, ClientRegistry::with_defaults(), platform_sampler())
    }

    /// Open the engine with an explicit client registry and sampler.
    pub fn open_with(
        config: &ServerConfig,
        registry: ClientRegistry,
        sampler: Box<dyn SystemSampler>,
    ) -> Result<Self, EngineError> {
        let codec = SecretCodec::from_key(config.secret_key.as_deref())?;
        let store = SettingsStore::open(&config.db_path, codec)?;

        let probe = ConnectionProbe::new(registry, sampler, config.probe.clone())
            .with_recorder(Arc::new(store.clone()));
        let dispatcher = Arc::new(ControlDispatcher::new(store.clone(), Arc::new(probe)));
        let retention = RetentionManager::start(store.clone(), config.retention.clone());

        store.append_event(None, EventKind::System, "engine started");
        tracing::info!("Engine started (store: {})", config.db_path);

        Ok(Self {
            store,
            dispatcher,
            retention,
        })
    }

    pub fn dispatcher(&self) -> Arc<ControlDispatcher> {
        self.dispatcher.clone()
    }

    pub fn store(&self) -> &SettingsStore {
        &self.store
    }

    /// Stop background work and record the shutdown.
    pub async fn shutdown(self) {
        self.retention.stop().await;
        self.store.append_event(None, EventKind::System, "engine stopped");
        tracing::info!("Engine stopped");
    }
}
