//! Retention manager for the event log.

use crate::config::RetentionSettings;
use crate::db::SettingsStore;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Periodically deletes events older than the retention horizon.
///
/// The task is started with the store and must be stopped before the store
/// is dropped.
pub struct RetentionManager {
    stop_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl RetentionManager {
    /// Start the retention background task.
    ///
    /// The first sweep runs one full interval after start.
    pub fn start(store: SettingsStore, settings: RetentionSettings) -> Self {
        let (stop_tx, stop_rx) = broadcast::channel(1);
        let handle = tokio::spawn(run_retention_loop(store, settings, stop_rx));
        Self { stop_tx, handle }
    }

    /// Stop the task and wait for an in-flight sweep to finish.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(());
        if let Err(e) = self.handle.await {
            tracing::error!("RetentionManager: task ended abnormally: {}", e);
        }
    }
}

async fn run_retention_loop(
    store: SettingsStore,
    settings: RetentionSettings,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let start = tokio::time::Instant::now() + settings.interval;
    let mut interval = tokio::time::interval_at(start, settings.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(
        "RetentionManager: sweeping events older than {:?} every {:?}",
        settings.horizon,
        settings.interval
    );

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = interval.tick() => {
                sweep_once(&store, &settings).await;
            }
        }
    }

    tracing::debug!("RetentionManager: stopped");
}

/// Run one sweep off the async workers. Returns the number of deleted rows.
pub async fn sweep_once(store: &SettingsStore, settings: &RetentionSettings) -> usize {
    let store = store.clone();
    let horizon = settings.horizon;
    let batch_size = settings.batch_size;

    let result = tokio::task::spawn_blocking(move || store.sweep_expired_events(horizon, batch_size)).await;

    match result {
        Ok(Ok(deleted)) => {
            tracing::info!("RetentionManager: deleted {} expired events", deleted);
            deleted
        }
        Ok(Err(e)) => {
            tracing::error!("RetentionManager: sweep failed: {}", e);
            0
        }
        Err(e) => {
            tracing::error!("RetentionManager: sweep task failed: {}", e);
            0
        }
    }
}
