use dbsync::config::ServerConfig;
use dbsync::engine::Engine;
use dbsync::web::Server;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("dbsync=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting dbsync on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);
    if cfg.secret_key.is_none() {
        tracing::warn!("DBSYNC_SECRET_KEY not set; connection secrets are stored base64-encoded only");
    }

    let engine = Engine::open(&cfg)?;

    // Serve until interrupted
    let server = Server::new(cfg, engine.dispatcher());
    let served = server.start().await;

    engine.shutdown().await;
    served
}
