//! Uptrail - availability monitoring service.

use uptrail::config::ServerConfig;
use uptrail::db::{self, MonitorStore, SqliteStore};
use uptrail::notify::{Coordinator, NotificationSender, PlaintextDecryptor, TelegramSender};
use uptrail::probe::ProtocolChecker;
use uptrail::scheduler::Engine;
use uptrail::web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    let json_logs = std::env::var("UPTRAIL_LOG_FORMAT")
        .map(|f| f.trim().eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("uptrail=info".parse()?);
    let registry = tracing_subscriber::registry().with(filter);
    if json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting Uptrail...");
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(SqliteStore::open(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    // Add sample monitor if none exist
    if store.list_monitors().await?.is_empty() {
        tracing::info!("Adding sample monitor: example.com");
        let mut monitor = db::Monitor {
            name: "Example".to_string(),
            monitor_type: "http".to_string(),
            target: "https://example.com".to_string(),
            ..Default::default()
        };
        store.add_monitor(&mut monitor)?;
    }

    let sender: Option<Arc<dyn NotificationSender>> = if cfg.telegram_enabled() {
        tracing::info!("Telegram notifications enabled");
        Some(Arc::new(TelegramSender::new()))
    } else {
        None
    };
    let coordinator = Arc::new(Coordinator::new(
        store.clone(),
        store.clone(),
        store.clone(),
        sender,
        Arc::new(PlaintextDecryptor),
    ));

    // Start engine
    let checker = Arc::new(ProtocolChecker::new()?);
    let engine = Engine::new(store.clone(), checker, coordinator, cfg.engine_options());
    engine.start()?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
        tracing::info!("Shutdown requested");
    };

    // Start web server
    if cfg.http_port != 0 {
        let server = Server::new(cfg.http_port, engine.clone(), store.clone());
        server.start(shutdown).await?;
    } else {
        shutdown.await;
    }

    engine.stop(cfg.shutdown_timeout()).await?;
    Ok(())
}
