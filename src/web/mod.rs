//! Operational HTTP surface.

mod handlers;

pub use handlers::*;

use crate::db::MonitorStore;
use crate::scheduler::Engine;

use axum::{
    routing::{get, put},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub store: Arc<dyn MonitorStore>,
}

/// Web server for the engine's ops endpoints.
pub struct Server {
    port: u16,
    state: AppState,
}

impl Server {
    pub fn new(port: u16, engine: Engine, store: Arc<dyn MonitorStore>) -> Self {
        Self {
            port,
            state: AppState { engine, store },
        }
    }

    /// Build the router with all routes.
    pub fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/api/stats", get(handlers::handle_get_stats))
            .route("/api/monitors", get(handlers::handle_get_monitors))
            .route("/api/monitors/{id}/sla", get(handlers::handle_get_monitor_sla))
            .route("/api/tuning", put(handlers::handle_put_tuning))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
