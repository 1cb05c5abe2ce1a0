//! HTTP API: event ingestion, delivery history and stats.

mod handlers;

use crate::config::ServerConfig;
use crate::db::Store;
use crate::delivery::Dispatcher;
use crate::monitor::MonitoringService;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub dispatcher: Dispatcher,
    pub monitor: Arc<MonitoringService>,
}

pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        store: Arc<Store>,
        dispatcher: Dispatcher,
        monitor: Arc<MonitoringService>,
    ) -> Self {
        Self {
            state: AppState {
                config,
                store,
                dispatcher,
                monitor,
            },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/health", get(handlers::handle_health))
            .route("/api/events", post(handlers::handle_ingest_event))
            .route("/api/deliveries", get(handlers::handle_get_deliveries))
            .route(
                "/api/deliveries/{conversion_id}/{profile_id}/cancel",
                post(handlers::handle_cancel_delivery),
            )
            .route("/api/profiles", get(handlers::handle_get_profiles))
            .route("/api/stats", get(handlers::handle_get_stats))
            .route("/api/stats/history", get(handlers::handle_get_stats_history))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(DefaultBodyLimit::max(256 * 1024))
            .with_state(self.state.clone())
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}
