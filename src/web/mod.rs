//! Web server module.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::db::Store;
use crate::scheduler::Scheduler;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Store,
    pub scheduler: Scheduler,
}

/// JSON API server for modelwatch.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(config: ServerConfig, store: Store, scheduler: Scheduler) -> Self {
        Self {
            state: AppState {
                config,
                store,
                scheduler,
            },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

        Router::new()
            .route("/api/targets", get(handlers::handle_get_targets))
            .route("/api/scheduler", get(handlers::handle_scheduler_stats))
            // Probe history
            .route("/api/probe/history/{provider_id}/{model_id}", get(handlers::handle_get_history))
            .route("/api/probe/timeline/batch", get(handlers::handle_get_timeline_batch))
            .route("/api/probe/timeline/{provider_id}/{model_id}", get(handlers::handle_get_timeline))
            .route("/api/probe/trigger/{provider_id}/{model_id}", post(handlers::handle_trigger))
            // Status rules
            .route(
                "/api/status/rules",
                get(handlers::handle_get_rules).post(handlers::handle_create_rule),
            )
            .route("/api/status/rules/preview", post(handlers::handle_preview_rule))
            .route(
                "/api/status/rules/{id}",
                put(handlers::handle_update_rule).delete(handlers::handle_delete_rule),
            )
            .route("/api/status/rules/{id}/apply", post(handlers::handle_apply_rule))
            .route("/api/status/unmatched", get(handlers::handle_get_unmatched))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` resolves.
    pub async fn start(
        &self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).with_graceful_shutdown(shutdown).await?;

        Ok(())
    }
}
