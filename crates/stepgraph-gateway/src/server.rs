use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use stepgraph_core::config::GatewayConfig;
use stepgraph_core::traits::HistoryStore;
use stepgraph_engine::RunManager;

use crate::routes;
use crate::state::AppState;

/// Build the API router over shared state.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(routes::health))
        .route("/api/graph", get(routes::graph))
        .route("/api/runs", get(routes::list_runs).post(routes::start_run))
        .route("/api/runs/{id}", get(routes::get_run))
        .route("/api/runs/{id}/cancel", post(routes::cancel_run))
        .route("/api/invoke", post(routes::invoke))
        .route("/api/history/{thread_id}", get(routes::history))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// HTTP gateway server built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    runs: RunManager,
    history: Arc<dyn HistoryStore>,
    history_limit: usize,
}

impl GatewayServer {
    pub fn new(
        config: GatewayConfig,
        runs: RunManager,
        history: Arc<dyn HistoryStore>,
        history_limit: usize,
    ) -> Self {
        Self {
            config,
            runs,
            history,
            history_limit,
        }
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            runs: self.runs.clone(),
            history: self.history.clone(),
            history_limit: self.history_limit,
        });
        let app = build_router(state);

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(
            bind = %self.config.bind,
            api_keys = self.config.api_keys.len(),
            "Gateway listening"
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
