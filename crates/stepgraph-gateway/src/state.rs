use std::sync::Arc;

use stepgraph_core::config::GatewayConfig;
use stepgraph_core::traits::HistoryStore;
use stepgraph_engine::RunManager;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub runs: RunManager,
    pub history: Arc<dyn HistoryStore>,
    /// Entries returned by the history route when no `limit` is given.
    pub history_limit: usize,
}
