use axum::routing::{delete, get, patch, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::{handlers, websocket};
use crate::state::AppState;

/// HTTP/WebSocket surface consumed by the dashboard.
pub struct ApiServer {
    state: AppState,
}

impl ApiServer {
    #[must_use]
    pub const fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Builds the router with all API routes.
    #[must_use]
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/api/bot/status", get(handlers::bot_status))
            .route("/api/bot/start", post(handlers::bot_start))
            .route("/api/bot/pause", post(handlers::bot_pause))
            .route("/api/bot/resume", post(handlers::bot_resume))
            .route("/api/markets/", get(handlers::list_markets))
            .route("/api/markets/all-pairs", get(handlers::all_pairs))
            .route("/api/markets/:id/favorite", post(handlers::toggle_favorite))
            .route("/api/markets/:id/start", post(handlers::start_market))
            .route("/api/markets/:id/stop", post(handlers::stop_market))
            .route("/api/markets/:id/reset-anchor", post(handlers::reset_anchor))
            .route("/api/markets/:id", patch(handlers::update_market))
            .route("/api/orders/", get(handlers::list_orders))
            .route("/api/orders/:id", delete(handlers::cancel_order))
            .route("/api/lots/", get(handlers::list_lots))
            .route("/api/history/fills", get(handlers::list_fills))
            .route(
                "/api/config/",
                get(handlers::get_config).post(handlers::update_config),
            )
            .route("/api/control/cancel_all", post(handlers::cancel_all))
            .route("/api/stats/capital-summary", get(handlers::capital_summary))
            .route("/api/stats/pnl-breakdown", get(handlers::pnl_breakdown))
            .route("/api/stats/pnl-history", get(handlers::pnl_history))
            .route("/api/ws", get(websocket::websocket_handler))
            .with_state(self.state.clone())
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Serves until the process shuts down.
    ///
    /// # Errors
    /// Returns an error if the listener cannot bind or the server fails.
    pub async fn serve(self, addr: &str) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("web API listening on {}", addr);

        axum::serve(listener, self.router()).await?;

        Ok(())
    }
}
