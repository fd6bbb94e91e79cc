//! Monitoring endpoint.

use crate::{
    metrics,
    reconcile::query_stats,
    stats::SHOW_STAT_ALL,
    workers::socket::AdminSocket,
};
use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use std::sync::Arc;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub socket: Arc<dyn AdminSocket>,
    pub inst_id: String,
}

pub fn build_router(state: AppState) -> Router {
    Router::new().route("/metrics", get(metrics_handler)).with_state(state)
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match query_stats(state.socket.as_ref(), SHOW_STAT_ALL).await {
        Ok(rows) => (StatusCode::OK, metrics::render(&rows, &state.inst_id)),
        Err(e) => {
            error!(error = %e, "Stats query for the metrics endpoint failed");
            (StatusCode::SERVICE_UNAVAILABLE, format!("stats unavailable: {e}\n"))
        }
    }
}
