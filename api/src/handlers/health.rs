use axum::{extract::State, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub tracked_deliveries: usize,
    pub delivery_window: usize,
}

/// Liveness probe; also reports how full the replay window is
#[tracing::instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        tracked_deliveries: state.deliveries.len(),
        delivery_window: state.config.webhook.delivery_cache_size,
    })
}
