use std::sync::atomic::Ordering;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::state::AppState;

/// Structured health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub match_info: MatchInfo,
    pub connections: usize,
}

#[derive(Serialize)]
pub struct MatchInfo {
    pub id: String,
    pub phase: String,
    pub round: u32,
    pub participants: usize,
    pub connected: usize,
    pub finished: bool,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = state.coordinator.status.borrow().clone();
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        match_info: MatchInfo {
            id: status.match_id.to_string(),
            phase: status.phase.to_string(),
            round: status.round,
            participants: status.participants,
            connected: status.connected,
            finished: status.phase.is_finished(),
        },
        connections: state.ws_connection_count.load(Ordering::Relaxed),
    })
}
