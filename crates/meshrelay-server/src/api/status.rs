use crate::state::AppState;
use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub connected_sessions: usize,
    pub active_rooms: usize,
    pub active_endpoints: usize,
    pub engine: &'static str,
    pub started_at: DateTime<Utc>,
}

pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let service = state.service().status().await;

    Json(StatusResponse {
        connected_sessions: state.router.session_count().await,
        active_rooms: service.active_rooms,
        active_endpoints: service.active_endpoints,
        engine: service.engine,
        started_at: state.started_at,
    })
}
