//! Session listener lookup.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use crate::auth::Authenticated;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_id: String,
    pub listeners: usize,
}

pub async fn get_session(
    State(state): State<AppState>,
    _auth: Authenticated,
    Path(session_id): Path<String>,
) -> Json<SessionResponse> {
    let listeners = state.registry.listener_count(&session_id);
    Json(SessionResponse { session_id, listeners })
}
