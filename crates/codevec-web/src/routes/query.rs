//! Question dispatch. The answer is not returned here: it streams on the
//! project's session channel.

use axum::{extract::State, Json};
use codevec_core::task;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::Authenticated;
use crate::error::GatewayError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    pub project_id: String,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    /// Task id, for correlating logs.
    pub message: String,
}

pub async fn submit_query(
    State(state): State<AppState>,
    Authenticated(claims): Authenticated,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, GatewayError> {
    let handle = task::enqueue(state.queue.as_ref(), &request.question, &request.project_id).await?;
    info!(
        task_id = %handle,
        session_id = %request.project_id,
        subject = claims.sub.as_deref().unwrap_or("-"),
        "Query dispatched"
    );
    Ok(Json(QueryResponse {
        message: handle.to_string(),
    }))
}
