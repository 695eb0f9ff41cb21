use axum::{extract::State, Json};
use serde_json::Value;

use crate::{api_state::ApiState, error::ApiError, mcp::tools};

/// Public liveness + dependency report, also backing the `system_health`
/// tool.
pub async fn health(State(state): State<ApiState>) -> Result<Json<Value>, ApiError> {
    let report = tools::system_health(&state).await?;
    Ok(Json(report))
}
