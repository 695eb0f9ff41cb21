use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde_json::{json, Value};

use common::{storage::types::access_token::Principal, utils::progress::ProgressSink};

use crate::{api_state::ApiState, error::ApiError, mcp::dispatcher};

/// The REST surface is a thin veneer over the tool dispatcher, so REST and
/// the streaming transport share one authorisation path.
async fn call_tool(
    state: &ApiState,
    principal: &Principal,
    tool: &str,
    args: Value,
) -> Result<Json<Value>, ApiError> {
    let result = dispatcher::dispatch(state, principal, tool, args, &ProgressSink::disabled())
        .await
        .map_err(ApiError)?;
    Ok(Json(result))
}

pub async fn list_memories(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<Value>, ApiError> {
    call_tool(&state, &principal, "memory_list", json!({})).await
}

pub async fn get_graph(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Path(memory_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    call_tool(
        &state,
        &principal,
        "memory_graph",
        json!({ "memory_id": memory_id }),
    )
    .await
}

pub async fn ask(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    call_tool(&state, &principal, "question_answer", body).await
}

pub async fn query(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    call_tool(&state, &principal, "memory_query", body).await
}
