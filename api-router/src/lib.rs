use axum::{
    extract::DefaultBodyLimit,
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use api_state::ApiState;
use middleware_api_auth::{api_auth, mcp_auth};
use routes::{
    health::health,
    memories::{ask, get_graph, list_memories, query},
};

pub mod api_state;
pub mod error;
pub mod mcp;
mod middleware_api_auth;
mod routes;

/// Assembles the full HTTP surface: public `/health`, Bearer-authenticated
/// REST under `/api/*`, and the streaming tool transport (`/sse` +
/// `/messages`). Host headers are not inspected anywhere, so the service
/// can sit behind any reverse proxy.
pub fn app_router(state: ApiState) -> Router {
    // Base64 ingest payloads are ~4/3 of the document limit, plus JSON framing.
    let message_body_limit = (state.config.max_document_size_bytes() as usize / 2) * 3;

    let public = Router::new().route("/health", get(health));

    let api = Router::new()
        .route("/api/memories", get(list_memories))
        .route("/api/graph/{memory_id}", get(get_graph))
        .route("/api/ask", post(ask))
        .route("/api/query", post(query))
        .route_layer(from_fn_with_state(state.clone(), api_auth));

    let streaming = Router::new()
        .route("/sse", get(mcp::sse_handler))
        .route(
            "/messages",
            post(mcp::message_handler).layer(DefaultBodyLimit::max(message_body_limit)),
        )
        .route_layer(from_fn_with_state(state.clone(), mcp_auth));

    public
        .merge(api)
        .merge(streaming)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
