pub mod dispatcher;
pub mod session;
pub mod tools;

use std::convert::Infallible;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Extension, Json,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tracing::{debug, warn};
use uuid::Uuid;

use common::{
    error::AppError,
    storage::types::access_token::Principal,
    utils::progress::ProgressSink,
};

use crate::api_state::ApiState;
use crate::error::ApiError;

use self::session::OutboundMessage;

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i64,
    message: String,
    data: Value,
}

fn response_ok(id: Option<Value>, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn response_err(id: Option<Value>, err: &AppError) -> Value {
    let code = match err.kind() {
        "invalid_argument" => -32602,
        "not_found" => -32601,
        _ => -32000,
    };
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": JsonRpcError {
            code,
            message: err.to_string(),
            data: json!({ "kind": err.kind() }),
        },
    })
}

/// Opens the server-push stream. The first event is `endpoint`, whose
/// payload is where this session must POST its JSON-RPC messages; all later
/// traffic flows as `message` events.
pub async fn sse_handler(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let session_id = Uuid::new_v4().to_string();
    let rx = state.sessions.register(session_id.clone()).await;
    debug!(%session_id, "sse session opened");

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/messages?session_id={session_id}"));

    let stream = tokio_stream::once(Ok(endpoint)).chain(
        ReceiverStream::new(rx).map(|message: OutboundMessage| {
            Ok(Event::default().event("message").data(message.data))
        }),
    );

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
pub struct MessageParams {
    pub session_id: String,
}

/// Receives one JSON-RPC message for a session; the reply goes out on the
/// session's SSE channel and the POST itself returns 202.
pub async fn message_handler(
    State(state): State<ApiState>,
    Query(params): Query<MessageParams>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<JsonRpcRequest>,
) -> Result<StatusCode, ApiError> {
    let sender = state
        .sessions
        .sender(&params.session_id)
        .await
        .ok_or_else(|| {
            ApiError(AppError::NotFound(format!(
                "session {}",
                params.session_id
            )))
        })?;

    let response = match request.method.as_str() {
        "initialize" => Some(response_ok(
            request.id,
            json!({
                "protocolVersion": "2024-11-05",
                "serverInfo": {
                    "name": "graph-memory",
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "capabilities": { "tools": {} },
            }),
        )),
        "ping" => Some(response_ok(request.id, json!({}))),
        "tools/list" => {
            let tools: Vec<Value> = dispatcher::TOOLS
                .iter()
                .map(|def| {
                    json!({
                        "name": def.name,
                        "description": def.description,
                        "inputSchema": dispatcher::input_schema(def),
                    })
                })
                .collect();
            Some(response_ok(request.id, json!({ "tools": tools })))
        }
        "tools/call" => {
            let name = request
                .params
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let arguments = request
                .params
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| json!({}));

            let progress = progress_forwarder(&state, &params.session_id, &name);
            let result =
                dispatcher::dispatch(&state, &principal, &name, arguments, &progress).await;

            Some(match result {
                Ok(value) => response_ok(
                    request.id,
                    json!({
                        "content": [{ "type": "text", "text": value.to_string() }],
                        "isError": false,
                    }),
                ),
                Err(err) => {
                    // Terminate the client's progress UI with the error too.
                    progress.emit(common::utils::progress::ProgressEvent {
                        phase: "error".to_string(),
                        current: 0,
                        total: 0,
                        entities: 0,
                        relations: 0,
                        elapsed_ms: 0,
                        message: Some(err.to_string()),
                    });
                    response_err(request.id, &err)
                }
            })
        }
        method if method.starts_with("notifications/") => None,
        other => Some(response_err(
            request.id,
            &AppError::NotFound(format!("method {other}")),
        )),
    };

    if let Some(response) = response {
        let data = response.to_string();
        if sender.send(OutboundMessage { data }).await.is_err() {
            warn!(session_id = %params.session_id, "session closed before response delivery");
            state.sessions.remove(&params.session_id).await;
        }
    }

    Ok(StatusCode::ACCEPTED)
}

/// Bridges pipeline progress events into `notifications/progress` pushes.
/// The session channel is bounded; a slow consumer loses notifications, not
/// ingestion throughput.
fn progress_forwarder(state: &ApiState, session_id: &str, tool: &str) -> ProgressSink {
    let (tx, mut rx) = tokio::sync::mpsc::channel(session::SESSION_CHANNEL_CAPACITY);
    let sessions = state.sessions.clone();
    let session_id = session_id.to_string();
    let tool = tool.to_string();

    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Some(sender) = sessions.sender(&session_id).await else {
                break;
            };
            let notification = json!({
                "jsonrpc": "2.0",
                "method": "notifications/progress",
                "params": { "tool": tool, "progress": event },
            });
            if sender
                .try_send(OutboundMessage {
                    data: notification.to_string(),
                })
                .is_err()
            {
                debug!(%session_id, "progress notification dropped");
            }
        }
    });

    ProgressSink::new(tx)
}
