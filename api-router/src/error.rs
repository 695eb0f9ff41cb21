use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::error::AppError;
use serde::Serialize;
use thiserror::Error;

/// HTTP-facing wrapper around [`AppError`]; the machine-readable kind drives
/// the status code and travels in the body.
#[derive(Error, Debug)]
#[error(transparent)]
pub struct ApiError(#[from] pub AppError);

#[derive(Serialize, Debug)]
struct ErrorResponse {
    error: String,
    kind: &'static str,
}

pub fn status_for(err: &AppError) -> StatusCode {
    match err.kind() {
        "not_found" => StatusCode::NOT_FOUND,
        "already_exists" | "conflict" => StatusCode::CONFLICT,
        "invalid_argument" => StatusCode::BAD_REQUEST,
        "unauthorized" => StatusCode::UNAUTHORIZED,
        "forbidden" => StatusCode::FORBIDDEN,
        "quota_exceeded" => StatusCode::PAYLOAD_TOO_LARGE,
        "dependency_failure" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "internal error");
        }
        let body = ErrorResponse {
            error: self.0.to_string(),
            kind: self.0.kind(),
        };
        (status, Json(body)).into_response()
    }
}
