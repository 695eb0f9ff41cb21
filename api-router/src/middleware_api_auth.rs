use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use chrono::Utc;

use common::{
    error::AppError,
    storage::types::access_token::{AccessToken, Principal},
};

use crate::{api_state::ApiState, error::ApiError};

/// Bearer authentication for `/api/*`: the bootstrap key or an active token,
/// resolved to a [`Principal`] on the request. No token cache; every request
/// does a fresh lookup.
#[axum::debug_middleware]
pub async fn api_auth(
    State(state): State<ApiState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let principal = authenticate_bearer(&state, &request).await?;
    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}

/// Authentication for the streaming transport. Same bearer policy, plus the
/// historical loopback carve-out for intra-host tooling; the carve-out never
/// applies to `/api/*`, which uses [`api_auth`].
pub async fn mcp_auth(
    State(state): State<ApiState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let principal = match authenticate_bearer(&state, &request).await {
        Ok(principal) => principal,
        Err(err) => {
            let is_loopback = request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .is_some_and(|info| info.0.ip().is_loopback());
            if is_loopback {
                Principal::bootstrap()
            } else {
                return Err(err);
            }
        }
    };

    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}

async fn authenticate_bearer(state: &ApiState, request: &Request) -> Result<Principal, ApiError> {
    let raw = extract_bearer(request).ok_or_else(|| {
        ApiError(AppError::Unauthorized(
            "missing Authorization bearer token".to_string(),
        ))
    })?;

    if raw == state.config.bootstrap_admin_key {
        return Ok(Principal::bootstrap());
    }

    let token = AccessToken::find_by_raw(&state.db, &raw)
        .await
        .map_err(ApiError)?
        .ok_or_else(|| ApiError(AppError::Unauthorized("unknown token".to_string())))?;

    if !token.is_active(Utc::now()) {
        return Err(ApiError(AppError::Unauthorized(
            "token is revoked or expired".to_string(),
        )));
    }

    Ok(token.principal())
}

fn extract_bearer(request: &Request) -> Option<String> {
    request
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer ").map(str::trim))
        .map(String::from)
}
