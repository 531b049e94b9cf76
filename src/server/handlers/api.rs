// src/server/handlers/api.rs
//! Version, permissions, tokens and usage

use super::Caller;
use crate::auth::TokenRequest;
use crate::db::models::StorageMetrics;
use crate::server::AppState;
use crate::server::response::{ApiResult, Envelope};
use axum::Json;
use axum::extract::State;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

/// GET /api/v1/
pub async fn root() -> ApiResult<Json<Envelope>> {
    Envelope::ok(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

/// GET /health
pub async fn health() -> ApiResult<Json<Envelope>> {
    Envelope::ok(json!({ "healthy": true }))
}

#[derive(Debug, Serialize)]
struct PermissionResponse {
    authenticated: bool,
    primary_namespace: Option<String>,
    entity_permissions: std::collections::BTreeMap<String, Vec<crate::auth::Permission>>,
    expiration: Option<DateTime<Utc>>,
}

/// GET /api/v1/permission/
pub async fn permission(Caller(caller): Caller) -> ApiResult<Json<Envelope>> {
    let expiration = caller
        .entity
        .exp
        .and_then(|exp| DateTime::<Utc>::from_timestamp(exp, 0));
    Envelope::ok(PermissionResponse {
        authenticated: caller.entity.authenticated,
        primary_namespace: caller.entity.primary_namespace.clone(),
        entity_permissions: caller.permissions(),
        expiration,
    })
}

/// POST /api/v1/token/
///
/// The new token can only carry permissions the caller already has.
pub async fn create_token(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(request): Json<TokenRequest>,
) -> ApiResult<Json<Envelope>> {
    let (token, claims) = state.authenticator.issue(&caller, request)?;
    Envelope::ok(json!({
        "token": token,
        "primary_namespace": claims.primary_namespace,
        "role_bindings": claims.role_bindings,
        "expiration": DateTime::<Utc>::from_timestamp(claims.exp, 0),
    }))
}

/// GET /api/v1/usage/
pub async fn usage(State(state): State<AppState>) -> ApiResult<Json<Envelope>> {
    let metrics = state.ctx.db(|conn| StorageMetrics::get(conn)).await?;
    Envelope::ok(metrics)
}
