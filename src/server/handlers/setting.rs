// src/server/handlers/setting.rs
//! Settings at global, namespace and environment scope
//!
//! Reads return the resolved settings for the scope. Writes store overrides
//! at exactly that scope; global writes need a `*/*` binding.

use super::Caller;
use crate::auth::{Authorization, Permission};
use crate::error::{Error, Result};
use crate::server::AppState;
use crate::server::response::{ApiResult, Envelope};
use crate::settings::set_settings;
use axum::Json;
use axum::extract::{Path, State};
use serde_json::{Map, Value};
use tracing::info;

fn check(caller: &Authorization, namespace: Option<&str>, environment: Option<&str>, permission: Permission) -> Result<()> {
    let allowed = match namespace {
        Some(ns) => caller.is_allowed(ns, environment, permission),
        None if permission == Permission::SettingRead => caller.has_any(permission),
        None => caller.is_global(permission),
    };
    if allowed {
        Ok(())
    } else {
        Err(Error::Authorization(permission.to_string()))
    }
}

async fn read(state: AppState, caller: Authorization, namespace: Option<String>, environment: Option<String>) -> ApiResult<Json<Envelope>> {
    check(&caller, namespace.as_deref(), environment.as_deref(), Permission::SettingRead)?;
    let settings = state.ctx.settings(namespace, environment).await?;
    Envelope::ok(settings)
}

async fn write(
    state: AppState,
    caller: Authorization,
    namespace: Option<String>,
    environment: Option<String>,
    data: Map<String, Value>,
) -> ApiResult<Json<Envelope>> {
    check(&caller, namespace.as_deref(), environment.as_deref(), Permission::SettingUpdate)?;
    let defaults = state.ctx.defaults().clone();
    let keys: Vec<String> = data.keys().cloned().collect();
    state
        .ctx
        .db(move |conn| set_settings(conn, &defaults, namespace.as_deref(), environment.as_deref(), &data))
        .await?;
    info!("Updated settings {}", keys.join(", "));
    Envelope::message(format!("settings updated: {}", keys.join(", ")))
}

/// GET /api/v1/setting/
pub async fn get_global(State(state): State<AppState>, Caller(caller): Caller) -> ApiResult<Json<Envelope>> {
    read(state, caller, None, None).await
}

/// GET /api/v1/setting/{namespace}/
pub async fn get_namespace(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(namespace): Path<String>,
) -> ApiResult<Json<Envelope>> {
    read(state, caller, Some(namespace), None).await
}

/// GET /api/v1/setting/{namespace}/{environment}/
pub async fn get_environment(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path((namespace, environment)): Path<(String, String)>,
) -> ApiResult<Json<Envelope>> {
    read(state, caller, Some(namespace), Some(environment)).await
}

/// PUT /api/v1/setting/
pub async fn put_global(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(data): Json<Map<String, Value>>,
) -> ApiResult<Json<Envelope>> {
    write(state, caller, None, None, data).await
}

/// PUT /api/v1/setting/{namespace}/
pub async fn put_namespace(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(namespace): Path<String>,
    Json(data): Json<Map<String, Value>>,
) -> ApiResult<Json<Envelope>> {
    write(state, caller, Some(namespace), None, data).await
}

/// PUT /api/v1/setting/{namespace}/{environment}/
pub async fn put_environment(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path((namespace, environment)): Path<(String, String)>,
    Json(data): Json<Map<String, Value>>,
) -> ApiResult<Json<Envelope>> {
    write(state, caller, Some(namespace), Some(environment), data).await
}
