// src/server/handlers/environment.rs
//! Environments and specification submission

use super::Caller;
use crate::auth::Permission;
use crate::db::models::{Environment, EnvironmentFilter, Page};
use crate::environment::{self, Registration, Submission, register};
use crate::error::{Error, Result};
use crate::server::AppState;
use crate::server::response::{ApiResult, Cursor, DEFAULT_PAGE_SIZE, Envelope, MAX_PAGE_SIZE};
use axum::Json;
use axum::extract::{Path, Query, State};
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

fn find_environment(conn: &Connection, namespace: &str, name: &str) -> Result<Environment> {
    Environment::find_by_name(conn, namespace, name)?
        .ok_or_else(|| Error::NotFound(format!("environment {namespace}/{name}")))
}

#[derive(Debug, Default, Deserialize)]
pub struct EnvironmentQuery {
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub search: Option<String>,
    pub cursor: Option<String>,
    pub size: Option<i64>,
}

/// GET /api/v1/environment/
///
/// Cursor-paginated by environment id; the returned cursor is absent once
/// the listing is exhausted.
pub async fn list(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Query(query): Query<EnvironmentQuery>,
) -> ApiResult<Json<Envelope>> {
    let size = query.size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let after_id = query
        .cursor
        .as_deref()
        .map(Cursor::decode)
        .transpose()?
        .map(|c| c.last_id);
    let filter = EnvironmentFilter {
        namespace: query.namespace,
        name: query.name,
        search: query.search,
        visible: caller.visible(Permission::EnvironmentRead),
        after_id,
        include_deleted: false,
    };

    let (environments, count) = state
        .ctx
        .db(move |conn| {
            let environments = Environment::list(conn, &filter, Page::new(1, size))?;
            let count = Environment::count(conn, &filter)?;
            Ok((environments, count))
        })
        .await?;

    let cursor = match environments.last() {
        Some(last) if environments.len() as i64 == size => last.id.map(|last_id| Cursor { last_id }),
        _ => None,
    };
    Envelope::with_cursor(environments, count, cursor)
}

/// GET /api/v1/environment/{namespace}/{name}/
pub async fn get(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path((namespace, name)): Path<(String, String)>,
) -> ApiResult<Json<Envelope>> {
    caller.require(&namespace, Some(&name), Permission::EnvironmentRead)?;
    let environment = state
        .ctx
        .db(move |conn| find_environment(conn, &namespace, &name))
        .await?;
    Envelope::ok(environment)
}

#[derive(Debug, Deserialize)]
pub struct EnvironmentUpdate {
    pub build_id: Option<i64>,
    pub description: Option<String>,
}

/// PUT /api/v1/environment/{namespace}/{name}/
pub async fn update(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path((namespace, name)): Path<(String, String)>,
    Json(body): Json<EnvironmentUpdate>,
) -> ApiResult<Json<Envelope>> {
    caller.require(&namespace, Some(&name), Permission::EnvironmentUpdate)?;
    let environment = state
        .ctx
        .db(move |conn| {
            environment::update_environment(conn, &namespace, &name, body.build_id, body.description.as_deref())
        })
        .await?;
    Envelope::ok(environment)
}

/// DELETE /api/v1/environment/{namespace}/{name}/
pub async fn delete(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path((namespace, name)): Path<(String, String)>,
) -> ApiResult<Json<Envelope>> {
    caller.require(&namespace, Some(&name), Permission::EnvironmentDelete)?;
    let store_directory = state.ctx.store_directory().to_path_buf();
    state
        .ctx
        .db(move |conn| {
            let environment = environment::delete_environment(conn, &namespace, &name)?;
            if let Err(e) = environment::remove_environment_link(&store_directory, &environment) {
                warn!("Failed to remove link of {}/{}: {}", namespace, name, e);
            }
            Ok(())
        })
        .await?;
    Envelope::message("environment deleted")
}

#[derive(Debug, Deserialize)]
pub struct SpecificationBody {
    /// YAML (or JSON) text of the specification
    pub specification: String,
    pub namespace: Option<String>,
    #[serde(default)]
    pub force: bool,
}

/// POST /api/v1/specification/
///
/// Responds with `{build_id}`, or `null` data when the same specification
/// is already built in the namespace and `force` is not set.
pub async fn submit(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(body): Json<SpecificationBody>,
) -> ApiResult<Json<Envelope>> {
    let submission = Submission::from_yaml(&body.specification)?;
    let namespace = match body.namespace {
        Some(namespace) => namespace,
        None => state.ctx.settings(None, None).await?.default_namespace,
    };
    let name = submission.name().to_string();

    let exists = {
        let (namespace, name) = (namespace.clone(), name.clone());
        state
            .ctx
            .db(move |conn| Ok(Environment::find_by_name(conn, &namespace, &name)?.is_some()))
            .await?
    };
    let permission = if exists {
        Permission::EnvironmentUpdate
    } else {
        Permission::EnvironmentCreate
    };
    caller.require(&namespace, Some(&name), permission)?;

    let defaults = state.ctx.defaults().clone();
    let store_directory = state.ctx.store_directory().to_path_buf();
    let request = Registration::new(Some(namespace.clone()), submission).force(body.force);
    let build_id = state
        .ctx
        .db(move |conn| register(conn, &defaults, &store_directory, request))
        .await?;

    match build_id {
        Some(build_id) => {
            info!("Specification {}/{} queued as build {}", namespace, name, build_id);
            Envelope::ok(json!({ "build_id": build_id }))
        }
        None => Envelope::ok(serde_json::Value::Null),
    }
}
