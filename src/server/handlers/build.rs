// src/server/handlers/build.rs
//! Builds: inspection, rebuild, cancel, delete and artifact redirects

use super::Caller;
use crate::auth::{Authorization, Permission};
use crate::build::state;
use crate::db::models::{ArtifactType, Build, BuildArtifact, BuildFilter, BuildStatus, CondaPackageBuild, Environment};
use crate::environment::registrar;
use crate::error::{Error, Result};
use crate::server::AppState;
use crate::server::response::{ApiResult, Envelope, PageParams};
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::http::header::LOCATION;
use axum::response::{IntoResponse, Response};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// A build with the names of its environment
#[derive(Debug, Serialize)]
pub struct BuildView {
    #[serde(flatten)]
    pub build: Build,
    pub namespace: String,
    pub environment: String,
}

fn load(conn: &Connection, build_id: i64) -> Result<(Build, Environment)> {
    let build = Build::get(conn, build_id)?;
    let environment = Environment::find_by_id(conn, build.environment_id)?
        .ok_or_else(|| Error::NotFound(format!("environment of build {build_id}")))?;
    Ok((build, environment))
}

/// Load a build and check `permission` on its environment
async fn authorized(
    state: &AppState,
    caller: &Authorization,
    build_id: i64,
    permission: Permission,
) -> Result<(Build, Environment)> {
    let (build, environment) = state.ctx.db(move |conn| load(conn, build_id)).await?;
    caller.require(&environment.namespace, Some(&environment.name), permission)?;
    Ok((build, environment))
}

#[derive(Debug, Default, Deserialize)]
pub struct BuildQuery {
    pub status: Option<String>,
    pub namespace: Option<String>,
    pub environment: Option<String>,
    pub page: Option<i64>,
    pub size: Option<i64>,
}

/// GET /api/v1/build/
pub async fn list(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Query(query): Query<BuildQuery>,
) -> ApiResult<Json<Envelope>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<BuildStatus>)
        .transpose()
        .map_err(Error::Validation)?;
    let filter = BuildFilter {
        status,
        environment_id: None,
        namespace: query.namespace,
        environment: query.environment,
        visible: caller.visible(Permission::EnvironmentRead),
    };
    let params = PageParams {
        page: query.page,
        size: query.size,
    };
    let window = params.window();
    let (builds, count) = state
        .ctx
        .db(move |conn| Ok((Build::list(conn, &filter, window)?, Build::count(conn, &filter)?)))
        .await?;
    Envelope::paginated(builds, &params, count)
}

/// GET /api/v1/build/{id}/
pub async fn get(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(build_id): Path<i64>,
) -> ApiResult<Json<Envelope>> {
    let (build, environment) = authorized(&state, &caller, build_id, Permission::EnvironmentRead).await?;
    Envelope::ok(BuildView {
        build,
        namespace: environment.namespace,
        environment: environment.name,
    })
}

/// PUT /api/v1/build/{id}/ schedules a fresh build of the same specification
pub async fn rebuild(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(build_id): Path<i64>,
) -> ApiResult<Json<Envelope>> {
    authorized(&state, &caller, build_id, Permission::EnvironmentUpdate).await?;
    let defaults = state.ctx.defaults().clone();
    let new_id = state
        .ctx
        .db(move |conn| registrar::rebuild(conn, &defaults, build_id))
        .await?;
    Envelope::ok(json!({ "build_id": new_id }))
}

/// PUT /api/v1/build/{id}/cancel/
pub async fn cancel(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(build_id): Path<i64>,
) -> ApiResult<Json<Envelope>> {
    authorized(&state, &caller, build_id, Permission::BuildCancel).await?;
    state.ctx.db(move |conn| state::request_cancel(conn, build_id)).await?;
    Envelope::message(format!("build {build_id} cancellation requested"))
}

/// DELETE /api/v1/build/{id}/
pub async fn delete(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(build_id): Path<i64>,
) -> ApiResult<Json<Envelope>> {
    authorized(&state, &caller, build_id, Permission::BuildDelete).await?;
    state.ctx.db(move |conn| state::delete(conn, build_id)).await?;
    Envelope::message(format!("build {build_id} deleted"))
}

/// GET /api/v1/build/{id}/packages/
pub async fn packages(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(build_id): Path<i64>,
    Query(params): Query<PageParams>,
) -> ApiResult<Json<Envelope>> {
    authorized(&state, &caller, build_id, Permission::EnvironmentRead).await?;
    let window = params.window();
    let (packages, count) = state
        .ctx
        .db(move |conn| {
            Ok((
                CondaPackageBuild::list_for_build(conn, build_id, window)?,
                CondaPackageBuild::count_for_build(conn, build_id)?,
            ))
        })
        .await?;
    Envelope::paginated(packages, &params, count)
}

/// 302 to the blob-store URL of one of the build's artifacts
async fn redirect(state: AppState, caller: Authorization, build_id: i64, artifact_type: ArtifactType) -> ApiResult<Response> {
    authorized(&state, &caller, build_id, Permission::EnvironmentRead).await?;
    let artifact = state
        .ctx
        .db(move |conn| BuildArtifact::find(conn, build_id, artifact_type))
        .await?
        .ok_or_else(|| Error::NotFound(format!("{} artifact of build {build_id}", artifact_type.as_str())))?;
    let url = state.ctx.store.get_url(&artifact.key).await?;
    Ok((StatusCode::FOUND, [(LOCATION, url)]).into_response())
}

/// GET /api/v1/build/{id}/logs/
pub async fn logs(State(state): State<AppState>, Caller(caller): Caller, Path(build_id): Path<i64>) -> ApiResult<Response> {
    redirect(state, caller, build_id, ArtifactType::Logs).await
}

/// GET /api/v1/build/{id}/yaml/
pub async fn yaml(State(state): State<AppState>, Caller(caller): Caller, Path(build_id): Path<i64>) -> ApiResult<Response> {
    redirect(state, caller, build_id, ArtifactType::Yaml).await
}

/// GET /api/v1/build/{id}/conda-lock.yaml/
pub async fn lockfile(State(state): State<AppState>, Caller(caller): Caller, Path(build_id): Path<i64>) -> ApiResult<Response> {
    redirect(state, caller, build_id, ArtifactType::Lockfile).await
}

/// GET /api/v1/build/{id}/archive/
pub async fn archive(State(state): State<AppState>, Caller(caller): Caller, Path(build_id): Path<i64>) -> ApiResult<Response> {
    redirect(state, caller, build_id, ArtifactType::CondaPack).await
}

/// GET /api/v1/build/{id}/installer/
pub async fn installer(State(state): State<AppState>, Caller(caller): Caller, Path(build_id): Path<i64>) -> ApiResult<Response> {
    redirect(state, caller, build_id, ArtifactType::Installer).await
}
