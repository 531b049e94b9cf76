// src/server/handlers/solve.rs
//! Dry-run solves: resolve a specification without building it

use super::Caller;
use crate::auth::Permission;
use crate::db::models::{CondaPackageBuild, Solve};
use crate::environment::{Submission, registrar};
use crate::error::Error;
use crate::server::AppState;
use crate::server::response::{ApiResult, Envelope};
use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct SolveBody {
    pub specification: String,
}

/// POST /api/v1/solve/
pub async fn create(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(body): Json<SolveBody>,
) -> ApiResult<Json<Envelope>> {
    if !caller.has_any(Permission::EnvironmentSolve) {
        return Err(Error::Authorization(Permission::EnvironmentSolve.to_string()).into());
    }
    let submission = Submission::from_yaml(&body.specification)?;
    let defaults = state.ctx.defaults().clone();
    let solve_id = state
        .ctx
        .db(move |conn| registrar::solve_specification(conn, &defaults, submission))
        .await?;
    Envelope::ok(json!({ "solve_id": solve_id }))
}

/// GET /api/v1/solve/{id}/
///
/// `packages` stays empty until the solve has ended.
pub async fn get(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(solve_id): Path<i64>,
) -> ApiResult<Json<Envelope>> {
    if !caller.has_any(Permission::EnvironmentSolve) {
        return Err(Error::Authorization(Permission::EnvironmentSolve.to_string()).into());
    }
    let (solve, packages) = state
        .ctx
        .db(move |conn| Ok((Solve::get(conn, solve_id)?, CondaPackageBuild::list_for_solve(conn, solve_id)?)))
        .await?;
    Envelope::ok(json!({ "solve": solve, "packages": packages }))
}
