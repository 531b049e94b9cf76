// src/server/handlers/package.rs
//! Channel and package catalog

use super::Caller;
use crate::auth::Permission;
use crate::db::models::{CondaChannel, CondaPackage, PackageFilter};
use crate::error::Error;
use crate::server::AppState;
use crate::server::response::{ApiResult, Envelope, PageParams, split_list};
use axum::Json;
use axum::extract::{Query, State};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct PackageQuery {
    pub search: Option<String>,
    pub exact: Option<String>,
    pub build: Option<String>,
    /// Comma-separated: `name`, `version`, `channel`
    pub sort_by: Option<String>,
    /// Comma-separated: `name`, `version`, `channel`
    pub distinct_on: Option<String>,
    pub page: Option<i64>,
    pub size: Option<i64>,
}

/// GET /api/v1/package/
pub async fn list_packages(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Query(query): Query<PackageQuery>,
) -> ApiResult<Json<Envelope>> {
    if !caller.has_any(Permission::PackageRead) {
        return Err(Error::Authorization(Permission::PackageRead.to_string()).into());
    }
    let filter = PackageFilter {
        search: query.search,
        exact: query.exact,
        build: query.build,
        sort_by: split_list(query.sort_by.as_deref()),
        distinct_on: split_list(query.distinct_on.as_deref()),
    };
    let params = PageParams {
        page: query.page,
        size: query.size,
    };
    let window = params.window();
    let (packages, count) = state
        .ctx
        .db(move |conn| Ok((CondaPackage::list(conn, &filter, window)?, CondaPackage::count(conn, &filter)?)))
        .await?;
    Envelope::paginated(packages, &params, count)
}

/// GET /api/v1/channel/
pub async fn list_channels(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Query(params): Query<PageParams>,
) -> ApiResult<Json<Envelope>> {
    if !caller.has_any(Permission::ChannelRead) {
        return Err(Error::Authorization(Permission::ChannelRead.to_string()).into());
    }
    let window = params.window();
    let (channels, count) = state
        .ctx
        .db(move |conn| Ok((CondaChannel::list(conn, window)?, CondaChannel::count(conn)?)))
        .await?;
    Envelope::paginated(channels, &params, count)
}
