// src/server/handlers/namespace.rs
//! Namespace CRUD and namespace-to-namespace role mappings

use super::Caller;
use crate::auth::{Permission, Role};
use crate::db::models::{Namespace, NamespaceRoleMapping};
use crate::environment::{self, spec::validate_name};
use crate::error::{Error, Result};
use crate::server::AppState;
use crate::server::response::{ApiResult, Envelope, PageParams};
use axum::Json;
use axum::extract::{Path, Query, State};
use rusqlite::Connection;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

fn find_namespace(conn: &Connection, name: &str) -> Result<Namespace> {
    Namespace::find_by_name(conn, name)?.ok_or_else(|| Error::NotFound(format!("namespace {name}")))
}

fn namespace_id(namespace: &Namespace) -> Result<i64> {
    namespace
        .id
        .ok_or_else(|| Error::NotFound(format!("namespace {}", namespace.name)))
}

/// GET /api/v1/namespace/
pub async fn list(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Query(params): Query<PageParams>,
) -> ApiResult<Json<Envelope>> {
    let visible = caller.visible(Permission::NamespaceRead);
    let window = params.window();
    let (namespaces, count) = state
        .ctx
        .db(move |conn| {
            let namespaces = Namespace::list(conn, &visible, window)?;
            let count = Namespace::count(conn, &visible)?;
            Ok((namespaces, count))
        })
        .await?;
    Envelope::paginated(namespaces, &params, count)
}

/// GET /api/v1/namespace/{name}/
pub async fn get(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
) -> ApiResult<Json<Envelope>> {
    caller.require(&name, None, Permission::NamespaceRead)?;
    let namespace = state.ctx.db(move |conn| find_namespace(conn, &name)).await?;
    Envelope::ok(namespace)
}

/// POST /api/v1/namespace/{name}/
pub async fn create(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
) -> ApiResult<Json<Envelope>> {
    validate_name("namespace", &name)?;
    caller.require(&name, None, Permission::NamespaceCreate)?;
    let namespace = state
        .ctx
        .db(move |conn| {
            if Namespace::find_by_name(conn, &name)?.is_some() {
                return Err(Error::Conflict(format!("namespace {name} already exists")));
            }
            let namespace = Namespace::ensure(conn, &name)?;
            info!("Created namespace {}", name);
            Ok(namespace)
        })
        .await?;
    Envelope::ok(namespace)
}

#[derive(Debug, Deserialize)]
pub struct NamespaceUpdate {
    pub metadata: Option<serde_json::Value>,
    /// Replaces every role mapping of the namespace: other namespace glob -> role
    pub role_mappings: Option<BTreeMap<String, String>>,
}

/// PUT /api/v1/namespace/{name}/
pub async fn update(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
    Json(body): Json<NamespaceUpdate>,
) -> ApiResult<Json<Envelope>> {
    caller.require(&name, None, Permission::NamespaceUpdate)?;
    let mappings = match body.role_mappings {
        Some(mappings) => {
            caller.require(&name, None, Permission::NamespaceRoleMappingUpdate)?;
            let mut normalized = BTreeMap::new();
            for (other, role) in mappings {
                check_glob(&other)?;
                normalized.insert(other, Role::normalize(&role)?);
            }
            Some(normalized)
        }
        None => None,
    };

    let namespace = state
        .ctx
        .db(move |conn| {
            crate::db::transaction(conn, |tx| {
                let mut namespace = find_namespace(tx, &name)?;
                let id = namespace_id(&namespace)?;
                if let Some(metadata) = body.metadata {
                    namespace.update_metadata(tx, metadata)?;
                }
                if let Some(mappings) = &mappings {
                    tx.execute("DELETE FROM namespace_role_mapping WHERE namespace_id = ?1", [id])?;
                    for (other, role) in mappings {
                        NamespaceRoleMapping::create(tx, id, other, role)?;
                    }
                }
                Ok(namespace)
            })
        })
        .await?;
    Envelope::ok(namespace)
}

/// DELETE /api/v1/namespace/{name}/
pub async fn delete(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
) -> ApiResult<Json<Envelope>> {
    caller.require(&name, None, Permission::NamespaceDelete)?;
    let store_directory = state.ctx.store_directory().to_path_buf();
    state
        .ctx
        .db(move |conn| {
            for env in environment::delete_namespace(conn, &name)? {
                if let Err(e) = environment::remove_environment_link(&store_directory, &env) {
                    warn!("Failed to remove link of {}/{}: {}", env.namespace, env.name, e);
                }
            }
            Ok(())
        })
        .await?;
    Envelope::message("namespace deleted")
}

/// Role-mapping `other_namespace` globs use name characters and `*`
fn check_glob(glob: &str) -> Result<()> {
    crate::auth::ArnPattern::parse(&format!("{glob}/*"))
        .map(|_| ())
        .map_err(|_| Error::Validation(format!("invalid namespace pattern {glob}")))
}

#[derive(Debug, Deserialize)]
pub struct RoleMappingBody {
    pub other_namespace: String,
    pub role: Option<String>,
}

impl RoleMappingBody {
    fn role(&self) -> Result<String> {
        let role = self
            .role
            .as_deref()
            .ok_or_else(|| Error::Validation("role is required".into()))?;
        Role::normalize(role)
    }
}

/// GET /api/v1/namespace/{name}/role/
pub async fn list_roles(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
) -> ApiResult<Json<Envelope>> {
    caller.require(&name, None, Permission::NamespaceRoleMappingRead)?;
    let mappings = state
        .ctx
        .db(move |conn| {
            let namespace = find_namespace(conn, &name)?;
            NamespaceRoleMapping::list_for_namespace(conn, namespace_id(&namespace)?)
        })
        .await?;
    Envelope::ok(mappings)
}

/// POST /api/v1/namespace/{name}/role/
pub async fn create_role(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
    Json(body): Json<RoleMappingBody>,
) -> ApiResult<Json<Envelope>> {
    caller.require(&name, None, Permission::NamespaceRoleMappingCreate)?;
    check_glob(&body.other_namespace)?;
    let role = body.role()?;
    state
        .ctx
        .db(move |conn| {
            let namespace = find_namespace(conn, &name)?;
            NamespaceRoleMapping::create(conn, namespace_id(&namespace)?, &body.other_namespace, &role)
        })
        .await?;
    Envelope::message("role mapping created")
}

/// PUT /api/v1/namespace/{name}/role/
pub async fn update_role(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
    Json(body): Json<RoleMappingBody>,
) -> ApiResult<Json<Envelope>> {
    caller.require(&name, None, Permission::NamespaceRoleMappingUpdate)?;
    let role = body.role()?;
    state
        .ctx
        .db(move |conn| {
            let namespace = find_namespace(conn, &name)?;
            NamespaceRoleMapping::update(conn, namespace_id(&namespace)?, &body.other_namespace, &role)
        })
        .await?;
    Envelope::message("role mapping updated")
}

/// DELETE /api/v1/namespace/{name}/role/
pub async fn delete_role(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(name): Path<String>,
    Json(body): Json<RoleMappingBody>,
) -> ApiResult<Json<Envelope>> {
    caller.require(&name, None, Permission::NamespaceRoleMappingDelete)?;
    state
        .ctx
        .db(move |conn| {
            let namespace = find_namespace(conn, &name)?;
            NamespaceRoleMapping::delete(conn, namespace_id(&namespace)?, &body.other_namespace)
        })
        .await?;
    Envelope::message("role mapping deleted")
}
