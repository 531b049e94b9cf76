// src/server/handlers/mod.rs
//! HTTP request handlers for the envstore API

pub mod api;
pub mod build;
pub mod environment;
pub mod namespace;
pub mod package;
pub mod setting;
pub mod solve;

use crate::auth::Authorization;
use crate::server::AppState;
use crate::server::response::ApiError;
use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

/// The resolved permissions of whoever sent the request
///
/// Built from the `Authorization: Bearer <token>` header; requests without
/// one are anonymous. An invalid or expired token is rejected with 403
/// rather than downgraded.
pub struct Caller(pub Authorization);

#[async_trait]
impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let bearer = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| token.trim().to_string());

        let entity = state.authenticator.entity(bearer.as_deref())?;
        let auth = state.authenticator.auth().clone();
        let authorization = state
            .ctx
            .db(move |conn| Authorization::resolve(conn, &entity, &auth))
            .await?;
        Ok(Caller(authorization))
    }
}
