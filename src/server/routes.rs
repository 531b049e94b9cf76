// src/server/routes.rs
//! Axum router configuration for the envstore API
//!
//! Every API path is reachable with and without its trailing slash.

use crate::config::StorageBackend;
use crate::server::AppState;
use crate::server::handlers::{api, build, environment, namespace, package, setting, solve};
use axum::Router;
use axum::http::HeaderValue;
use axum::routing::{MethodRouter, get, post, put};
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Register `path` and its slash-less twin
fn route(router: Router<AppState>, path: &str, handler: MethodRouter<AppState>) -> Router<AppState> {
    let bare = path.trim_end_matches('/');
    router.route(path, handler.clone()).route(bare, handler)
}

fn api_routes() -> Router<AppState> {
    let mut r = Router::new();
    r = route(r, "/api/v1/", get(api::root));
    r = route(r, "/api/v1/permission/", get(api::permission));
    r = route(r, "/api/v1/token/", post(api::create_token));
    r = route(r, "/api/v1/usage/", get(api::usage));

    r = route(r, "/api/v1/namespace/", get(namespace::list));
    r = route(
        r,
        "/api/v1/namespace/:name/",
        get(namespace::get)
            .post(namespace::create)
            .put(namespace::update)
            .delete(namespace::delete),
    );
    r = route(
        r,
        "/api/v1/namespace/:name/role/",
        get(namespace::list_roles)
            .post(namespace::create_role)
            .put(namespace::update_role)
            .delete(namespace::delete_role),
    );

    r = route(r, "/api/v1/environment/", get(environment::list));
    r = route(
        r,
        "/api/v1/environment/:namespace/:name/",
        get(environment::get)
            .put(environment::update)
            .delete(environment::delete),
    );
    r = route(r, "/api/v1/specification/", post(environment::submit));

    r = route(r, "/api/v1/build/", get(build::list));
    r = route(
        r,
        "/api/v1/build/:id/",
        get(build::get).put(build::rebuild).delete(build::delete),
    );
    r = route(r, "/api/v1/build/:id/cancel/", put(build::cancel));
    r = route(r, "/api/v1/build/:id/packages/", get(build::packages));
    r = route(r, "/api/v1/build/:id/logs/", get(build::logs));
    r = route(r, "/api/v1/build/:id/yaml/", get(build::yaml));
    r = route(r, "/api/v1/build/:id/conda-lock.yaml/", get(build::lockfile));
    r = route(r, "/api/v1/build/:id/archive/", get(build::archive));
    r = route(r, "/api/v1/build/:id/installer/", get(build::installer));

    r = route(r, "/api/v1/package/", get(package::list_packages));
    r = route(r, "/api/v1/channel/", get(package::list_channels));

    r = route(
        r,
        "/api/v1/setting/",
        get(setting::get_global).put(setting::put_global),
    );
    r = route(
        r,
        "/api/v1/setting/:namespace/",
        get(setting::get_namespace).put(setting::put_namespace),
    );
    r = route(
        r,
        "/api/v1/setting/:namespace/:environment/",
        get(setting::get_environment).put(setting::put_environment),
    );

    r = route(r, "/api/v1/solve/", post(solve::create));
    route(r, "/api/v1/solve/:id/", get(solve::get))
}

fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }
    if origins.iter().any(|o| o == "*") {
        return Some(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {}", origin);
                None
            }
        })
        .collect();
    Some(
        CorsLayer::new()
            .allow_origin(parsed)
            .allow_methods(Any)
            .allow_headers(Any),
    )
}

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    let config = &state.ctx.config;

    let mut router = api_routes().route("/health", get(api::health));

    // Blobs of the local backend are served by us; S3 URLs point elsewhere
    if config.storage.backend == StorageBackend::Local {
        router = router.nest_service("/storage", ServeDir::new(&config.storage.local_path));
    }

    let mut router = router
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http());
    if let Some(cors) = cors_layer(&config.server.cors_origins) {
        router = router.layer(cors);
    }
    router.with_state(state)
}
