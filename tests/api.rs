// tests/api.rs

//! HTTP API tests driven through the router without a listener.

mod common;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use common::{TestStore, specification_yaml, token};
use serde_json::{Value, json};
use tower::ServiceExt;

async fn send(app: &Router, method: &str, uri: &str, bearer: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let response = send_raw(app, method, uri, bearer, body).await;
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn send_raw(
    app: &Router,
    method: &str,
    uri: &str,
    bearer: Option<&str>,
    body: Option<Value>,
) -> axum::response::Response {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(bearer) = bearer {
        request = request.header(header::AUTHORIZATION, format!("Bearer {bearer}"));
    }
    let request = match body {
        Some(body) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    app.clone().oneshot(request).await.unwrap()
}

#[tokio::test]
async fn test_health_and_root() {
    let store = TestStore::new();
    let state = store.state();
    let app = store.router(&state);

    let (status, body) = send(&app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = send(&app, "GET", "/api/v1/", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["version"], env!("CARGO_PKG_VERSION"));

    let (status, _) = send(&app, "GET", "/api/v1", None, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_anonymous_permissions() {
    let store = TestStore::new();
    let state = store.state();
    let app = store.router(&state);

    let (status, body) = send(&app, "GET", "/api/v1/permission/", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["authenticated"], false);
    let permissions = body["data"]["entity_permissions"]["default/*"].as_array().unwrap();
    assert!(permissions.contains(&json!("ENVIRONMENT_READ")));
    assert!(!permissions.contains(&json!("ENVIRONMENT_CREATE")));

    let submission = json!({ "specification": specification_yaml("anon", &["zlib"]) });
    let (status, body) = send(&app, "POST", "/api/v1/specification/", None, Some(submission)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["status"], "error");
    assert_eq!(body["message"], "not authorized");

    let (status, _) = send(&app, "GET", "/api/v1/permission/", Some("garbage"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_submit_build_and_fetch_artifacts() {
    let store = TestStore::new();
    let state = store.state();
    let app = store.router(&state);
    let admin = token(&state, "default", &[]);

    let submission = json!({ "specification": specification_yaml("web", &["zlib"]) });
    let (status, body) = send(&app, "POST", "/api/v1/specification/", Some(&admin), Some(submission.clone())).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let build_id = body["data"]["build_id"].as_i64().unwrap();

    // Same specification again is deduplicated
    let (status, body) = send(&app, "POST", "/api/v1/specification/", Some(&admin), Some(submission)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"].is_null());

    let (_, body) = send(&app, "GET", &format!("/api/v1/build/{build_id}/"), None, None).await;
    assert_eq!(body["data"]["status"], "QUEUED");
    assert_eq!(body["data"]["namespace"], "default");
    assert_eq!(body["data"]["environment"], "web");

    store.drain().await;

    let (status, body) = send(&app, "GET", &format!("/api/v1/build/{build_id}"), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "COMPLETED");

    let (_, body) = send(&app, "GET", "/api/v1/environment/default/web/", None, None).await;
    assert_eq!(body["data"]["current_build_id"], build_id);

    let (_, body) = send(&app, "GET", &format!("/api/v1/build/{build_id}/packages/"), None, None).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["data"][0]["name"], "zlib");

    let response = send_raw(&app, "GET", &format!("/api/v1/build/{build_id}/conda-lock.yaml/"), None, None).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    let location = response.headers()[header::LOCATION].to_str().unwrap();
    assert!(location.starts_with("http://envstore.test/storage/lockfile/"), "{location}");
    assert!(location.ends_with(".yml"));

    let response = send_raw(&app, "GET", &format!("/api/v1/build/{build_id}/logs"), None, None).await;
    assert_eq!(response.status(), StatusCode::FOUND);

    let (status, _) = send(&app, "GET", &format!("/api/v1/build/{build_id}/installer/"), None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Completed builds cannot be cancelled, current builds cannot be deleted
    let (status, _) = send(&app, "PUT", &format!("/api/v1/build/{build_id}/cancel/"), Some(&admin), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = send(&app, "DELETE", &format!("/api/v1/build/{build_id}/"), Some(&admin), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(&app, "GET", "/api/v1/build/999/", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_namespace_settings_enforce_required_packages() {
    let store = TestStore::new();
    let state = store.state();
    let app = store.router(&state);
    let admin = token(&state, "science", &[]);

    let (status, _) = send(
        &app,
        "PUT",
        "/api/v1/setting/science/",
        Some(&admin),
        Some(json!({ "conda_required_packages": ["python"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&app, "GET", "/api/v1/setting/science/", Some(&admin), None).await;
    assert_eq!(body["data"]["conda_required_packages"], json!(["python"]));
    let (_, body) = send(&app, "GET", "/api/v1/setting/", Some(&admin), None).await;
    assert_eq!(body["data"]["conda_required_packages"], json!([]));

    let missing = json!({
        "namespace": "science",
        "specification": specification_yaml("notebook", &["zlib"]),
    });
    let (status, body) = send(&app, "POST", "/api/v1/specification/", Some(&admin), Some(missing)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("python"));

    let complete = json!({
        "namespace": "science",
        "specification": specification_yaml("notebook", &["zlib", "python>=3.11"]),
    });
    let (status, body) = send(&app, "POST", "/api/v1/specification/", Some(&admin), Some(complete)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["build_id"].is_i64());

    // Global-only keys cannot be set within a namespace
    let (status, body) = send(
        &app,
        "PUT",
        "/api/v1/setting/science/",
        Some(&admin),
        Some(json!({ "conda_command": "conda" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("global"));

    // Global writes need a */* binding
    let (status, _) = send(
        &app,
        "PUT",
        "/api/v1/setting/",
        Some(&admin),
        Some(json!({ "conda_max_solve_time": 60 })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let root = token(&state, "science", &[("*/*", "admin")]);
    let (status, _) = send(
        &app,
        "PUT",
        "/api/v1/setting/",
        Some(&root),
        Some(json!({ "conda_max_solve_time": 60 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Values that deserialize but would break every later build
    for value in [json!({ "build_key_version": 7 }), json!({ "default_permissions": "zzz" })] {
        let (status, _) = send(&app, "PUT", "/api/v1/setting/", Some(&root), Some(value)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/specification/",
        Some(&root),
        Some(json!({
            "namespace": "science",
            "specification": specification_yaml("after-settings", &["python", "flask"]),
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
}

#[tokio::test]
async fn test_token_issuance_is_bounded_by_caller() {
    let store = TestStore::new();
    let state = store.state();
    let app = store.router(&state);
    let team = token(&state, "team", &[]);

    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/token/",
        Some(&team),
        Some(json!({ "role_bindings": { "team/*": ["viewer"] } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["primary_namespace"], "team");
    let issued = body["data"]["token"].as_str().unwrap().to_string();

    let (_, body) = send(&app, "GET", "/api/v1/permission/", Some(&issued), None).await;
    assert_eq!(body["data"]["authenticated"], true);
    assert_eq!(body["data"]["primary_namespace"], "team");

    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/token/",
        Some(&team),
        Some(json!({ "role_bindings": { "*/*": ["admin"] } })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&app, "POST", "/api/v1/token/", None, Some(json!({}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_listings_respect_visibility() {
    let store = TestStore::new();
    let state = store.state();
    let app = store.router(&state);
    let secret = token(&state, "secret", &[]);
    let default_admin = token(&state, "default", &[]);

    for (bearer, namespace, name) in [(&secret, "secret", "hidden"), (&default_admin, "default", "open")] {
        let submission = json!({
            "namespace": namespace,
            "specification": specification_yaml(name, &["zlib"]),
        });
        let (status, _) = send(&app, "POST", "/api/v1/specification/", Some(bearer), Some(submission)).await;
        assert_eq!(status, StatusCode::OK);
    }

    let (_, body) = send(&app, "GET", "/api/v1/environment/", None, None).await;
    let names: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|env| env["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["open"]);

    let (_, body) = send(&app, "GET", "/api/v1/environment/", Some(&secret), None).await;
    assert_eq!(body["count"], 2);

    let (status, _) = send(&app, "GET", "/api/v1/environment/secret/hidden/", None, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (_, body) = send(&app, "GET", "/api/v1/build/", None, None).await;
    assert_eq!(body["count"], 1);

    let (_, body) = send(&app, "GET", "/api/v1/namespace/", Some(&secret), None).await;
    let namespaces: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|ns| ns["name"].as_str().unwrap())
        .collect();
    assert!(namespaces.contains(&"secret"));
    assert!(namespaces.contains(&"default"));
}

#[tokio::test]
async fn test_environment_cursor_pagination() {
    let store = TestStore::new();
    let state = store.state();
    let app = store.router(&state);
    let admin = token(&state, "default", &[]);

    for name in ["one", "two", "three"] {
        let submission = json!({ "specification": specification_yaml(name, &["zlib"]) });
        let (status, _) = send(&app, "POST", "/api/v1/specification/", Some(&admin), Some(submission)).await;
        assert_eq!(status, StatusCode::OK);
    }

    let (_, first) = send(&app, "GET", "/api/v1/environment/?size=2", None, None).await;
    assert_eq!(first["data"].as_array().unwrap().len(), 2);
    assert_eq!(first["count"], 3);
    let cursor = first["cursor"].as_str().unwrap().to_string();

    let (_, second) = send(&app, "GET", &format!("/api/v1/environment/?size=2&cursor={cursor}"), None, None).await;
    let rest = second["data"].as_array().unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0]["name"], "three");
    assert!(second.get("cursor").is_none());

    let (status, _) = send(&app, "GET", "/api/v1/environment/?cursor=bm90LWpzb24", None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
