// tests/registration.rs

//! Registration against a file-backed store: deduplication, scoped
//! settings and environment management.

mod common;

use common::{TestStore, specification};
use envstore::db::models::{Build, BuildStatus, Environment, Namespace};
use envstore::environment::{delete_environment, delete_namespace, update_environment};
use envstore::queue::Task;
use envstore::settings::{get_settings, set_settings};
use envstore::{Error, environment::spec::Submission};
use serde_json::{Map, Value, json};

fn values(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected an object"),
    }
}

#[test]
fn test_dedupe_is_per_namespace() {
    let store = TestStore::new();
    let first = store.submit("default", specification("shared", &["zlib"])).unwrap();
    assert!(first.is_some());
    assert_eq!(store.submit("default", specification("shared", &["zlib"])).unwrap(), None);

    let elsewhere = store.submit("lab", specification("shared", &["zlib"])).unwrap();
    assert!(elsewhere.is_some());
    assert_ne!(first, elsewhere);

    let conn = store.conn();
    assert!(Namespace::find_by_name(&conn, "lab").unwrap().is_some());
    let a = Build::get(&conn, first.unwrap()).unwrap();
    let b = Build::get(&conn, elsewhere.unwrap()).unwrap();
    assert_eq!(a.specification_id, b.specification_id, "specifications are shared by content");
}

#[test]
fn test_environment_scope_overrides_namespace_scope() {
    let store = TestStore::new();
    let mut conn = store.conn();
    let defaults = store.ctx.defaults().clone();

    set_settings(
        &mut conn,
        &defaults,
        Some("lab"),
        None,
        &values(json!({ "conda_required_packages": ["python"] })),
    )
    .unwrap();
    set_settings(
        &mut conn,
        &defaults,
        Some("lab"),
        Some("scratch"),
        &values(json!({ "conda_required_packages": [] })),
    )
    .unwrap();

    let namespace = get_settings(&conn, &defaults, Some("lab"), None).unwrap();
    assert_eq!(namespace.conda_required_packages, vec!["python"]);
    let environment = get_settings(&conn, &defaults, Some("lab"), Some("scratch")).unwrap();
    assert!(environment.conda_required_packages.is_empty());
    drop(conn);

    let rejected = store.submit("lab", specification("analysis", &["zlib"]));
    assert!(matches!(rejected, Err(Error::Validation(_))));
    assert!(store.submit("lab", specification("scratch", &["zlib"])).unwrap().is_some());
    assert!(store.submit("default", specification("analysis", &["zlib"])).unwrap().is_some());
}

#[test]
fn test_lockfile_submission_is_stored_verbatim() {
    let store = TestStore::new();
    let channel = store.temp.path().join("channel");
    let lockfile = common::channel_lockfile(&channel);
    let submission = Submission::from_value(json!({
        "name": "pinned",
        "lockfile": lockfile,
    }))
    .unwrap();
    assert!(submission.is_lockfile());

    let build_id = store.submit("default", submission).unwrap().unwrap();
    let conn = store.conn();
    let build = Build::get(&conn, build_id).unwrap();
    let stored = envstore::db::models::Specification::get(&conn, build.specification_id).unwrap();
    assert!(stored.is_lockfile);
    assert_eq!(stored.spec["lockfile"]["package"][0]["name"], "zlib");
}

#[tokio::test]
async fn test_repoint_and_delete_environment() {
    let store = TestStore::new();
    let first = store.submit("default", specification("tools", &["zlib"])).unwrap().unwrap();
    store.drain().await;
    let second = store
        .submit("default", specification("tools", &["zlib", "git"]))
        .unwrap()
        .unwrap();
    store.drain().await;

    let mut conn = store.conn();
    let environment = update_environment(&mut conn, "default", "tools", Some(second), Some("dev tools")).unwrap();
    assert_eq!(environment.current_build_id, Some(second));
    assert_eq!(environment.description, "dev tools");
    assert!(Task::find_by_id(&conn, &format!("build-{second}-symlink")).unwrap().is_some());
    drop(conn);

    store.drain().await;
    let conn = store.conn();
    let info = envstore::build::BuildInfo::load(&conn, second).unwrap();
    assert_eq!(
        std::fs::read_link(info.environment_path(store.store_directory())).unwrap(),
        info.build_path(store.store_directory()).unwrap()
    );
    drop(conn);

    let mut conn = store.conn();
    delete_environment(&mut conn, "default", "tools").unwrap();
    assert!(Environment::find_by_name(&conn, "default", "tools").unwrap().is_none());
    assert_eq!(Build::get(&conn, first).unwrap().status, BuildStatus::Deleted);
}

#[test]
fn test_delete_namespace_retires_queued_builds() {
    let store = TestStore::new();
    let build_id = store.submit("lab", specification("queued", &["zlib"])).unwrap().unwrap();

    let mut conn = store.conn();
    let removed = delete_namespace(&mut conn, "lab").unwrap();
    assert_eq!(removed.len(), 1);
    assert!(Namespace::find_by_name(&conn, "lab").unwrap().is_none());
    assert!(Task::is_chain_revoked(&conn, &format!("build-{build_id}")).unwrap());
}
