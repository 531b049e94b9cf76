// src/lib.rs

//! envstore
//!
//! Multi-tenant service that builds conda environments from declarative
//! specifications and serves the results.
//!
//! # Architecture
//!
//! - Database-first: namespaces, environments, specifications, builds,
//!   artifacts, the package catalog, settings and the task queue all live
//!   in SQLite
//! - Builds move through an explicit state machine (`build::state`)
//! - Work runs on a durable task queue drained by worker pools (`queue`)
//! - Artifacts (logs, lockfiles, archives, installers) go to a blob store
//!   (`storage`), either a local directory or S3
//! - Settings resolve in three layers: global, namespace, environment

pub mod auth;
pub mod build;
pub mod config;
pub mod context;
pub mod db;
pub mod environment;
mod error;
pub mod hash;
pub mod indexer;
pub mod queue;
pub mod server;
pub mod settings;
pub mod storage;

pub use config::Config;
pub use context::AppContext;
pub use error::{Error, Result};
pub use hash::{HashAlgorithm, canonical_sha256};
pub use settings::Settings;
