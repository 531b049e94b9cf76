// src/config.rs
//! Configuration file parsing for envstore
//!
//! Supports TOML configuration files with the following sections:
//! - [server] - Bind address, public URL, standalone mode
//! - [storage] - Store directory, database, package cache, blob backend
//! - [worker] - Concurrency, periodic task intervals, external commands
//! - [auth] - Token signing key and default role bindings
//! - [settings] - Deployment defaults for the settings resolver

use crate::settings::Settings;
use crate::storage::s3::S3Config;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// TOML configuration file structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub storage: StorageSection,

    #[serde(default)]
    pub worker: WorkerSection,

    #[serde(default)]
    pub auth: AuthSection,

    /// Deployment defaults, the bottom layer of every settings lookup
    #[serde(default)]
    pub settings: Settings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Base URL clients reach the server on; blob URLs are built from it
    #[serde(default = "default_public_url")]
    pub public_url: String,

    /// Run a worker pool inside the server process
    #[serde(default)]
    pub standalone: bool,

    /// Allowed CORS origins (empty = CORS disabled)
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// How long startup waits for a worker to report ready (e.g., "60s")
    #[serde(default = "default_worker_ready_timeout")]
    pub worker_ready_timeout: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            public_url: default_public_url(),
            standalone: false,
            cors_origins: Vec::new(),
            worker_ready_timeout: default_worker_ready_timeout(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_public_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_worker_ready_timeout() -> String {
    "60s".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Local,
    S3,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    /// Root of installed prefixes and environment symlinks
    #[serde(default = "default_store_directory")]
    pub store_directory: PathBuf,

    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// Shared package cache (`CONDA_PKGS_DIRS`)
    #[serde(default = "default_package_cache")]
    pub package_cache: PathBuf,

    #[serde(default)]
    pub backend: StorageBackend,

    /// Blob directory for the local backend, served at /storage
    #[serde(default = "default_local_path")]
    pub local_path: PathBuf,

    #[serde(default)]
    pub s3: Option<S3Config>,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            store_directory: default_store_directory(),
            database: default_database(),
            package_cache: default_package_cache(),
            backend: StorageBackend::Local,
            local_path: default_local_path(),
            s3: None,
        }
    }
}

fn default_store_directory() -> PathBuf {
    PathBuf::from("/var/lib/envstore/envs")
}

fn default_database() -> PathBuf {
    PathBuf::from("/var/lib/envstore/envstore.db")
}

fn default_package_cache() -> PathBuf {
    PathBuf::from("/var/lib/envstore/pkgs")
}

fn default_local_path() -> PathBuf {
    PathBuf::from("/var/lib/envstore/storage")
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSection {
    /// Tasks run in parallel per worker process
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Directories scanned for environment files
    #[serde(default)]
    pub watch_paths: Vec<PathBuf>,

    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: String,

    /// A started task whose heartbeat is older than this is not active
    #[serde(default = "default_stale_after")]
    pub stale_after: String,

    #[serde(default = "default_watch_paths_interval")]
    pub watch_paths_interval: String,

    #[serde(default = "default_update_channels_interval")]
    pub update_channels_interval: String,

    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval: String,

    /// Finished tasks older than this are purged by the watchdog
    #[serde(default = "default_task_retention")]
    pub task_retention: String,

    #[serde(default = "default_conda_lock_command")]
    pub conda_lock_command: String,

    #[serde(default = "default_constructor_command")]
    pub constructor_command: String,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            watch_paths: Vec::new(),
            poll_interval: default_poll_interval(),
            heartbeat_interval: default_heartbeat_interval(),
            stale_after: default_stale_after(),
            watch_paths_interval: default_watch_paths_interval(),
            update_channels_interval: default_update_channels_interval(),
            watchdog_interval: default_watchdog_interval(),
            task_retention: default_task_retention(),
            conda_lock_command: default_conda_lock_command(),
            constructor_command: default_constructor_command(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

fn default_poll_interval() -> String {
    "1s".to_string()
}

fn default_heartbeat_interval() -> String {
    "10s".to_string()
}

fn default_stale_after() -> String {
    "60s".to_string()
}

fn default_watch_paths_interval() -> String {
    "60s".to_string()
}

fn default_update_channels_interval() -> String {
    "15m".to_string()
}

fn default_watchdog_interval() -> String {
    "5m".to_string()
}

fn default_task_retention() -> String {
    "7d".to_string()
}

fn default_conda_lock_command() -> String {
    "conda-lock".to_string()
}

fn default_constructor_command() -> String {
    "constructor".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    /// Ed25519 signing key (created by `envstore init`)
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,

    /// Default lifetime of issued tokens (e.g., "1d")
    #[serde(default = "default_token_expiry")]
    pub token_expiry: String,

    /// Bindings for requests without a token
    #[serde(default = "default_unauthenticated_bindings")]
    pub unauthenticated_role_bindings: BTreeMap<String, Vec<String>>,

    /// Bindings every token holder gets in addition to its own
    #[serde(default = "default_authenticated_bindings")]
    pub authenticated_role_bindings: BTreeMap<String, Vec<String>>,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            key_path: default_key_path(),
            token_expiry: default_token_expiry(),
            unauthenticated_role_bindings: default_unauthenticated_bindings(),
            authenticated_role_bindings: default_authenticated_bindings(),
        }
    }
}

fn default_key_path() -> PathBuf {
    PathBuf::from("/var/lib/envstore/token.key")
}

fn default_token_expiry() -> String {
    "1d".to_string()
}

fn default_unauthenticated_bindings() -> BTreeMap<String, Vec<String>> {
    BTreeMap::from([("default/*".to_string(), vec!["viewer".to_string()])])
}

fn default_authenticated_bindings() -> BTreeMap<String, Vec<String>> {
    BTreeMap::from([
        ("default/*".to_string(), vec!["viewer".to_string()]),
        ("filesystem/*".to_string(), vec!["viewer".to_string()]),
    ])
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, otherwise use defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.worker.concurrency == 0 {
            anyhow::bail!("worker.concurrency must be at least 1");
        }

        if self.storage.backend == StorageBackend::S3 && self.storage.s3.is_none() {
            anyhow::bail!("storage.backend = \"s3\" requires a [storage.s3] section");
        }

        if let Err(e) = self.settings.validate() {
            anyhow::bail!("settings: {e}");
        }

        for value in [
            &self.server.worker_ready_timeout,
            &self.worker.poll_interval,
            &self.worker.heartbeat_interval,
            &self.worker.stale_after,
            &self.worker.watch_paths_interval,
            &self.worker.update_channels_interval,
            &self.worker.watchdog_interval,
            &self.worker.task_retention,
            &self.auth.token_expiry,
        ] {
            parse_duration(value)?;
        }

        url::Url::parse(&self.server.public_url)
            .with_context(|| format!("Invalid server.public_url: {}", self.server.public_url))?;
        self.bind_addr()?;
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.server.bind))
    }

    /// Public URL of the /storage mount
    pub fn storage_url(&self) -> String {
        format!("{}/storage", self.server.public_url.trim_end_matches('/'))
    }

    pub fn worker_ready_timeout(&self) -> Result<Duration> {
        parse_duration(&self.server.worker_ready_timeout)
    }

    pub fn token_expiry(&self) -> Result<Duration> {
        parse_duration(&self.auth.token_expiry)
    }
}

impl WorkerSection {
    pub fn poll_interval(&self) -> Result<Duration> {
        parse_duration(&self.poll_interval)
    }

    pub fn heartbeat_interval(&self) -> Result<Duration> {
        parse_duration(&self.heartbeat_interval)
    }

    pub fn stale_after(&self) -> Result<Duration> {
        parse_duration(&self.stale_after)
    }

    pub fn watch_paths_interval(&self) -> Result<Duration> {
        parse_duration(&self.watch_paths_interval)
    }

    pub fn update_channels_interval(&self) -> Result<Duration> {
        parse_duration(&self.update_channels_interval)
    }

    pub fn watchdog_interval(&self) -> Result<Duration> {
        parse_duration(&self.watchdog_interval)
    }

    pub fn task_retention(&self) -> Result<Duration> {
        parse_duration(&self.task_retention)
    }
}

/// Parse a duration string like "30s", "15m", "1h" or "7d"
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix('d') {
        (n, 24 * 60 * 60)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 60 * 60)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1)
    } else {
        // Assume seconds
        (s.as_str(), 1)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid duration number: {}", num_str))?;

    Ok(Duration::from_secs(num * multiplier))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::ArtifactType;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(7 * 86400));
        assert_eq!(parse_duration("5").unwrap(), Duration::from_secs(5));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage_url(), "http://localhost:8080/storage");
        assert_eq!(config.worker.concurrency, 4);
        assert_eq!(config.settings.build_key_version, 2);
    }

    #[test]
    fn test_parse_toml() {
        let config: Config = toml::from_str(
            r#"
[server]
bind = "127.0.0.1:9000"
public_url = "https://envs.example.com/"
standalone = true

[storage]
store_directory = "/srv/envs"
backend = "s3"

[storage.s3]
internal_endpoint = "http://minio:9000"
bucket = "envstore"
access_key = "admin"
secret_key = "password"

[worker]
concurrency = 2
watch_paths = ["/opt/environments"]

[auth.unauthenticated_role_bindings]
"public/*" = ["viewer"]

[settings]
conda_channel_alias = "https://mirror.example.com"
conda_default_channels = ["main"]
build_artifacts = ["LOCKFILE", "YAML"]
"#,
        )
        .unwrap();

        assert!(config.validate().is_ok());
        assert!(config.server.standalone);
        assert_eq!(config.storage_url(), "https://envs.example.com/storage");
        assert_eq!(config.storage.backend, StorageBackend::S3);
        assert_eq!(config.storage.s3.as_ref().unwrap().bucket, "envstore");
        assert_eq!(config.worker.watch_paths, vec![PathBuf::from("/opt/environments")]);
        assert!(config.auth.unauthenticated_role_bindings.contains_key("public/*"));
        assert_eq!(config.settings.conda_channel_alias, "https://mirror.example.com");
        assert_eq!(
            config.settings.build_artifacts,
            vec![ArtifactType::Lockfile, ArtifactType::Yaml]
        );
        // untouched defaults survive a partial [settings] table
        assert_eq!(config.settings.conda_command, "mamba");
    }

    #[test]
    fn test_invalid_configs() {
        let mut config = Config::default();
        config.worker.concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.storage.backend = StorageBackend::S3;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.settings.build_key_version = 7;
        assert!(config.validate().is_err());

        assert!(toml::from_str::<Config>("[bogus]\nx = 1\n").is_err());
    }
}
