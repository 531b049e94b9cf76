// src/build/install.rs

//! Package fetch and prefix installation
//!
//! Archives are downloaded into the shared package cache before install.
//! The cache is content-addressed by file name and verified by digest, so
//! concurrent builds that need the same archive fetch it once: each file
//! is guarded by a sidecar lock and a verified file is never downloaded
//! again.

use super::BuildLog;
use super::lockfile::{LockedPackage, Lockfile};
use super::process::run_logged;
use crate::error::{Error, Result};
use crate::hash::{HashAlgorithm, verify_file};
use crate::storage::{PathLock, run_blocking};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct InstallContext {
    pub log: BuildLog,
    pub env: BTreeMap<String, String>,
    pub cancel: CancellationToken,
    pub work_dir: PathBuf,
    pub package_cache: PathBuf,
    pub conda_command: String,
}

#[async_trait]
pub trait Installer: Send + Sync {
    /// Install the locked packages for `platform` into `prefix`
    async fn install(
        &self,
        lockfile: &Lockfile,
        platform: &str,
        prefix: &Path,
        ctx: &InstallContext,
    ) -> Result<()>;
}

/// `conda create --file explicit.txt`, then pip entries without dependencies
pub struct CondaInstaller;

#[async_trait]
impl Installer for CondaInstaller {
    async fn install(
        &self,
        lockfile: &Lockfile,
        platform: &str,
        prefix: &Path,
        ctx: &InstallContext,
    ) -> Result<()> {
        let explicit = ctx.work_dir.join("explicit.txt");
        tokio::fs::write(&explicit, lockfile.explicit(platform)).await?;

        let mut command = Command::new(&ctx.conda_command);
        command
            .arg("create")
            .arg("--yes")
            .arg("--quiet")
            .arg("--prefix")
            .arg(prefix)
            .arg("--file")
            .arg(&explicit)
            .env("CONDA_PKGS_DIRS", &ctx.package_cache)
            .envs(&ctx.env);
        run_logged(command, "install", &ctx.log, &ctx.cancel).await?;

        let wheels: Vec<&str> = lockfile.pip_packages(platform).map(|p| p.url.as_str()).collect();
        if !wheels.is_empty() {
            let mut pip = Command::new(prefix.join("bin").join("python"));
            pip.args(["-m", "pip", "install", "--no-deps", "--no-input"])
                .args(&wheels)
                .envs(&ctx.env);
            run_logged(pip, "pip", &ctx.log, &ctx.cancel).await?;
        }
        Ok(())
    }
}

/// Download every conda archive of `platform` into the package cache
///
/// Returns the number of archives actually transferred.
pub async fn fetch_packages(
    client: &reqwest::Client,
    lockfile: &Lockfile,
    platform: &str,
    package_cache: &Path,
    log: &BuildLog,
) -> Result<usize> {
    tokio::fs::create_dir_all(package_cache).await?;
    let mut fetched = 0;
    for package in lockfile.conda_packages(platform) {
        if fetch_package(client, package, package_cache).await? {
            fetched += 1;
        }
    }
    log.append(&format!(
        "Fetched {} package(s) into {}",
        fetched,
        package_cache.display()
    ))
    .await?;
    Ok(fetched)
}

/// Expected digest of a package, strongest first
fn expected_digest(package: &LockedPackage) -> Option<(&str, HashAlgorithm)> {
    if let Some(sha256) = &package.hash.sha256 {
        return Some((sha256.as_str(), HashAlgorithm::Sha256));
    }
    package.hash.md5.as_deref().map(|md5| (md5, HashAlgorithm::Md5))
}

async fn fetch_package(client: &reqwest::Client, package: &LockedPackage, cache: &Path) -> Result<bool> {
    let dest = cache.join(package.filename());
    let lock_path = PathLock::sidecar(&dest);
    let _lock = run_blocking(move || PathLock::acquire(&lock_path)).await?;

    let digest = expected_digest(package).map(|(d, a)| (d.to_string(), a));
    if dest.exists() {
        let Some((expected, algorithm)) = &digest else {
            return Ok(false);
        };
        if verify(&dest, expected, *algorithm).await.is_ok() {
            debug!("Cache hit for {}", package.filename());
            return Ok(false);
        }
        warn!("Cached {} failed verification, fetching again", package.filename());
    }

    let partial = cache.join(format!(".{}.{}.part", package.filename(), uuid::Uuid::new_v4()));
    let result = download(client, &package.url, &partial).await;
    let result = match (result, &digest) {
        (Ok(()), Some((expected, algorithm))) => verify(&partial, expected, *algorithm).await,
        (Ok(()), None) => {
            warn!("No digest for {}, accepting unverified", package.filename());
            Ok(())
        }
        (Err(e), _) => Err(e),
    };
    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(e);
    }
    tokio::fs::rename(&partial, &dest).await?;
    info!("Fetched {}", package.filename());
    Ok(true)
}

async fn verify(path: &Path, expected: &str, algorithm: HashAlgorithm) -> Result<()> {
    let path = path.to_path_buf();
    let expected = expected.to_string();
    run_blocking(move || {
        verify_file(&path, &expected, algorithm)
            .map_err(|e| Error::BuildFailure(format!("{}: {e}", path.display())))
    })
    .await
}

async fn download(client: &reqwest::Client, url: &str, dest: &Path) -> Result<()> {
    if let Some(source) = file_url_path(url) {
        tokio::fs::copy(&source, dest)
            .await
            .map_err(|e| Error::BuildFailure(format!("failed to copy {url}: {e}")))?;
        return Ok(());
    }

    let mut response = client
        .get(url)
        .send()
        .await?
        .error_for_status()
        .map_err(|e| Error::BuildFailure(format!("failed to download {url}: {e}")))?;
    let mut file = tokio::fs::File::create(dest).await?;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

fn file_url_path(url: &str) -> Option<PathBuf> {
    let parsed = url::Url::parse(url).ok()?;
    if parsed.scheme() == "file" {
        parsed.to_file_path().ok()
    } else {
        None
    }
}
