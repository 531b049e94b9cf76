// src/build/artifacts.rs

//! Derived artifacts of a completed build
//!
//! Each export reads the build's lockfile or prefix and stores one blob:
//! a pinned environment YAML, a conda-pack style tarball of the prefix, or
//! a self-contained installer produced by `constructor`.

use super::key::blob;
use super::lockfile::Lockfile;
use super::process::run_logged;
use super::{BuildInfo, BuildLog};
use crate::context::AppContext;
use crate::db::models::{ArtifactType, BuildStatus};
use crate::error::{Error, Result};
use crate::settings::current_platform;
use crate::storage::run_blocking;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde_json::{Value, json};
use std::fs::File;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Load a build that an export may run for
///
/// Returns `None` when the build is no longer COMPLETED.
async fn completed_build(ctx: &AppContext, build_id: i64) -> Result<Option<(BuildInfo, String, BuildLog)>> {
    let info = ctx.db(move |conn| BuildInfo::load(conn, build_id)).await?;
    if info.build.status != BuildStatus::Completed {
        warn!(
            "Build {} is {}, skipping export",
            build_id, info.build.status
        );
        return Ok(None);
    }
    let key = info.build_key()?;
    let log = BuildLog::new(ctx.store.clone(), build_id, blob::logs(&key));
    Ok(Some((info, key, log)))
}

async fn load_lockfile(ctx: &AppContext, key: &str) -> Result<Lockfile> {
    let bytes = ctx.store.get(&blob::lockfile(key)).await?;
    let text = String::from_utf8(bytes)
        .map_err(|e| Error::Serialization(format!("lockfile is not UTF-8: {e}")))?;
    Lockfile::from_yaml(&text)
}

/// Environment file pinning every locked package
#[derive(Debug, Serialize)]
struct PinnedEnvironment {
    name: String,
    channels: Vec<String>,
    dependencies: Vec<Value>,
}

fn pinned_environment(name: &str, lockfile: &Lockfile, platform: &str) -> PinnedEnvironment {
    let mut dependencies: Vec<Value> = lockfile
        .conda_packages(platform)
        .map(|p| match p.build_string() {
            Some(build) => json!(format!("{}={}={}", p.name, p.version, build)),
            None => json!(format!("{}={}", p.name, p.version)),
        })
        .collect();
    let pip: Vec<String> = lockfile
        .pip_packages(platform)
        .map(|p| format!("{}=={}", p.name, p.version))
        .collect();
    if !pip.is_empty() {
        dependencies.push(json!({ "pip": pip }));
    }
    PinnedEnvironment {
        name: name.to_string(),
        channels: lockfile.metadata.channels.iter().map(|c| c.url.clone()).collect(),
        dependencies,
    }
}

/// conda-env-export: YAML artifact
pub async fn export_yaml(ctx: &AppContext, build_id: i64) -> Result<()> {
    let Some((info, key, log)) = completed_build(ctx, build_id).await? else {
        return Ok(());
    };
    let lockfile = load_lockfile(ctx, &key).await?;
    let platform = lockfile.install_platform(current_platform())?;
    let document = pinned_environment(&info.environment.name, &lockfile, &platform);
    let yaml = serde_yaml::to_string(&document)?;

    ctx.store
        .put(build_id, &blob::yaml(&key), yaml.as_bytes(), "text/yaml", ArtifactType::Yaml)
        .await?;
    log.append("Exported environment YAML").await?;
    info!("Exported YAML for build {}", build_id);
    Ok(())
}

/// conda-pack: gzipped tarball of the prefix
pub async fn conda_pack(ctx: &AppContext, build_id: i64, cancel: CancellationToken) -> Result<()> {
    let Some((info, key, log)) = completed_build(ctx, build_id).await? else {
        return Ok(());
    };
    let prefix = info.build_path(ctx.store_directory())?;
    let scratch = TempDir::new()?;
    let archive = scratch.path().join("environment.tar.gz");

    log.append(&format!("Packing {}", prefix.display())).await?;
    let (source, dest) = (prefix.clone(), archive.clone());
    run_blocking(move || pack_prefix(&source, &dest)).await?;
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    ctx.store
        .put_file(
            build_id,
            &blob::archive(&key),
            &archive,
            "application/gzip",
            ArtifactType::CondaPack,
        )
        .await?;
    log.append("Stored conda-pack archive").await?;
    Ok(())
}

/// Write `prefix` as a tar.gz with paths relative to the prefix root
pub fn pack_prefix(prefix: &Path, dest: &Path) -> Result<()> {
    if !prefix.is_dir() {
        return Err(Error::NotFound(format!("prefix {}", prefix.display())));
    }
    let file = File::create(dest)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);
    builder.append_dir_all(".", prefix)?;
    builder.into_inner()?.finish()?.sync_all()?;
    Ok(())
}

/// installer: constructor output for the build's platform
pub async fn build_installer(ctx: &AppContext, build_id: i64, cancel: CancellationToken) -> Result<()> {
    let Some((info, key, log)) = completed_build(ctx, build_id).await? else {
        return Ok(());
    };
    let lockfile = load_lockfile(ctx, &key).await?;
    let platform = lockfile.install_platform(current_platform())?;
    let extension = installer_extension(&platform);

    let scratch = TempDir::new()?;
    let output = scratch.path().join("out");
    tokio::fs::create_dir_all(&output).await?;
    let construct = construct_yaml(&info.environment.name, build_id, &lockfile, &platform, extension);
    tokio::fs::write(scratch.path().join("construct.yaml"), serde_yaml::to_string(&construct)?).await?;

    let mut command = Command::new(&ctx.config.worker.constructor_command);
    command
        .current_dir(scratch.path())
        .arg("--output-dir")
        .arg(&output)
        .arg("--platform")
        .arg(&platform)
        .arg(".");
    run_logged(command, "constructor", &log, &cancel).await?;

    let produced = find_with_extension(&output, extension)
        .await?
        .ok_or_else(|| Error::BuildFailure(format!("constructor produced no .{extension} file")))?;
    ctx.store
        .put_file(
            build_id,
            &blob::installer(&key, extension),
            &produced,
            "application/octet-stream",
            ArtifactType::Installer,
        )
        .await?;
    log.append(&format!("Stored installer {}", produced.display())).await?;
    Ok(())
}

fn installer_extension(platform: &str) -> &'static str {
    if platform.starts_with("win-") { "exe" } else { "sh" }
}

fn construct_yaml(name: &str, build_id: i64, lockfile: &Lockfile, platform: &str, extension: &str) -> Value {
    let specs: Vec<String> = lockfile
        .conda_packages(platform)
        .map(|p| match p.build_string() {
            Some(build) => format!("{} {} {}", p.name, p.version, build),
            None => format!("{} {}", p.name, p.version),
        })
        .collect();
    json!({
        "name": name,
        "version": build_id.to_string(),
        "installer_type": extension,
        "channels": lockfile.metadata.channels.iter().map(|c| c.url.clone()).collect::<Vec<_>>(),
        "specs": specs,
    })
}

async fn find_with_extension(dir: &Path, extension: &str) -> Result<Option<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == extension) {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::lockfile::tests::SAMPLE;

    #[test]
    fn test_pinned_environment_lists_exact_builds() {
        let lockfile = Lockfile::from_yaml(SAMPLE).unwrap().normalized();
        let platform = lockfile.metadata.platforms[0].clone();
        let document = pinned_environment("test", &lockfile, &platform);
        assert_eq!(document.name, "test");
        assert!(!document.channels.is_empty());
        assert!(
            document
                .dependencies
                .iter()
                .filter_map(|d| d.as_str())
                .all(|d| d.split('=').count() >= 2)
        );
    }

    #[test]
    fn test_pack_prefix_roundtrip_listing() {
        let temp = TempDir::new().unwrap();
        let prefix = temp.path().join("prefix");
        std::fs::create_dir_all(prefix.join("bin")).unwrap();
        std::fs::write(prefix.join("bin").join("python"), b"#!").unwrap();
        let dest = temp.path().join("env.tar.gz");

        pack_prefix(&prefix, &dest).unwrap();

        let decoder = flate2::read::GzDecoder::new(File::open(&dest).unwrap());
        let mut archive = tar::Archive::new(decoder);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n.ends_with("bin/python")));
    }

    #[test]
    fn test_pack_missing_prefix() {
        let temp = TempDir::new().unwrap();
        let result = pack_prefix(&temp.path().join("missing"), &temp.path().join("x.tar.gz"));
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_installer_extension() {
        assert_eq!(installer_extension("win-64"), "exe");
        assert_eq!(installer_extension("linux-64"), "sh");
    }
}
