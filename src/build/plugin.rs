// src/build/plugin.rs

//! Lockfile solver seam
//!
//! The pipeline never solves dependencies itself. It hands the
//! specification and target platforms to a [`LockPlugin`] and gets a
//! pinned [`Lockfile`] back. The built-in [`CondaLockPlugin`] drives the
//! external `conda-lock` binary; tests plug in fakes.

use super::BuildLog;
use super::lockfile::Lockfile;
use super::process::run_logged;
use crate::environment::spec::CondaSpecification;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Environment variables forwarded from the worker to the solver
pub const FORWARDED_ENV: &[&str] = &["CONDA_OVERRIDE_CUDA"];

/// Everything a plugin may use besides the specification
#[derive(Clone)]
pub struct LockContext {
    pub log: BuildLog,
    /// Extra environment for subprocesses
    pub env: BTreeMap<String, String>,
    pub cancel: CancellationToken,
    /// Scratch directory owned by the caller
    pub work_dir: PathBuf,
    /// `conda_command` setting (mamba, conda, micromamba)
    pub conda_command: String,
}

impl LockContext {
    /// Environment forwarded from the current process
    pub fn forwarded_env() -> BTreeMap<String, String> {
        FORWARDED_ENV
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|v| (name.to_string(), v)))
            .collect()
    }
}

#[async_trait]
pub trait LockPlugin: Send + Sync {
    fn name(&self) -> &str;

    async fn lock(
        &self,
        spec: &CondaSpecification,
        platforms: &[String],
        ctx: &LockContext,
    ) -> Result<Lockfile>;
}

/// Runs `conda-lock lock` in the scratch directory
pub struct CondaLockPlugin {
    command: String,
}

impl CondaLockPlugin {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl LockPlugin for CondaLockPlugin {
    fn name(&self) -> &str {
        "conda-lock"
    }

    async fn lock(
        &self,
        spec: &CondaSpecification,
        platforms: &[String],
        ctx: &LockContext,
    ) -> Result<Lockfile> {
        let environment_file = ctx.work_dir.join("environment.yaml");
        let lockfile_path = ctx.work_dir.join("conda-lock.yaml");
        tokio::fs::write(&environment_file, serde_yaml::to_string(spec)?).await?;

        let mut command = Command::new(&self.command);
        command
            .current_dir(&ctx.work_dir)
            .arg("lock")
            .arg("--conda")
            .arg(&ctx.conda_command)
            .arg("--file")
            .arg(&environment_file)
            .arg("--lockfile")
            .arg(&lockfile_path)
            .envs(&ctx.env);
        for platform in platforms {
            command.arg("--platform").arg(platform);
        }

        info!("Solving {} for {:?}", spec.name, platforms);
        ctx.log
            .append(&format!("Solving {} for platforms {}", spec.name, platforms.join(", ")))
            .await?;
        run_logged(command, "conda-lock", &ctx.log, &ctx.cancel).await?;

        let text = tokio::fs::read_to_string(&lockfile_path)
            .await
            .map_err(|e| Error::BuildFailure(format!("conda-lock produced no lockfile: {e}")))?;
        Lockfile::from_yaml(&text)
    }
}
