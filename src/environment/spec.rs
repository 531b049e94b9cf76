// src/environment/spec.rs

//! Submitted environment specifications
//!
//! A submission is either a solvable conda environment description or a
//! fully pinned lockfile. Both are stored as JSON in the `specification`
//! table and identified by the SHA-256 of their canonical rendering.

use crate::build::lockfile::Lockfile;
use crate::error::{Error, Result};
use crate::hash;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Characters allowed in namespace and environment names besides ASCII
/// letters and digits
pub const NAME_PUNCTUATION: &str = "-+_@$&?^~.=";

/// Check a namespace or environment name
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || NAME_PUNCTUATION.contains(c));
    if ok {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "invalid {kind} name {name:?}: must match [A-Za-z0-9{NAME_PUNCTUATION}]+"
        )))
    }
}

/// One entry of `dependencies`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dependency {
    Conda(String),
    Pip { pip: Vec<String> },
}

/// A solvable conda environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CondaSpecification {
    pub name: String,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl CondaSpecification {
    pub fn conda_dependencies(&self) -> impl Iterator<Item = &str> {
        self.dependencies.iter().filter_map(|d| match d {
            Dependency::Conda(spec) => Some(spec.as_str()),
            Dependency::Pip { .. } => None,
        })
    }

    pub fn pip_dependencies(&self) -> impl Iterator<Item = &str> {
        self.dependencies
            .iter()
            .filter_map(|d| match d {
                Dependency::Pip { pip } => Some(pip.iter().map(String::as_str)),
                Dependency::Conda(_) => None,
            })
            .flatten()
    }

    /// Package names referenced by conda matchspecs
    pub fn conda_package_names(&self) -> Vec<String> {
        self.conda_dependencies().map(conda_package_name).collect()
    }

    /// Normalized package names referenced by pip requirements
    pub fn pip_package_names(&self) -> Vec<String> {
        self.pip_dependencies().map(pip_package_name).collect()
    }

    pub fn add_conda(&mut self, spec: &str) {
        self.dependencies.push(Dependency::Conda(spec.to_string()));
    }

    /// Append to the existing `pip:` entry, creating it if absent
    pub fn add_pip(&mut self, requirement: &str) {
        for dependency in &mut self.dependencies {
            if let Dependency::Pip { pip } = dependency {
                pip.push(requirement.to_string());
                return;
            }
        }
        self.dependencies.push(Dependency::Pip {
            pip: vec![requirement.to_string()],
        });
    }

    /// Whether the specification pulls `pip` in (needed for pip entries)
    pub fn has_pip_entries(&self) -> bool {
        self.pip_dependencies().next().is_some()
    }
}

/// A fully pinned submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockfileSpecification {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub lockfile: Lockfile,
}

/// Either kind of submission
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    Conda(CondaSpecification),
    Lockfile(LockfileSpecification),
}

impl Submission {
    /// Parse a YAML (or JSON) document; a top-level `lockfile` key selects
    /// the lockfile form
    pub fn from_yaml(text: &str) -> Result<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(text)
            .map_err(|e| Error::Validation(format!("unable to parse specification: {e}")))?;
        let value: Value = serde_json::to_value(value)
            .map_err(|e| Error::Validation(format!("unable to parse specification: {e}")))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(Error::Validation("specification must be a mapping".into()));
        }
        let submission = if value.get("lockfile").is_some() {
            let mut spec: LockfileSpecification = serde_json::from_value(value)
                .map_err(|e| Error::Validation(format!("invalid lockfile specification: {e}")))?;
            spec.lockfile = spec.lockfile.normalized();
            Submission::Lockfile(spec)
        } else {
            Submission::Conda(
                serde_json::from_value(value)
                    .map_err(|e| Error::Validation(format!("invalid specification: {e}")))?,
            )
        };
        validate_name("environment", submission.name())?;
        Ok(submission)
    }

    pub fn name(&self) -> &str {
        match self {
            Submission::Conda(spec) => &spec.name,
            Submission::Lockfile(spec) => &spec.name,
        }
    }

    pub fn description(&self) -> Option<&str> {
        match self {
            Submission::Conda(spec) => spec.description.as_deref(),
            Submission::Lockfile(spec) => spec.description.as_deref(),
        }
    }

    pub fn is_lockfile(&self) -> bool {
        matches!(self, Submission::Lockfile(_))
    }

    /// JSON stored in the `specification` row
    pub fn to_value(&self) -> Result<Value> {
        Ok(match self {
            Submission::Conda(spec) => serde_json::to_value(spec)?,
            Submission::Lockfile(spec) => serde_json::to_value(spec)?,
        })
    }

    /// Identity of the stored JSON
    pub fn sha256(&self) -> Result<String> {
        Ok(hash::canonical_sha256(&self.to_value()?))
    }
}

/// Package name of a conda matchspec (`conda-forge::numpy>=1.20` -> `numpy`)
pub fn conda_package_name(spec: &str) -> String {
    let spec = spec.trim();
    let spec = spec.rsplit_once("::").map(|(_, s)| s).unwrap_or(spec);
    let end = spec
        .find(|c: char| "<>=!~ [".contains(c))
        .unwrap_or(spec.len());
    spec[..end].trim().to_string()
}

/// Normalized distribution name of a pip requirement
pub fn pip_package_name(requirement: &str) -> String {
    let requirement = requirement.trim();
    let end = requirement
        .find(|c: char| "<>=!~ [;@".contains(c))
        .unwrap_or(requirement.len());
    requirement[..end].trim().to_lowercase().replace('_', "-")
}

/// Expand a channel name under the alias; URLs are kept as given
pub fn normalize_channel(channel: &str, alias: &str) -> String {
    if channel.starts_with("http://") || channel.starts_with("https://") || channel.starts_with("file://") {
        channel.trim_end_matches('/').to_string()
    } else {
        format!("{}/{}", alias.trim_end_matches('/'), channel.trim_matches('/'))
    }
}
