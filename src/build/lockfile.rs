// src/build/lockfile.rs

//! Pinned lockfiles in the conda-lock v1 layout
//!
//! A lockfile lists one entry per (package, platform) with the exact
//! archive URL and its digests. The pipeline derives everything else from
//! it: the download set, the explicit install list and the exported YAML.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lockfile {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub metadata: LockMetadata,
    #[serde(default)]
    pub package: Vec<LockedPackage>,
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LockMetadata {
    #[serde(default)]
    pub content_hash: BTreeMap<String, String>,
    #[serde(default)]
    pub channels: Vec<LockChannel>,
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockChannel {
    pub url: String,
    #[serde(default)]
    pub used_env_vars: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockedPackage {
    pub name: String,
    pub version: String,
    /// `conda` or `pip`
    pub manager: String,
    pub platform: String,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    pub url: String,
    #[serde(default)]
    pub hash: PackageHash,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub optional: bool,
}

fn default_category() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageHash {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

const ARCHIVE_EXTENSIONS: [&str; 2] = [".conda", ".tar.bz2"];

impl LockedPackage {
    pub fn is_conda(&self) -> bool {
        self.manager == "conda"
    }

    /// Archive file name, the last URL segment
    pub fn filename(&self) -> &str {
        self.url.rsplit('/').next().unwrap_or(&self.url)
    }

    /// Build string parsed out of `{name}-{version}-{build}.{ext}`
    pub fn build_string(&self) -> Option<&str> {
        let stem = ARCHIVE_EXTENSIONS
            .iter()
            .find_map(|ext| self.filename().strip_suffix(ext))?;
        stem.strip_prefix(&format!("{}-{}-", self.name, self.version))
    }

    /// Channel URL: the archive URL without `/{subdir}/{filename}`
    pub fn channel(&self) -> Option<&str> {
        let (dir, _) = self.url.rsplit_once('/')?;
        let (channel, _) = dir.rsplit_once('/')?;
        Some(channel)
    }

    /// Subdir the archive was published under
    pub fn subdir(&self) -> Option<&str> {
        let (dir, _) = self.url.rsplit_once('/')?;
        dir.rsplit('/').next()
    }
}

impl Lockfile {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let lockfile: Lockfile = serde_yaml::from_str(text)
            .map_err(|e| Error::Validation(format!("invalid lockfile: {e}")))?;
        lockfile.check()?;
        Ok(lockfile)
    }

    /// Accept a lockfile submitted inside a specification
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let lockfile: Lockfile = serde_json::from_value(value)
            .map_err(|e| Error::Validation(format!("invalid lockfile: {e}")))?;
        lockfile.check()?;
        Ok(lockfile)
    }

    fn check(&self) -> Result<()> {
        if self.version != 1 {
            return Err(Error::Validation(format!(
                "unsupported lockfile version {}",
                self.version
            )));
        }
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Normalize a submitted lockfile: platforms and channels filled in from
    /// the package list when missing, entries sorted for a stable rendering
    pub fn normalized(mut self) -> Self {
        if self.metadata.platforms.is_empty() {
            let mut platforms: Vec<String> = self.package.iter().map(|p| p.platform.clone()).collect();
            platforms.sort();
            platforms.dedup();
            self.metadata.platforms = platforms;
        }
        if self.metadata.channels.is_empty() {
            let mut channels: Vec<String> = self
                .package
                .iter()
                .filter(|p| p.is_conda())
                .filter_map(|p| p.channel().map(str::to_string))
                .collect();
            channels.sort();
            channels.dedup();
            self.metadata.channels = channels
                .into_iter()
                .map(|url| LockChannel {
                    url,
                    used_env_vars: Vec::new(),
                })
                .collect();
        }
        self.package
            .sort_by(|a, b| (&a.platform, &a.name).cmp(&(&b.platform, &b.name)));
        self
    }

    /// Conda packages for one platform, `noarch` entries included
    pub fn conda_packages<'a>(&'a self, platform: &'a str) -> impl Iterator<Item = &'a LockedPackage> {
        self.package
            .iter()
            .filter(move |p| p.is_conda() && (p.platform == platform || p.platform == "noarch"))
    }

    pub fn pip_packages<'a>(&'a self, platform: &'a str) -> impl Iterator<Item = &'a LockedPackage> {
        self.package
            .iter()
            .filter(move |p| p.manager == "pip" && p.platform == platform)
    }

    /// The `@EXPLICIT` list handed to the installer
    pub fn explicit(&self, platform: &str) -> String {
        let mut out = String::from("@EXPLICIT\n");
        for package in self.conda_packages(platform) {
            match &package.hash.md5 {
                Some(md5) => out.push_str(&format!("{}#{}\n", package.url, md5)),
                None => out.push_str(&format!("{}\n", package.url)),
            }
        }
        out
    }

    /// Platform to install for: the host platform when locked, else the
    /// first locked one
    pub fn install_platform(&self, host: &str) -> Result<String> {
        if self.package.iter().any(|p| p.platform == host) || self.metadata.platforms.iter().any(|p| p == host) {
            return Ok(host.to_string());
        }
        self.metadata
            .platforms
            .first()
            .cloned()
            .ok_or_else(|| Error::BuildFailure("lockfile does not name any platform".into()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = r#"
version: 1
metadata:
  content_hash:
    linux-64: abc
  channels:
  - url: https://conda.anaconda.org/main
    used_env_vars: []
  platforms:
  - linux-64
  sources:
  - environment.yaml
package:
- name: zlib
  version: 1.2.13
  manager: conda
  platform: linux-64
  dependencies:
    libgcc-ng: '>=11.2.0'
  url: https://conda.anaconda.org/main/linux-64/zlib-1.2.13-h5eee18b_0.conda
  hash:
    md5: 12345678901234567890123456789012
    sha256: 0000000000000000000000000000000000000000000000000000000000000001
  category: main
  optional: false
- name: tzdata
  version: 2024a
  manager: conda
  platform: noarch
  url: https://conda.anaconda.org/main/noarch/tzdata-2024a-h04d1e81_0.tar.bz2
  hash:
    sha256: 0000000000000000000000000000000000000000000000000000000000000002
- name: requests
  version: 2.31.0
  manager: pip
  platform: linux-64
  url: https://files.pythonhosted.org/requests-2.31.0-py3-none-any.whl
  hash:
    sha256: 0000000000000000000000000000000000000000000000000000000000000003
"#;

    #[test]
    fn test_parse_and_package_views() {
        let lockfile = Lockfile::from_yaml(SAMPLE).unwrap();
        assert_eq!(lockfile.conda_packages("linux-64").count(), 2);
        assert_eq!(lockfile.pip_packages("linux-64").count(), 1);

        let zlib = &lockfile.package[0];
        assert_eq!(zlib.filename(), "zlib-1.2.13-h5eee18b_0.conda");
        assert_eq!(zlib.build_string(), Some("h5eee18b_0"));
        assert_eq!(zlib.channel(), Some("https://conda.anaconda.org/main"));
        assert_eq!(zlib.subdir(), Some("linux-64"));
        assert_eq!(lockfile.package[1].build_string(), Some("h04d1e81_0"));
    }

    #[test]
    fn test_explicit_list() {
        let lockfile = Lockfile::from_yaml(SAMPLE).unwrap();
        let explicit = lockfile.explicit("linux-64");
        let lines: Vec<&str> = explicit.lines().collect();
        assert_eq!(lines[0], "@EXPLICIT");
        assert!(lines[1].ends_with("zlib-1.2.13-h5eee18b_0.conda#12345678901234567890123456789012"));
        assert!(lines[2].ends_with("tzdata-2024a-h04d1e81_0.tar.bz2"));
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_normalize_fills_metadata() {
        let mut lockfile = Lockfile::from_yaml(SAMPLE).unwrap();
        lockfile.metadata = LockMetadata::default();
        let normalized = lockfile.normalized();
        assert_eq!(normalized.metadata.platforms, vec!["linux-64", "noarch"]);
        assert_eq!(normalized.metadata.channels[0].url, "https://conda.anaconda.org/main");
        assert_eq!(normalized.package[0].name, "requests");
        assert_eq!(normalized.install_platform("linux-64").unwrap(), "linux-64");
        assert_eq!(normalized.install_platform("osx-arm64").unwrap(), "linux-64");
    }

    #[test]
    fn test_rejects_unknown_version() {
        assert!(Lockfile::from_yaml("version: 2\npackage: []\n").is_err());
        assert!(Lockfile::from_yaml("package: [1, 2]").is_err());
    }
}
