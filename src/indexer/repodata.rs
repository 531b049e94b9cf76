// src/indexer/repodata.rs

//! Channel metadata documents
//!
//! `channeldata.json` carries per-package descriptions; each subdir's
//! `repodata.json` lists every package build. Entries are parsed leniently
//! and filtered afterwards, so one malformed record never rejects a whole
//! channel.

use crate::error::{Error, Result};
use bzip2::read::BzDecoder;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::io::Read;

/// `channeldata.json`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelData {
    #[serde(default)]
    pub packages: BTreeMap<String, ChannelPackage>,
    #[serde(default)]
    pub subdirs: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelPackage {
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// `repodata.json` of one subdir
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Repodata {
    #[serde(default)]
    pub info: Option<RepodataInfo>,
    #[serde(default)]
    pub packages: BTreeMap<String, RawPackageBuild>,
    #[serde(default, rename = "packages.conda")]
    pub packages_conda: BTreeMap<String, RawPackageBuild>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepodataInfo {
    #[serde(default)]
    pub subdir: Option<String>,
}

/// A repodata record as published; any field may be missing or null
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPackageBuild {
    pub name: Option<String>,
    pub version: Option<String>,
    pub build: Option<String>,
    pub build_number: Option<i64>,
    pub depends: Option<Vec<String>>,
    #[serde(default)]
    pub constrains: Option<Vec<String>>,
    pub md5: Option<String>,
    pub sha256: Option<String>,
    pub size: Option<i64>,
    #[serde(default)]
    pub subdir: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub license: Option<String>,
}

/// A record with every required field present
#[derive(Debug, Clone, PartialEq)]
pub struct PackageBuildRow {
    pub name: String,
    pub version: String,
    pub build: String,
    pub build_number: i64,
    pub subdir: String,
    pub sha256: String,
    pub md5: String,
    pub size: i64,
    pub depends: Vec<String>,
    pub constrains: Vec<String>,
    pub timestamp: Option<i64>,
    pub license: Option<String>,
}

impl RawPackageBuild {
    fn into_row(self, default_subdir: &str) -> Option<PackageBuildRow> {
        Some(PackageBuildRow {
            name: self.name?,
            version: self.version?,
            build: self.build?,
            build_number: self.build_number?,
            subdir: self.subdir.unwrap_or_else(|| default_subdir.to_string()),
            sha256: self.sha256?,
            md5: self.md5?,
            size: self.size?,
            depends: self.depends?,
            constrains: self.constrains.unwrap_or_default(),
            timestamp: self.timestamp,
            license: self.license,
        })
    }
}

impl Repodata {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Parse a `repodata.json.bz2` payload
    pub fn from_bz2(bytes: &[u8]) -> Result<Self> {
        let mut json = Vec::new();
        BzDecoder::new(bytes)
            .read_to_end(&mut json)
            .map_err(|e| Error::Serialization(format!("cannot decompress repodata: {e}")))?;
        Self::from_slice(&json)
    }

    /// Usable package builds, one per sha256
    ///
    /// Records missing a required field are dropped. `.tar.bz2` entries are
    /// read before `.conda` entries and a later record replaces an earlier
    /// one with the same sha256.
    pub fn rows(self, subdir: &str) -> Vec<PackageBuildRow> {
        let subdir = self
            .info
            .and_then(|info| info.subdir)
            .unwrap_or_else(|| subdir.to_string());
        let mut dropped = 0;
        let mut by_sha: HashMap<String, PackageBuildRow> = HashMap::new();
        for raw in self.packages.into_values().chain(self.packages_conda.into_values()) {
            match raw.into_row(&subdir) {
                Some(row) => {
                    by_sha.insert(row.sha256.clone(), row);
                }
                None => dropped += 1,
            }
        }
        if dropped > 0 {
            tracing::debug!("Dropped {} incomplete record(s) from {}", dropped, subdir);
        }
        let mut rows: Vec<PackageBuildRow> = by_sha.into_values().collect();
        rows.sort_by(|a, b| a.sha256.cmp(&b.sha256));
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bzip2::Compression;
    use bzip2::write::BzEncoder;
    use std::io::Write;

    const REPODATA: &str = r#"{
        "info": {"subdir": "linux-64"},
        "packages": {
            "zlib-1.2.13-h0_0.tar.bz2": {
                "name": "zlib", "version": "1.2.13", "build": "h0_0", "build_number": 0,
                "depends": [], "md5": "m1", "sha256": "s1", "size": 10
            },
            "broken-1.0-h0_0.tar.bz2": {
                "name": "broken", "version": "1.0", "build": "h0_0", "build_number": 0,
                "depends": ["zlib"], "md5": null, "sha256": "s2", "size": 10
            }
        },
        "packages.conda": {
            "zlib-1.2.13-h0_0.conda": {
                "name": "zlib", "version": "1.2.13", "build": "h0_0", "build_number": 0,
                "depends": ["libgcc"], "md5": "m1", "sha256": "s1", "size": 12
            },
            "xz-5.4-h1_1.conda": {
                "name": "xz", "version": "5.4", "build": "h1_1", "build_number": 1,
                "depends": [], "constrains": ["zlib <2"], "md5": "m3", "sha256": "s3", "size": 5,
                "timestamp": 1700000000000
            }
        }
    }"#;

    #[test]
    fn test_rows_filter_and_dedupe() {
        let rows = Repodata::from_slice(REPODATA.as_bytes()).unwrap().rows("noarch");
        assert_eq!(rows.len(), 2);

        let zlib = &rows[0];
        assert_eq!(zlib.sha256, "s1");
        // the .conda record wins
        assert_eq!(zlib.size, 12);
        assert_eq!(zlib.depends, vec!["libgcc".to_string()]);
        assert_eq!(zlib.subdir, "linux-64");

        let xz = &rows[1];
        assert_eq!(xz.constrains, vec!["zlib <2".to_string()]);
        assert_eq!(xz.timestamp, Some(1_700_000_000_000));
    }

    #[test]
    fn test_from_bz2() {
        let mut encoder = BzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(REPODATA.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();

        let repodata = Repodata::from_bz2(&compressed).unwrap();
        assert_eq!(repodata.packages.len(), 2);
        assert!(Repodata::from_bz2(b"not bzip2").is_err());
    }

    #[test]
    fn test_channeldata_ignores_unknown_fields() {
        let data: ChannelData = serde_json::from_str(
            r#"{"channeldata_version": 1, "subdirs": ["noarch"],
                "packages": {"zlib": {"license": "Zlib", "summary": "compression", "home": "x"}}}"#,
        )
        .unwrap();
        assert_eq!(data.packages["zlib"].license.as_deref(), Some("Zlib"));
        assert_eq!(data.subdirs, vec!["noarch".to_string()]);
    }
}
