// src/build/key.rs

//! Build keys and on-disk layout
//!
//! A build key names a build's prefix directory and its blobs. Three
//! formats exist and the one used is fixed per build at insert time:
//!
//! - v1: `{sha256}-{%Y%m%d-%H%M%S-%6f}-{id}-{name}`
//! - v2: `{sha256[:8]}-{unix_ts}-{id}-{name}`
//! - v3: `{h[:16]}-{id}` with `h` the sha256 of the v2 key
//!
//! Names may contain dashes, so parsing looks at the length of the leading
//! hash segment (64, 8 or 16) and never at the number of dashes.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Longest prefix path accepted for an install
pub const MAX_PREFIX_LENGTH: usize = 255;

pub const SUPPORTED_VERSIONS: [u8; 3] = [1, 2, 3];

/// Format the key of a build
pub fn build_key(
    version: u8,
    id: i64,
    sha256: &str,
    scheduled_at: DateTime<Utc>,
    name: &str,
) -> Result<String> {
    match version {
        1 => Ok(format!(
            "{}-{}-{}-{}",
            sha256,
            scheduled_at.format("%Y%m%d-%H%M%S-%6f"),
            id,
            name
        )),
        2 => Ok(v2_key(id, sha256, scheduled_at, name)),
        3 => {
            let digest = hex::encode(Sha256::digest(v2_key(id, sha256, scheduled_at, name)));
            Ok(format!("{}-{}", &digest[..16], id))
        }
        other => Err(Error::Validation(format!("unsupported build key version {other}"))),
    }
}

fn v2_key(id: i64, sha256: &str, scheduled_at: DateTime<Utc>, name: &str) -> String {
    let short = sha256.get(..8).unwrap_or(sha256);
    format!("{}-{}-{}-{}", short, scheduled_at.timestamp(), id, name)
}

/// Recover the build id from a key of any version
pub fn parse_build_key(key: &str) -> Result<i64> {
    let invalid = || Error::Validation(format!("invalid build key {key}"));
    let (head, _) = key.split_once('-').ok_or_else(invalid)?;

    let id = match head.len() {
        // hash, date, time, micros, id, name
        64 => key.splitn(6, '-').nth(4),
        // hash, unix timestamp, id, name
        8 => key.splitn(4, '-').nth(2),
        // hash, id
        16 => key.splitn(2, '-').nth(1),
        _ => None,
    };
    id.and_then(|id| id.parse().ok()).ok_or_else(invalid)
}

/// Version of a key, from the length of its hash segment
pub fn key_version(key: &str) -> Option<u8> {
    match key.split_once('-')?.0.len() {
        64 => Some(1),
        8 => Some(2),
        16 => Some(3),
        _ => None,
    }
}

/// Install prefix of a build
pub fn build_path(store_directory: &Path, namespace: &str, key: &str, version: u8) -> PathBuf {
    if version >= 3 {
        store_directory.join(key)
    } else {
        store_directory.join(namespace).join(key)
    }
}

/// Symlink that resolves to an environment's current prefix
pub fn environment_path(store_directory: &Path, namespace: &str, environment: &str) -> PathBuf {
    store_directory.join(namespace).join("envs").join(environment)
}

/// Fail with a user-visible error when the prefix is too long to install into
pub fn check_prefix_length(path: &Path) -> Result<()> {
    let length = path.as_os_str().len();
    if length > MAX_PREFIX_LENGTH {
        return Err(Error::BuildPath(format!(
            "build path too long: {} is {} characters, must be <= {}; \
             use a shorter namespace or environment name",
            path.display(),
            length,
            MAX_PREFIX_LENGTH
        )));
    }
    Ok(())
}

/// Path as handed to OS calls
///
/// With `extended` set on Windows, absolute paths gain the `\\?\` prefix so
/// long prefixes can be created. Elsewhere the path is returned unchanged.
pub fn os_path(path: &Path, extended: bool) -> PathBuf {
    if cfg!(windows) && extended && path.is_absolute() {
        let raw = path.as_os_str().to_string_lossy();
        if !raw.starts_with(r"\\?\") {
            return PathBuf::from(format!(r"\\?\{raw}"));
        }
    }
    path.to_path_buf()
}

/// Blob keys derived from a build key
pub mod blob {
    pub fn logs(key: &str) -> String {
        format!("logs/{key}.log")
    }

    pub fn lockfile(key: &str) -> String {
        format!("lockfile/{key}.yml")
    }

    pub fn yaml(key: &str) -> String {
        format!("yaml/{key}.yml")
    }

    pub fn archive(key: &str) -> String {
        format!("archive/{key}.tar.gz")
    }

    pub fn installer(key: &str, extension: &str) -> String {
        format!("installer/{key}.{extension}")
    }
}
