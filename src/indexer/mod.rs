// src/indexer/mod.rs

//! Channel indexer
//!
//! Mirrors the package metadata of the indexed channels into the
//! `conda_package` / `conda_package_build` tables. Each run only inserts
//! what is new: packages are diffed on (channel, name, version) and package
//! builds on sha256 within a (channel, subdir). Two indexers racing on one
//! channel collide on the unique constraints; the loser backs off and
//! retries.

pub mod client;
pub mod repodata;

pub use client::{ChannelClient, Fetched};
pub use repodata::{ChannelData, PackageBuildRow, Repodata};

use crate::context::AppContext;
use crate::db;
use crate::db::models::{CondaChannel, CondaPackageBuild};
use crate::environment::spec::normalize_channel;
use crate::error::{Error, Result};
use crate::storage::run_blocking;
use rand::Rng;
use rusqlite::{Connection, params, params_from_iter};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Rows per package-build insert batch; the parent lookup ORs one term per
/// row and must stay below SQLite's expression depth limit
pub const BATCH_SIZE: usize = 990;

/// Attempts per channel when inserts keep colliding
const MAX_ATTEMPTS: u32 = 3;

/// Counts of rows inserted by one ingest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub packages: usize,
    pub builds: usize,
}

impl IngestStats {
    fn add(&mut self, other: IngestStats) {
        self.packages += other.packages;
        self.builds += other.builds;
    }
}

/// Back-off before retry `attempt` (1-based): 15-30 s of jitter, doubled
/// per attempt
pub fn retry_delay(attempt: u32) -> Duration {
    let jitter = rand::thread_rng().gen_range(15..=30);
    Duration::from_secs(jitter << attempt.min(6))
}

/// update-channels: index every channel in `conda_indexed_channels`
pub async fn update_channels(ctx: &AppContext) -> Result<()> {
    let settings = ctx.settings(None, None).await?;
    let client = ChannelClient::new(ctx.http.clone());

    let mut failed = Vec::new();
    for channel in &settings.conda_indexed_channels {
        let url = normalize_channel(channel, &settings.conda_channel_alias);
        match update_channel_with_retry(ctx, &client, &url, &settings.conda_platforms).await {
            Ok(stats) => info!(
                "Indexed {}: {} new package(s), {} new build(s)",
                url, stats.packages, stats.builds
            ),
            Err(e) => {
                warn!("Failed to index {}: {}", url, e);
                failed.push(url);
            }
        }
    }
    if failed.is_empty() {
        Ok(())
    } else {
        Err(Error::Http(format!("failed to index {}", failed.join(", "))))
    }
}

async fn update_channel_with_retry(
    ctx: &AppContext,
    client: &ChannelClient,
    url: &str,
    subdirs: &[String],
) -> Result<IngestStats> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match update_channel(ctx, client, url, subdirs).await {
            Err(Error::Transient(message)) if attempt < MAX_ATTEMPTS => {
                let delay = retry_delay(attempt);
                warn!(
                    "Indexing {} collided ({}), retrying in {}s",
                    url,
                    message,
                    delay.as_secs()
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

/// Index one channel over `subdirs`
///
/// Requests are conditional on the channel's last update, except for
/// subdirs with no package builds yet: those are fetched in full so a
/// platform added after the first run is still indexed. When every subdir
/// is already indexed, an unchanged `channeldata.json` (304) leaves the
/// channel alone.
pub async fn update_channel(
    ctx: &AppContext,
    client: &ChannelClient,
    url: &str,
    subdirs: &[String],
) -> Result<IngestStats> {
    let name = url.to_string();
    let channel = ctx.db(move |conn| CondaChannel::ensure(conn, &name)).await?;
    let channel_id = channel
        .id
        .ok_or_else(|| Error::NotFound(format!("channel {url}")))?;

    let wanted = subdirs.to_vec();
    let unindexed: HashSet<String> = ctx
        .db(move |conn| {
            let mut unindexed = HashSet::new();
            for subdir in wanted {
                if !subdir_indexed(conn, channel_id, &subdir)? {
                    unindexed.insert(subdir);
                }
            }
            Ok(unindexed)
        })
        .await?;

    let channeldata_url = format!("{url}/channeldata.json");
    let mut fetched = client.fetch(&channeldata_url, channel.last_update).await?;
    if matches!(fetched, Fetched::NotModified) {
        if unindexed.is_empty() {
            debug!("Channel {} unchanged since last update", url);
            return Ok(IngestStats::default());
        }
        debug!("Channel {} unchanged, indexing new subdir(s) {:?}", url, unindexed);
        fetched = client.fetch(&channeldata_url, None).await?;
    }
    let channeldata = match fetched {
        Fetched::Body(bytes) => serde_json::from_slice(&bytes)?,
        Fetched::NotModified | Fetched::Missing => ChannelData::default(),
    };
    let channeldata = Arc::new(channeldata);
    let started = db::now();

    let mut stats = IngestStats::default();
    for subdir in subdirs {
        let repodata_url = format!("{url}/{subdir}/repodata.json.bz2");
        let since = if unindexed.contains(subdir) {
            None
        } else {
            channel.last_update
        };
        let bytes = match client.fetch(&repodata_url, since).await? {
            Fetched::Body(bytes) => bytes,
            Fetched::NotModified | Fetched::Missing => continue,
        };
        let owned_subdir = subdir.clone();
        let rows = run_blocking(move || Ok(Repodata::from_bz2(&bytes)?.rows(&owned_subdir))).await?;

        let owned_subdir = subdir.clone();
        let channeldata = channeldata.clone();
        let subdir_stats = ctx
            .db(move |conn| ingest_rows(conn, channel_id, &owned_subdir, rows, &channeldata))
            .await?;
        debug!(
            "{}/{}: {} package(s), {} build(s) inserted",
            url, subdir, subdir_stats.packages, subdir_stats.builds
        );
        stats.add(subdir_stats);
    }

    ctx.db(move |conn| CondaChannel::set_last_update(conn, channel_id, started))
        .await?;
    Ok(stats)
}

/// Insert the packages and package builds of a parsed repodata payload
pub fn ingest_repodata(
    conn: &mut Connection,
    channel_id: i64,
    subdir: &str,
    repodata: Repodata,
    channeldata: &ChannelData,
) -> Result<IngestStats> {
    let rows = repodata.rows(subdir);
    ingest_rows(conn, channel_id, subdir, rows, channeldata)
}

fn ingest_rows(
    conn: &mut Connection,
    channel_id: i64,
    subdir: &str,
    rows: Vec<PackageBuildRow>,
    channeldata: &ChannelData,
) -> Result<IngestStats> {
    let packages = insert_packages(conn, channel_id, &rows, channeldata)?;

    let existing = existing_sha256(conn, channel_id, subdir)?;
    let new_rows: Vec<PackageBuildRow> = rows
        .into_iter()
        .filter(|row| !existing.contains(&row.sha256))
        .collect();

    let mut builds = 0;
    for batch in new_rows.chunks(BATCH_SIZE) {
        builds += db::transaction(conn, |tx| insert_build_batch(tx, channel_id, batch))?;
    }
    Ok(IngestStats { packages, builds })
}

fn transient(error: Error) -> Error {
    if error.is_unique_violation() {
        Error::Transient(error.to_string())
    } else {
        error
    }
}

/// Insert the (name, version) pairs the channel does not have yet
fn insert_packages(
    conn: &mut Connection,
    channel_id: i64,
    rows: &[PackageBuildRow],
    channeldata: &ChannelData,
) -> Result<usize> {
    let existing: HashSet<(String, String)> = {
        let mut stmt = conn.prepare("SELECT name, version FROM conda_package WHERE channel_id = ?1")?;
        stmt.query_map([channel_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?
    };

    let mut wanted: HashMap<(String, String), Option<String>> = HashMap::new();
    for row in rows {
        let key = (row.name.clone(), row.version.clone());
        if !existing.contains(&key) {
            wanted.entry(key).or_insert_with(|| row.license.clone());
        }
    }
    if wanted.is_empty() {
        return Ok(0);
    }

    db::transaction(conn, |tx| {
        let mut stmt = tx.prepare(
            "INSERT INTO conda_package (channel_id, name, version, license, summary, description)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for ((name, version), license) in &wanted {
            let meta = channeldata.packages.get(name);
            let license = license
                .clone()
                .or_else(|| meta.and_then(|m| m.license.clone()));
            stmt.execute(params![
                channel_id,
                name,
                version,
                license,
                meta.and_then(|m| m.summary.clone()),
                meta.and_then(|m| m.description.clone()),
            ])
            .map_err(|e| transient(e.into()))?;
        }
        Ok(wanted.len())
    })
}

/// Whether any package build of `subdir` has been indexed for the channel
fn subdir_indexed(conn: &Connection, channel_id: i64, subdir: &str) -> Result<bool> {
    let indexed = conn.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM conda_package_build pb
            JOIN conda_package p ON p.id = pb.package_id
            WHERE p.channel_id = ?1 AND pb.subdir = ?2)",
        params![channel_id, subdir],
        |row| row.get(0),
    )?;
    Ok(indexed)
}

fn existing_sha256(conn: &Connection, channel_id: i64, subdir: &str) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare(
        "SELECT pb.sha256 FROM conda_package_build pb
         JOIN conda_package p ON p.id = pb.package_id
         WHERE p.channel_id = ?1 AND pb.subdir = ?2",
    )?;
    let shas = stmt
        .query_map(params![channel_id, subdir], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    Ok(shas)
}

/// Look up the parents of one batch and insert its builds
fn insert_build_batch(conn: &Connection, channel_id: i64, batch: &[PackageBuildRow]) -> Result<usize> {
    let keys: Vec<(&str, &str)> = {
        let mut seen = HashSet::new();
        batch
            .iter()
            .map(|row| (row.name.as_str(), row.version.as_str()))
            .filter(|key| seen.insert(*key))
            .collect()
    };
    let clause = vec!["(name = ? AND version = ?)"; keys.len()].join(" OR ");
    let sql = format!("SELECT id, name, version FROM conda_package WHERE channel_id = ? AND ({clause})");
    let mut values: Vec<rusqlite::types::Value> = vec![channel_id.into()];
    for (name, version) in &keys {
        values.push(name.to_string().into());
        values.push(version.to_string().into());
    }

    let parents: HashMap<(String, String), i64> = {
        let mut stmt = conn.prepare(&sql)?;
        stmt.query_map(params_from_iter(values), |row| {
            Ok(((row.get(1)?, row.get(2)?), row.get(0)?))
        })?
        .collect::<rusqlite::Result<_>>()?
    };

    let mut stmt = conn.prepare(
        "INSERT INTO conda_package_build
            (package_id, build, build_number, subdir, sha256, md5, size, depends, constrains, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )?;
    let mut inserted = 0;
    for row in batch {
        let Some(package_id) = parents.get(&(row.name.clone(), row.version.clone())) else {
            warn!("No package row for {}-{}, skipping build {}", row.name, row.version, row.sha256);
            continue;
        };
        stmt.execute(params![
            package_id,
            &row.build,
            row.build_number,
            &row.subdir,
            &row.sha256,
            &row.md5,
            row.size,
            CondaPackageBuild::encode_list(&row.depends),
            CondaPackageBuild::encode_list(&row.constrains),
            row.timestamp,
        ])
        .map_err(|e| transient(e.into()))?;
        inserted += 1;
    }
    Ok(inserted)
}
