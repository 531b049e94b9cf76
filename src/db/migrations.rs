// src/db/migrations.rs
//! Database migration implementations
//!
//! Each function upgrades the schema by exactly one version and runs inside
//! the transaction opened by `schema::migrate_to`.

use crate::error::Result;
use rusqlite::Connection;
use tracing::{debug, info};

/// Initial schema - Version 1
///
/// Historical shape: every `conda_package` row describes a single package
/// build and builds link to it through `build_conda_package`.
pub fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Creating schema version 1");

    conn.execute_batch(
        "
        CREATE TABLE namespace (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            metadata TEXT NOT NULL DEFAULT '{}',
            deleted_at TEXT
        );

        CREATE TABLE specification (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            spec TEXT NOT NULL,
            sha256 TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL,
            is_lockfile INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE environment (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            namespace_id INTEGER NOT NULL REFERENCES namespace(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            specification_id INTEGER REFERENCES specification(id),
            current_build_id INTEGER REFERENCES build(id) ON DELETE SET NULL,
            description TEXT NOT NULL DEFAULT '',
            deleted_at TEXT,
            UNIQUE(namespace_id, name)
        );

        CREATE TABLE build (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            specification_id INTEGER NOT NULL REFERENCES specification(id),
            environment_id INTEGER NOT NULL REFERENCES environment(id) ON DELETE CASCADE,
            status TEXT NOT NULL CHECK(status IN
                ('QUEUED', 'BUILDING', 'COMPLETED', 'FAILED', 'CANCELED', 'DELETED')),
            status_info TEXT,
            size INTEGER NOT NULL DEFAULT 0,
            scheduled_at TEXT NOT NULL,
            started_at TEXT,
            ended_at TEXT,
            deleted_at TEXT,
            build_key_version INTEGER NOT NULL DEFAULT 2 CHECK(build_key_version IN (1, 2, 3))
        );

        CREATE INDEX idx_build_status ON build(status);
        CREATE INDEX idx_build_environment ON build(environment_id);

        CREATE TABLE build_artifact (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            build_id INTEGER NOT NULL REFERENCES build(id) ON DELETE CASCADE,
            artifact_type TEXT NOT NULL CHECK(artifact_type IN
                ('DIRECTORY', 'LOCKFILE', 'LOGS', 'YAML', 'CONDA_PACK', 'CONTAINER_MANIFEST',
                 'CONTAINER_BLOB', 'CONTAINER_REGISTRY', 'INSTALLER')),
            key TEXT NOT NULL,
            UNIQUE(build_id, artifact_type, key)
        );

        CREATE INDEX idx_build_artifact_build ON build_artifact(build_id);

        CREATE TABLE conda_channel (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            last_update TEXT
        );

        CREATE TABLE conda_package (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            channel_id INTEGER NOT NULL REFERENCES conda_channel(id),
            name TEXT NOT NULL,
            version TEXT NOT NULL,
            build TEXT NOT NULL,
            build_number INTEGER NOT NULL,
            subdir TEXT,
            sha256 TEXT NOT NULL,
            md5 TEXT NOT NULL,
            size INTEGER NOT NULL,
            depends TEXT NOT NULL,
            constrains TEXT NOT NULL DEFAULT '',
            timestamp INTEGER,
            license TEXT,
            summary TEXT,
            description TEXT
        );

        CREATE TABLE build_conda_package (
            build_id INTEGER NOT NULL REFERENCES build(id) ON DELETE CASCADE,
            conda_package_id INTEGER NOT NULL REFERENCES conda_package(id) ON DELETE CASCADE,
            PRIMARY KEY (build_id, conda_package_id)
        );

        CREATE TABLE solve (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            specification_id INTEGER NOT NULL REFERENCES specification(id),
            scheduled_at TEXT NOT NULL,
            started_at TEXT,
            ended_at TEXT
        );

        CREATE TABLE solve_conda_package (
            solve_id INTEGER NOT NULL REFERENCES solve(id) ON DELETE CASCADE,
            conda_package_id INTEGER NOT NULL REFERENCES conda_package(id) ON DELETE CASCADE,
            PRIMARY KEY (solve_id, conda_package_id)
        );

        CREATE TABLE key_value_store (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            prefix TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            UNIQUE(prefix, key)
        );
        ",
    )?;

    info!("Schema version 1 created successfully");
    Ok(())
}

/// Schema Version 2: split package builds out of `conda_package`
///
/// Legacy rows are grouped on (channel_id, name, version); the lowest id of
/// each group survives as the package and every legacy row becomes a
/// package build keeping its id, so the link tables only need their foreign
/// key retargeted. The builds are re-associated from `channel_id` to the
/// surviving `package_id`.
pub fn migrate_v2(conn: &Connection) -> Result<()> {
    debug!("Migrating to schema version 2");

    conn.execute_batch(
        "
        CREATE TABLE conda_package_v2 (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            channel_id INTEGER NOT NULL REFERENCES conda_channel(id),
            name TEXT NOT NULL,
            version TEXT NOT NULL,
            license TEXT,
            summary TEXT,
            description TEXT,
            UNIQUE(channel_id, name, version)
        );

        INSERT INTO conda_package_v2 (id, channel_id, name, version, license, summary, description)
        SELECT id, channel_id, name, version, license, summary, description
        FROM conda_package
        WHERE id IN (
            SELECT MIN(id) FROM conda_package GROUP BY channel_id, name, version
        );

        CREATE TABLE conda_package_build (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package_id INTEGER REFERENCES conda_package_v2(id) ON DELETE CASCADE,
            channel_id INTEGER,
            build TEXT NOT NULL,
            build_number INTEGER NOT NULL,
            subdir TEXT,
            sha256 TEXT NOT NULL,
            md5 TEXT NOT NULL,
            size INTEGER NOT NULL,
            depends TEXT NOT NULL,
            constrains TEXT NOT NULL DEFAULT '',
            timestamp INTEGER,
            UNIQUE(package_id, subdir, build, build_number, sha256)
        );

        INSERT INTO conda_package_build
            (id, package_id, channel_id, build, build_number, subdir, sha256, md5, size,
             depends, constrains, timestamp)
        SELECT id, NULL, channel_id, build, build_number, subdir, sha256, md5, size,
               depends, constrains, timestamp
        FROM conda_package;

        UPDATE conda_package_build
        SET package_id = (
            SELECT survivor.id
            FROM conda_package legacy
            JOIN conda_package_v2 survivor
              ON survivor.channel_id = legacy.channel_id
             AND survivor.name = legacy.name
             AND survivor.version = legacy.version
            WHERE legacy.id = conda_package_build.id
              AND legacy.channel_id = conda_package_build.channel_id
        );

        CREATE TABLE build_conda_package_v2 (
            build_id INTEGER NOT NULL REFERENCES build(id) ON DELETE CASCADE,
            conda_package_build_id INTEGER NOT NULL
                REFERENCES conda_package_build(id) ON DELETE CASCADE,
            PRIMARY KEY (build_id, conda_package_build_id)
        );
        INSERT INTO build_conda_package_v2 (build_id, conda_package_build_id)
        SELECT build_id, conda_package_id FROM build_conda_package;
        DROP TABLE build_conda_package;
        ALTER TABLE build_conda_package_v2 RENAME TO build_conda_package;

        CREATE TABLE solve_conda_package_v2 (
            solve_id INTEGER NOT NULL REFERENCES solve(id) ON DELETE CASCADE,
            conda_package_build_id INTEGER NOT NULL
                REFERENCES conda_package_build(id) ON DELETE CASCADE,
            PRIMARY KEY (solve_id, conda_package_build_id)
        );
        INSERT INTO solve_conda_package_v2 (solve_id, conda_package_build_id)
        SELECT solve_id, conda_package_id FROM solve_conda_package;
        DROP TABLE solve_conda_package;
        ALTER TABLE solve_conda_package_v2 RENAME TO solve_conda_package;

        DROP TABLE conda_package;
        ALTER TABLE conda_package_v2 RENAME TO conda_package;
        ALTER TABLE conda_package_build DROP COLUMN channel_id;

        CREATE INDEX idx_conda_package_build_sha256 ON conda_package_build(sha256);
        CREATE INDEX idx_conda_package_build_package ON conda_package_build(package_id);
        CREATE INDEX idx_conda_package_name ON conda_package(name);
        ",
    )?;

    info!("Schema version 2 applied successfully");
    Ok(())
}

/// Schema Version 3: rename link tables after their package-build targets
pub fn migrate_v3(conn: &Connection) -> Result<()> {
    debug!("Migrating to schema version 3");

    conn.execute_batch(
        "
        ALTER TABLE build_conda_package RENAME TO build_conda_package_build;
        ALTER TABLE solve_conda_package RENAME TO solve_conda_package_build;
        ",
    )?;

    info!("Schema version 3 applied successfully");
    Ok(())
}

/// Schema Version 4: role mappings, worker handshake, task broker, storage metrics
pub fn migrate_v4(conn: &Connection) -> Result<()> {
    debug!("Migrating to schema version 4");

    conn.execute_batch(
        "
        CREATE TABLE namespace_role_mapping (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            namespace_id INTEGER NOT NULL REFERENCES namespace(id) ON DELETE CASCADE,
            other_namespace TEXT NOT NULL,
            role TEXT NOT NULL CHECK(role IN ('viewer', 'developer', 'admin')),
            UNIQUE(namespace_id, other_namespace)
        );

        CREATE TABLE worker (
            id TEXT PRIMARY KEY,
            initialized INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        -- Durable broker for the worker pool
        CREATE TABLE task (
            id TEXT PRIMARY KEY,
            chain_id TEXT,
            name TEXT NOT NULL,
            args TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL CHECK(status IN
                ('pending', 'started', 'succeeded', 'failed', 'revoked')),
            eta TEXT NOT NULL,
            time_limit_secs INTEGER,
            worker_id TEXT,
            revoked INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            heartbeat_at TEXT,
            finished_at TEXT
        );

        CREATE INDEX idx_task_status_eta ON task(status, eta);
        CREATE INDEX idx_task_chain ON task(chain_id);

        CREATE TABLE storage_metrics (
            id INTEGER PRIMARY KEY CHECK(id = 1),
            disk_usage INTEGER NOT NULL DEFAULT 0,
            free_storage INTEGER NOT NULL DEFAULT 0,
            total_storage INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT
        );
        ",
    )?;

    info!("Schema version 4 applied successfully");
    Ok(())
}
