//! Database schema for the local store.
//!
//! The schema is created inline when a pool is opened, so a fresh database
//! file is usable immediately and `reset` can drop and recreate it without a
//! migration runner.
//!
//! `AUTOINCREMENT` on `regions.id` is load-bearing: region ids must increase
//! monotonically and never be reused, even after deletion.

use sqlx::{Pool, Sqlite};

use crate::error::Result;

pub(crate) const CREATE_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS resources (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        url TEXT NOT NULL UNIQUE,
        kind INTEGER NOT NULL DEFAULT 0,
        body BLOB NOT NULL,
        size_bytes INTEGER NOT NULL,
        etag TEXT,
        last_modified INTEGER,
        expires INTEGER,
        pin_count INTEGER NOT NULL DEFAULT 0,
        last_used INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS regions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        definition TEXT NOT NULL,
        metadata BLOB NOT NULL,
        download_state INTEGER NOT NULL DEFAULT 0,
        required_count INTEGER NOT NULL DEFAULT 0,
        required_exact INTEGER NOT NULL DEFAULT 0,
        completed_count INTEGER NOT NULL DEFAULT 0,
        completed_bytes INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS region_resources (
        region_id INTEGER NOT NULL REFERENCES regions(id) ON DELETE CASCADE,
        resource_id INTEGER NOT NULL REFERENCES resources(id) ON DELETE CASCADE,
        PRIMARY KEY (region_id, resource_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_resources_ambient
        ON resources(pin_count, last_used)",
    "CREATE INDEX IF NOT EXISTS idx_region_resources_resource
        ON region_resources(resource_id)",
];

const DROP_STATEMENTS: &[&str] = &[
    "DROP TABLE IF EXISTS region_resources",
    "DROP TABLE IF EXISTS regions",
    "DROP TABLE IF EXISTS resources",
];

/// Create all tables and indexes if they do not exist.
pub(crate) async fn init(pool: &Pool<Sqlite>) -> Result<()> {
    for statement in CREATE_STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// Drop and recreate the schema, discarding all logical contents.
pub(crate) async fn reset(pool: &Pool<Sqlite>) -> Result<()> {
    for statement in DROP_STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    // Forget handed-out AUTOINCREMENT ids as well; after a reset the store
    // is indistinguishable from a brand-new file.
    sqlx::query("DELETE FROM sqlite_sequence")
        .execute(pool)
        .await
        .ok();
    init(pool).await
}
