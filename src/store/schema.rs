//! Database schema definitions and migrations.

use rusqlite::Connection;

use crate::error::StoreError;

/// Current schema version. Increment when making schema changes.
pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS podcasts (
    id TEXT PRIMARY KEY NOT NULL,
    title TEXT NOT NULL,
    feed_url TEXT
);

CREATE TABLE IF NOT EXISTS episodes (
    id TEXT PRIMARY KEY NOT NULL,
    podcast_id TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT,
    state TEXT NOT NULL DEFAULT 'NEW',
    file_path TEXT,
    enclosure_url TEXT,
    hash TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    size_bytes INTEGER,
    published_at INTEGER,
    downloaded_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_episodes_state ON episodes(state);
CREATE INDEX IF NOT EXISTS idx_episodes_podcast ON episodes(podcast_id);

CREATE TABLE IF NOT EXISTS downloads (
    episode_id TEXT PRIMARY KEY NOT NULL,
    enqueued_at INTEGER NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_downloads_claim_order ON downloads(priority DESC, enqueued_at ASC);
"#;

pub(crate) fn get_schema_version(conn: &Connection) -> Result<i32, StoreError> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(StoreError::Migration)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), StoreError> {
    conn.pragma_update(None, "user_version", version)
        .map_err(StoreError::Migration)
}

/// Initialize or migrate the database schema.
///
/// Idempotent; safe on both new and existing databases.
pub(crate) fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let current_version = get_schema_version(conn)?;

    if current_version > SCHEMA_VERSION {
        return Err(StoreError::UnsupportedSchemaVersion {
            found: current_version,
            expected: SCHEMA_VERSION,
        });
    }

    if current_version < SCHEMA_VERSION {
        conn.execute_batch(SCHEMA_V1)
            .map_err(StoreError::Migration)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
        tracing::debug!("Initialized database schema at version {}", SCHEMA_VERSION);
    }

    Ok(())
}
