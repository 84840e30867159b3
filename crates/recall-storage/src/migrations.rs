//! Database schema migrations.
//!
//! Applies the record schema: the `records` table holding text, opaque
//! metadata and the f32 embedding blob, plus `store_meta` for store-wide
//! invariants such as the fixed embedding dimension.

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use recall_core::error::{RecallError, Result};

/// Latest schema version this build knows how to apply.
pub const SCHEMA_VERSION: i64 = 1;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| RecallError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version = schema_version(conn)?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: record_schema");
    }

    Ok(())
}

/// Highest applied migration version (0 for a fresh database).
pub fn schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )
    .map_err(|e| RecallError::Storage(format!("Failed to query migration version: {}", e)))
}

/// Version 1: records and store metadata.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS records (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            kind                TEXT NOT NULL
                                CHECK (kind IN ('chunk', 'log', 'standalone')),
            source_document_id  TEXT,
            ordinal             INTEGER,
            text                TEXT NOT NULL CHECK (length(text) > 0),
            char_count          INTEGER NOT NULL,
            metadata            TEXT NOT NULL DEFAULT '{}',
            embedding           BLOB NOT NULL,
            dimensions          INTEGER NOT NULL,
            created_at          INTEGER NOT NULL,
            CHECK (kind != 'chunk'
                   OR (source_document_id IS NOT NULL AND ordinal IS NOT NULL))
        );

        -- Ordinals are unique within a document; NULLs (non-chunks) never collide.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_records_document_ordinal
            ON records (source_document_id, ordinal);

        CREATE INDEX IF NOT EXISTS idx_records_created_at
            ON records (created_at DESC);

        CREATE INDEX IF NOT EXISTS idx_records_kind
            ON records (kind, created_at DESC);

        CREATE TABLE IF NOT EXISTS store_meta (
            key     TEXT PRIMARY KEY NOT NULL,
            value   TEXT NOT NULL
        );

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (1, 'record_schema');
        ",
    )
    .map_err(|e| RecallError::Storage(format!("Failed to apply migration v1: {}", e)))?;

    Ok(())
}

/// Pin the store's embedding dimension, or verify it against the pinned value.
///
/// The first store opened on a database records `dimensions`; every later
/// open must agree.
pub fn ensure_dimensions(conn: &Connection, dimensions: usize) -> Result<()> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM store_meta WHERE key = 'dimensions'",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| RecallError::Storage(format!("Failed to read store dimensions: {}", e)))?;

    match stored {
        Some(raw) => {
            let expected: usize = raw.parse().map_err(|_| {
                RecallError::Storage(format!("Corrupt dimensions value in store_meta: {}", raw))
            })?;
            if expected != dimensions {
                return Err(RecallError::DimensionMismatch {
                    expected,
                    actual: dimensions,
                });
            }
        }
        None => {
            conn.execute(
                "INSERT INTO store_meta (key, value) VALUES ('dimensions', ?1)",
                rusqlite::params![dimensions.to_string()],
            )
            .map_err(|e| RecallError::Storage(format!("Failed to pin store dimensions: {}", e)))?;
            info!(dimensions, "Pinned store embedding dimension");
        }
    }
    Ok(())
}
