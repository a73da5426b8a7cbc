//! v001 -- Initial schema creation.
//!
//! Creates the two tables the core needs: `collections` (whole-collection
//! JSON blobs, one row per persisted list) and `meta` (scalar settings).

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Collections: one JSON array per persisted list, rewritten wholesale
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS collections (
    name       TEXT PRIMARY KEY NOT NULL,
    data       BLOB NOT NULL,               -- JSON array of records
    updated_at INTEGER NOT NULL             -- Unix epoch millis
);

-- ----------------------------------------------------------------
-- Meta: scalar key/value settings (device address, local callsign, ...)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
