//! Database schema migrations for SQLite.
//!
//! We use a simple versioned migration system. Each migration is a SQL string
//! that transforms the schema from version N to N+1.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    // Create migrations table if it doesn't exist
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    // Apply migrations
    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
        }

        tx.commit()?;
    }

    Ok(())
}

/// Apply a specific migration version.
fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- One row per CoValue
        CREATE TABLE covalues (
            row_id INTEGER PRIMARY KEY,
            id TEXT NOT NULL UNIQUE,          -- co_<hex>
            header BLOB NOT NULL              -- CBOR-encoded header
        );

        -- Per-session progress
        CREATE TABLE sessions (
            row_id INTEGER PRIMARY KEY,
            covalue INTEGER NOT NULL REFERENCES covalues(row_id),
            session_id TEXT NOT NULL,
            last_idx INTEGER NOT NULL,        -- number of stored transactions
            last_signature TEXT NOT NULL,
            bytes_since_checkpoint INTEGER NOT NULL DEFAULT 0,
            UNIQUE(covalue, session_id)
        );

        CREATE TABLE transactions (
            ses INTEGER NOT NULL REFERENCES sessions(row_id),
            idx INTEGER NOT NULL,
            tx BLOB NOT NULL,                 -- CBOR-encoded transaction
            PRIMARY KEY (ses, idx)
        );

        -- Checkpoint signatures, the only places a session may be split
        CREATE TABLE signature_after (
            ses INTEGER NOT NULL REFERENCES sessions(row_id),
            idx INTEGER NOT NULL,
            signature TEXT NOT NULL,
            PRIMARY KEY (ses, idx)
        );

        -- Peers that have not confirmed a CoValue yet
        CREATE TABLE unsynced_covalues (
            covalue_id TEXT NOT NULL,
            peer_id TEXT NOT NULL,
            PRIMARY KEY (covalue_id, peer_id)
        );

        -- Deletion work queue: 0 = pending, 1 = done
        CREATE TABLE deleted_covalues (
            covalue_id TEXT PRIMARY KEY,
            status INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX idx_sessions_covalue ON sessions(covalue);
        CREATE INDEX idx_deleted_status ON deleted_covalues(status);
        "#,
    )?;

    Ok(())
}

/// Get current time in milliseconds.
fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        // Verify tables exist
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "covalues",
            "sessions",
            "transactions",
            "signature_after",
            "unsynced_covalues",
            "deleted_covalues",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {}", table);
        }
        assert!(tables.contains(&"schema_migrations".to_string()));
    }

    #[test]
    fn test_migration_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap(); // Should not error
        migrate(&mut conn).unwrap(); // Still should not error

        // Verify version is 1
        let version: u32 = conn
            .query_row(
                "SELECT MAX(version) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, 1);
    }
}
