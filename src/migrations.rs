//! Database schema migrations
//!
//! Each step is additive (new tables, new columns with defaults) and runs in
//! its own transaction together with the version stamp, so a failed step
//! leaves the database at the last fully-applied version.

use crate::{Error, Result};
use rusqlite::{Connection, Transaction};

/// Schema version this build writes and expects
pub const SCHEMA_VERSION: i32 = 4;

/// Bring the database up to [`SCHEMA_VERSION`].
///
/// A database stamped with a newer version than this build understands is
/// rejected outright rather than opened half-understood.
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let mut current = schema_version(conn)?;

    if current > SCHEMA_VERSION {
        return Err(Error::Migration(format!(
            "Database schema version {} is newer than supported version {}; \
             refusing to open",
            current, SCHEMA_VERSION
        )));
    }

    if current == SCHEMA_VERSION {
        tracing::debug!("Schema already at version {}", SCHEMA_VERSION);
        return Ok(());
    }

    tracing::debug!(
        "Running migrations: current_version={}, target_version={}",
        current,
        SCHEMA_VERSION
    );

    while current < SCHEMA_VERSION {
        let next = current + 1;
        let tx = conn.transaction()?;
        apply_step(&tx, next)?;
        set_schema_version(&tx, next)?;
        tx.commit()?;
        tracing::debug!("Migrated to schema version {}", next);
        current = next;
    }

    Ok(())
}

/// Read the stored schema version (0 for a brand-new database)
pub fn schema_version(conn: &Connection) -> Result<i32> {
    let result = conn.query_row(
        "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
        [],
        |row| row.get(0),
    );

    match result {
        Ok(v) => Ok(v),
        Err(_) => Ok(0),
    }
}

fn set_schema_version(tx: &Transaction<'_>, version: i32) -> Result<()> {
    tx.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
        [],
    )?;
    tx.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

fn apply_step(tx: &Transaction<'_>, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(tx),
        2 => migrate_v2(tx),
        3 => migrate_v3(tx),
        4 => migrate_v4(tx),
        other => Err(Error::Migration(format!(
            "No migration step defined for version {}",
            other
        ))),
    }
}

fn migrate_v1(tx: &Transaction<'_>) -> Result<()> {
    tx.execute_batch(
        r#"
        CREATE TABLE accounts (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            institution TEXT NOT NULL,
            type TEXT NOT NULL,
            encrypted_data BLOB NOT NULL,
            created_date INTEGER NOT NULL,
            last_updated INTEGER NOT NULL,
            schema_version INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE historical_snapshots (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            value REAL NOT NULL,
            change_type TEXT NOT NULL,
            encrypted_metadata BLOB,
            FOREIGN KEY (account_id) REFERENCES accounts (id) ON DELETE CASCADE
        );

        CREATE TABLE stock_positions (
            id TEXT PRIMARY KEY,
            trading_account_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            shares REAL NOT NULL,
            purchase_price REAL NOT NULL,
            purchase_date TEXT NOT NULL,
            current_price REAL,
            last_price_update INTEGER,
            FOREIGN KEY (trading_account_id) REFERENCES accounts (id) ON DELETE CASCADE
        );

        CREATE TABLE app_settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            encrypted_value BLOB
        );

        CREATE INDEX idx_accounts_type ON accounts (type);
        CREATE INDEX idx_historical_account_id ON historical_snapshots (account_id);
        CREATE INDEX idx_historical_timestamp ON historical_snapshots (timestamp);
        CREATE INDEX idx_stock_positions_account ON stock_positions (trading_account_id);
        "#,
    )
    .map_err(|e| Error::Migration(e.to_string()))?;

    Ok(())
}

fn migrate_v2(tx: &Transaction<'_>) -> Result<()> {
    // Demo marker for sample data. Guarded so databases hand-initialized by
    // early builds (which already had the column) migrate cleanly.
    let mut stmt = tx.prepare("PRAGMA table_info(accounts)")?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    drop(stmt);

    if columns.iter().any(|c| c == "is_demo") {
        return Ok(());
    }

    tx.execute_batch(
        r#"
        ALTER TABLE accounts ADD COLUMN is_demo INTEGER NOT NULL DEFAULT 0;
        "#,
    )
    .map_err(|e| Error::Migration(e.to_string()))?;

    Ok(())
}

fn migrate_v3(tx: &Transaction<'_>) -> Result<()> {
    tx.execute_batch(
        r#"
        -- Tracked-but-not-owned symbols; notes and prices are encrypted
        CREATE TABLE IF NOT EXISTS watchlist (
            id TEXT PRIMARY KEY,
            symbol TEXT NOT NULL UNIQUE,
            encrypted_data BLOB NOT NULL,
            added_date INTEGER NOT NULL,
            last_price_update INTEGER,
            is_demo INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_watchlist_symbol ON watchlist (symbol);
        CREATE INDEX IF NOT EXISTS idx_watchlist_added_date ON watchlist (added_date);
        "#,
    )
    .map_err(|e| Error::Migration(e.to_string()))?;

    Ok(())
}

fn migrate_v4(tx: &Transaction<'_>) -> Result<()> {
    tx.execute_batch(
        r#"
        CREATE INDEX IF NOT EXISTS idx_accounts_institution_type
            ON accounts (institution, type);
        "#,
    )
    .map_err(|e| Error::Migration(e.to_string()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_database_reaches_current_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_rerun_is_noop() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        run_migrations(&mut conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_future_version_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [SCHEMA_VERSION + 1],
        )
        .unwrap();

        assert!(matches!(
            run_migrations(&mut conn),
            Err(Error::Migration(_))
        ));
    }

    #[test]
    fn test_version_history_is_kept() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, SCHEMA_VERSION as i64);
    }
}
