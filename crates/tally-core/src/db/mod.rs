//! SQLite ledger store utilities.
//!
//! Runtime defaults:
//! - `journal_mode = WAL` so readers proceed while a writer holds the lock
//! - `busy_timeout = 5s` so writers queue on the counter row instead of failing
//! - `foreign_keys = ON` to protect conflict → queued-write references

pub mod migrations;
pub mod schema;

use anyhow::{Context, Result};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::{path::Path, time::Duration};

/// Busy timeout used for ledger connections.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (or create) the ledger database, apply runtime pragmas, and migrate
/// the schema to the latest version.
///
/// # Errors
///
/// Returns an error if opening/configuring/migrating the database fails.
pub fn open_store(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create ledger directory {}", parent.display()))?;
    }

    let mut conn =
        Connection::open(path).with_context(|| format!("open ledger database {}", path.display()))?;

    configure_connection(&conn).context("configure sqlite pragmas")?;
    migrations::migrate(&mut conn).context("apply ledger migrations")?;

    Ok(conn)
}

/// Open an in-memory, fully migrated store. Used by tests and dry runs.
///
/// # Errors
///
/// Returns an error if migration fails.
pub fn open_in_memory() -> Result<Connection> {
    let mut conn = Connection::open_in_memory().context("open in-memory ledger")?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .context("enable foreign keys")?;
    migrations::migrate(&mut conn).context("apply ledger migrations")?;
    Ok(conn)
}

/// Start a write transaction that takes the database write lock up front.
///
/// # Errors
///
/// Returns the SQLite error if the lock cannot be taken within the busy
/// timeout.
pub fn begin_write(conn: &mut Connection) -> rusqlite::Result<Transaction<'_>> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
}

/// Bump and return the store-wide write sequence inside `tx`.
///
/// # Errors
///
/// Returns the SQLite error if the update fails.
pub fn next_write_seq(tx: &Transaction<'_>) -> rusqlite::Result<i64> {
    tx.query_row(
        "UPDATE store_meta SET write_seq = write_seq + 1 WHERE id = 1 RETURNING write_seq",
        [],
        |row| row.get(0),
    )
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    Ok(())
}
