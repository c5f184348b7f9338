//! Sequence allocation.
//!
//! A counter is one row keyed by `(tenant_id, scope_id, sequence_name)`. The
//! increment is a single `INSERT .. ON CONFLICT DO UPDATE .. RETURNING`
//! statement executed inside the caller's write transaction, so the number
//! and whatever document carries it commit or roll back together.
//!
//! Writers take the database lock at `BEGIN IMMEDIATE`; a writer that cannot
//! get it within the busy timeout sees `SQLITE_BUSY`, which is reported as
//! [`LedgerError::AllocationConflict`] and retried by
//! [`SequenceAllocator::run`] up to `max_attempts` times before surfacing
//! [`LedgerError::AllocationExhausted`]. A rolled-back attempt never
//! consumes a number; a committed allocation whose document write later
//! fails elsewhere leaves a gap, never a duplicate.

use rusqlite::{Connection, Transaction, params};
use std::fmt;
use std::thread;
use std::time::Duration;

use crate::config::SequenceConfig;
use crate::db;
use crate::error::{LedgerError, Result, is_busy_error};

/// Identity of one counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SequenceKey {
    pub tenant_id: String,
    pub scope_id: String,
    pub sequence_name: String,
}

impl SequenceKey {
    pub fn new(
        tenant_id: impl Into<String>,
        scope_id: impl Into<String>,
        sequence_name: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            scope_id: scope_id.into(),
            sequence_name: sequence_name.into(),
        }
    }

    /// Tenant-level key: the scope is the tenant itself.
    pub fn tenant_level(tenant_id: impl Into<String>, sequence_name: impl Into<String>) -> Self {
        let tenant_id = tenant_id.into();
        Self::new(tenant_id.clone(), tenant_id, sequence_name)
    }

    fn conflict(&self) -> LedgerError {
        LedgerError::AllocationConflict {
            tenant_id: self.tenant_id.clone(),
            scope_id: self.scope_id.clone(),
            sequence_name: self.sequence_name.clone(),
        }
    }
}

impl fmt::Display for SequenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.tenant_id, self.scope_id, self.sequence_name
        )
    }
}

/// Increment the counter for `key` inside `tx` and return the new value.
///
/// The first allocation for a key creates the row and returns 1.
///
/// # Errors
///
/// Busy/locked failures come back as [`LedgerError::AllocationConflict`];
/// anything else as the storage error.
pub fn allocate_in(tx: &Transaction<'_>, key: &SequenceKey, now_us: i64) -> Result<i64> {
    tx.query_row(
        "INSERT INTO counters (tenant_id, scope_id, sequence_name, value, updated_at_us)
         VALUES (?1, ?2, ?3, 1, ?4)
         ON CONFLICT (tenant_id, scope_id, sequence_name)
         DO UPDATE SET value = value + 1, updated_at_us = excluded.updated_at_us
         RETURNING value",
        params![key.tenant_id, key.scope_id, key.sequence_name, now_us],
        |row| row.get(0),
    )
    .map_err(|err| {
        if is_busy_error(&err) {
            key.conflict()
        } else {
            LedgerError::Storage(err)
        }
    })
}

/// Read the last issued value without allocating. Diagnostic only.
///
/// # Errors
///
/// Returns the SQLite error if the query fails.
pub fn peek(conn: &Connection, key: &SequenceKey) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COALESCE(
            (SELECT value FROM counters
             WHERE tenant_id = ?1 AND scope_id = ?2 AND sequence_name = ?3),
            0)",
        params![key.tenant_id, key.scope_id, key.sequence_name],
        |row| row.get(0),
    )
}

/// Runs allocation transactions with a bounded retry policy.
#[derive(Debug, Clone, Copy)]
pub struct SequenceAllocator {
    max_attempts: u32,
    retry_delay: Duration,
}

impl Default for SequenceAllocator {
    fn default() -> Self {
        Self::from_config(&SequenceConfig::default())
    }
}

impl SequenceAllocator {
    #[must_use]
    pub fn from_config(config: &SequenceConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            retry_delay: config.retry_delay(),
        }
    }

    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Allocate the next number for `key` in a transaction of its own.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::AllocationExhausted`] when every attempt lost
    /// the write race, or the underlying storage error.
    pub fn allocate(&self, conn: &mut Connection, key: &SequenceKey, now_us: i64) -> Result<i64> {
        let value = self.run(conn, key, |tx| allocate_in(tx, key, now_us))?;
        tracing::debug!(key = %key, value, "allocated sequence number");
        Ok(value)
    }

    /// Run `body` in an immediate write transaction, retrying the whole
    /// transaction on transient conflicts. `what` names the target in logs
    /// and in the exhaustion error.
    ///
    /// `body` may be invoked more than once and must not have side effects
    /// outside the transaction.
    ///
    /// # Errors
    ///
    /// Returns the first non-transient error from `body` or commit, or
    /// [`LedgerError::AllocationExhausted`] after `max_attempts` conflicts.
    pub fn run<T>(
        &self,
        conn: &mut Connection,
        what: &dyn fmt::Display,
        mut body: impl FnMut(&Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        for attempt in 1..=self.max_attempts {
            match Self::attempt(conn, &mut body) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    tracing::debug!(
                        op = %what,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "write transaction conflicted, retrying"
                    );
                    if attempt < self.max_attempts {
                        thread::sleep(self.retry_delay.saturating_mul(attempt));
                    }
                }
                Err(err) => return Err(err),
            }
        }

        tracing::warn!(op = %what, attempts = self.max_attempts, "write retries exhausted");
        Err(LedgerError::AllocationExhausted {
            sequence_name: what.to_string(),
            attempts: self.max_attempts,
        })
    }

    fn attempt<T>(
        conn: &mut Connection,
        body: &mut impl FnMut(&Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let tx = db::begin_write(conn)?;
        let value = body(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}
