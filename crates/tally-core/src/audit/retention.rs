//! Retention sweep for expired audit snapshots.
//!
//! A run walks expired snapshots in `(expires_at_us, snapshot_id)` order,
//! one bounded batch at a time. The walk is keyset-paginated, so a batch
//! that keeps failing is stepped over instead of being re-selected forever.
//! Failed batches are retried with exponential backoff, then logged and
//! skipped; their rows stay expired and are picked up by the next run.
//! Deletes re-check the expiry, which makes re-running a sweep harmless.

use anyhow::Context;
use rusqlite::{Connection, params};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::{self, LedgerConfig, RetentionConfig};
use crate::error::{LedgerError, Result};
use crate::lock::{LockError, SweepLock};
use crate::store::Store;

/// Keyset position: `(expires_at_us, snapshot_id)` of the last row seen.
pub type Cursor = (i64, String);

/// Storage the sweep deletes from.
pub trait PurgeTarget {
    /// Up to `limit` expired snapshots strictly after `after`, in key order.
    ///
    /// # Errors
    ///
    /// Returns the storage error.
    fn expired_page(&mut self, now_us: i64, after: Option<&Cursor>, limit: u32)
    -> Result<Vec<Cursor>>;

    /// Delete the given snapshots if they are still expired. Returns the
    /// number of rows removed.
    ///
    /// # Errors
    ///
    /// Returns the storage error; nothing from the batch is deleted then.
    fn purge(&mut self, now_us: i64, snapshot_ids: &[String]) -> Result<usize>;
}

impl PurgeTarget for Connection {
    fn expired_page(
        &mut self,
        now_us: i64,
        after: Option<&Cursor>,
        limit: u32,
    ) -> Result<Vec<Cursor>> {
        let (after_ts, after_id) = after.map_or((i64::MIN, ""), |(ts, id)| (*ts, id.as_str()));
        let mut stmt = self.prepare_cached(
            "SELECT expires_at_us, snapshot_id FROM audit_snapshots \
             WHERE expires_at_us <= ?1 AND (expires_at_us, snapshot_id) > (?2, ?3) \
             ORDER BY expires_at_us, snapshot_id LIMIT ?4",
        )?;
        let rows = stmt.query_map(params![now_us, after_ts, after_id, limit], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<Cursor>>>()?)
    }

    fn purge(&mut self, now_us: i64, snapshot_ids: &[String]) -> Result<usize> {
        let tx = self.transaction()?;
        let mut deleted = 0;
        {
            let mut stmt = tx.prepare_cached(
                "DELETE FROM audit_snapshots WHERE snapshot_id = ?1 AND expires_at_us <= ?2",
            )?;
            for id in snapshot_ids {
                deleted += stmt.execute(params![id, now_us])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }
}

/// Totals for one sweep run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SweepReport {
    pub deleted: usize,
    pub batches: usize,
    pub failed_batches: usize,
    /// Snapshots left in place because their batch failed.
    pub skipped: usize,
    pub elapsed_ms: u64,
}

/// Batched, retrying purge of expired snapshots.
#[derive(Debug, Clone)]
pub struct RetentionSweep {
    config: RetentionConfig,
}

impl RetentionSweep {
    #[must_use]
    pub const fn new(config: RetentionConfig) -> Self {
        Self { config }
    }

    /// Purge everything expired at `now_us`.
    ///
    /// A batch that fails every attempt is logged and skipped; the run goes
    /// on with the next batch.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::RetentionBatchFailure`] only if the expired
    /// set itself cannot be read after all retries.
    pub fn run<T: PurgeTarget + ?Sized>(&self, target: &mut T, now_us: i64) -> Result<SweepReport> {
        let started = Instant::now();
        let batch_size = self.config.batch_size.max(1);
        let mut report = SweepReport::default();
        let mut cursor: Option<Cursor> = None;

        loop {
            let page = self
                .with_retry(|| target.expired_page(now_us, cursor.as_ref(), batch_size))
                .map_err(|(err, attempts)| LedgerError::RetentionBatchFailure {
                    size: 0,
                    attempts,
                    reason: format!("listing expired snapshots: {err}"),
                })?;
            let Some(last) = page.last().cloned() else {
                break;
            };

            let ids: Vec<String> = page.into_iter().map(|(_, id)| id).collect();
            report.batches += 1;
            match self.with_retry(|| target.purge(now_us, &ids)) {
                Ok(deleted) => report.deleted += deleted,
                Err((err, attempts)) => {
                    let failure = LedgerError::RetentionBatchFailure {
                        size: ids.len(),
                        attempts,
                        reason: err.to_string(),
                    };
                    tracing::error!(
                        code = %failure.code(),
                        first = %ids[0],
                        error = %failure,
                        "skipping retention batch"
                    );
                    report.failed_batches += 1;
                    report.skipped += ids.len();
                }
            }
            cursor = Some(last);
        }

        report.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::info!(
            deleted = report.deleted,
            batches = report.batches,
            failed_batches = report.failed_batches,
            elapsed_ms = report.elapsed_ms,
            "retention sweep finished"
        );
        Ok(report)
    }

    fn with_retry<T>(
        &self,
        mut op: impl FnMut() -> Result<T>,
    ) -> std::result::Result<T, (LedgerError, u32)> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= max_attempts => return Err((err, attempt)),
                Err(err) => {
                    let delay = self.config.backoff(attempt);
                    tracing::warn!(attempt, ?delay, error = %err, "retention batch failed, backing off");
                    thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

/// Sweep the store with its own config and clock.
///
/// # Errors
///
/// See [`RetentionSweep::run`].
pub fn sweep_store(store: &mut Store) -> Result<SweepReport> {
    let sweep = RetentionSweep::new(store.config().retention.clone());
    let now = store.now_us();
    sweep.run(store.conn_mut(), now)
}

/// One locked sweep over the project store at `project_root`.
///
/// Returns `None` when another sweeper holds the lock.
///
/// # Errors
///
/// Returns an error if the store cannot be opened or the sweep fails.
pub fn sweep_project(
    project_root: &Path,
    config: &LedgerConfig,
    lock_timeout: Duration,
) -> anyhow::Result<Option<SweepReport>> {
    let lock = match SweepLock::acquire(&config::sweep_lock_path(project_root), lock_timeout) {
        Ok(lock) => lock,
        Err(LockError::Timeout { .. }) => {
            tracing::info!("another sweep holds the lock, skipping this run");
            return Ok(None);
        }
        Err(err) => return Err(err).context("acquire sweep lock"),
    };

    let mut store = Store::open(&config::store_path(project_root), config.clone())?;
    let report = sweep_store(&mut store).context("retention sweep")?;
    lock.release();
    Ok(Some(report))
}

/// Background thread running a job at a fixed interval, starting at once.
pub struct RetentionScheduler {
    shutdown: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl RetentionScheduler {
    /// Run `job` now and then every `interval` until stopped.
    pub fn spawn<F>(interval: Duration, mut job: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let (shutdown, signal) = mpsc::channel();
        let handle = thread::spawn(move || {
            loop {
                job();
                match signal.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });
        Self { shutdown, handle }
    }

    /// Schedule [`sweep_project`] at the configured interval.
    #[must_use]
    pub fn for_project(project_root: PathBuf, config: LedgerConfig) -> Self {
        let interval = config.retention.interval();
        Self::spawn(interval, move || {
            match sweep_project(&project_root, &config, Duration::from_secs(1)) {
                Ok(Some(report)) => tracing::debug!(?report, "scheduled sweep done"),
                Ok(None) => {}
                Err(err) => tracing::error!(error = %format!("{err:#}"), "scheduled sweep failed"),
            }
        })
    }

    /// Signal the thread and wait for the current run to finish.
    pub fn stop(self) {
        let _ = self.shutdown.send(());
        if self.handle.join().is_err() {
            tracing::error!("retention scheduler thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditSnapshot, insert_snapshot};
    use crate::db::open_in_memory;
    use crate::event::MutationKind;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn seed(conn: &Connection, id: &str, expires_at_us: i64) {
        let snapshot = AuditSnapshot {
            snapshot_id: id.into(),
            tenant_id: "acme".into(),
            operation: MutationKind::Create,
            collection: "jobs".into(),
            collection_path: "jobs".into(),
            doc_id: format!("d-{id}"),
            parent_id: None,
            ts_us: 0,
            write_seq: 1,
            author: None,
            before: None,
            after: Some(crate::model::Fields::new()),
            expires_at_us,
        };
        assert!(insert_snapshot(conn, &snapshot).unwrap());
    }

    fn remaining(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM audit_snapshots", [], |row| row.get(0))
            .unwrap()
    }

    fn config(batch_size: u32) -> RetentionConfig {
        RetentionConfig {
            batch_size,
            max_attempts: 3,
            base_backoff_ms: 0,
            interval_hours: 24,
        }
    }

    /// Fails `purge` for any batch containing `poison`, and for the first
    /// `transient` calls overall.
    struct Faulty<'a> {
        conn: &'a mut Connection,
        poison: Option<&'static str>,
        transient: usize,
        purge_calls: usize,
    }

    impl PurgeTarget for Faulty<'_> {
        fn expired_page(
            &mut self,
            now_us: i64,
            after: Option<&Cursor>,
            limit: u32,
        ) -> Result<Vec<Cursor>> {
            self.conn.expired_page(now_us, after, limit)
        }

        fn purge(&mut self, now_us: i64, snapshot_ids: &[String]) -> Result<usize> {
            self.purge_calls += 1;
            let poisoned = self
                .poison
                .is_some_and(|p| snapshot_ids.iter().any(|id| id == p));
            if poisoned || self.purge_calls <= self.transient {
                return Err(LedgerError::InvalidDocument("injected failure".into()));
            }
            self.conn.purge(now_us, snapshot_ids)
        }
    }

    #[test]
    fn deletes_only_expired_in_batches() {
        let mut conn = open_in_memory().unwrap();
        for i in 0..7 {
            seed(&conn, &format!("s{i}"), 100);
        }
        seed(&conn, "fresh", 1_000);

        let report = RetentionSweep::new(config(3)).run(&mut conn, 500).unwrap();
        assert_eq!(report.deleted, 7);
        assert_eq!(report.batches, 3);
        assert_eq!(report.failed_batches, 0);
        assert_eq!(remaining(&conn), 1);
    }

    #[test]
    fn second_run_is_a_no_op() {
        let mut conn = open_in_memory().unwrap();
        for i in 0..4 {
            seed(&conn, &format!("s{i}"), 100);
        }
        let sweep = RetentionSweep::new(config(500));
        assert_eq!(sweep.run(&mut conn, 500).unwrap().deleted, 4);

        let again = sweep.run(&mut conn, 500).unwrap();
        assert_eq!(again, SweepReport {
            elapsed_ms: again.elapsed_ms,
            ..SweepReport::default()
        });
    }

    #[test]
    fn transient_batch_failures_are_retried() {
        let mut conn = open_in_memory().unwrap();
        for i in 0..3 {
            seed(&conn, &format!("s{i}"), 100);
        }
        let mut target = Faulty {
            conn: &mut conn,
            poison: None,
            transient: 2,
            purge_calls: 0,
        };
        let report = RetentionSweep::new(config(10)).run(&mut target, 500).unwrap();
        assert_eq!(report.deleted, 3);
        assert_eq!(report.failed_batches, 0);
        assert_eq!(target.purge_calls, 3);
    }

    #[test]
    fn failed_batch_is_skipped_and_picked_up_next_run() {
        let mut conn = open_in_memory().unwrap();
        for i in 0..6 {
            seed(&conn, &format!("s{i}"), 100);
        }
        let mut target = Faulty {
            conn: &mut conn,
            poison: Some("s0"),
            transient: 0,
            purge_calls: 0,
        };
        let report = RetentionSweep::new(config(2)).run(&mut target, 500).unwrap();
        assert_eq!(report.batches, 3);
        assert_eq!(report.failed_batches, 1);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.deleted, 4);
        // Three attempts on the poisoned batch, one each for the others.
        assert_eq!(target.purge_calls, 5);

        let report = RetentionSweep::new(config(2)).run(&mut conn, 500).unwrap();
        assert_eq!(report.deleted, 2);
        assert_eq!(remaining(&conn), 0);
    }

    #[test]
    fn scheduler_runs_immediately_and_stops() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let scheduler = RetentionScheduler::spawn(Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(40));
        scheduler.stop();

        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected repeated runs, saw {seen}");
        thread::sleep(Duration::from_millis(20));
        assert_eq!(runs.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn project_sweep_skips_when_locked() {
        let dir = tempfile::tempdir().unwrap();
        let config = LedgerConfig::default();
        let _held = SweepLock::acquire(
            &config::sweep_lock_path(dir.path()),
            Duration::from_millis(50),
        )
        .unwrap();

        let outcome = sweep_project(dir.path(), &config, Duration::from_millis(20)).unwrap();
        assert!(outcome.is_none());
    }
}
