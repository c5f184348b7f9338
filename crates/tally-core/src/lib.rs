//! tally-core library.
//!
//! Multi-tenant ledger core: duplicate-free sequence allocation, backfill for
//! documents created offline, an audit trail with bounded retention, and
//! reconciliation of queued offline writes.
//!
//! # Conventions
//!
//! - **Errors**: component APIs return [`error::LedgerError`]; read paths and
//!   setup use `anyhow::Result`.
//! - **Logging**: `tracing` macros only. Post-commit work logs its failures
//!   instead of returning them to the writer.
//! - **Time**: persisted timestamps come from a [`clock::ServerClock`], in
//!   microseconds since the Unix epoch.

pub mod audit;
pub mod auth;
pub mod backfill;
pub mod clock;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod ledger;
pub mod lock;
pub mod model;
pub mod sequence;
pub mod store;
pub mod sync;

pub use error::{ErrorCode, LedgerError};
pub use ledger::Ledger;
