//! Offline write queue, reconciliation and conflict handling.

pub mod conflict;
pub mod lww;
pub mod pending;
pub mod reconcile;

pub use conflict::{ConflictCategory, ConflictStatus, Resolution, SyncConflict};
pub use pending::{NewPendingWrite, PendingState, PendingWrite, WriteOp};
pub use reconcile::{Applied, SyncOutcome};
