//! Whole-document last-writer-wins.
//!
//! A stored document carries the [`WriteStamp`] of the commit that produced
//! it. An incoming write either replaces the whole document or is dropped;
//! there is no field-level merge.
//!
//! # Tie-Breaking Chain
//!
//! 1. **Server timestamp**: higher `server_ts_us` wins. Client clocks never
//!    take part.
//! 2. **Write sequence**: if timestamps are equal, higher `write_seq` wins.
//!    The store assigns a fresh value to every commit, so no ties remain.

use std::cmp::Ordering;

use crate::model::WriteStamp;

/// Result of comparing an incoming write with the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The incoming write replaces the document.
    IncomingWins,
    /// The current state stays; the incoming write is superseded.
    CurrentWins,
}

/// Decide between the stored state and an incoming write.
#[must_use]
pub fn decide(current: WriteStamp, incoming: WriteStamp) -> Verdict {
    match incoming.server_ts_us.cmp(&current.server_ts_us) {
        Ordering::Greater => return Verdict::IncomingWins,
        Ordering::Less => return Verdict::CurrentWins,
        Ordering::Equal => {}
    }
    if incoming.write_seq > current.write_seq {
        Verdict::IncomingWins
    } else {
        Verdict::CurrentWins
    }
}
