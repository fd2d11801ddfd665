// Conflict resolution primitives.
//
// Two classes of data are merged here:
//   - append-only entries (strokes, chat messages) live in an `OrderedLog`
//     whose order is total and identical on every replica;
//   - single-valued mutable fields (todo done flag, membership role) are
//     `LwwRegister`s resolved by (logical clock, author id).
//
// Every `Merge` implementation is commutative, associative and idempotent.

mod log;
mod lww;

pub use log::{EntryOrder, OrderedLog, Sequence};
pub use lww::LwwRegister;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Last-writer-wins stamp. Ordered by clock, then author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Stamp {
    pub clock: u64,
    pub author: Uuid,
}

impl Stamp {
    pub const fn new(clock: u64, author: Uuid) -> Self {
        Self { clock, author }
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.clock, self.author)
    }
}

/// Two writes to the same field share a stamp but disagree on the value.
///
/// Well-formed writers never produce this: an author never reuses a clock.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("conflicting writes to {field} share stamp {stamp}")]
pub struct MergeConflict {
    pub field: &'static str,
    pub stamp: Stamp,
}

pub trait Merge: Sized {
    fn merge(&self, other: &Self) -> Result<Self, MergeConflict>;
}

/// Later of two optional stamps.
pub fn max_stamp(left: Option<Stamp>, right: Option<Stamp>) -> Option<Stamp> {
    match (left, right) {
        (Some(left), Some(right)) => Some(left.max(right)),
        (left, None) => left,
        (None, right) => right,
    }
}
