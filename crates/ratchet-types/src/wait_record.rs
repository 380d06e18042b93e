//! The wait record data model (§3): a token representing a single pending
//! condition registered with the demultiplexer.

use std::os::fd::RawFd;
use std::time::Instant;

use crate::ids::TaskId;

#[derive(Clone, Debug)]
pub enum WaitRecordKind {
    FdRead { fd: RawFd },
    FdWrite { fd: RawFd },
    Signal { signum: i32 },
    /// A bare deadline with no associated fd or signal.
    Timeout,
}

/// A single armed wait, owned by exactly one task.
///
/// Invariant: a wait record never outlives its task nor the scheduler. When
/// any record belonging to the same yield fires, every sibling record of
/// that yield is cancelled before the task resumes — enforced by
/// `ratchet-core`'s scheduler, which always arms and tears down a yield's
/// wait records as a unit.
#[derive(Clone, Debug)]
pub struct WaitRecord {
    pub kind: WaitRecordKind,
    pub owner: TaskId,
    pub deadline: Option<Instant>,
}

impl WaitRecord {
    pub fn new(kind: WaitRecordKind, owner: TaskId, deadline: Option<Instant>) -> Self {
        Self {
            kind,
            owner,
            deadline,
        }
    }
}
