//! The tagged value a suspending task hands to the scheduler.
//!
//! Mirrors the source's `YIELD_READ`/`YIELD_WRITE`/`YIELD_TIMEOUT`/
//! `YIELD_WAITALL`/`YIELD_MULTIRW`/`YIELD_PAUSE`/`YIELD_GET` sentinel tags
//! (plus `Signal`, dispatched separately in the source) as a sum type instead
//! of a pointer sentinel, per the light-tag-dispatch design note.

use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use crate::ids::TaskId;

#[derive(Clone, Debug)]
pub enum YieldPayload {
    /// Wait for `fd` to become readable. `deadline`, if set, is the absolute
    /// instant after which the wait resumes with a timeout result instead.
    Read { fd: RawFd, deadline: Option<Instant> },
    /// Symmetric to `Read`, for writability.
    Write { fd: RawFd, deadline: Option<Instant> },
    /// Wait for delivery of `signum`. `deadline` races the signal itself;
    /// whichever fires first cancels the other.
    Signal {
        signum: i32,
        deadline: Option<Instant>,
    },
    /// Wait unconditionally for `duration` to elapse.
    Timeout { duration: Duration },
    /// Wait for any of several fds to become ready in their given direction.
    MultiRw {
        reads: Vec<RawFd>,
        writes: Vec<RawFd>,
        deadline: Option<Instant>,
    },
    /// Wait for every task in `tasks` to reach Done, Failed, or killed.
    WaitAll { tasks: Vec<TaskId> },
    /// Suspend until explicitly resumed by `Scheduler::unpause`.
    Pause,
    /// Synthetic payload resolved immediately with the scheduler handle,
    /// never actually armed against the demultiplexer.
    GetScheduler,
}

/// The value a yielded task is resumed with, once its wait resolves.
#[derive(Clone, Debug)]
pub enum ResumeValue {
    /// `Read`/`Write`/one arm of `MultiRw` fired: `true` means ready,
    /// `false` means the deadline elapsed first.
    Ready(bool),
    /// A signal fired; carries the delivered signal number.
    Signal(i32),
    /// An unconditional timeout elapsed.
    TimedOut,
    /// `MultiRw` resolved on a specific fd.
    MultiRw { fd: RawFd, direction: Direction },
    /// `WaitAll`'s awaited set has fully drained.
    AllDone,
    /// `Pause` was released via `unpause`, carrying the values it was given.
    Unpaused(Vec<PauseValue>),
    /// `GetScheduler` resolved immediately.
    Scheduler,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// A loosely-typed value passed through `unpause`, since callers may hand a
/// task back arbitrary small values rather than one fixed type.
#[derive(Clone, Debug)]
pub enum PauseValue {
    Unit,
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_rw_payload_carries_both_sets() {
        let payload = YieldPayload::MultiRw {
            reads: vec![3, 4],
            writes: vec![5],
            deadline: None,
        };
        match payload {
            YieldPayload::MultiRw { reads, writes, .. } => {
                assert_eq!(reads, vec![3, 4]);
                assert_eq!(writes, vec![5]);
            }
            _ => panic!("expected MultiRw"),
        }
    }
}
