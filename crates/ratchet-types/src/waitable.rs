//! The capability interface an io-object must satisfy to be armed against
//! the demultiplexer, replacing the source's duck-typed "anything with
//! `get_fd` and optionally `get_timeout`" object model.

use std::os::fd::RawFd;
use std::time::Instant;

/// Anything that can be waited on by [`crate::YieldPayload::Read`],
/// [`crate::YieldPayload::Write`], or as a member of a
/// [`crate::YieldPayload::MultiRw`] set.
pub trait Waitable {
    fn fd(&self) -> RawFd;

    /// A per-object deadline, consulted to derive the wait record's deadline
    /// when the caller didn't supply one explicitly.
    fn deadline(&self) -> Option<Instant> {
        None
    }
}

impl Waitable for RawFd {
    fn fd(&self) -> RawFd {
        *self
    }
}
