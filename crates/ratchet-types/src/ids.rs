//! Opaque identities for scheduler-owned arenas.
//!
//! Tasks and wait records are never passed around by reference — the scheduler
//! is their sole owner (a `slab::Slab` arena in `ratchet-core`) and every other
//! part of the system refers to them by one of these ids. A stale id simply
//! fails to resolve rather than dangling.

use std::fmt;

macro_rules! opaque_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) usize);

        impl $name {
            /// Construct from a raw arena slot. Only meant to be called by the
            /// arena owner; kept `pub` so `ratchet-core` can build one without
            /// a circular dependency back into this crate.
            pub fn from_raw(slot: usize) -> Self {
                Self(slot)
            }

            pub fn raw(self) -> usize {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

opaque_id!(TaskId, "Identity of a live task in the scheduler's task arena.");
opaque_id!(
    WaitRecordId,
    "Identity of a single pending condition registered with the demultiplexer."
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_from_same_slot_are_equal_across_kinds_but_not_interchangeable() {
        let t = TaskId::from_raw(3);
        let w = WaitRecordId::from_raw(3);
        assert_eq!(t.raw(), w.raw());
        assert_eq!(format!("{t}"), "TaskId(3)");
        assert_eq!(format!("{w}"), "WaitRecordId(3)");
    }

    #[test]
    fn ids_order_by_raw_slot() {
        let a = TaskId::from_raw(1);
        let b = TaskId::from_raw(2);
        assert!(a < b);
    }
}
