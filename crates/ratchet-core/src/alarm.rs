//! Per-task alarm records (§3 Alarm record, §4.2 Alarm semantics).

use std::time::Instant;

use ratchet_types::{RatchetError, WaitRecordId};

use crate::scheduler::Scheduler;

/// A pending alarm on one task. Replacing an alarm cancels the previous one
/// (see `Scheduler::alarm`); there is at most one live `AlarmState` per task.
pub(crate) struct AlarmState {
    pub deadline: Instant,
    pub wait_record: WaitRecordId,
    pub callback: Option<Box<dyn FnMut(&Scheduler) -> Result<(), RatchetError>>>,
}
