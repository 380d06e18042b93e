//! Task-local data model (§3 Task, §4.3 `self`/`space`).

use std::any::Any;
use std::collections::HashMap;

use ratchet_types::{RatchetError, WaitRecordId, YieldPayload};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    NotStarted,
    Ready,
    Running,
    Waiting,
    Done,
    Failed,
}

/// The shape of the yield currently outstanding for a task, used to decide
/// how a fired wait record's result is packaged back into a `ResumeValue` —
/// a plain `Read`/`Write` and a `MultiRw` can both arm the same
/// `WaitRecordKind::FdRead`, but resume with different shapes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WaitMode {
    ReadWrite,
    Signal,
    PlainTimeout,
    MultiRw,
}

/// Per-wait-record bookkeeping the scheduler needs beyond what the
/// demultiplexer itself tracks.
#[derive(Clone)]
pub(crate) struct WaitMeta {
    pub owner: ratchet_types::TaskId,
    pub kind: ratchet_types::WaitRecordKind,
    pub mode: WaitMode,
}

/// Task-local scratch space (`space()`/`task_local()`), a loosely-typed
/// mapping private to the owning task.
#[derive(Default)]
pub struct Scratch {
    values: HashMap<String, Box<dyn Any>>,
}

impl Scratch {
    pub fn set<T: Any>(&mut self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Box::new(value));
    }

    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.values.get(key).and_then(|v| v.downcast_ref())
    }

    pub fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }
}

pub(crate) type TaskFuture = std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), RatchetError>>>>;

pub(crate) struct TaskSlot {
    pub future: Option<TaskFuture>,
    pub status: TaskStatus,
    pub wait_records: Vec<WaitRecordId>,
    pub wait_mode: Option<WaitMode>,
    pub pending_yield: Option<YieldPayload>,
    pub resume_value: Option<ratchet_types::ResumeValue>,
    pub injected_error: Option<RatchetError>,
    pub is_paused: bool,
    pub scratch: Scratch,
    pub alarm: Option<super::alarm::AlarmState>,
    pub final_error: Option<RatchetError>,
}

impl TaskSlot {
    pub fn placeholder() -> Self {
        Self {
            future: None,
            status: TaskStatus::NotStarted,
            wait_records: Vec::new(),
            wait_mode: None,
            pending_yield: None,
            resume_value: None,
            injected_error: None,
            is_paused: false,
            scratch: Scratch::default(),
            alarm: None,
            final_error: None,
        }
    }
}
