//! L2: the scheduler. Owns every task's lifecycle, interprets yields,
//! posts wait records to the demultiplexer, and resumes tasks on
//! readiness, timeout, signal, or alarm — grounded in `ratchet_loop_once`
//! and the thread-state machine of `original_source/src/c/ratchet.c`.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use ratchet_types::{
    Direction, ErrorKind, PauseValue, RatchetError, ResumeValue, TaskId, WaitRecordId,
    WaitRecordKind,
};
use slab::Slab;
use tracing::{debug, warn};

use crate::alarm::AlarmState;
use crate::config::SchedulerConfig;
use crate::demux::{Demultiplexer, Fired};
use crate::task::{TaskFuture, TaskSlot, TaskStatus, WaitMeta, WaitMode};
use crate::wait::TaskHandle;

pub(crate) struct Inner {
    pub(crate) demux: Demultiplexer,
    pub(crate) tasks: Slab<TaskSlot>,
    pub(crate) ready: VecDeque<TaskId>,
    pub(crate) waiting_on: HashMap<TaskId, HashSet<TaskId>>,
    pub(crate) awaited_by: HashMap<TaskId, HashSet<TaskId>>,
    pub(crate) wait_meta: HashMap<WaitRecordId, WaitMeta>,
    pub(crate) alarm_records: HashMap<WaitRecordId, TaskId>,
    pub(crate) current: Option<TaskId>,
    pub(crate) live_count: usize,
    pub(crate) terminal_error: Option<RatchetError>,
    pub(crate) error_handler: Option<Box<dyn FnMut(&Scheduler, TaskId, &RatchetError) -> Result<(), RatchetError>>>,
    pub(crate) config: SchedulerConfig,
}

/// The singleton coordinator. Cheap to clone: every clone shares the same
/// underlying task registry, ready queue, and demultiplexer.
#[derive(Clone)]
pub struct Scheduler {
    pub(crate) inner: Rc<RefCell<Inner>>,
}

impl Scheduler {
    /// Construct a scheduler with one initial task, using default
    /// configuration and no top-level error handler.
    pub fn new<F, Fut>(entry: F) -> Result<Self, RatchetError>
    where
        F: FnOnce(TaskHandle) -> Fut + 'static,
        Fut: std::future::Future<Output = Result<(), RatchetError>> + 'static,
    {
        Self::with_config(SchedulerConfig::default(), entry)
    }

    pub fn with_config<F, Fut>(config: SchedulerConfig, entry: F) -> Result<Self, RatchetError>
    where
        F: FnOnce(TaskHandle) -> Fut + 'static,
        Fut: std::future::Future<Output = Result<(), RatchetError>> + 'static,
    {
        let demux = Demultiplexer::new()?;
        let inner = Rc::new(RefCell::new(Inner {
            demux,
            tasks: Slab::new(),
            ready: VecDeque::new(),
            waiting_on: HashMap::new(),
            awaited_by: HashMap::new(),
            wait_meta: HashMap::new(),
            alarm_records: HashMap::new(),
            current: None,
            live_count: 0,
            terminal_error: None,
            error_handler: None,
            config,
        }));
        let scheduler = Scheduler { inner };
        scheduler.spawn(entry);
        Ok(scheduler)
    }

    /// Install the top-level error handler. An error from a task with no
    /// handler configured propagates out of `run_until_done`/`run_one_tick`.
    pub fn with_error_handler<H>(self, handler: H) -> Self
    where
        H: FnMut(&Scheduler, TaskId, &RatchetError) -> Result<(), RatchetError> + 'static,
    {
        self.inner.borrow_mut().error_handler = Some(Box::new(handler));
        self
    }

    pub fn spawn<F, Fut>(&self, body: F) -> TaskId
    where
        F: FnOnce(TaskHandle) -> Fut + 'static,
        Fut: std::future::Future<Output = Result<(), RatchetError>> + 'static,
    {
        let slot_key = self.inner.borrow_mut().tasks.insert(TaskSlot::placeholder());
        let task_id = TaskId::from_raw(slot_key);
        let handle = TaskHandle::new(self.inner.clone(), task_id);
        let future: TaskFuture = Box::pin(body(handle));

        let mut inner = self.inner.borrow_mut();
        inner.tasks[slot_key].future = Some(future);
        inner.tasks[slot_key].status = TaskStatus::Ready;
        inner.live_count += 1;
        inner.ready.push_back(task_id);
        debug!(task = %task_id, "spawned task");
        task_id
    }

    pub fn num_tasks(&self) -> usize {
        self.inner.borrow().live_count
    }

    pub fn current_task(&self) -> Option<TaskId> {
        self.inner.borrow().current
    }

    pub fn status(&self, task_id: TaskId) -> Option<TaskStatus> {
        self.inner.borrow().tasks.get(task_id.raw()).map(|s| s.status)
    }

    pub fn final_error(&self, task_id: TaskId) -> Option<RatchetError> {
        self.inner.borrow().tasks.get(task_id.raw())?.final_error.clone()
    }

    /// Read a value the task itself stored via `TaskHandle::space`, after
    /// the task has finished — the mechanism by which a task's "return
    /// value" is observed (there is no generic async return channel; see
    /// the scratch-space convention in `task.rs`).
    pub fn space_get<T: Clone + 'static>(&self, task_id: TaskId, key: &str) -> Option<T> {
        self.inner.borrow().tasks.get(task_id.raw())?.scratch.get::<T>(key).cloned()
    }

    pub fn kill(&self, task_id: TaskId) {
        let was_alive = self
            .inner
            .borrow()
            .tasks
            .get(task_id.raw())
            .map(|s| !matches!(s.status, TaskStatus::Done | TaskStatus::Failed))
            .unwrap_or(false);
        if !was_alive {
            return;
        }
        self.teardown_wait_state(task_id);
        self.cancel_alarm(task_id);

        let joiners = {
            let mut inner = self.inner.borrow_mut();
            if let Some(slot) = inner.tasks.get_mut(task_id.raw()) {
                slot.future = None;
                slot.status = TaskStatus::Done; // killed counts as Done for WaitAll
            }
            inner.live_count = inner.live_count.saturating_sub(1);
            inner.ready.retain(|t| *t != task_id);
            inner.awaited_by.remove(&task_id).unwrap_or_default()
        };
        self.release_joiners(task_id, joiners);
        debug!(task = %task_id, "killed task");
    }

    pub fn kill_all(&self, tasks: &[TaskId]) {
        for t in tasks {
            self.kill(*t);
        }
    }

    pub fn unpause(&self, task_id: TaskId, values: Vec<PauseValue>) -> Result<(), RatchetError> {
        let is_paused = self
            .inner
            .borrow()
            .tasks
            .get(task_id.raw())
            .map(|s| s.is_paused)
            .unwrap_or(false);
        if !is_paused {
            return Err(RatchetError::new(
                "Scheduler::unpause",
                ErrorKind::Einval,
                "task is not paused",
            ));
        }
        self.complete_wait(task_id, ResumeValue::Unpaused(values));
        Ok(())
    }

    pub(crate) fn set_alarm(
        &self,
        task_id: TaskId,
        duration: Duration,
        callback: Option<Box<dyn FnMut(&Scheduler) -> Result<(), RatchetError>>>,
    ) -> Result<(), RatchetError> {
        self.cancel_alarm(task_id);
        let deadline = Instant::now() + duration;
        let mut inner = self.inner.borrow_mut();
        let wait_id = inner.demux.arm(WaitRecordKind::Timeout, Some(deadline))?;
        inner.alarm_records.insert(wait_id, task_id);
        if let Some(slot) = inner.tasks.get_mut(task_id.raw()) {
            slot.alarm = Some(AlarmState {
                deadline,
                wait_record: wait_id,
                callback,
            });
        }
        Ok(())
    }

    fn cancel_alarm(&self, task_id: TaskId) {
        let mut inner = self.inner.borrow_mut();
        let prev = inner.tasks.get_mut(task_id.raw()).and_then(|s| s.alarm.take());
        if let Some(alarm) = prev {
            inner.demux.cancel(alarm.wait_record);
            inner.alarm_records.remove(&alarm.wait_record);
        }
    }

    /// Run one scheduling iteration. Returns `false` once no tasks remain
    /// live (the scheduler is finished); `Err` on DEADLOCK or an
    /// unhandled/escalated task error.
    pub fn run_one_tick(&self, timeout: Option<Duration>) -> Result<bool, RatchetError> {
        loop {
            self.drain_ready()?;

            let live = self.inner.borrow().live_count;
            if live == 0 {
                return Ok(false);
            }
            if self.inner.borrow().ready.is_empty() {
                break;
            }
        }

        if self.inner.borrow().demux.is_idle() {
            let live = self.inner.borrow().live_count;
            if live > 0 {
                warn!("no ready tasks and no wait record armed");
                return Err(RatchetError::new(
                    "Scheduler::run_one_tick",
                    ErrorKind::Deadlock,
                    "no ready tasks and no wait record armed",
                ));
            }
            return Ok(false);
        }

        let fired = {
            let mut inner = self.inner.borrow_mut();
            inner.demux.tick(timeout)?
        };
        if fired.is_empty() {
            let live = self.inner.borrow().live_count;
            return if live > 0 {
                warn!("no ready tasks and no wait record fired");
                Err(RatchetError::new(
                    "Scheduler::run_one_tick",
                    ErrorKind::Deadlock,
                    "no ready tasks and no wait record fired",
                ))
            } else {
                Ok(false)
            };
        }

        debug!(woken = fired.len(), "demultiplexer tick fired");
        for (wait_id, fired_kind) in fired {
            let is_yield = self.inner.borrow().wait_meta.contains_key(&wait_id);
            if is_yield {
                self.resume_from_wait_record(wait_id, fired_kind);
            } else if let Some(task_id) = self.inner.borrow_mut().alarm_records.remove(&wait_id) {
                self.fire_alarm(task_id);
            }
            self.check_terminal_error()?;
        }
        Ok(true)
    }

    pub fn run_until_done(&self) -> Result<(), RatchetError> {
        while self.run_one_tick(None)? {}
        Ok(())
    }

    pub fn run_until(&self, mut predicate: impl FnMut(&Scheduler) -> bool) -> Result<(), RatchetError> {
        while !predicate(self) {
            if !self.run_one_tick(None)? {
                break;
            }
        }
        Ok(())
    }

    fn drain_ready(&self) -> Result<(), RatchetError> {
        loop {
            let next = self.inner.borrow_mut().ready.pop_front();
            let Some(task_id) = next else { break };
            self.poll_task(task_id);
            self.check_terminal_error()?;
        }
        Ok(())
    }

    fn check_terminal_error(&self) -> Result<(), RatchetError> {
        if let Some(err) = self.inner.borrow_mut().terminal_error.take() {
            return Err(err);
        }
        Ok(())
    }

    fn poll_task(&self, task_id: TaskId) {
        let fut_opt = {
            let mut inner = self.inner.borrow_mut();
            if let Some(slot) = inner.tasks.get_mut(task_id.raw()) {
                slot.status = TaskStatus::Running;
                slot.future.take()
            } else {
                None
            }
        };
        let Some(mut fut) = fut_opt else { return };

        let prev_current = self.inner.borrow_mut().current.replace(task_id);
        let waker: &Waker = Waker::noop();
        let mut cx = Context::from_waker(waker);
        let poll_result = fut.as_mut().poll(&mut cx);
        self.inner.borrow_mut().current = prev_current;

        match poll_result {
            Poll::Ready(result) => self.finish_task(task_id, result),
            Poll::Pending => {
                let payload = {
                    let mut inner = self.inner.borrow_mut();
                    if let Some(slot) = inner.tasks.get_mut(task_id.raw()) {
                        slot.future = Some(fut);
                        slot.pending_yield.take()
                    } else {
                        None
                    }
                };
                if let Some(payload) = payload {
                    self.handle_yield(task_id, payload);
                }
            }
        }
    }

    fn handle_yield(&self, task_id: TaskId, payload: ratchet_types::YieldPayload) {
        use ratchet_types::YieldPayload as Y;
        match payload {
            Y::Read { fd, deadline } => {
                self.arm_simple(task_id, WaitRecordKind::FdRead { fd }, deadline, WaitMode::ReadWrite)
            }
            Y::Write { fd, deadline } => {
                self.arm_simple(task_id, WaitRecordKind::FdWrite { fd }, deadline, WaitMode::ReadWrite)
            }
            Y::Signal { signum, deadline } => self.arm_signal(task_id, signum, deadline),
            Y::Timeout { duration } => {
                let deadline = Instant::now() + duration;
                self.arm_simple(task_id, WaitRecordKind::Timeout, Some(deadline), WaitMode::PlainTimeout)
            }
            Y::MultiRw { reads, writes, deadline } => self.arm_multi_rw(task_id, reads, writes, deadline),
            Y::WaitAll { tasks } => self.arm_wait_all(task_id, tasks),
            Y::Pause => {
                let mut inner = self.inner.borrow_mut();
                if let Some(slot) = inner.tasks.get_mut(task_id.raw()) {
                    slot.status = TaskStatus::Waiting;
                    slot.is_paused = true;
                }
            }
            Y::GetScheduler => self.complete_wait(task_id, ResumeValue::Scheduler),
        }
    }

    fn arm_simple(&self, task_id: TaskId, kind: WaitRecordKind, deadline: Option<Instant>, mode: WaitMode) {
        let mut inner = self.inner.borrow_mut();
        match inner.demux.arm(kind.clone(), deadline) {
            Ok(id) => {
                inner.wait_meta.insert(id, WaitMeta { owner: task_id, kind, mode });
                if let Some(slot) = inner.tasks.get_mut(task_id.raw()) {
                    slot.wait_records.push(id);
                    slot.wait_mode = Some(mode);
                    slot.status = TaskStatus::Waiting;
                }
            }
            Err(e) => {
                drop(inner);
                self.fail_yield(task_id, e);
            }
        }
    }

    fn arm_signal(&self, task_id: TaskId, signum: i32, deadline: Option<Instant>) {
        let mut inner = self.inner.borrow_mut();
        let sig_id = match inner.demux.arm(WaitRecordKind::Signal { signum }, None) {
            Ok(id) => id,
            Err(e) => {
                drop(inner);
                self.fail_yield(task_id, e);
                return;
            }
        };
        inner.wait_meta.insert(
            sig_id,
            WaitMeta {
                owner: task_id,
                kind: WaitRecordKind::Signal { signum },
                mode: WaitMode::Signal,
            },
        );
        let mut records = vec![sig_id];
        if let Some(dl) = deadline {
            match inner.demux.arm(WaitRecordKind::Timeout, Some(dl)) {
                Ok(timeout_id) => {
                    inner.wait_meta.insert(
                        timeout_id,
                        WaitMeta {
                            owner: task_id,
                            kind: WaitRecordKind::Timeout,
                            mode: WaitMode::Signal,
                        },
                    );
                    records.push(timeout_id);
                }
                Err(e) => {
                    inner.demux.cancel(sig_id);
                    inner.wait_meta.remove(&sig_id);
                    drop(inner);
                    self.fail_yield(task_id, e);
                    return;
                }
            }
        }
        if let Some(slot) = inner.tasks.get_mut(task_id.raw()) {
            slot.wait_records = records;
            slot.wait_mode = Some(WaitMode::Signal);
            slot.status = TaskStatus::Waiting;
        }
    }

    fn arm_multi_rw(
        &self,
        task_id: TaskId,
        reads: Vec<std::os::fd::RawFd>,
        writes: Vec<std::os::fd::RawFd>,
        deadline: Option<Instant>,
    ) {
        let mut inner = self.inner.borrow_mut();
        let mut records = Vec::new();
        let mut failed = None;
        for fd in &reads {
            let kind = WaitRecordKind::FdRead { fd: *fd };
            match inner.demux.arm(kind.clone(), deadline) {
                Ok(id) => {
                    inner.wait_meta.insert(id, WaitMeta { owner: task_id, kind, mode: WaitMode::MultiRw });
                    records.push(id);
                }
                Err(e) => {
                    failed = Some(e);
                    break;
                }
            }
        }
        if failed.is_none() {
            for fd in &writes {
                let kind = WaitRecordKind::FdWrite { fd: *fd };
                match inner.demux.arm(kind.clone(), deadline) {
                    Ok(id) => {
                        inner.wait_meta.insert(id, WaitMeta { owner: task_id, kind, mode: WaitMode::MultiRw });
                        records.push(id);
                    }
                    Err(e) => {
                        failed = Some(e);
                        break;
                    }
                }
            }
        }
        // A bare deadline (possibly with no fds at all) still needs its own
        // Timeout record — otherwise block_on(reads=[], writes=[], deadline)
        // arms nothing and the task waits forever.
        if failed.is_none() {
            if let Some(dl) = deadline {
                match inner.demux.arm(WaitRecordKind::Timeout, Some(dl)) {
                    Ok(id) => {
                        inner.wait_meta.insert(id, WaitMeta { owner: task_id, kind: WaitRecordKind::Timeout, mode: WaitMode::MultiRw });
                        records.push(id);
                    }
                    Err(e) => failed = Some(e),
                }
            }
        }
        if let Some(e) = failed {
            for r in &records {
                inner.demux.cancel(*r);
                inner.wait_meta.remove(r);
            }
            drop(inner);
            self.fail_yield(task_id, e);
            return;
        }
        if let Some(slot) = inner.tasks.get_mut(task_id.raw()) {
            slot.wait_records = records;
            slot.wait_mode = Some(WaitMode::MultiRw);
            slot.status = TaskStatus::Waiting;
        }
    }

    fn arm_wait_all(&self, task_id: TaskId, tasks: Vec<TaskId>) {
        let mut inner = self.inner.borrow_mut();
        let remaining: HashSet<TaskId> = tasks
            .iter()
            .copied()
            .filter(|t| {
                inner
                    .tasks
                    .get(t.raw())
                    .map(|s| !matches!(s.status, TaskStatus::Done | TaskStatus::Failed))
                    .unwrap_or(false)
            })
            .collect();
        if remaining.is_empty() {
            drop(inner);
            self.complete_wait(task_id, ResumeValue::AllDone);
            return;
        }
        for t in &remaining {
            inner.awaited_by.entry(*t).or_default().insert(task_id);
        }
        inner.waiting_on.insert(task_id, remaining);
        if let Some(slot) = inner.tasks.get_mut(task_id.raw()) {
            slot.status = TaskStatus::Waiting;
            slot.wait_mode = None;
        }
    }

    fn fail_yield(&self, task_id: TaskId, err: RatchetError) {
        let mut inner = self.inner.borrow_mut();
        if let Some(slot) = inner.tasks.get_mut(task_id.raw()) {
            slot.injected_error = Some(err);
            slot.status = TaskStatus::Ready;
        }
        inner.ready.push_back(task_id);
    }

    fn resume_from_wait_record(&self, fired_id: WaitRecordId, fired: Fired) {
        let meta = self.inner.borrow_mut().wait_meta.remove(&fired_id);
        let Some(meta) = meta else { return };
        let task_id = meta.owner;

        let siblings = {
            let mut inner = self.inner.borrow_mut();
            if let Some(slot) = inner.tasks.get_mut(task_id.raw()) {
                std::mem::take(&mut slot.wait_records)
            } else {
                Vec::new()
            }
        };
        {
            let mut inner = self.inner.borrow_mut();
            for sib in &siblings {
                if *sib != fired_id {
                    inner.demux.cancel(*sib);
                    inner.wait_meta.remove(sib);
                }
            }
        }

        let mode = self
            .inner
            .borrow()
            .tasks
            .get(task_id.raw())
            .and_then(|s| s.wait_mode)
            .unwrap_or(WaitMode::ReadWrite);

        let resume_value = match (mode, &meta.kind, fired) {
            (WaitMode::ReadWrite, _, Fired::Ready) => ResumeValue::Ready(true),
            (WaitMode::ReadWrite, _, Fired::TimedOut) => ResumeValue::Ready(false),
            (WaitMode::Signal, WaitRecordKind::Signal { signum }, Fired::Ready) => ResumeValue::Signal(*signum),
            (WaitMode::MultiRw, WaitRecordKind::FdRead { fd }, Fired::Ready) => {
                ResumeValue::MultiRw { fd: *fd, direction: Direction::Read }
            }
            (WaitMode::MultiRw, WaitRecordKind::FdWrite { fd }, Fired::Ready) => {
                ResumeValue::MultiRw { fd: *fd, direction: Direction::Write }
            }
            _ => ResumeValue::TimedOut,
        };

        self.complete_wait(task_id, resume_value);
    }

    fn fire_alarm(&self, task_id: TaskId) {
        let callback = {
            let mut inner = self.inner.borrow_mut();
            inner.tasks.get_mut(task_id.raw()).and_then(|s| s.alarm.take()).and_then(|a| a.callback)
        };
        if let Some(mut cb) = callback {
            let scheduler = self.clone();
            if let Err(e) = cb(&scheduler) {
                warn!(task = %task_id, error = %e, "alarm callback failed");
            }
        }
        let alive = self
            .inner
            .borrow()
            .tasks
            .get(task_id.raw())
            .map(|s| !matches!(s.status, TaskStatus::Done | TaskStatus::Failed))
            .unwrap_or(false);
        if !alive {
            return;
        }
        warn!(task = %task_id, "alarm expired");
        let err = RatchetError::new("Scheduler::alarm", ErrorKind::Alarm, "alarm expired");
        self.teardown_wait_state(task_id);
        let mut inner = self.inner.borrow_mut();
        if let Some(slot) = inner.tasks.get_mut(task_id.raw()) {
            slot.injected_error = Some(err);
            slot.status = TaskStatus::Ready;
        }
        inner.ready.push_back(task_id);
    }

    fn complete_wait(&self, task_id: TaskId, resume_value: ResumeValue) {
        self.teardown_wait_state(task_id);
        let mut inner = self.inner.borrow_mut();
        if let Some(slot) = inner.tasks.get_mut(task_id.raw()) {
            slot.resume_value = Some(resume_value);
            slot.status = TaskStatus::Ready;
        }
        inner.ready.push_back(task_id);
    }

    fn teardown_wait_state(&self, task_id: TaskId) {
        let mut inner = self.inner.borrow_mut();
        let records = if let Some(slot) = inner.tasks.get_mut(task_id.raw()) {
            slot.wait_mode = None;
            slot.is_paused = false;
            std::mem::take(&mut slot.wait_records)
        } else {
            Vec::new()
        };
        for r in &records {
            inner.demux.cancel(*r);
            inner.wait_meta.remove(r);
        }
        inner.waiting_on.remove(&task_id);
    }

    fn finish_task(&self, task_id: TaskId, result: Result<(), RatchetError>) {
        self.teardown_wait_state(task_id);
        self.cancel_alarm(task_id);

        let failed = result.is_err();
        let joiners = {
            let mut inner = self.inner.borrow_mut();
            if let Some(slot) = inner.tasks.get_mut(task_id.raw()) {
                slot.future = None;
                slot.status = if failed { TaskStatus::Failed } else { TaskStatus::Done };
                slot.final_error = result.err();
            }
            inner.live_count = inner.live_count.saturating_sub(1);
            inner.awaited_by.remove(&task_id).unwrap_or_default()
        };
        self.release_joiners(task_id, joiners);

        let err_for_handler = self.inner.borrow().tasks.get(task_id.raw()).and_then(|s| s.final_error.clone());
        if let Some(err) = err_for_handler {
            warn!(task = %task_id, error = %err, "task failed");
            self.invoke_error_handler(task_id, err);
        }
    }

    fn release_joiners(&self, finished: TaskId, joiners: HashSet<TaskId>) {
        let mut newly_ready = Vec::new();
        {
            let mut inner = self.inner.borrow_mut();
            for joiner in joiners {
                if let Some(set) = inner.waiting_on.get_mut(&joiner) {
                    set.remove(&finished);
                    if set.is_empty() {
                        inner.waiting_on.remove(&joiner);
                        newly_ready.push(joiner);
                    }
                }
            }
        }
        for joiner in newly_ready {
            self.complete_wait(joiner, ResumeValue::AllDone);
        }
    }

    fn invoke_error_handler(&self, task_id: TaskId, err: RatchetError) {
        let handler = self.inner.borrow_mut().error_handler.take();
        match handler {
            Some(mut handler) => {
                let scheduler = self.clone();
                let result = handler(&scheduler, task_id, &err);
                self.inner.borrow_mut().error_handler = Some(handler);
                if let Err(e) = result {
                    let mut inner = self.inner.borrow_mut();
                    if inner.terminal_error.is_none() {
                        inner.terminal_error = Some(e);
                    }
                }
            }
            None => {
                let mut inner = self.inner.borrow_mut();
                if inner.terminal_error.is_none() {
                    inner.terminal_error = Some(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test_log::test]
    fn task_runs_to_completion() {
        let scheduler = Scheduler::new(|_handle| async move { Ok(()) }).unwrap();
        scheduler.run_until_done().unwrap();
        assert_eq!(scheduler.num_tasks(), 0);
    }

    #[test_log::test]
    fn timer_resumes_after_duration() {
        let start = Instant::now();
        let scheduler = Scheduler::new(|handle| async move {
            handle.timer(Duration::from_millis(20)).await?;
            Ok(())
        })
        .unwrap();
        scheduler.run_until_done().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test_log::test]
    fn wait_all_resumes_after_every_sibling_is_done() {
        let start = Instant::now();
        let scheduler = Scheduler::new(|handle| async move {
            let durations = [
                Duration::from_millis(30),
                Duration::from_millis(60),
                Duration::from_millis(90),
            ];
            let mut children = Vec::new();
            for (i, d) in durations.into_iter().enumerate() {
                let id = handle.spawn(move |child| async move {
                    child.timer(d).await?;
                    child.with_space(|s| s.set("index", i as i64));
                    Ok(())
                });
                children.push(id);
            }
            handle.wait_all(children.clone()).await?;
            handle.with_space(|s| s.set("children", children));
            Ok(())
        })
        .unwrap();
        let entry = TaskId::from_raw(0);
        scheduler.run_until_done().unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(90));
        assert!(elapsed < Duration::from_millis(200));
        let children: Vec<TaskId> = scheduler.space_get(entry, "children").unwrap();
        for (i, child) in children.iter().enumerate() {
            let index: i64 = scheduler.space_get(*child, "index").unwrap();
            assert_eq!(index, i as i64);
        }
    }

    #[test_log::test]
    fn alarm_preempts_a_wait_that_would_never_fire() {
        let (read_fd, _write_fd) = nix::unistd::pipe().unwrap();
        let start = Instant::now();
        let scheduler = Scheduler::new(move |handle| async move {
            handle.alarm(Duration::from_millis(20), None)?;
            handle.wait_read(&read_fd).await?;
            Ok(())
        })
        .unwrap();
        let entry = TaskId::from_raw(0);
        scheduler.run_until_done().unwrap();
        assert_eq!(scheduler.status(entry), Some(TaskStatus::Failed));
        assert_eq!(scheduler.final_error(entry).unwrap(), ErrorKind::Alarm);
        assert!(start.elapsed() < Duration::from_millis(150));
    }

    #[test_log::test]
    fn alarm_callback_runs_before_the_unconditional_error() {
        let ran = Arc::new(Mutex::new(false));
        let ran_clone = ran.clone();
        let (read_fd, _write_fd) = nix::unistd::pipe().unwrap();
        let scheduler = Scheduler::new(move |handle| {
            let ran = ran_clone.clone();
            async move {
                let cb: Box<dyn FnMut(&Scheduler) -> Result<(), RatchetError>> = Box::new(move |_s| {
                    *ran.lock().unwrap() = true;
                    Ok(())
                });
                handle.alarm(Duration::from_millis(10), Some(cb))?;
                handle.wait_read(&read_fd).await?;
                Ok(())
            }
        })
        .unwrap();
        scheduler.run_until_done().unwrap();
        assert!(*ran.lock().unwrap());
    }

    #[test_log::test]
    fn kill_is_idempotent_and_releases_waitall_joiners() {
        let scheduler = Scheduler::new(|handle| async move {
            let (read_fd, _write_fd) = nix::unistd::pipe().unwrap();
            let victim = handle.spawn(move |child| async move {
                child.wait_read(&read_fd).await?;
                Ok(())
            });
            let sched = handle.get_scheduler().await?;
            sched.kill(victim);
            sched.kill(victim);
            handle.wait_all(vec![victim]).await?;
            Ok(())
        })
        .unwrap();
        scheduler.run_until_done().unwrap();
        assert_eq!(scheduler.num_tasks(), 0);
    }

    #[test_log::test]
    fn pause_resumes_with_exactly_the_values_given() {
        // A sibling task keeps the demultiplexer tick busy (its own timer)
        // long enough to drive the unpause from within normal scheduling,
        // rather than relying on an external driver thread.
        let resumed_with = Arc::new(Mutex::new(None));
        let resumed_with_clone = resumed_with.clone();
        let scheduler = Scheduler::new(move |handle| {
            let resumed_with = resumed_with_clone.clone();
            async move {
                let paused = handle.spawn(move |child| {
                    let resumed_with = resumed_with.clone();
                    async move {
                        let values = child.pause().await?;
                        *resumed_with.lock().unwrap() = Some(values);
                        Ok(())
                    }
                });
                handle.timer(Duration::from_millis(15)).await?;
                let sched = handle.get_scheduler().await?;
                sched.unpause(paused, vec![PauseValue::Int(1), PauseValue::Text("x".into())])?;
                handle.wait_all(vec![paused]).await?;
                Ok(())
            }
        })
        .unwrap();
        scheduler.run_until_done().unwrap();
        let values = resumed_with.lock().unwrap().take().unwrap();
        assert_eq!(values.len(), 2);
        match &values[0] {
            PauseValue::Int(1) => {}
            other => panic!("unexpected first value: {other:?}"),
        }
    }

    #[test_log::test]
    fn deadlock_is_reported_when_nothing_can_ever_wake_a_waiting_task() {
        let scheduler = Scheduler::new(|handle| async move {
            let _ = handle.pause().await?;
            Ok(())
        })
        .unwrap();
        let err = scheduler.run_until_done().unwrap_err();
        // `pause()` has no armed wait record at all, so the very next tick's
        // demultiplexer poll has nothing to report and nothing pending.
        assert_eq!(err, ErrorKind::Deadlock);
    }
}
