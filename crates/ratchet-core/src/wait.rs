//! L3: the wait primitives a task uses to suspend, plus `TaskHandle`, the
//! capability a spawned task's body is given instead of a bare scheduler
//! reference — grounded in `ratchet_block_on`, `ratchet_sigwait`,
//! `ratchet_wait_all`, `ratchet_timer`, `ratchet_pause`/`ratchet_unpause`,
//! and `ratchet_alarm` (`original_source/src/c/ratchet.c`).

use std::cell::RefCell;
use std::future::Future;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use ratchet_types::{
    Direction, ErrorKind, PauseValue, RatchetError, ResumeValue, TaskId, Waitable, YieldPayload,
};

use crate::scheduler::{Inner, Scheduler};
use crate::task::Scratch;

/// One suspension point: on first poll, stash a `YieldPayload` into the
/// task's slot and return `Pending`; on every later poll, check for an
/// injected error (alarm/kill preemption) before consulting the resume
/// value the scheduler deposited.
struct YieldFuture<T> {
    inner: Rc<RefCell<Inner>>,
    task_id: TaskId,
    payload: Option<YieldPayload>,
    extract: fn(ResumeValue) -> Result<T, RatchetError>,
}

impl<T> Future for YieldFuture<T> {
    type Output = Result<T, RatchetError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.inner.borrow_mut();
        let Some(slot) = inner.tasks.get_mut(this.task_id.raw()) else {
            return Poll::Ready(Err(RatchetError::new(
                "YieldFuture::poll",
                ErrorKind::Einval,
                "task no longer registered",
            )));
        };
        if let Some(err) = slot.injected_error.take() {
            return Poll::Ready(Err(err));
        }
        if let Some(payload) = this.payload.take() {
            slot.pending_yield = Some(payload);
            return Poll::Pending;
        }
        match slot.resume_value.take() {
            Some(rv) => Poll::Ready((this.extract)(rv)),
            None => Poll::Pending,
        }
    }
}

fn expect_ready(rv: ResumeValue) -> Result<bool, RatchetError> {
    match rv {
        ResumeValue::Ready(b) => Ok(b),
        _ => unreachable!("scheduler resumed a Read/Write yield with a mismatched value"),
    }
}

fn expect_signal(rv: ResumeValue) -> Result<i32, RatchetError> {
    match rv {
        ResumeValue::Signal(s) => Ok(s),
        ResumeValue::TimedOut => Ok(0),
        _ => unreachable!("scheduler resumed a Signal yield with a mismatched value"),
    }
}

fn expect_timed_out(rv: ResumeValue) -> Result<(), RatchetError> {
    match rv {
        ResumeValue::TimedOut => Ok(()),
        _ => unreachable!("scheduler resumed a Timeout yield with a mismatched value"),
    }
}

fn expect_multi_rw(rv: ResumeValue) -> Result<Option<(RawFd, Direction)>, RatchetError> {
    match rv {
        ResumeValue::MultiRw { fd, direction } => Ok(Some((fd, direction))),
        ResumeValue::TimedOut => Ok(None),
        _ => unreachable!("scheduler resumed a MultiRw yield with a mismatched value"),
    }
}

fn expect_all_done(rv: ResumeValue) -> Result<(), RatchetError> {
    match rv {
        ResumeValue::AllDone => Ok(()),
        _ => unreachable!("scheduler resumed a WaitAll yield with a mismatched value"),
    }
}

fn expect_unpaused(rv: ResumeValue) -> Result<Vec<PauseValue>, RatchetError> {
    match rv {
        ResumeValue::Unpaused(values) => Ok(values),
        _ => unreachable!("scheduler resumed a Pause yield with a mismatched value"),
    }
}

fn expect_scheduler(rv: ResumeValue) -> Result<(), RatchetError> {
    match rv {
        ResumeValue::Scheduler => Ok(()),
        _ => unreachable!("scheduler resumed a GetScheduler yield with a mismatched value"),
    }
}

/// The capability a task body receives in place of a bare `Scheduler`
/// reference. Every wait primitive in §4.3 is a method here.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Rc<RefCell<Inner>>,
    task_id: TaskId,
}

impl TaskHandle {
    pub(crate) fn new(inner: Rc<RefCell<Inner>>, task_id: TaskId) -> Self {
        Self { inner, task_id }
    }

    fn yield_for<T>(&self, payload: YieldPayload, extract: fn(ResumeValue) -> Result<T, RatchetError>) -> YieldFuture<T> {
        YieldFuture {
            inner: self.inner.clone(),
            task_id: self.task_id,
            payload: Some(payload),
            extract,
        }
    }

    pub fn self_task(&self) -> TaskId {
        self.task_id
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler { inner: self.inner.clone() }
    }

    /// Wait for `io` to become readable. `Ok(true)` means ready, `Ok(false)`
    /// means the deadline elapsed first.
    pub async fn wait_read(&self, io: &impl Waitable) -> Result<bool, RatchetError> {
        let fd = io.fd();
        let deadline = io.deadline();
        self.yield_for(YieldPayload::Read { fd, deadline }, expect_ready).await
    }

    pub async fn wait_write(&self, io: &impl Waitable) -> Result<bool, RatchetError> {
        let fd = io.fd();
        let deadline = io.deadline();
        self.yield_for(YieldPayload::Write { fd, deadline }, expect_ready).await
    }

    /// `block_on(reads, writes, deadline)`: yields `MultiRw`. Resolves with
    /// the fd/direction that fired, or `None` on timeout.
    pub async fn block_on(
        &self,
        reads: Vec<RawFd>,
        writes: Vec<RawFd>,
        deadline: Option<Instant>,
    ) -> Result<Option<(RawFd, Direction)>, RatchetError> {
        self.yield_for(YieldPayload::MultiRw { reads, writes, deadline }, expect_multi_rw).await
    }

    /// Wait for delivery of `signum`, with no deadline. Returns the signal
    /// number (always `signum` itself, since the only thing that can fire
    /// this wait is the signal it names).
    pub async fn sigwait(&self, signum: i32) -> Result<i32, RatchetError> {
        self.yield_for(YieldPayload::Signal { signum, deadline: None }, expect_signal).await
    }

    pub async fn wait_all(&self, tasks: Vec<TaskId>) -> Result<(), RatchetError> {
        self.yield_for(YieldPayload::WaitAll { tasks }, expect_all_done).await
    }

    pub async fn timer(&self, duration: Duration) -> Result<(), RatchetError> {
        self.yield_for(YieldPayload::Timeout { duration }, expect_timed_out).await
    }

    /// Suspend until some external caller invokes `Scheduler::unpause`.
    pub async fn pause(&self) -> Result<Vec<PauseValue>, RatchetError> {
        self.yield_for(YieldPayload::Pause, expect_unpaused).await
    }

    /// Obtain the scheduler handle via the yield protocol (§4.2
    /// `GetScheduler`), so library code that only has a `TaskHandle` can
    /// still reach scheduler-level operations like `kill` without it being
    /// threaded through every call as an explicit argument.
    pub async fn get_scheduler(&self) -> Result<Scheduler, RatchetError> {
        self.yield_for(YieldPayload::GetScheduler, expect_scheduler).await?;
        Ok(self.scheduler())
    }

    pub fn alarm(
        &self,
        duration: Duration,
        callback: Option<Box<dyn FnMut(&Scheduler) -> Result<(), RatchetError>>>,
    ) -> Result<(), RatchetError> {
        self.scheduler().set_alarm(self.task_id, duration, callback)
    }

    pub fn spawn<F, Fut>(&self, body: F) -> TaskId
    where
        F: FnOnce(TaskHandle) -> Fut + 'static,
        Fut: Future<Output = Result<(), RatchetError>> + 'static,
    {
        self.scheduler().spawn(body)
    }

    pub fn kill(&self, task_id: TaskId) {
        self.scheduler().kill(task_id);
    }

    pub fn kill_all(&self, tasks: &[TaskId]) {
        self.scheduler().kill_all(tasks);
    }

    pub fn unpause(&self, task_id: TaskId, values: Vec<PauseValue>) -> Result<(), RatchetError> {
        self.scheduler().unpause(task_id, values)
    }

    /// Access this task's own scratch space (`space()`, §4.3). Other tasks
    /// read a finished task's space via `Scheduler::space_get`.
    pub fn with_space<R>(&self, f: impl FnOnce(&mut Scratch) -> R) -> R {
        let mut inner = self.inner.borrow_mut();
        let slot = inner.tasks.get_mut(self.task_id.raw()).expect("task alive");
        f(&mut slot.scratch)
    }
}
