//! L1: the event demultiplexer.
//!
//! Single point of truth for "which kernel descriptors / signals / timers is
//! the process currently waiting on." Grounded in `event_triggered`,
//! `signal_triggered`, `timeout_triggered`, and `ratchet_loop_once`
//! (`original_source/src/c/ratchet.c`), realized over `mio::Poll` instead of
//! libevent, with signal delivery folded into the same readiness path via a
//! self-pipe (a standard non-blocking-signal-handling idiom, since `mio`
//! itself has no signal source).

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::unistd;
use ratchet_types::{ErrorKind, RatchetError, WaitRecordId, WaitRecordKind};
use slab::Slab;

/// Highest signal number we'll route through the self-pipe. Linux's
/// real-time signal range tops out around 64; anything beyond that isn't a
/// signal this crate expects anyone to `sigwait` on.
const MAX_SIGNUM: usize = 64;

static SIGNAL_PIPE_FDS: [AtomicI32; MAX_SIGNUM] = [const { AtomicI32::new(-1) }; MAX_SIGNUM];

extern "C" fn signal_trampoline(signum: libc::c_int) {
    let idx = signum as usize;
    if idx >= MAX_SIGNUM {
        return;
    }
    let fd = SIGNAL_PIPE_FDS[idx].load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signum as u8;
        // Async-signal-safe: a raw `write(2)` of one byte.
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// Install the self-pipe trampoline for `signum`, unless a non-default
/// handler is already installed for it — mirrors the "never override a user
/// handler" rule from the child-process module (§4.6), generalized to every
/// signal this demultiplexer is asked to wait on.
fn install_signal_relay(signum: i32, write_fd: RawFd) -> Result<(), RatchetError> {
    let idx = signum as usize;
    if idx >= MAX_SIGNUM {
        return Err(RatchetError::new(
            "Demultiplexer::arm",
            ErrorKind::Einval,
            format!("signal number {signum} out of supported range"),
        ));
    }
    SIGNAL_PIPE_FDS[idx].store(write_fd, Ordering::Relaxed);

    let sig = Signal::try_from(signum).map_err(|_| {
        RatchetError::new(
            "Demultiplexer::arm",
            ErrorKind::Einval,
            format!("{signum} is not a valid signal number"),
        )
    })?;

    // SAFETY: sigaction() with a plain extern "C" fn handler and no shared
    // mutable state beyond the lock-free fd table above.
    unsafe {
        let current = sigaction(
            sig,
            &SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty()),
        )
        .map_err(|e| {
            RatchetError::from_errno("Demultiplexer::arm", "sigaction(2)", e as i32)
        })?;
        let already_user_installed = !matches!(
            current.handler(),
            SigHandler::SigDfl | SigHandler::SigIgn
        );
        if already_user_installed {
            // Restore what was there; we only relay signals nobody else claimed.
            sigaction(sig, &current).ok();
            return Ok(());
        }
        sigaction(
            sig,
            &SigAction::new(
                SigHandler::Handler(signal_trampoline),
                SaFlags::SA_RESTART,
                SigSet::empty(),
            ),
        )
        .map_err(|e| RatchetError::from_errno("Demultiplexer::arm", "sigaction(2)", e as i32))?;
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fired {
    Ready,
    TimedOut,
}

struct FdInterest {
    token: Token,
    readers: Vec<WaitRecordId>,
    writers: Vec<WaitRecordId>,
}

enum Armed {
    FdRead { fd: RawFd, deadline: Option<Instant> },
    FdWrite { fd: RawFd, deadline: Option<Instant> },
    Signal { signum: i32, deadline: Option<Instant> },
    Timeout { deadline: Instant },
}

impl Armed {
    fn deadline(&self) -> Option<Instant> {
        match self {
            Armed::FdRead { deadline, .. } => *deadline,
            Armed::FdWrite { deadline, .. } => *deadline,
            Armed::Signal { deadline, .. } => *deadline,
            Armed::Timeout { deadline } => Some(*deadline),
        }
    }
}

pub struct Demultiplexer {
    poll: Poll,
    events: Events,
    next_token: usize,
    fds: HashMap<RawFd, FdInterest>,
    signals: HashMap<i32, Vec<WaitRecordId>>,
    records: Slab<Armed>,
    signal_read_fd: RawFd,
    signal_write_fd: RawFd,
    signal_token: Token,
}

impl Demultiplexer {
    pub fn new() -> Result<Self, RatchetError> {
        let poll = Poll::new()
            .map_err(|e| RatchetError::from_errno("Demultiplexer::new", "epoll_create1(2)", e.raw_os_error().unwrap_or(libc::EINVAL)))?;
        let (read_fd, write_fd) = unistd::pipe()
            .map_err(|e| RatchetError::from_errno("Demultiplexer::new", "pipe2(2)", e as i32))?;
        set_nonblocking(read_fd)?;
        set_nonblocking(write_fd)?;

        let signal_token = Token(0);
        poll.registry()
            .register(&mut SourceFd(&read_fd), signal_token, Interest::READABLE)
            .map_err(|e| {
                RatchetError::from_errno(
                    "Demultiplexer::new",
                    "epoll_ctl(2)",
                    e.raw_os_error().unwrap_or(libc::EINVAL),
                )
            })?;

        Ok(Self {
            poll,
            events: Events::with_capacity(1024),
            next_token: 1,
            fds: HashMap::new(),
            signals: HashMap::new(),
            records: Slab::new(),
            signal_read_fd: read_fd,
            signal_write_fd: write_fd,
            signal_token,
        })
    }

    fn nearest_deadline(&self) -> Option<Instant> {
        self.records.iter().filter_map(|(_, a)| a.deadline()).min()
    }

    /// True when no fd, signal, timeout, or alarm record is armed —
    /// `poll(None)` would then block forever, since nothing could ever fire.
    pub fn is_idle(&self) -> bool {
        self.records.is_empty()
    }

    fn reregister_fd(&mut self, fd: RawFd) -> Result<(), RatchetError> {
        let interest_entry = self.fds.get(&fd).expect("fd tracked");
        let mut interest = Interest::READABLE; // placeholder, recomputed below
        let want_read = !interest_entry.readers.is_empty();
        let want_write = !interest_entry.writers.is_empty();
        interest = match (want_read, want_write) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (true, false) => Interest::READABLE,
            (false, true) => Interest::WRITABLE,
            (false, false) => {
                let token = interest_entry.token;
                self.poll
                    .registry()
                    .deregister(&mut SourceFd(&fd))
                    .map_err(|e| {
                        RatchetError::from_errno(
                            "Demultiplexer::cancel",
                            "epoll_ctl(2)",
                            e.raw_os_error().unwrap_or(libc::EINVAL),
                        )
                    })?;
                let _ = token;
                self.fds.remove(&fd);
                return Ok(());
            }
        };
        let token = interest_entry.token;
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), token, interest)
            .map_err(|e| {
                RatchetError::from_errno(
                    "Demultiplexer::arm",
                    "epoll_ctl(2)",
                    e.raw_os_error().unwrap_or(libc::EINVAL),
                )
            })
    }

    /// Register a new wait. Returns an id usable for cancellation.
    pub fn arm(
        &mut self,
        kind: WaitRecordKind,
        deadline: Option<Instant>,
    ) -> Result<WaitRecordId, RatchetError> {
        match kind {
            WaitRecordKind::FdRead { fd } => {
                let id = WaitRecordId::from_raw(self.records.insert(Armed::FdRead { fd, deadline }));
                self.arm_fd(fd, id, true)?;
                Ok(id)
            }
            WaitRecordKind::FdWrite { fd } => {
                let id =
                    WaitRecordId::from_raw(self.records.insert(Armed::FdWrite { fd, deadline }));
                self.arm_fd(fd, id, false)?;
                Ok(id)
            }
            WaitRecordKind::Signal { signum } => {
                let id = WaitRecordId::from_raw(self.records.insert(Armed::Signal {
                    signum,
                    deadline,
                }));
                install_signal_relay(signum, self.signal_write_fd)?;
                self.signals.entry(signum).or_default().push(id);
                Ok(id)
            }
            WaitRecordKind::Timeout => {
                let deadline = deadline.unwrap_or_else(Instant::now);
                Ok(WaitRecordId::from_raw(
                    self.records.insert(Armed::Timeout { deadline }),
                ))
            }
        }
    }

    fn arm_fd(&mut self, fd: RawFd, id: WaitRecordId, is_read: bool) -> Result<(), RatchetError> {
        if !self.fds.contains_key(&fd) {
            let token = Token(self.next_token);
            self.next_token += 1;
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), token, Interest::READABLE)
                .map_err(|e| {
                    RatchetError::from_errno(
                        "Demultiplexer::arm",
                        "epoll_ctl(2)",
                        e.raw_os_error().unwrap_or(libc::EINVAL),
                    )
                })?;
            self.fds.insert(
                fd,
                FdInterest {
                    token,
                    readers: Vec::new(),
                    writers: Vec::new(),
                },
            );
        }
        let entry = self.fds.get_mut(&fd).unwrap();
        if is_read {
            entry.readers.push(id);
        } else {
            entry.writers.push(id);
        }
        self.reregister_fd(fd)
    }

    /// Idempotently remove a wait. Safe to call on an id that already fired
    /// or was never valid.
    pub fn cancel(&mut self, id: WaitRecordId) {
        let Some(armed) = self.records.try_remove(id.raw()) else {
            return;
        };
        match armed {
            Armed::FdRead { fd, .. } => self.remove_fd_interest(fd, id, true),
            Armed::FdWrite { fd, .. } => self.remove_fd_interest(fd, id, false),
            Armed::Signal { signum, .. } => {
                if let Some(list) = self.signals.get_mut(&signum) {
                    list.retain(|r| *r != id);
                }
            }
            Armed::Timeout { .. } => {}
        }
    }

    fn remove_fd_interest(&mut self, fd: RawFd, id: WaitRecordId, is_read: bool) {
        if let Some(entry) = self.fds.get_mut(&fd) {
            if is_read {
                entry.readers.retain(|r| *r != id);
            } else {
                entry.writers.retain(|r| *r != id);
            }
        }
        let _ = self.reregister_fd(fd);
    }

    /// Block until at least one record fires or `timeout` elapses; return
    /// the batch of fired records.
    pub fn tick(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Vec<(WaitRecordId, Fired)>, RatchetError> {
        let now = Instant::now();
        let mut effective = timeout;
        if let Some(nearest) = self.nearest_deadline() {
            let until = nearest.saturating_duration_since(now);
            effective = Some(match effective {
                Some(t) => t.min(until),
                None => until,
            });
        }

        self.poll.poll(&mut self.events, effective).map_err(|e| {
            RatchetError::from_errno(
                "Demultiplexer::tick",
                "epoll_wait(2)",
                e.raw_os_error().unwrap_or(libc::EINTR),
            )
        })?;

        let mut fired = Vec::new();

        for event in self.events.iter() {
            if event.token() == self.signal_token {
                self.drain_signal_pipe(&mut fired);
                continue;
            }
            let fd = self
                .fds
                .iter()
                .find(|(_, v)| v.token == event.token())
                .map(|(fd, _)| *fd);
            let Some(fd) = fd else { continue };
            if event.is_readable() {
                if let Some(entry) = self.fds.get(&fd) {
                    for id in entry.readers.clone() {
                        fired.push((id, Fired::Ready));
                    }
                }
            }
            if event.is_writable() {
                if let Some(entry) = self.fds.get(&fd) {
                    for id in entry.writers.clone() {
                        fired.push((id, Fired::Ready));
                    }
                }
            }
        }

        for (id, _) in &fired {
            self.cancel(*id);
        }

        let now = Instant::now();
        let expired: Vec<WaitRecordId> = self
            .records
            .iter()
            .filter(|(_, a)| a.deadline().is_some_and(|d| d <= now))
            .map(|(slot, _)| WaitRecordId::from_raw(slot))
            .collect();
        for id in expired {
            self.cancel(id);
            fired.push((id, Fired::TimedOut));
        }

        Ok(fired)
    }

    fn drain_signal_pipe(&mut self, fired: &mut Vec<(WaitRecordId, Fired)>) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(
                    self.signal_read_fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
            for &signum in &buf[..n as usize] {
                if let Some(list) = self.signals.get(&(signum as i32)) {
                    for id in list.clone() {
                        fired.push((id, Fired::Ready));
                    }
                }
            }
        }
    }
}

fn set_nonblocking(fd: RawFd) -> Result<(), RatchetError> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(RatchetError::from_errno(
                "Demultiplexer::new",
                "fcntl(2)",
                std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL),
            ));
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(RatchetError::from_errno(
                "Demultiplexer::new",
                "fcntl(2)",
                std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn arm_timeout_fires_after_deadline() {
        let mut demux = Demultiplexer::new().unwrap();
        let id = demux
            .arm(WaitRecordKind::Timeout, Some(Instant::now()))
            .unwrap();
        let fired = demux.tick(Some(Duration::from_millis(50))).unwrap();
        assert_eq!(fired, vec![(id, Fired::TimedOut)]);
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut demux = Demultiplexer::new().unwrap();
        let id = demux.arm(WaitRecordKind::Timeout, None).unwrap();
        demux.cancel(id);
        demux.cancel(id);
    }

    #[test]
    fn fd_read_fires_on_writable_pipe() {
        use std::os::fd::FromRawFd;

        let mut demux = Demultiplexer::new().unwrap();
        let (read_fd, write_fd) = unistd::pipe().unwrap();
        set_nonblocking(read_fd).unwrap();
        let id = demux
            .arm(WaitRecordKind::FdRead { fd: read_fd }, None)
            .unwrap();
        let mut f = unsafe { std::fs::File::from_raw_fd(write_fd) };
        f.write_all(b"x").unwrap();
        let fired = demux.tick(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(fired, vec![(id, Fired::Ready)]);
    }
}
