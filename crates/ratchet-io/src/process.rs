//! Child-process launcher (§4.6), grounded in `original_source/src/c/exec.c`
//! (`start_process`/`rexec_wait`/`rexec_communicate`/`rexec_kill`/
//! `enable_sigchld`): fork+exec with three non-blocking pipes on the parent
//! side, a process-global SIGCHLD handler installed once so `waitpid` isn't
//! short-circuited by auto-reap, and a send-all-then-drain-both-streams
//! `communicate` built on `block_on`.

use std::os::fd::RawFd;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::Once;
use std::time::{Duration, Instant};

use nix::sys::signal::{SigHandler, Signal, sigaction, SigAction, SaFlags, SigSet};
use ratchet_core::{Direction, ErrorKind, RatchetError, TaskHandle, Waitable};
use tracing::debug;

static INSTALL_SIGCHLD: Once = Once::new();
static IGNORE_SIGPIPE: Once = Once::new();

extern "C" fn sigchld_noop(_: libc::c_int) {}

/// Install a minimal SIGCHLD handler, replacing only `SIG_IGN`/`SIG_DFL`,
/// never a user-installed handler — `enable_sigchld()` in the source.
fn ensure_sigchld_handled() {
    INSTALL_SIGCHLD.call_once(|| unsafe {
        if let Ok(old) = sigaction(Signal::SIGCHLD, &SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty())) {
            let replace = matches!(old.handler(), SigHandler::SigIgn | SigHandler::SigDfl);
            if replace {
                let _ = sigaction(
                    Signal::SIGCHLD,
                    &SigAction::new(SigHandler::Handler(sigchld_noop), SaFlags::empty(), SigSet::empty()),
                );
            } else {
                let _ = sigaction(Signal::SIGCHLD, &old);
            }
        }
    });
}

/// Ignore SIGPIPE process-wide (§4.6): without this, a `write` to a child
/// whose read end has closed kills the whole process instead of returning
/// EPIPE. The child itself gets ordinary SIGPIPE behavior back via
/// `pre_exec` in `start()`.
fn ensure_sigpipe_ignored() {
    IGNORE_SIGPIPE.call_once(|| unsafe {
        let _ = sigaction(
            Signal::SIGPIPE,
            &SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty()),
        );
    });
}

struct Waited {
    fd: RawFd,
    deadline: Option<Instant>,
}

impl Waitable for Waited {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

fn set_nonblocking(fd: RawFd) -> Result<(), RatchetError> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(RatchetError::from_errno("Process::start", "fcntl(2)", std::io::Error::last_os_error().raw_os_error().unwrap_or(0)));
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(RatchetError::from_errno("Process::start", "fcntl(2)", std::io::Error::last_os_error().raw_os_error().unwrap_or(0)));
    }
    Ok(())
}

/// A spawned child with non-blocking pipes on the parent's three std
/// streams — `rexec_state`'s Rust realization.
pub struct Process {
    argv: Vec<String>,
    child: Option<Child>,
    timeout: Option<Duration>,
}

impl Process {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv, child: None, timeout: None }
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|d| Instant::now() + d)
    }

    /// `start()`: fork+exec via `std::process::Command`, then set
    /// `O_NONBLOCK` on the parent ends of all three pipes.
    pub fn start(&mut self) -> Result<(), RatchetError> {
        ensure_sigchld_handled();
        ensure_sigpipe_ignored();
        let (program, args) = self.argv.split_first().ok_or_else(|| {
            RatchetError::new("Process::start", ErrorKind::Einval, "empty argv")
        })?;
        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
        unsafe {
            cmd.pre_exec(|| {
                libc::signal(libc::SIGPIPE, libc::SIG_DFL);
                Ok(())
            });
        }
        let child = cmd.spawn().map_err(|e| {
            RatchetError::from_errno("Process::start", "fork/exec", e.raw_os_error().unwrap_or(libc::EINVAL))
        })?;

        set_nonblocking(fd_of(child.stdin.as_ref().unwrap()))?;
        set_nonblocking(fd_of(child.stdout.as_ref().unwrap()))?;
        set_nonblocking(fd_of(child.stderr.as_ref().unwrap()))?;

        debug!(pid = child.id(), argv = ?self.argv, "process started");
        self.child = Some(child);
        Ok(())
    }

    fn child(&mut self) -> Result<&mut Child, RatchetError> {
        self.child.as_mut().ok_or_else(|| RatchetError::new("Process", ErrorKind::Einval, "process not started"))
    }

    /// `write(stdin-bytes)`: retries on EAGAIN/EWOULDBLOCK; a SIGPIPE from
    /// writing to a dead child surfaces as EPIPE since `start()` ignores
    /// SIGPIPE process-wide (see `ensure_sigpipe_ignored`).
    pub async fn write(&mut self, handle: &TaskHandle, data: &[u8]) -> Result<(), RatchetError> {
        let fd = fd_of(self.child()?.stdin.as_ref().unwrap());
        let mut remaining = data;
        while !remaining.is_empty() {
            let ret = unsafe { libc::write(fd, remaining.as_ptr() as *const libc::c_void, remaining.len()) };
            if ret >= 0 {
                remaining = &remaining[ret as usize..];
                continue;
            }
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                let ready = handle.wait_write(&Waited { fd, deadline: self.deadline() }).await?;
                if !ready {
                    return Err(RatchetError::new("Process::write", ErrorKind::Etimedout, "timed out on write"));
                }
                continue;
            }
            return Err(RatchetError::from_errno("Process::write", "write(2)", errno));
        }
        Ok(())
    }

    /// Closes the stdin pipe, signaling EOF to the child.
    pub fn close_stdin(&mut self) -> Result<(), RatchetError> {
        self.child()?.stdin.take();
        Ok(())
    }

    /// `read(stdout|stderr)`: an empty return means EOF.
    pub async fn read(&mut self, handle: &TaskHandle, which: Stream, max_len: usize) -> Result<Vec<u8>, RatchetError> {
        let fd = match which {
            Stream::Stdout => fd_of(self.child()?.stdout.as_ref().unwrap()),
            Stream::Stderr => fd_of(self.child()?.stderr.as_ref().unwrap()),
        };
        let mut buf = vec![0u8; max_len];
        loop {
            let ret = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, max_len) };
            if ret >= 0 {
                buf.truncate(ret as usize);
                return Ok(buf);
            }
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno != libc::EAGAIN && errno != libc::EWOULDBLOCK {
                return Err(RatchetError::from_errno("Process::read", "read(2)", errno));
            }
            let ready = handle.wait_read(&Waited { fd, deadline: self.deadline() }).await?;
            if !ready {
                return Err(RatchetError::new("Process::read", ErrorKind::Etimedout, "timed out on read"));
            }
        }
    }

    /// `wait(optional-timeout)`: yields on SIGCHLD with the timeout,
    /// non-blocking `waitpid` each time it wakes (the signal is merely a
    /// prod — another unrelated child may have reaped first).
    pub async fn wait(&mut self, handle: &TaskHandle) -> Result<i32, RatchetError> {
        let pid = self.child()?.id() as libc::pid_t;
        loop {
            let mut status: libc::c_int = 0;
            let ret = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
            if ret == pid {
                return Ok(decode_exit_status(status));
            }
            if ret < 0 {
                return Err(RatchetError::from_errno("Process::wait", "waitpid(2)", std::io::Error::last_os_error().raw_os_error().unwrap_or(0)));
            }
            handle.sigwait(libc::SIGCHLD).await?;
        }
    }

    /// `kill(signal=SIGTERM)`.
    pub fn kill(&mut self, signal: i32) -> Result<(), RatchetError> {
        let pid = self.child()?.id() as libc::pid_t;
        if unsafe { libc::kill(pid, signal) } < 0 {
            return Err(RatchetError::from_errno("Process::kill", "kill(2)", std::io::Error::last_os_error().raw_os_error().unwrap_or(0)));
        }
        Ok(())
    }

    /// `communicate(optional-stdin-bytes)`: write-all then drain both
    /// streams via `block_on`, dropping a stream from the wait set once it
    /// returns empty, then `wait()`.
    pub async fn communicate(&mut self, handle: &TaskHandle, stdin_data: Option<&[u8]>) -> Result<(Vec<u8>, Vec<u8>, i32), RatchetError> {
        if self.child.is_none() {
            self.start()?;
        }
        if let Some(data) = stdin_data {
            self.write(handle, data).await?;
        }
        self.close_stdin()?;

        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        let mut stdout_open = true;
        let mut stderr_open = true;

        while stdout_open || stderr_open {
            let out_fd = fd_of(self.child()?.stdout.as_ref().unwrap());
            let err_fd = fd_of(self.child()?.stderr.as_ref().unwrap());
            let mut reads = Vec::new();
            if stdout_open {
                reads.push(out_fd);
            }
            if stderr_open {
                reads.push(err_fd);
            }
            let fired = handle.block_on(reads, Vec::new(), self.deadline()).await?;
            let Some((fd, Direction::Read)) = fired else {
                break;
            };

            let which = if fd == out_fd { Stream::Stdout } else { Stream::Stderr };
            let chunk = self.read(handle, which, 65536).await?;
            if chunk.is_empty() {
                match which {
                    Stream::Stdout => stdout_open = false,
                    Stream::Stderr => stderr_open = false,
                }
            } else {
                match which {
                    Stream::Stdout => stdout_buf.extend_from_slice(&chunk),
                    Stream::Stderr => stderr_buf.extend_from_slice(&chunk),
                }
            }
        }

        let status = self.wait(handle).await?;
        Ok((stdout_buf, stderr_buf, status))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

fn decode_exit_status(status: libc::c_int) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        -libc::WTERMSIG(status)
    } else {
        status
    }
}

fn fd_of(stream: &impl std::os::fd::AsRawFd) -> RawFd {
    stream.as_raw_fd()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn true_exits_zero() {
        let scheduler = ratchet_core::Scheduler::new(|handle| async move {
            let mut proc = Process::new(vec!["true".to_string()]);
            proc.start().unwrap();
            let status = proc.wait(&handle).await?;
            assert_eq!(status, 0);
            Ok(())
        })
        .unwrap();
        scheduler.run_until_done().unwrap();
    }

    #[test_log::test]
    fn communicate_echoes_stdin_to_stdout() {
        let scheduler = ratchet_core::Scheduler::new(|handle| async move {
            let mut proc = Process::new(vec!["cat".to_string()]);
            proc.start().unwrap();
            let (stdout, _stderr, status) = proc.communicate(&handle, Some(b"hello\n")).await?;
            assert_eq!(stdout, b"hello\n");
            assert_eq!(status, 0);
            Ok(())
        })
        .unwrap();
        scheduler.run_until_done().unwrap();
    }
}
