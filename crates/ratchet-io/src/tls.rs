//! TLS session wrapper (§4.4), grounded in `original_source/src/c/ssl.c`
//! (`rssl_session_connect`/`_accept`/`_read`/`_write`/`_shutdown`): drive
//! `openssl`'s non-blocking state machine, yielding read or write readiness
//! on `SSL_ERROR_WANT_READ`/`WANT_WRITE` and mapping everything else through
//! `handle_ssl_error`.
//!
//! Certificate/key/CA configuration is out of scope here (§1) — callers
//! bring their own `openssl::ssl::SslContext`; this module only wraps the
//! handshake/read/write/shutdown surface.

use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use openssl::error::ErrorStack;
use openssl::ssl::{ErrorCode, Ssl, SslContext, SslStream};
use ratchet_core::{ErrorKind, RatchetError, TaskHandle, Waitable};

use crate::socket::Socket;

/// A non-blocking TLS session bound to a [`Socket`]'s fd.
pub struct TlsSession {
    stream: SslStream<FdStream>,
    timeout: Option<Duration>,
}

/// A minimal `Read + Write` adapter so `openssl::ssl::SslStream` can drive
/// its BIO over a raw fd without taking ownership of the `Socket`.
struct FdStream {
    fd: RawFd,
}

impl std::io::Read for FdStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let ret = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if ret < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(ret as usize)
        }
    }
}

impl std::io::Write for FdStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let ret = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if ret < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(ret as usize)
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
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

impl TlsSession {
    pub fn new(ctx: &SslContext, socket: Socket, timeout: Option<Duration>) -> Result<Self, RatchetError> {
        let fd = socket.get_fd();
        std::mem::forget(socket);
        let ssl = Ssl::new(ctx).map_err(ssl_stack_error("TlsSession::new"))?;
        let stream = SslStream::new(ssl, FdStream { fd }).map_err(ssl_stack_error("TlsSession::new"))?;
        Ok(Self { stream, timeout })
    }

    fn fd(&self) -> RawFd {
        self.stream.get_ref().fd
    }

    fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|d| Instant::now() + d)
    }

    async fn drive<F>(&mut self, handle: &TaskHandle, function: &'static str, mut attempt: F) -> Result<usize, RatchetError>
    where
        F: FnMut(&mut SslStream<FdStream>) -> Result<usize, openssl::ssl::Error>,
    {
        loop {
            match attempt(&mut self.stream) {
                Ok(n) => return Ok(n),
                Err(e) => match e.code() {
                    ErrorCode::WANT_READ => {
                        let ready = handle.wait_read(&Waited { fd: self.fd(), deadline: self.deadline() }).await?;
                        if !ready {
                            return Err(RatchetError::new(function, ErrorKind::Etimedout, "timed out"));
                        }
                    }
                    ErrorCode::WANT_WRITE => {
                        let ready = handle.wait_write(&Waited { fd: self.fd(), deadline: self.deadline() }).await?;
                        if !ready {
                            return Err(RatchetError::new(function, ErrorKind::Etimedout, "timed out"));
                        }
                    }
                    ErrorCode::ZERO_RETURN => return Err(RatchetError::new(function, ErrorKind::SslEof, "peer closed without close_notify")),
                    ErrorCode::SYSCALL => {
                        return Err(RatchetError::new(function, ErrorKind::SslEof, "connection closed without a clean shutdown"));
                    }
                    _ => return Err(RatchetError::new(function, ErrorKind::SslError, e.to_string())),
                },
            }
        }
    }

    /// `client_handshake` (`rssl_session_connect`).
    pub async fn connect(&mut self, handle: &TaskHandle) -> Result<(), RatchetError> {
        self.drive(handle, "TlsSession::connect", |s| s.connect().map(|_| 0)).await?;
        Ok(())
    }

    /// `server_handshake` (`rssl_session_accept`).
    pub async fn accept(&mut self, handle: &TaskHandle) -> Result<(), RatchetError> {
        self.drive(handle, "TlsSession::accept", |s| s.accept().map(|_| 0)).await?;
        Ok(())
    }

    pub async fn read(&mut self, handle: &TaskHandle, max_len: usize) -> Result<Vec<u8>, RatchetError> {
        let mut buf = vec![0u8; max_len];
        match self.drive(handle, "TlsSession::read", |s| s.ssl_read(&mut buf)).await {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if e == ErrorKind::SslEof => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    pub async fn write(&mut self, handle: &TaskHandle, data: &[u8]) -> Result<(), RatchetError> {
        self.drive(handle, "TlsSession::write", |s| s.ssl_write(data)).await?;
        Ok(())
    }

    /// `shutdown` (`rssl_session_shutdown`): a clean bidirectional
    /// `close_notify` returns `Ok(true)`; a peer that simply vanished
    /// (`SSL_ERROR_SYSCALL` with EPIPE/EBADF in the source) returns
    /// `Ok(false)` rather than an error.
    pub async fn shutdown(&mut self, handle: &TaskHandle) -> Result<bool, RatchetError> {
        loop {
            match self.stream.shutdown() {
                Ok(_) => return Ok(true),
                Err(e) => match e.code() {
                    ErrorCode::WANT_READ => {
                        handle.wait_read(&Waited { fd: self.fd(), deadline: self.deadline() }).await?;
                    }
                    ErrorCode::WANT_WRITE => {
                        handle.wait_write(&Waited { fd: self.fd(), deadline: self.deadline() }).await?;
                    }
                    ErrorCode::SYSCALL => return Ok(false),
                    _ => return Err(RatchetError::new("TlsSession::shutdown", ErrorKind::SslError, e.to_string())),
                },
            }
        }
    }

    pub fn cipher_name(&self) -> Option<&str> {
        self.stream.ssl().current_cipher().map(|c| c.name())
    }
}

impl Drop for TlsSession {
    fn drop(&mut self) {
        let fd = self.stream.get_ref().fd;
        if fd >= 0 {
            unsafe { libc::close(fd) };
        }
    }
}

fn ssl_stack_error(function: &'static str) -> impl FnOnce(ErrorStack) -> RatchetError {
    move |e| RatchetError::new(function, ErrorKind::SslError, e.to_string())
}
