//! Non-blocking socket object (§4.4), grounded in `original_source/src/c/socket.c`
//! (`rsock_connect`/`rsock_accept`/`rsock_send`/`rsock_recv`): attempt the
//! syscall non-blockingly, and on EAGAIN/EWOULDBLOCK/EINPROGRESS/EALREADY
//! yield read or write readiness through the owning task's [`TaskHandle`]
//! and retry.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use ratchet_core::{ErrorKind, RatchetError, TaskHandle, Waitable};
use ratchet_types::Direction;

/// The address families a `Socket` may be created with, mirroring
/// `rsock_new`'s `family` argument (defaulted there to `AF_INET`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

impl AddressFamily {
    fn as_raw(self) -> libc::c_int {
        match self {
            AddressFamily::Inet => libc::AF_INET,
            AddressFamily::Inet6 => libc::AF_INET6,
        }
    }
}

/// A non-blocking socket, set `O_NONBLOCK` at creation and never toggled
/// back, matching `rsock_new`'s `set_nonblocking` call.
pub struct Socket {
    fd: RawFd,
    timeout: Option<Duration>,
}

impl Socket {
    /// Wrap an already-open, already-non-blocking fd (`rsock_from_fd`).
    ///
    /// # Safety
    /// `fd` must be a valid, open file descriptor this `Socket` now owns
    /// exclusively; it is closed on drop.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Result<Self, RatchetError> {
        set_nonblocking(fd)?;
        Ok(Self { fd, timeout: None })
    }

    pub fn new_tcp(family: AddressFamily) -> Result<Self, RatchetError> {
        Self::new(family, libc::SOCK_STREAM)
    }

    pub fn new_udp(family: AddressFamily) -> Result<Self, RatchetError> {
        Self::new(family, libc::SOCK_DGRAM)
    }

    fn new(family: AddressFamily, socktype: libc::c_int) -> Result<Self, RatchetError> {
        let fd = unsafe { libc::socket(family.as_raw(), socktype, 0) };
        if fd < 0 {
            return Err(errno_error("Socket::new", "socket(2)"));
        }
        set_nonblocking(fd)?;
        Ok(Self { fd, timeout: None })
    }

    pub fn get_fd(&self) -> RawFd {
        self.fd
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|d| Instant::now() + d)
    }

    pub fn bind(&self, addr: SocketAddr) -> Result<(), RatchetError> {
        let (storage, len) = sockaddr_from_std(addr);
        let ret = unsafe { libc::bind(self.fd, &storage as *const _ as *const libc::sockaddr, len) };
        if ret < 0 {
            return Err(errno_error("Socket::bind", "bind(2)"));
        }
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> Result<(), RatchetError> {
        if unsafe { libc::listen(self.fd, backlog) } < 0 {
            return Err(errno_error("Socket::listen", "listen(2)"));
        }
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RatchetError> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        if unsafe { libc::getsockname(self.fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) } < 0 {
            return Err(errno_error("Socket::local_addr", "getsockname(2)"));
        }
        sockaddr_storage_to_std(&storage)
    }

    /// `connect`: non-blocking connect, racing the socket's own timeout
    /// (§4.4). A successful wakeup still requires a SO_ERROR check.
    pub async fn connect(&self, handle: &TaskHandle, addr: SocketAddr) -> Result<(), RatchetError> {
        let (storage, len) = sockaddr_from_std(addr);
        let ret = unsafe { libc::connect(self.fd, &storage as *const _ as *const libc::sockaddr, len) };
        if ret < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno != libc::EINPROGRESS && errno != libc::EALREADY {
                return Err(RatchetError::from_errno("Socket::connect", "connect(2)", errno));
            }
        } else {
            return self.check_pending_error("Socket::connect");
        }

        let ready = handle.wait_write(&Waited { fd: self.fd, deadline: self.deadline() }).await?;
        if !ready {
            return Err(RatchetError::new("Socket::connect", ErrorKind::Etimedout, "timed out on connect"));
        }
        self.check_pending_error("Socket::connect")
    }

    fn check_pending_error(&self, function: &'static str) -> Result<(), RatchetError> {
        let mut error: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        if unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut error as *mut _ as *mut libc::c_void,
                &mut len,
            )
        } < 0
        {
            return Err(errno_error(function, "getsockopt(2)"));
        }
        if error != 0 {
            return Err(RatchetError::from_errno(function, "connect(2)", error));
        }
        Ok(())
    }

    /// `accept`: on success, builds a new non-blocking `Socket` plus the
    /// peer's printable address, per §4.4.
    pub async fn accept(&self, handle: &TaskHandle) -> Result<(Socket, SocketAddr), RatchetError> {
        loop {
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let client = unsafe {
                libc::accept(self.fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
            };
            if client >= 0 {
                set_nonblocking(client)?;
                let peer = sockaddr_storage_to_std(&storage)?;
                return Ok((Socket { fd: client, timeout: None }, peer));
            }
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno != libc::EAGAIN && errno != libc::EWOULDBLOCK {
                return Err(RatchetError::from_errno("Socket::accept", "accept(2)", errno));
            }
            let ready = handle.wait_read(&Waited { fd: self.fd, deadline: self.deadline() }).await?;
            if !ready {
                return Err(RatchetError::new("Socket::accept", ErrorKind::Etimedout, "timed out on accept"));
            }
        }
    }

    /// `send`: on a partial write, returns the unsent tail; the caller loops.
    pub async fn send(&self, handle: &TaskHandle, data: &[u8]) -> Result<Vec<u8>, RatchetError> {
        loop {
            let ret = unsafe {
                libc::send(self.fd, data.as_ptr() as *const libc::c_void, data.len(), libc::MSG_NOSIGNAL)
            };
            if ret >= 0 {
                let sent = ret as usize;
                return Ok(data[sent..].to_vec());
            }
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno != libc::EAGAIN && errno != libc::EWOULDBLOCK {
                return Err(RatchetError::from_errno("Socket::send", "send(2)", errno));
            }
            let ready = handle.wait_write(&Waited { fd: self.fd, deadline: self.deadline() }).await?;
            if !ready {
                return Err(RatchetError::new("Socket::send", ErrorKind::Etimedout, "timed out on send"));
            }
        }
    }

    /// `send_many` (vectored write): returns how many whole buffers were
    /// consumed, per §4.4.
    pub async fn send_many(&self, handle: &TaskHandle, bufs: &[&[u8]]) -> Result<usize, RatchetError> {
        loop {
            let iov: Vec<libc::iovec> = bufs
                .iter()
                .map(|b| libc::iovec { iov_base: b.as_ptr() as *mut libc::c_void, iov_len: b.len() })
                .collect();
            let ret = unsafe { libc::writev(self.fd, iov.as_ptr(), iov.len() as libc::c_int) };
            if ret >= 0 {
                let mut remaining = ret as usize;
                let mut consumed = 0;
                for b in bufs {
                    if remaining < b.len() {
                        break;
                    }
                    remaining -= b.len();
                    consumed += 1;
                }
                return Ok(consumed);
            }
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno != libc::EAGAIN && errno != libc::EWOULDBLOCK {
                return Err(RatchetError::from_errno("Socket::send_many", "writev(2)", errno));
            }
            let ready = handle.wait_write(&Waited { fd: self.fd, deadline: self.deadline() }).await?;
            if !ready {
                return Err(RatchetError::new("Socket::send_many", ErrorKind::Etimedout, "timed out on send"));
            }
        }
    }

    /// `recv`: an empty return means EOF, matching `rsock_recv`'s buffer
    /// semantics (an empty string on a closed peer).
    pub async fn recv(&self, handle: &TaskHandle, max_len: usize) -> Result<Vec<u8>, RatchetError> {
        let mut buf = vec![0u8; max_len];
        loop {
            let ret = unsafe { libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, max_len, 0) };
            if ret >= 0 {
                buf.truncate(ret as usize);
                return Ok(buf);
            }
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno != libc::EAGAIN && errno != libc::EWOULDBLOCK {
                return Err(RatchetError::from_errno("Socket::recv", "recv(2)", errno));
            }
            let ready = handle.wait_read(&Waited { fd: self.fd, deadline: self.deadline() }).await?;
            if !ready {
                return Err(RatchetError::new("Socket::recv", ErrorKind::Etimedout, "timed out on recv"));
            }
        }
    }

    pub fn shutdown(&self, direction: Direction) -> Result<(), RatchetError> {
        let how = match direction {
            Direction::Read => libc::SHUT_RD,
            Direction::Write => libc::SHUT_WR,
        };
        if unsafe { libc::shutdown(self.fd, how) } < 0 {
            return Err(errno_error("Socket::shutdown", "shutdown(2)"));
        }
        Ok(())
    }
}

impl Waitable for Socket {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn deadline(&self) -> Option<Instant> {
        self.deadline()
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
        }
    }
}

/// A free-standing fd+deadline pair used for the arm/wait call itself,
/// since `Socket`'s own `Waitable` impl already captures its current
/// timeout at the moment the operation started.
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
        return Err(errno_error("set_nonblocking", "fcntl(2)"));
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(errno_error("set_nonblocking", "fcntl(2)"));
    }
    Ok(())
}

fn errno_error(function: &'static str, syscall: &'static str) -> RatchetError {
    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    RatchetError::from_errno(function, syscall, errno)
}

/// Build a `sockaddr_storage` from a std `SocketAddr`, mirroring
/// `build_tcp_info`/`build_udp_info` (`original_source/src/c/socket.c`),
/// which construct the raw `sockaddr_in`/`sockaddr_in6` by hand.
fn sockaddr_from_std(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(v4.ip().octets()) },
                sin_zero: [0; 8],
            };
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin) };
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr { s6_addr: v6.ip().octets() },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    };
    (storage, len)
}

fn sockaddr_storage_to_std(storage: &libc::sockaddr_storage) -> Result<SocketAddr, RatchetError> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let addr_in: libc::sockaddr_in = unsafe { std::mem::transmute_copy(storage) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(addr_in.sin_addr.s_addr));
            let port = u16::from_be(addr_in.sin_port);
            Ok(SocketAddr::new(ip.into(), port))
        }
        libc::AF_INET6 => {
            let addr_in6: libc::sockaddr_in6 = unsafe { std::mem::transmute_copy(storage) };
            let ip = std::net::Ipv6Addr::from(addr_in6.sin6_addr.s6_addr);
            let port = u16::from_be(addr_in6.sin6_port);
            Ok(SocketAddr::new(ip.into(), port))
        }
        _ => Err(RatchetError::new("sockaddr_storage_to_std", ErrorKind::Eafnosupport, "unsupported address family")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn new_tcp_socket_is_nonblocking_and_has_a_valid_fd() {
        let sock = Socket::new_tcp(AddressFamily::Inet).unwrap();
        assert!(sock.get_fd() >= 0);
        let flags = unsafe { libc::fcntl(sock.get_fd(), libc::F_GETFL, 0) };
        assert_eq!(flags & libc::O_NONBLOCK, libc::O_NONBLOCK);
    }

    #[test]
    fn bind_then_local_addr_reports_assigned_port() {
        let sock = Socket::new_tcp(AddressFamily::Inet).unwrap();
        sock.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        sock.listen(16).unwrap();
        let addr = sock.local_addr().unwrap();
        assert_eq!(addr.ip(), std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
        assert!(addr.port() > 0);
    }

    #[test_log::test]
    fn echo_server_round_trips_a_message_through_accept_and_connect() {
        let scheduler = ratchet_core::Scheduler::new(|handle| async move {
            let listener = Socket::new_tcp(AddressFamily::Inet)?;
            listener.bind("127.0.0.1:0".parse().unwrap())?;
            listener.listen(16)?;
            let addr = listener.local_addr()?;

            handle.spawn(move |child| async move {
                let (conn, _peer) = listener.accept(&child).await?;
                loop {
                    let chunk = conn.recv(&child, 4096).await?;
                    if chunk.is_empty() {
                        break;
                    }
                    conn.send(&child, &chunk).await?;
                }
                Ok(())
            });

            let client = Socket::new_tcp(AddressFamily::Inet)?;
            client.connect(&handle, addr).await?;
            client.send(&handle, b"hello\nworld\n\n").await?;
            client.shutdown(ratchet_types::Direction::Write)?;

            let mut received = Vec::new();
            loop {
                let chunk = client.recv(&handle, 4096).await?;
                if chunk.is_empty() {
                    break;
                }
                received.extend_from_slice(&chunk);
            }
            assert_eq!(received, b"hello\nworld\n\n");
            Ok(())
        })
        .unwrap();
        scheduler.run_until_done().unwrap();
    }

    #[test_log::test]
    fn connect_to_an_unroutable_address_times_out() {
        let scheduler = ratchet_core::Scheduler::new(|handle| async move {
            let mut sock = Socket::new_tcp(AddressFamily::Inet)?;
            sock.set_timeout(Some(Duration::from_millis(250)));
            let result = sock.connect(&handle, "10.255.255.1:1".parse().unwrap()).await;
            assert_eq!(result.unwrap_err(), ErrorKind::Etimedout);
            Ok(())
        })
        .unwrap();
        scheduler.run_until_done().unwrap();
    }
}
