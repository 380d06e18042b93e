//! The structured error type surfaced to user code.

use std::fmt;

/// Every error code name user code can compare against.
///
/// Most variants mirror a POSIX errno; the rest (`Deadlock`, `Alarm`,
/// `SslError`, `SslEof`, and the DNS-specific ones) are scheduler- or
/// protocol-level conditions with no errno of their own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    Eacces,
    Eafnosupport,
    Einval,
    Emfile,
    Enfile,
    Enobufs,
    Enomem,
    Eprotonosupport,
    Eagain,
    Ewouldblock,
    Ebadf,
    Econnaborted,
    Efault,
    Eintr,
    Enotsock,
    Eopnotsupp,
    Eproto,
    Eperm,
    Eaddrinuse,
    Eaddrnotavail,
    Eloop,
    Enametoolong,
    Enoent,
    Enotdir,
    Erofs,
    Ealready,
    Econnrefused,
    Einprogress,
    Eisconn,
    Enetunreach,
    Etimedout,
    Econnreset,
    Edestaddrreq,
    Emsgsize,
    Enotconn,
    Epipe,
    Enodev,
    Enotsup,
    /// The demultiplexer would block forever: live tasks remain but none are
    /// ready and no wait record can ever fire.
    Deadlock,
    /// A per-task alarm expired.
    Alarm,
    /// A TLS operation failed for a reason other than WANT_READ/WANT_WRITE.
    SslError,
    /// A TLS peer closed the connection without a clean `close_notify`.
    SslEof,
    /// The DNS query itself was malformed before being sent.
    BadQuery,
    /// The resolver could not get an answer before its expire deadline.
    TempFail,
    /// The DNS response was not parseable as a valid packet.
    Protocol,
    /// Authoritative "no such domain."
    NxDomain,
    /// The domain exists but has no records of the requested type.
    NoData,
}

impl ErrorKind {
    /// Map a POSIX `errno` value to its code name, for the subset this crate
    /// surfaces. Returns `None` for an errno outside that set.
    pub fn from_errno(errno: i32) -> Option<Self> {
        use ErrorKind::*;
        Some(match errno {
            libc::EACCES => Eacces,
            libc::EAFNOSUPPORT => Eafnosupport,
            libc::EINVAL => Einval,
            libc::EMFILE => Emfile,
            libc::ENFILE => Enfile,
            libc::ENOBUFS => Enobufs,
            libc::ENOMEM => Enomem,
            libc::EPROTONOSUPPORT => Eprotonosupport,
            libc::EAGAIN => Eagain,
            libc::EWOULDBLOCK if libc::EWOULDBLOCK != libc::EAGAIN => Ewouldblock,
            libc::EBADF => Ebadf,
            libc::ECONNABORTED => Econnaborted,
            libc::EFAULT => Efault,
            libc::EINTR => Eintr,
            libc::ENOTSOCK => Enotsock,
            libc::EOPNOTSUPP => Eopnotsupp,
            libc::EPROTO => Eproto,
            libc::EPERM => Eperm,
            libc::EADDRINUSE => Eaddrinuse,
            libc::EADDRNOTAVAIL => Eaddrnotavail,
            libc::ELOOP => Eloop,
            libc::ENAMETOOLONG => Enametoolong,
            libc::ENOENT => Enoent,
            libc::ENOTDIR => Enotdir,
            libc::EROFS => Erofs,
            libc::EALREADY => Ealready,
            libc::ECONNREFUSED => Econnrefused,
            libc::EINPROGRESS => Einprogress,
            libc::EISCONN => Eisconn,
            libc::ENETUNREACH => Enetunreach,
            libc::ETIMEDOUT => Etimedout,
            libc::ECONNRESET => Econnreset,
            libc::EDESTADDRREQ => Edestaddrreq,
            libc::EMSGSIZE => Emsgsize,
            libc::ENOTCONN => Enotconn,
            libc::EPIPE => Epipe,
            libc::ENODEV => Enodev,
            libc::ENOTSUP if libc::ENOTSUP != libc::EOPNOTSUPP => Enotsup,
            _ => return None,
        })
    }

    /// True for the errno-backed transient conditions L4's retry loop
    /// recovers from locally without surfacing to user code.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::Eagain
                | ErrorKind::Ewouldblock
                | ErrorKind::Einprogress
                | ErrorKind::Ealready
                | ErrorKind::Eintr
        )
    }

    pub fn code_name(self) -> &'static str {
        use ErrorKind::*;
        match self {
            Eacces => "EACCES",
            Eafnosupport => "EAFNOSUPPORT",
            Einval => "EINVAL",
            Emfile => "EMFILE",
            Enfile => "ENFILE",
            Enobufs => "ENOBUFS",
            Enomem => "ENOMEM",
            Eprotonosupport => "EPROTONOSUPPORT",
            Eagain => "EAGAIN",
            Ewouldblock => "EWOULDBLOCK",
            Ebadf => "EBADF",
            Econnaborted => "ECONNABORTED",
            Efault => "EFAULT",
            Eintr => "EINTR",
            Enotsock => "ENOTSOCK",
            Eopnotsupp => "EOPNOTSUPP",
            Eproto => "EPROTO",
            Eperm => "EPERM",
            Eaddrinuse => "EADDRINUSE",
            Eaddrnotavail => "EADDRNOTAVAIL",
            Eloop => "ELOOP",
            Enametoolong => "ENAMETOOLONG",
            Enoent => "ENOENT",
            Enotdir => "ENOTDIR",
            Erofs => "EROFS",
            Ealready => "EALREADY",
            Econnrefused => "ECONNREFUSED",
            Einprogress => "EINPROGRESS",
            Eisconn => "EISCONN",
            Enetunreach => "ENETUNREACH",
            Etimedout => "ETIMEDOUT",
            Econnreset => "ECONNRESET",
            Edestaddrreq => "EDESTADDRREQ",
            Emsgsize => "EMSGSIZE",
            Enotconn => "ENOTCONN",
            Epipe => "EPIPE",
            Enodev => "ENODEV",
            Enotsup => "ENOTSUP",
            Deadlock => "DEADLOCK",
            Alarm => "ALARM",
            SslError => "SSLERROR",
            SslEof => "SSLEOF",
            BadQuery => "BADQUERY",
            TempFail => "TEMPFAIL",
            Protocol => "PROTOCOL",
            NxDomain => "NXDOMAIN",
            NoData => "NODATA",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code_name())
    }
}

/// A structured, first-class error.
///
/// Compares equal to an [`ErrorKind`] directly (`err == ErrorKind::Etimedout`)
/// so callers don't need to destructure it for the common "is this code X"
/// check.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{function}: {description} ({kind})")]
pub struct RatchetError {
    pub kind: ErrorKind,
    pub description: String,
    pub function: &'static str,
    pub location: Option<&'static std::panic::Location<'static>>,
    pub syscall: Option<&'static str>,
    pub errno: Option<i32>,
}

impl RatchetError {
    #[track_caller]
    pub fn new(function: &'static str, kind: ErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            function,
            location: Some(std::panic::Location::caller()),
            syscall: None,
            errno: None,
        }
    }

    pub fn with_syscall(mut self, syscall: &'static str) -> Self {
        self.syscall = Some(syscall);
        self
    }

    pub fn with_errno(mut self, errno: i32) -> Self {
        self.errno = Some(errno);
        self
    }

    /// Build from a syscall's raw errno, mapping it via [`ErrorKind::from_errno`].
    /// Falls back to `ErrorKind::Einval` with the raw errno preserved if the
    /// value isn't one this crate names explicitly.
    #[track_caller]
    pub fn from_errno(function: &'static str, syscall: &'static str, errno: i32) -> Self {
        let kind = ErrorKind::from_errno(errno).unwrap_or(ErrorKind::Einval);
        let description = std::io::Error::from_raw_os_error(errno).to_string();
        Self::new(function, kind, description)
            .with_syscall(syscall)
            .with_errno(errno)
    }
}

impl PartialEq for RatchetError {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl PartialEq<ErrorKind> for RatchetError {
    fn eq(&self, other: &ErrorKind) -> bool {
        self.kind == *other
    }
}

impl PartialEq<RatchetError> for ErrorKind {
    fn eq(&self, other: &RatchetError) -> bool {
        *self == other.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compares_equal_to_its_code_name() {
        let err = RatchetError::new("connect", ErrorKind::Etimedout, "deadline exceeded");
        assert_eq!(err, ErrorKind::Etimedout);
        assert_ne!(err, ErrorKind::Ealready);
    }

    #[test]
    fn from_errno_maps_known_values() {
        let err = RatchetError::from_errno("recv", "recv(2)", libc::ECONNRESET);
        assert_eq!(err, ErrorKind::Econnreset);
        assert_eq!(err.syscall, Some("recv(2)"));
        assert_eq!(err.errno, Some(libc::ECONNRESET));
    }

    #[test]
    fn transient_kinds_are_recoverable_locally() {
        assert!(ErrorKind::Eagain.is_transient());
        assert!(ErrorKind::Eintr.is_transient());
        assert!(!ErrorKind::Etimedout.is_transient());
    }
}
