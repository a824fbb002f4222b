//! Status codes
//!
//! Every fallible operation reports a negative status. On unix the value is
//! the negated `errno`; codes without a system counterpart (`EOF`, the
//! resolver's `EAI_*` family, ...) use fixed values outside the errno range.

use std::borrow::Cow;
use std::fmt;
use std::io;

/// Result type for loop operations
pub type UvResult<T> = Result<T, Errno>;

/// A negative status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(i32);

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name(), self.message())
    }
}

impl std::error::Error for Errno {}

// Codes that only exist on some unix flavours fall back to fixed values.
#[cfg(target_os = "linux")]
mod raw {
    pub const ENONET: i32 = libc::ENONET;
    pub const EREMOTEIO: i32 = libc::EREMOTEIO;
    pub const EUNATCH: i32 = libc::EUNATCH;
}

#[cfg(not(target_os = "linux"))]
mod raw {
    pub const ENONET: i32 = 4056;
    pub const EREMOTEIO: i32 = 4030;
    pub const EUNATCH: i32 = 4023;
}

macro_rules! errno_map {
    ($(($name:ident, $code:expr, $msg:literal)),* $(,)?) => {
        impl Errno {
            $(
                #[doc = $msg]
                pub const $name: Errno = Errno($code);
            )*
        }

        const TABLE: &[(Errno, &str, &str)] = &[
            $((Errno::$name, stringify!($name), $msg),)*
        ];
    };
}

errno_map! {
    (E2BIG, -libc::E2BIG, "argument list too long"),
    (EACCES, -libc::EACCES, "permission denied"),
    (EADDRINUSE, -libc::EADDRINUSE, "address already in use"),
    (EADDRNOTAVAIL, -libc::EADDRNOTAVAIL, "address not available"),
    (EAFNOSUPPORT, -libc::EAFNOSUPPORT, "address family not supported"),
    (EAGAIN, -libc::EAGAIN, "resource temporarily unavailable"),
    (EAI_ADDRFAMILY, -3000, "address family not supported"),
    (EAI_AGAIN, -3001, "temporary failure"),
    (EAI_BADFLAGS, -3002, "bad ai_flags value"),
    (EAI_CANCELED, -3003, "request canceled"),
    (EAI_FAIL, -3004, "permanent failure"),
    (EAI_FAMILY, -3005, "ai_family not supported"),
    (EAI_MEMORY, -3006, "out of memory"),
    (EAI_NODATA, -3007, "no address"),
    (EAI_NONAME, -3008, "unknown node or service"),
    (EAI_OVERFLOW, -3009, "argument buffer overflow"),
    (EAI_SERVICE, -3010, "service not available for socket type"),
    (EAI_SOCKTYPE, -3011, "socket type not supported"),
    (EAI_BADHINTS, -3013, "invalid value for hints"),
    (EAI_PROTOCOL, -3014, "resolved protocol is unknown"),
    (EALREADY, -libc::EALREADY, "connection already in progress"),
    (EBADF, -libc::EBADF, "bad file descriptor"),
    (EBUSY, -libc::EBUSY, "resource busy or locked"),
    (ECANCELED, -libc::ECANCELED, "operation canceled"),
    (ECHARSET, -4080, "invalid Unicode character"),
    (ECONNABORTED, -libc::ECONNABORTED, "software caused connection abort"),
    (ECONNREFUSED, -libc::ECONNREFUSED, "connection refused"),
    (ECONNRESET, -libc::ECONNRESET, "connection reset by peer"),
    (EDESTADDRREQ, -libc::EDESTADDRREQ, "destination address required"),
    (EEXIST, -libc::EEXIST, "file already exists"),
    (EFAULT, -libc::EFAULT, "bad address in system call argument"),
    (EFBIG, -libc::EFBIG, "file too large"),
    (EHOSTUNREACH, -libc::EHOSTUNREACH, "host is unreachable"),
    (EINTR, -libc::EINTR, "interrupted system call"),
    (EINVAL, -libc::EINVAL, "invalid argument"),
    (EIO, -libc::EIO, "i/o error"),
    (EISCONN, -libc::EISCONN, "socket is already connected"),
    (EISDIR, -libc::EISDIR, "illegal operation on a directory"),
    (ELOOP, -libc::ELOOP, "too many symbolic links encountered"),
    (EMFILE, -libc::EMFILE, "too many open files"),
    (EMSGSIZE, -libc::EMSGSIZE, "message too long"),
    (ENAMETOOLONG, -libc::ENAMETOOLONG, "name too long"),
    (ENETDOWN, -libc::ENETDOWN, "network is down"),
    (ENETUNREACH, -libc::ENETUNREACH, "network is unreachable"),
    (ENFILE, -libc::ENFILE, "file table overflow"),
    (ENOBUFS, -libc::ENOBUFS, "no buffer space available"),
    (ENODEV, -libc::ENODEV, "no such device"),
    (ENOENT, -libc::ENOENT, "no such file or directory"),
    (ENOMEM, -libc::ENOMEM, "not enough memory"),
    (ENONET, -raw::ENONET, "machine is not on the network"),
    (ENOPROTOOPT, -libc::ENOPROTOOPT, "protocol not available"),
    (ENOSPC, -libc::ENOSPC, "no space left on device"),
    (ENOSYS, -libc::ENOSYS, "function not implemented"),
    (ENOTCONN, -libc::ENOTCONN, "socket is not connected"),
    (ENOTDIR, -libc::ENOTDIR, "not a directory"),
    (ENOTEMPTY, -libc::ENOTEMPTY, "directory not empty"),
    (ENOTSOCK, -libc::ENOTSOCK, "socket operation on non-socket"),
    (ENOTSUP, -libc::ENOTSUP, "operation not supported on socket"),
    (EOVERFLOW, -libc::EOVERFLOW, "value too large for defined data type"),
    (EPERM, -libc::EPERM, "operation not permitted"),
    (EPIPE, -libc::EPIPE, "broken pipe"),
    (EPROTO, -libc::EPROTO, "protocol error"),
    (EPROTONOSUPPORT, -libc::EPROTONOSUPPORT, "protocol not supported"),
    (EPROTOTYPE, -libc::EPROTOTYPE, "protocol wrong type for socket"),
    (ERANGE, -libc::ERANGE, "result too large"),
    (EROFS, -libc::EROFS, "read-only file system"),
    (ESHUTDOWN, -libc::ESHUTDOWN, "cannot send after transport endpoint shutdown"),
    (ESPIPE, -libc::ESPIPE, "invalid seek"),
    (ESRCH, -libc::ESRCH, "no such process"),
    (ETIMEDOUT, -libc::ETIMEDOUT, "connection timed out"),
    (ETXTBSY, -libc::ETXTBSY, "text file is busy"),
    (EXDEV, -libc::EXDEV, "cross-device link not permitted"),
    (UNKNOWN, -4094, "unknown error"),
    (EOF, -4095, "end of file"),
    (ENXIO, -libc::ENXIO, "no such device or address"),
    (EMLINK, -libc::EMLINK, "too many links"),
    (EHOSTDOWN, -libc::EHOSTDOWN, "host is down"),
    (EREMOTEIO, -raw::EREMOTEIO, "remote I/O error"),
    (ENOTTY, -libc::ENOTTY, "inappropriate ioctl for device"),
    (EFTYPE, -4028, "inappropriate file type or format"),
    (EILSEQ, -libc::EILSEQ, "illegal byte sequence"),
    (ESOCKTNOSUPPORT, -libc::ESOCKTNOSUPPORT, "socket type not supported"),
    (ENODATA, -libc::ENODATA, "no data available"),
    (EUNATCH, -raw::EUNATCH, "protocol driver not attached"),
}

impl Errno {
    /// Wrap a raw status. Positive values are treated as system errno values.
    pub fn from_raw(code: i32) -> Self {
        Errno::translate_sys_error(code)
    }

    /// Map a system errno (positive) to a status code; non-positive values
    /// are already status codes and pass through.
    pub fn translate_sys_error(sys_errno: i32) -> Self {
        if sys_errno > 0 {
            Errno(-sys_errno)
        } else {
            Errno(sys_errno)
        }
    }

    /// The status from the calling thread's `errno`.
    pub fn last_os_error() -> Self {
        Errno::from_io(&io::Error::last_os_error())
    }

    /// Status for an I/O error.
    pub fn from_io(err: &io::Error) -> Self {
        if let Some(code) = err.raw_os_error() {
            return Errno::translate_sys_error(code);
        }
        match err.kind() {
            io::ErrorKind::NotFound => Errno::ENOENT,
            io::ErrorKind::PermissionDenied => Errno::EACCES,
            io::ErrorKind::AlreadyExists => Errno::EEXIST,
            io::ErrorKind::InvalidInput => Errno::EINVAL,
            io::ErrorKind::InvalidData => Errno::ECHARSET,
            io::ErrorKind::UnexpectedEof => Errno::EOF,
            io::ErrorKind::WouldBlock => Errno::EAGAIN,
            io::ErrorKind::Interrupted => Errno::EINTR,
            io::ErrorKind::Unsupported => Errno::ENOTSUP,
            io::ErrorKind::OutOfMemory => Errno::ENOMEM,
            _ => Errno::EIO,
        }
    }

    /// Map a resolver (`getaddrinfo`) error to a status code.
    pub fn from_gai(code: i32) -> Self {
        match code {
            libc::EAI_AGAIN => Errno::EAI_AGAIN,
            libc::EAI_BADFLAGS => Errno::EAI_BADFLAGS,
            libc::EAI_FAIL => Errno::EAI_FAIL,
            libc::EAI_FAMILY => Errno::EAI_FAMILY,
            libc::EAI_MEMORY => Errno::EAI_MEMORY,
            libc::EAI_NONAME => Errno::EAI_NONAME,
            libc::EAI_OVERFLOW => Errno::EAI_OVERFLOW,
            libc::EAI_SERVICE => Errno::EAI_SERVICE,
            libc::EAI_SOCKTYPE => Errno::EAI_SOCKTYPE,
            #[cfg(target_os = "linux")]
            libc::EAI_NODATA => Errno::EAI_NODATA,
            libc::EAI_SYSTEM => Errno::last_os_error(),
            _ => Errno::UNKNOWN,
        }
    }

    /// Raw negative value.
    pub fn code(self) -> i32 {
        self.0
    }

    /// Every code with a symbolic name.
    pub fn all() -> impl Iterator<Item = Errno> {
        TABLE.iter().map(|(errno, _, _)| *errno)
    }

    /// Look a code up by its symbolic name (`"ENOENT"`).
    pub fn from_name(name: &str) -> Option<Errno> {
        TABLE.iter().find(|(_, n, _)| *n == name).map(|(errno, _, _)| *errno)
    }

    /// Symbolic name, e.g. `"ENOENT"`.
    pub fn name(self) -> Cow<'static, str> {
        match TABLE.iter().find(|(errno, _, _)| *errno == self) {
            Some((_, name, _)) => Cow::Borrowed(name),
            None => Cow::Owned(format!("Unknown system error {}", self.0)),
        }
    }

    /// Human readable message, e.g. `"no such file or directory"`.
    pub fn message(self) -> Cow<'static, str> {
        match TABLE.iter().find(|(errno, _, _)| *errno == self) {
            Some((_, _, msg)) => Cow::Borrowed(msg),
            None => Cow::Owned(format!("Unknown system error {}", self.0)),
        }
    }
}

impl From<io::Error> for Errno {
    fn from(err: io::Error) -> Self {
        Errno::from_io(&err)
    }
}

/// Map a `-1`-on-failure libc return value.
pub(crate) fn check(ret: libc::c_int) -> UvResult<libc::c_int> {
    if ret < 0 {
        Err(Errno::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Map a `-1`-on-failure libc size return value.
pub(crate) fn check_size(ret: libc::ssize_t) -> UvResult<usize> {
    if ret < 0 {
        Err(Errno::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_and_messages() {
        assert_eq!(Errno::ENOENT.name(), "ENOENT");
        assert_eq!(Errno::ENOENT.message(), "no such file or directory");
        assert_eq!(Errno::EOF.code(), -4095);
        assert_eq!(Errno::ENOENT.to_string(), "ENOENT: no such file or directory");
    }

    #[test]
    fn test_codes_are_unique_and_negative() {
        let codes: Vec<i32> = Errno::all().map(Errno::code).collect();
        let mut dedup = codes.clone();
        dedup.sort_unstable();
        dedup.dedup();
        assert_eq!(codes.len(), dedup.len());
        assert!(codes.iter().all(|c| *c < 0));
    }

    #[test]
    fn test_translate_sys_error() {
        assert_eq!(Errno::translate_sys_error(libc::ENOENT), Errno::ENOENT);
        assert_eq!(Errno::translate_sys_error(Errno::EOF.code()), Errno::EOF);
    }

    #[test]
    fn test_from_io() {
        let err = io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(Errno::from_io(&err), Errno::EACCES);
        let err = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(Errno::from_io(&err), Errno::ENOENT);
    }

    #[test]
    fn test_unknown_code() {
        let odd = Errno::from_raw(-99_999);
        assert_eq!(odd.name(), "Unknown system error -99999");
        assert_eq!(odd.message(), "Unknown system error -99999");
    }

    #[test]
    fn test_from_name() {
        assert_eq!(Errno::from_name("EINVAL"), Some(Errno::EINVAL));
        assert_eq!(Errno::from_name("NOPE"), None);
    }
}
