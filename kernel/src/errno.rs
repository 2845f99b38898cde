//! POSIX errno values
//!
//! Kernel functions report failure as small negative integers drawn from the
//! POSIX errno set. `Errno` is a thin wrapper so error paths stay typed until
//! the syscall boundary flattens them into the return register.

use core::fmt;

/// A POSIX error number (stored as its positive magnitude).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Errno(i32);

/// Kernel-internal result type carried up to the syscall boundary.
pub type KResult<T> = Result<T, Errno>;

impl Errno {
    /// The positive errno magnitude.
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// The `-errno` form written into the syscall return register.
    pub const fn as_ret(self) -> i64 {
        -(self.0 as i64)
    }

    /// Recover an `Errno` from a negative syscall-style return value.
    pub const fn from_ret(ret: i64) -> Option<Errno> {
        if ret < 0 && ret >= -4096 {
            Some(Errno(-ret as i32))
        } else {
            None
        }
    }
}

/// Operation not permitted
pub const EPERM: Errno = Errno(1);
/// No such file or directory
pub const ENOENT: Errno = Errno(2);
/// No such process
pub const ESRCH: Errno = Errno(3);
/// Interrupted system call
pub const EINTR: Errno = Errno(4);
/// I/O error
pub const EIO: Errno = Errno(5);
/// No such device or address
pub const ENXIO: Errno = Errno(6);
/// Argument list too long
pub const E2BIG: Errno = Errno(7);
/// Exec format error
pub const ENOEXEC: Errno = Errno(8);
/// Bad file descriptor
pub const EBADF: Errno = Errno(9);
/// No child processes
pub const ECHILD: Errno = Errno(10);
/// Resource temporarily unavailable (would block)
pub const EAGAIN: Errno = Errno(11);
/// Cannot allocate memory
pub const ENOMEM: Errno = Errno(12);
/// Permission denied
pub const EACCES: Errno = Errno(13);
/// Bad address
pub const EFAULT: Errno = Errno(14);
/// Device or resource busy
pub const EBUSY: Errno = Errno(16);
/// File exists
pub const EEXIST: Errno = Errno(17);
/// Cross-device link
pub const EXDEV: Errno = Errno(18);
/// No such device
pub const ENODEV: Errno = Errno(19);
/// Not a directory
pub const ENOTDIR: Errno = Errno(20);
/// Is a directory
pub const EISDIR: Errno = Errno(21);
/// Invalid argument
pub const EINVAL: Errno = Errno(22);
/// Too many open files in system
pub const ENFILE: Errno = Errno(23);
/// Too many open files
pub const EMFILE: Errno = Errno(24);
/// Inappropriate ioctl for device
pub const ENOTTY: Errno = Errno(25);
/// File too large
pub const EFBIG: Errno = Errno(27);
/// No space left on device
pub const ENOSPC: Errno = Errno(28);
/// Illegal seek
pub const ESPIPE: Errno = Errno(29);
/// Read-only file system
pub const EROFS: Errno = Errno(30);
/// Too many links
pub const EMLINK: Errno = Errno(31);
/// Broken pipe
pub const EPIPE: Errno = Errno(32);
/// Numerical result out of range
pub const ERANGE: Errno = Errno(34);
/// File name too long
pub const ENAMETOOLONG: Errno = Errno(36);
/// Function not implemented
pub const ENOSYS: Errno = Errno(38);
/// Directory not empty
pub const ENOTEMPTY: Errno = Errno(39);
/// Too many levels of symbolic links
pub const ELOOP: Errno = Errno(40);
/// Not a socket
pub const ENOTSOCK: Errno = Errno(88);
/// Destination address required
pub const EDESTADDRREQ: Errno = Errno(89);
/// Message too long
pub const EMSGSIZE: Errno = Errno(90);
/// Operation not supported
pub const ENOTSUP: Errno = Errno(95);
/// Connection refused
pub const ECONNREFUSED: Errno = Errno(111);
/// No route to host
pub const EHOSTUNREACH: Errno = Errno(113);

/// Kernel-internal: restart the interrupted syscall if the handler allows it.
/// Never visible to userspace; the syscall return path converts it to either
/// a transparent restart or `EINTR`.
pub const ERESTARTSYS: Errno = Errno(512);

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            EPERM => "EPERM",
            ENOENT => "ENOENT",
            ESRCH => "ESRCH",
            EINTR => "EINTR",
            EIO => "EIO",
            ENXIO => "ENXIO",
            E2BIG => "E2BIG",
            ENOEXEC => "ENOEXEC",
            EBADF => "EBADF",
            ECHILD => "ECHILD",
            EAGAIN => "EAGAIN",
            ENOMEM => "ENOMEM",
            EACCES => "EACCES",
            EFAULT => "EFAULT",
            EBUSY => "EBUSY",
            EEXIST => "EEXIST",
            EXDEV => "EXDEV",
            ENODEV => "ENODEV",
            ENOTDIR => "ENOTDIR",
            EISDIR => "EISDIR",
            EINVAL => "EINVAL",
            ENFILE => "ENFILE",
            EMFILE => "EMFILE",
            ENOTTY => "ENOTTY",
            EFBIG => "EFBIG",
            ENOSPC => "ENOSPC",
            ESPIPE => "ESPIPE",
            EROFS => "EROFS",
            EMLINK => "EMLINK",
            EPIPE => "EPIPE",
            ERANGE => "ERANGE",
            ENAMETOOLONG => "ENAMETOOLONG",
            ENOSYS => "ENOSYS",
            ENOTEMPTY => "ENOTEMPTY",
            ELOOP => "ELOOP",
            ENOTSOCK => "ENOTSOCK",
            EDESTADDRREQ => "EDESTADDRREQ",
            EMSGSIZE => "EMSGSIZE",
            ENOTSUP => "ENOTSUP",
            ECONNREFUSED => "ECONNREFUSED",
            EHOSTUNREACH => "EHOSTUNREACH",
            ERESTARTSYS => "ERESTARTSYS",
            _ => return write!(f, "Errno({})", self.0),
        };
        f.write_str(name)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn ret_round_trip() {
        assert_eq!(EAGAIN.as_ret(), -11);
        assert_eq!(Errno::from_ret(-11), Some(EAGAIN));
        assert_eq!(Errno::from_ret(0), None);
        assert_eq!(Errno::from_ret(42), None);
    }

    #[test_case]
    fn restartsys_is_internal() {
        // Must stay outside the user-visible errno range used by libc.
        assert!(ERESTARTSYS.raw() > 255);
    }
}
