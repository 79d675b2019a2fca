//! Kernel-visible error numbers.
//!
//! Handlers resolve every failure to one of these before it crosses the
//! FUSE boundary; the raw value is what ends up in the kernel reply.

use std::fmt;

use libc::c_int;

/// An errno value returned to the kernel.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub c_int);

impl Errno {
    /// No such file or directory.
    pub const ENOENT: Errno = Errno(libc::ENOENT);
    /// Operation not permitted.
    pub const EPERM: Errno = Errno(libc::EPERM);
    /// Permission denied.
    pub const EACCES: Errno = Errno(libc::EACCES);
    /// Directory not empty.
    pub const ENOTEMPTY: Errno = Errno(libc::ENOTEMPTY);
    /// Cross-device link or rename.
    pub const EXDEV: Errno = Errno(libc::EXDEV);
    /// Operation not supported.
    pub const ENOSYS: Errno = Errno(libc::ENOSYS);
    /// Stale file handle.
    pub const ESTALE: Errno = Errno(libc::ESTALE);
    /// Interrupted system call.
    pub const EINTR: Errno = Errno(libc::EINTR);
    /// Input/output error.
    pub const EIO: Errno = Errno(libc::EIO);
    /// Not a directory.
    pub const ENOTDIR: Errno = Errno(libc::ENOTDIR);
    /// Is a directory.
    pub const EISDIR: Errno = Errno(libc::EISDIR);
    /// File exists.
    pub const EEXIST: Errno = Errno(libc::EEXIST);
    /// Invalid argument.
    pub const EINVAL: Errno = Errno(libc::EINVAL);
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Errno({})", self.0)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "errno {}", self.0)
    }
}
