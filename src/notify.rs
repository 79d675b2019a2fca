//! Invalidation egress to the kernel.
//!
//! The mount layer hands out a [`fuser::Notifier`] once a session exists;
//! [`KernelNotifier`] abstracts it so the notification path can run
//! without a kernel (tests record the calls instead). "Not cached"
//! responses are expected and swallowed: the kernel may have dropped the
//! entry on its own already.

use std::ffi::OsStr;
use std::io;

/// The kernel's cache-invalidation surface.
pub trait KernelNotifier: Send + Sync {
    /// Drop all cached data of an inode.
    fn invalidate_node_data(&self, ino: u64) -> io::Result<()>;

    /// Drop cached data in `[off, off+len)`; negative `len` means to end.
    fn invalidate_node_data_range(&self, ino: u64, off: i64, len: i64) -> io::Result<()>;

    /// Drop cached attributes of an inode.
    fn invalidate_node_attr(&self, ino: u64) -> io::Result<()>;

    /// Drop one name from the dentry cache under `parent`.
    fn invalidate_entry(&self, parent: u64, name: &OsStr) -> io::Result<()>;
}

/// [`KernelNotifier`] backed by a live FUSE session.
pub struct FuseNotifier {
    inner: fuser::Notifier,
}

impl FuseNotifier {
    /// Wrap a session's notifier.
    pub fn new(inner: fuser::Notifier) -> FuseNotifier {
        FuseNotifier { inner }
    }

    fn inval_inode(&self, ino: u64, off: i64, len: i64) -> io::Result<()> {
        ignore_uncached(self.inner.inval_inode(ino, off, len))
    }
}

impl KernelNotifier for FuseNotifier {
    fn invalidate_node_data(&self, ino: u64) -> io::Result<()> {
        self.inval_inode(ino, 0, -1)
    }

    fn invalidate_node_data_range(&self, ino: u64, off: i64, len: i64) -> io::Result<()> {
        self.inval_inode(ino, off, len)
    }

    fn invalidate_node_attr(&self, ino: u64) -> io::Result<()> {
        self.inval_inode(ino, 0, 0)
    }

    fn invalidate_entry(&self, parent: u64, name: &OsStr) -> io::Result<()> {
        ignore_uncached(self.inner.inval_entry(parent, name))
    }
}

fn ignore_uncached(res: io::Result<()>) -> io::Result<()> {
    match res {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
