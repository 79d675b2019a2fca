//! Kernel-facing adapter for the Keybase filesystem (KBFS).
//!
//! KBFS presents per-user, per-folder encrypted storage through an
//! ordinary kernel mount. This crate is the bridge: it maps kernel
//! inodes onto KBFS node identities, keeps that mapping coherent with
//! the kernel's reference-counted lookup cache, drives kernel cache
//! invalidations when other mounts change a folder, and layers the
//! virtual namespace (`/private`, `/public`, per-folder pseudo-files)
//! over the data path.
//!
//! The operations layer itself (metadata, blocks, crypto, conflict
//! resolution) is consumed through the [`ops::KbfsOps`] trait; the kernel
//! transport is the `fuser` crate. An in-memory operations layer lives in
//! [`memfs`] for local use and tests.

#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

pub use crate::errno::Errno;
pub use crate::fs::Config;
pub use crate::fs::DirEntryOut;
pub use crate::fs::EntryOut;
pub use crate::fs::FsResult;
pub use crate::fs::KbfsFs;
pub use crate::fs::PRIVATE_INO;
pub use crate::fs::PUBLIC_INO;
pub use crate::fs::ROOT_INO;
pub use crate::fs::SetattrRequest;
pub use crate::notify::FuseNotifier;
pub use crate::notify::KernelNotifier;

mod dir;
mod dispatch;
mod errno;
mod file;
mod folder;
mod folderlist;
mod fs;
mod fuse;
pub mod handle;
pub mod info;
pub mod memfs;
pub mod mounter;
mod notify;
pub mod ops;
pub mod reporter;
pub mod run;
pub mod special;
mod symlink;
