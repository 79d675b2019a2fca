//! The `fuser::Filesystem` shim.
//!
//! Nothing lives here but translation: OsStr names become UTF-8, errnos
//! become replies, and every operation delegates to the kernel-ingress
//! methods on [`KbfsFs`]. Names that are not UTF-8 cannot exist in KBFS.

use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;
use std::time::SystemTime;

use fuser::Filesystem;
use fuser::ReplyAttr;
use fuser::ReplyCreate;
use fuser::ReplyData;
use fuser::ReplyDirectory;
use fuser::ReplyEmpty;
use fuser::ReplyEntry;
use fuser::ReplyOpen;
use fuser::ReplyWrite;
use fuser::Request;
use fuser::TimeOrNow;

use crate::fs::KbfsFs;
use crate::fs::SetattrRequest;

/// How long the kernel may cache entries and attributes. Staleness past
/// this window is handled by the invalidation protocol.
const TTL: Duration = Duration::from_secs(1);

const GENERATION: u64 = 0;

impl Filesystem for KbfsFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        match KbfsFs::lookup(self, parent, name) {
            Ok(out) => reply.entry(&TTL, &out.attr, GENERATION),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        KbfsFs::forget(self, ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match KbfsFs::getattr(self, ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno.0),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        ctime: Option<SystemTime>,
        _fh: Option<u64>,
        crtime: Option<SystemTime>,
        chgtime: Option<SystemTime>,
        bkuptime: Option<SystemTime>,
        flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let req = SetattrRequest {
            mode,
            uid,
            gid,
            size,
            atime,
            mtime,
            ctime,
            crtime,
            chgtime,
            bkuptime,
            flags,
        };
        match KbfsFs::setattr(self, ino, &req) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match KbfsFs::readlink(self, ino) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        match KbfsFs::mkdir(self, parent, name) {
            Ok(out) => reply.entry(&TTL, &out.attr, GENERATION),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        match KbfsFs::remove(self, parent, name, false) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        match KbfsFs::remove(self, parent, name, true) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let (Some(name), Some(target)) = (link_name.to_str(), target.to_str()) else {
            reply.error(libc::EINVAL);
            return;
        };
        match KbfsFs::symlink(self, parent, name, target) {
            Ok(out) => reply.entry(&TTL, &out.attr, GENERATION),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(name), Some(newname)) = (name.to_str(), newname.to_str()) else {
            reply.error(libc::ENOENT);
            return;
        };
        match KbfsFs::rename(self, parent, name, newparent, newname) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.open_flags(ino) {
            Ok(flags) => reply.opened(0, flags),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        match KbfsFs::read(self, ino, offset, size) {
            Ok(data) => reply.data(&data),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        match KbfsFs::write(self, ino, offset, data) {
            Ok(written) => reply.written(written),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match KbfsFs::flush(self, ino) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match KbfsFs::fsync(self, ino) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match KbfsFs::readdir(self, ino) {
            Ok(entries) => entries,
            Err(errno) => {
                reply.error(errno.0);
                return;
            }
        };
        let dots = [
            (ino, fuser::FileType::Directory, ".".to_string()),
            (ino, fuser::FileType::Directory, "..".to_string()),
        ];
        let all = dots
            .into_iter()
            .chain(entries.into_iter().map(|e| (e.ino, e.kind, e.name)));
        for (i, (entry_ino, kind, name)) in all.enumerate().skip(offset as usize) {
            // i + 1 is the offset of the next entry.
            if reply.add(entry_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        match KbfsFs::create(self, parent, name, mode) {
            Ok(out) => reply.created(
                &TTL,
                &out.attr,
                GENERATION,
                0,
                fuser::consts::FOPEN_KEEP_CACHE,
            ),
            Err(errno) => reply.error(errno.0),
        }
    }
}
