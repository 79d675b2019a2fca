//! Regular file nodes.
//!
//! All content operations proxy straight to the operations layer, which
//! guarantees that local writes are visible to subsequent local reads;
//! nothing is cached here.

use std::sync::Arc;

use fuser::FileAttr;

use crate::errno::Errno;
use crate::folder::Folder;
use crate::fs::FsInner;
use crate::fs::SetattrRequest;
use crate::fs::time_of;
use crate::fs::unhandled_setattr_bits;
use crate::ops::NodeId;
use crate::ops::OpContext;

pub(crate) struct FileNode {
    pub(crate) folder: Arc<Folder>,
    pub(crate) id: NodeId,
}

impl FileNode {
    pub(crate) fn attr(&self, fs: &FsInner, ctx: &OpContext, ino: u64) -> Result<FileAttr, Errno> {
        fs.stat_attr(ctx, ino, self.id, self.folder.public())
    }

    pub(crate) fn read(
        &self,
        fs: &FsInner,
        ctx: &OpContext,
        off: u64,
        size: u32,
    ) -> Result<Vec<u8>, Errno> {
        let mut buf = vec![0; size as usize];
        let n = fs
            .ops()
            .read(ctx, self.id, off, &mut buf)
            .map_err(|err| fs.report_errno("read", err))?;
        buf.truncate(n);
        Ok(buf)
    }

    pub(crate) fn write(
        &self,
        fs: &FsInner,
        ctx: &OpContext,
        off: u64,
        data: &[u8],
    ) -> Result<u32, Errno> {
        fs.ops()
            .write(ctx, self.id, off, data)
            .map_err(|err| fs.report_errno("write", err))?;
        Ok(data.len() as u32)
    }

    /// Flush and fsync both push buffered writes out, so close() surfaces
    /// write errors.
    pub(crate) fn sync(&self, fs: &FsInner, ctx: &OpContext) -> Result<(), Errno> {
        fs.ops()
            .sync(ctx, self.id)
            .map_err(|err| fs.report_errno("fsync", err))
    }

    pub(crate) fn setattr(
        &self,
        fs: &FsInner,
        ctx: &OpContext,
        ino: u64,
        req: &SetattrRequest,
    ) -> Result<FileAttr, Errno> {
        if unhandled_setattr_bits(req) {
            return Err(Errno::ENOSYS);
        }
        if let Some(size) = req.size {
            fs.ops()
                .truncate(ctx, self.id, size)
                .map_err(|err| fs.report_errno("setattr", err))?;
        }
        if let Some(mode) = req.mode {
            // Only the executable bit is meaningful; other mode changes
            // are accepted and dropped.
            let exec = mode & 0o100 != 0;
            fs.ops()
                .set_ex(ctx, self.id, exec)
                .map_err(|err| fs.report_errno("setattr", err))?;
        }
        if let Some(mtime) = req.mtime {
            fs.ops()
                .set_mtime(ctx, self.id, time_of(mtime))
                .map_err(|err| fs.report_errno("setattr", err))?;
        }
        // atime is accepted and dropped.
        self.attr(fs, ctx, ino)
    }
}
