//! Directory nodes inside a folder.

use std::sync::Arc;

use fuser::FileAttr;

use crate::errno::Errno;
use crate::folder::Folder;
use crate::fs::DirEntryOut;
use crate::fs::EntryOut;
use crate::fs::FsInner;
use crate::fs::SetattrRequest;
use crate::fs::UNKNOWN_INO;
use crate::fs::file_type_of;
use crate::fs::time_of;
use crate::fs::unhandled_setattr_bits;
use crate::ops::EntryType;
use crate::ops::NodeId;
use crate::ops::OpContext;
use crate::ops::OpsError;
use crate::special;

/// A directory backed by a KBFS node. The folder's root directory is the
/// same type; a promoted TLF placeholder becomes one of these.
pub(crate) struct DirNode {
    pub(crate) folder: Arc<Folder>,
    pub(crate) id: NodeId,
}

impl DirNode {
    pub(crate) fn attr(&self, fs: &FsInner, ctx: &OpContext, ino: u64) -> Result<FileAttr, Errno> {
        fs.stat_attr(ctx, ino, self.id, self.folder.public())
    }

    /// Reserved names resolve to pseudo-files before the operations layer
    /// sees them; everything else forwards to `KbfsOps::lookup`.
    pub(crate) fn lookup(
        self: &Arc<Self>,
        fs: &FsInner,
        ctx: &OpContext,
        name: &str,
    ) -> Result<EntryOut, Errno> {
        if let Some(kind) = special::folder_special(name, &self.folder) {
            return fs.special_entry(ctx, kind);
        }
        let (node, ei) = match fs.ops().lookup(ctx, self.id, name) {
            Ok(found) => found,
            Err(OpsError::NoSuchName(_)) => return Err(Errno::ENOENT),
            Err(err) => return Err(fs.report_errno("lookup", err)),
        };
        match (node, ei.entry_type) {
            (Some(id), EntryType::Dir | EntryType::File | EntryType::Exec) => {
                Ok(fs.install_wrapper(&self.folder, id, &ei))
            }
            (None, EntryType::Sym) => Ok(fs.insert_symlink_entry(self, name, &ei)),
            (node, entry_type) => {
                let err = OpsError::Other(format!(
                    "lookup of {name} returned unexpected entry: node {node:?}, type {entry_type:?}"
                ));
                Err(fs.report_errno("lookup", err))
            }
        }
    }

    pub(crate) fn create(
        &self,
        fs: &FsInner,
        ctx: &OpContext,
        name: &str,
        mode: u32,
    ) -> Result<EntryOut, Errno> {
        let exec = mode & 0o100 != 0;
        let (id, ei) = fs
            .ops()
            .create_file(ctx, self.id, name, exec)
            .map_err(|err| fs.report_errno("create", err))?;
        Ok(fs.install_wrapper(&self.folder, id, &ei))
    }

    pub(crate) fn mkdir(
        &self,
        fs: &FsInner,
        ctx: &OpContext,
        name: &str,
    ) -> Result<EntryOut, Errno> {
        let (id, ei) = fs
            .ops()
            .create_dir(ctx, self.id, name)
            .map_err(|err| fs.report_errno("mkdir", err))?;
        Ok(fs.install_wrapper(&self.folder, id, &ei))
    }

    pub(crate) fn symlink(
        self: &Arc<Self>,
        fs: &FsInner,
        ctx: &OpContext,
        name: &str,
        target: &str,
    ) -> Result<EntryOut, Errno> {
        let ei = fs
            .ops()
            .create_link(ctx, self.id, name, target)
            .map_err(|err| fs.report_errno("symlink", err))?;
        Ok(fs.insert_symlink_entry(self, name, &ei))
    }

    /// The atomic step is the operations layer's; this only refuses the
    /// combinations the kernel can express but KBFS cannot serve.
    pub(crate) fn rename_to(
        &self,
        fs: &FsInner,
        ctx: &OpContext,
        name: &str,
        dest: &DirNode,
        new_name: &str,
    ) -> Result<(), Errno> {
        if !Arc::ptr_eq(&self.folder, &dest.folder) {
            return Err(Errno::EXDEV);
        }
        fs.ops()
            .rename(ctx, self.id, name, dest.id, new_name)
            .map_err(|err| fs.report_errno("rename", err))
    }

    /// Any wrapper for the removed entry stays in the node map until the
    /// kernel forgets it.
    pub(crate) fn remove(
        &self,
        fs: &FsInner,
        ctx: &OpContext,
        name: &str,
        dir: bool,
    ) -> Result<(), Errno> {
        if special::folder_special(name, &self.folder).is_some() {
            return Err(Errno::EPERM);
        }
        let res = if dir {
            fs.ops().remove_dir(ctx, self.id, name)
        } else {
            fs.ops().remove_entry(ctx, self.id, name)
        };
        res.map_err(|err| fs.report_errno("remove", err))
    }

    pub(crate) fn readdir(
        &self,
        fs: &FsInner,
        ctx: &OpContext,
    ) -> Result<Vec<DirEntryOut>, Errno> {
        let children = fs
            .ops()
            .get_dir_children(ctx, self.id)
            .map_err(|err| fs.report_errno("readdir", err))?;
        Ok(children
            .into_iter()
            .map(|(name, kind)| DirEntryOut {
                ino: UNKNOWN_INO,
                kind: file_type_of(kind),
                name,
            })
            .collect())
    }

    pub(crate) fn setattr(
        &self,
        fs: &FsInner,
        ctx: &OpContext,
        ino: u64,
        req: &SetattrRequest,
    ) -> Result<FileAttr, Errno> {
        if req.mode.is_some() {
            // Directory modes are fixed by the folder's visibility.
            return Err(Errno::EPERM);
        }
        if req.size.is_some() {
            return Err(Errno::EISDIR);
        }
        if unhandled_setattr_bits(req) {
            return Err(Errno::ENOSYS);
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
