//! Symlink nodes.
//!
//! Two flavors exist: entries created inside a folder, which resolve
//! their target through the parent directory on every read, and aliases,
//! which redirect a non-canonical folder name to its canonical form.
//! Neither appears in a folder's node map.

use std::sync::Arc;

use fuser::FileAttr;

use crate::dir::DirNode;
use crate::errno::Errno;
use crate::fs::FsInner;
use crate::ops::OpContext;
use crate::ops::OpsError;

pub(crate) enum SymlinkNode {
    /// A symlink entry inside a folder, identified by parent and name.
    Entry {
        parent: Arc<DirNode>,
        name: String,
    },
    /// A canonical-name redirect presented by a folder list.
    Alias { target: String },
}

impl SymlinkNode {
    pub(crate) fn readlink(&self, fs: &FsInner, ctx: &OpContext) -> Result<String, Errno> {
        match self {
            SymlinkNode::Alias { target } => Ok(target.clone()),
            SymlinkNode::Entry { parent, name } => {
                let (_, ei) = match fs.ops().lookup(ctx, parent.id, name) {
                    Ok(found) => found,
                    Err(OpsError::NoSuchName(_)) => return Err(Errno::ESTALE),
                    Err(err) => return Err(fs.report_errno("readlink", err)),
                };
                ei.sym_path.ok_or_else(|| {
                    let err = OpsError::Other(format!("{name} is no longer a symlink"));
                    fs.report_errno("readlink", err)
                })
            }
        }
    }

    pub(crate) fn attr(&self, fs: &FsInner, ctx: &OpContext, ino: u64) -> Result<FileAttr, Errno> {
        match self {
            SymlinkNode::Alias { target } => {
                Ok(fs.symlink_attr(ino, target.len() as u64, fs.start_time()))
            }
            SymlinkNode::Entry { parent, name } => {
                let (_, ei) = match fs.ops().lookup(ctx, parent.id, name) {
                    Ok(found) => found,
                    Err(OpsError::NoSuchName(_)) => return Err(Errno::ESTALE),
                    Err(err) => return Err(fs.report_errno("getattr", err)),
                };
                let size = ei.sym_path.as_ref().map_or(ei.size, |t| t.len() as u64);
                Ok(fs.symlink_attr(ino, size, ei.mtime))
            }
        }
    }
}
