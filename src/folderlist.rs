//! The `/private` and `/public` virtual directories.
//!
//! A folder list maps canonical folder names to the inode serving that
//! folder. Lookup parses and canonicalizes names; listing surfaces the
//! current user's favorites.

use std::collections::HashMap;
use std::sync::Arc;

use fuser::FileType;
use parking_lot::Mutex;

use crate::errno::Errno;
use crate::fs::DirEntryOut;
use crate::fs::EntryOut;
use crate::fs::FsInner;
use crate::fs::NodeRef;
use crate::fs::UNKNOWN_INO;
use crate::handle::HandleError;
use crate::handle::TlfHandle;
use crate::handle::parse_tlf_handle;
use crate::ops::OpContext;
use crate::special;

pub(crate) struct FolderList {
    public: bool,
    /// Canonical folder name -> inode of the folder's root (or its
    /// placeholder before the root node has been fetched).
    folders: Mutex<HashMap<String, u64>>,
}

/// A folder known by name whose root node has not been fetched yet. The
/// first operation needing real data promotes it, in place, to the
/// folder's root directory.
pub(crate) struct TlfPlaceholder {
    pub(crate) handle: TlfHandle,
    pub(crate) list: Arc<FolderList>,
}

impl FolderList {
    pub(crate) fn new(public: bool) -> FolderList {
        FolderList {
            public,
            folders: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn get(&self, name: &str) -> Option<u64> {
        self.folders.lock().get(name).copied()
    }

    pub(crate) fn set(&self, name: &str, ino: u64) {
        self.folders.lock().insert(name.to_string(), ino);
    }

    /// Called when a folder quiesces or its placeholder is forgotten.
    pub(crate) fn forget_folder(&self, name: &str) {
        self.folders.lock().remove(name);
    }

    pub(crate) fn lookup(
        self: &Arc<Self>,
        fs: &FsInner,
        ctx: &OpContext,
        name: &str,
    ) -> Result<EntryOut, Errno> {
        if let Some(kind) = special::mount_special(name) {
            return fs.special_entry(ctx, kind);
        }
        // Sidestep Finder's resource-fork probes; parsing them would
        // conjure phantom folders.
        if name.starts_with("._") {
            return Err(Errno::ENOENT);
        }
        if let Some((ino, node)) = fs.existing_folder_entry(self, name) {
            return match node {
                NodeRef::Tlf(ph) => Ok(EntryOut {
                    ino,
                    attr: fs.dir_stub_attr(ino, ph.handle.public()),
                }),
                NodeRef::Dir(dir) => Ok(EntryOut {
                    ino,
                    attr: dir.attr(fs, ctx, ino)?,
                }),
                _ => Err(Errno::ESTALE),
            };
        }
        match parse_tlf_handle(ctx, fs.kbpki().as_ref(), name, self.public) {
            Ok(handle) => Ok(fs.insert_tlf_placeholder(self, handle)),
            Err(HandleError::NonCanonical(canonical)) => Ok(fs.insert_alias(canonical)),
            Err(
                HandleError::NoSuchUser(_)
                | HandleError::ReadersInPublic
                | HandleError::BadName(_),
            ) => Err(Errno::ENOENT),
            Err(HandleError::Ops(err)) => Err(fs.report_errno("lookup", err)),
        }
    }

    /// Lists the current user's favorites on this side of the namespace;
    /// with nobody logged in the listing is empty.
    pub(crate) fn readdir(
        &self,
        fs: &FsInner,
        ctx: &OpContext,
    ) -> Result<Vec<DirEntryOut>, Errno> {
        let user = fs
            .kbpki()
            .current_user(ctx)
            .map_err(|err| fs.report_errno("readdir", err))?;
        if user.is_none() {
            return Ok(Vec::new());
        }
        let favorites = fs
            .ops()
            .get_favorites(ctx)
            .map_err(|err| fs.report_errno("readdir", err))?;
        Ok(favorites
            .into_iter()
            .filter(|favorite| favorite.public == self.public)
            .map(|favorite| DirEntryOut {
                ino: UNKNOWN_INO,
                kind: FileType::Directory,
                name: favorite.name,
            })
            .collect())
    }
}
