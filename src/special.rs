//! Reserved pseudo-files.
//!
//! Read variants produce their bytes on demand and cache the result until
//! the backing source reports something newer. Control variants are
//! write-only; a write of any content triggers the corresponding
//! operations-layer side effect.

use std::sync::Arc;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use parking_lot::Mutex;

use crate::folder::Folder;
use crate::fs::FsInner;
use crate::ops::OpContext;
use crate::ops::OpsError;

/// Recent handler failures, whole-mount scope.
pub const ERROR_FILE_NAME: &str = ".kbfs_error";
/// Mount operation counters.
pub const METRICS_FILE_NAME: &str = ".kbfs_metrics";
/// Per-folder status, JSON.
pub const STATUS_FILE_NAME: &str = ".kbfs_status";
/// Write to abandon staged local changes.
pub const UNSTAGE_FILE_NAME: &str = ".kbfs_unstage";
/// Write to pause applying server updates.
pub const DISABLE_UPDATES_FILE_NAME: &str = ".kbfs_disable_updates";
/// Write to resume applying server updates.
pub const ENABLE_UPDATES_FILE_NAME: &str = ".kbfs_enable_updates";
/// Write to request a rekey of the folder.
pub const REKEY_FILE_NAME: &str = ".kbfs_rekey";

pub(crate) enum SpecialKind {
    Error,
    Metrics,
    Status(Arc<Folder>),
    Unstage(Arc<Folder>),
    DisableUpdates(Arc<Folder>),
    EnableUpdates(Arc<Folder>),
    Rekey(Arc<Folder>),
}

/// The reserved names available at the mount root and the folder lists.
pub(crate) fn mount_special(name: &str) -> Option<SpecialKind> {
    match name {
        ERROR_FILE_NAME => Some(SpecialKind::Error),
        METRICS_FILE_NAME => Some(SpecialKind::Metrics),
        _ => None,
    }
}

/// The reserved names available inside a folder.
pub(crate) fn folder_special(name: &str, folder: &Arc<Folder>) -> Option<SpecialKind> {
    match name {
        ERROR_FILE_NAME => Some(SpecialKind::Error),
        METRICS_FILE_NAME => Some(SpecialKind::Metrics),
        STATUS_FILE_NAME => Some(SpecialKind::Status(Arc::clone(folder))),
        UNSTAGE_FILE_NAME => Some(SpecialKind::Unstage(Arc::clone(folder))),
        DISABLE_UPDATES_FILE_NAME => Some(SpecialKind::DisableUpdates(Arc::clone(folder))),
        ENABLE_UPDATES_FILE_NAME => Some(SpecialKind::EnableUpdates(Arc::clone(folder))),
        REKEY_FILE_NAME => Some(SpecialKind::Rekey(Arc::clone(folder))),
        _ => None,
    }
}

pub(crate) struct SpecialNode {
    kind: SpecialKind,
    cache: Mutex<Option<(Vec<u8>, SystemTime)>>,
}

impl SpecialNode {
    pub(crate) fn new(kind: SpecialKind) -> SpecialNode {
        SpecialNode {
            kind,
            cache: Mutex::new(None),
        }
    }

    pub(crate) fn is_control(&self) -> bool {
        matches!(
            self.kind,
            SpecialKind::Unstage(_)
                | SpecialKind::DisableUpdates(_)
                | SpecialKind::EnableUpdates(_)
                | SpecialKind::Rekey(_)
        )
    }

    pub(crate) fn mode(&self) -> u16 {
        if self.is_control() { 0o222 } else { 0o444 }
    }

    /// Current bytes and mtime, recomputing when the source moved on.
    pub(crate) fn content(
        &self,
        fs: &FsInner,
        ctx: &OpContext,
    ) -> Result<(Vec<u8>, SystemTime), OpsError> {
        {
            let cache = self.cache.lock();
            if let Some((bytes, mtime)) = cache.as_ref() {
                // A known source mtime no newer than the cache means the
                // cached bytes are still current.
                if self.source_mtime(fs).is_some_and(|source| source <= *mtime) {
                    return Ok((bytes.clone(), *mtime));
                }
            }
        }
        // Produce outside the cache lock; it may call into the
        // operations layer.
        let produced = self.produce(fs, ctx)?;
        *self.cache.lock() = Some(produced.clone());
        Ok(produced)
    }

    fn source_mtime(&self, fs: &FsInner) -> Option<SystemTime> {
        match self.kind {
            SpecialKind::Error => Some(fs.reporter().last_error_time().unwrap_or(UNIX_EPOCH)),
            _ => None,
        }
    }

    fn produce(&self, fs: &FsInner, ctx: &OpContext) -> Result<(Vec<u8>, SystemTime), OpsError> {
        match &self.kind {
            SpecialKind::Error => {
                let mtime = fs.reporter().last_error_time().unwrap_or(UNIX_EPOCH);
                Ok((fs.reporter().render().into_bytes(), mtime))
            }
            SpecialKind::Metrics => Ok((fs.metrics().render().into_bytes(), SystemTime::now())),
            SpecialKind::Status(folder) => {
                let status = fs.ops().status(ctx, folder.fb())?;
                let mut bytes = serde_json::to_vec_pretty(&status)
                    .map_err(|err| OpsError::Other(err.to_string()))?;
                bytes.push(b'\n');
                Ok((bytes, SystemTime::now()))
            }
            _ => Ok((Vec::new(), SystemTime::now())),
        }
    }

    /// Handle a write to a control file. The content is ignored; writing
    /// anything triggers the side effect.
    pub(crate) fn write(
        &self,
        fs: &FsInner,
        ctx: &OpContext,
        _data: &[u8],
    ) -> Result<(), OpsError> {
        match &self.kind {
            SpecialKind::Unstage(folder) => fs.ops().unstage(ctx, folder.fb()),
            SpecialKind::DisableUpdates(folder) => {
                let resume = fs.ops().disable_updates(ctx, folder.fb())?;
                folder.pause_updates(resume);
                Ok(())
            }
            SpecialKind::EnableUpdates(folder) => {
                folder.resume_updates();
                Ok(())
            }
            SpecialKind::Rekey(folder) => fs.ops().rekey(ctx, folder.fb().tlf),
            _ => Err(OpsError::Other("file is read-only".to_string())),
        }
    }
}
