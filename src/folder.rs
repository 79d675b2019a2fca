//! Per-top-level-folder state.
//!
//! A [`Folder`] owns the mapping from live KBFS node ids to the inodes the
//! kernel knows them by, and turns change notifications from the
//! operations layer into kernel invalidations. The node map holds exactly
//! one wrapper per live node; symlinks and aliases never appear in it.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::mpsc::SyncSender;

use parking_lot::Mutex;

use crate::folderlist::FolderList;
use crate::fs::FsInner;
use crate::handle::TlfHandle;
use crate::notify::KernelNotifier;
use crate::ops::FolderBranch;
use crate::ops::NodeChange;
use crate::ops::NodeId;
use crate::ops::Observer;
use crate::ops::ObserverId;
use crate::ops::OpContext;
use crate::ops::WriteRange;

pub(crate) struct Folder {
    fs: Weak<FsInner>,
    list: Arc<FolderList>,
    handle: TlfHandle,
    name: String,
    fb: FolderBranch,
    /// KBFS node id -> inode, one wrapper per live node.
    nodes: Mutex<HashMap<NodeId, u64>>,
    /// Resume channel handed out by `disable_updates`, if updates are
    /// currently paused.
    pause: Mutex<Option<SyncSender<()>>>,
    observer: Mutex<Option<ObserverId>>,
}

impl Folder {
    pub(crate) fn new(
        fs: Weak<FsInner>,
        list: Arc<FolderList>,
        handle: TlfHandle,
        fb: FolderBranch,
    ) -> Folder {
        let name = handle.canonical_name();
        Folder {
            fs,
            list,
            handle,
            name,
            fb,
            nodes: Mutex::new(HashMap::new()),
            pause: Mutex::new(None),
            observer: Mutex::new(None),
        }
    }

    pub(crate) fn public(&self) -> bool {
        self.handle.public()
    }

    pub(crate) fn fb(&self) -> FolderBranch {
        self.fb
    }

    pub(crate) fn set_observer(&self, id: ObserverId) {
        *self.observer.lock() = Some(id);
    }

    /// The inode currently wrapping `id`, if the kernel holds one.
    pub(crate) fn node_ino(&self, id: NodeId) -> Option<u64> {
        self.nodes.lock().get(&id).copied()
    }

    /// Record the wrapper for `id`. Caller must not hold any operations
    /// layer call open; the inode table lock is allowed.
    pub(crate) fn install(&self, id: NodeId, ino: u64) {
        self.nodes.lock().insert(id, ino);
    }

    /// Drop the wrapper for `id` on kernel Forget. When the last wrapper
    /// goes, the folder detaches from its folder list.
    pub(crate) fn forget_node(&self, id: NodeId) {
        let empty = {
            let mut nodes = self.nodes.lock();
            nodes.remove(&id);
            nodes.is_empty()
        };
        if empty {
            self.detach();
        }
    }

    fn detach(&self) {
        self.list.forget_folder(&self.name);
        let observer = self.observer.lock().take();
        if let (Some(id), Some(fs)) = (observer, self.fs.upgrade()) {
            fs.ops().unregister_from_changes(self.fb, id);
        }
    }

    pub(crate) fn pause_updates(&self, resume: SyncSender<()>) {
        *self.pause.lock() = Some(resume);
    }

    pub(crate) fn resume_updates(&self) {
        if let Some(resume) = self.pause.lock().take() {
            let _ = resume.send(());
        }
    }

    /// Translate changes into kernel invalidations and hand them to the
    /// dispatcher. Wrappers are resolved under the node-map lock; the lock
    /// is released before anything is queued.
    fn queue_changes(&self, ctx: &OpContext, changes: &[NodeChange]) {
        let Some(fs) = self.fs.upgrade() else {
            return;
        };
        if !fs.has_invalidate() {
            return;
        }
        // The kernel on the originating mount already reflects the change.
        if ctx.origin() == fs.id() {
            return;
        }
        let mut invals = Vec::new();
        {
            let nodes = self.nodes.lock();
            for change in changes {
                let Some(&ino) = nodes.get(&change.node) else {
                    continue;
                };
                collect_invalidations(ino, change, &mut invals);
            }
        }
        for inval in invals {
            fs.queue_invalidation(inval);
        }
    }
}

impl Observer for Folder {
    fn local_change(&self, ctx: &OpContext, node: NodeId, write: WriteRange) {
        let change = NodeChange {
            node,
            dir_updated: Vec::new(),
            file_updated: vec![write],
        };
        self.queue_changes(ctx, std::slice::from_ref(&change));
    }

    fn batch_changes(&self, ctx: &OpContext, changes: &[NodeChange]) {
        self.queue_changes(ctx, changes);
    }
}

/// One kernel invalidation, ready to issue outside all locks.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Invalidation {
    /// A changed byte range of a file; a truncate when `range.len == 0`.
    FileRange { ino: u64, range: WriteRange },
    /// Changed entries of a directory.
    DirEntries { ino: u64, names: Vec<String> },
    /// Attributes only.
    Attr { ino: u64 },
}

fn collect_invalidations(ino: u64, change: &NodeChange, out: &mut Vec<Invalidation>) {
    if change.dir_updated.is_empty() && change.file_updated.is_empty() {
        out.push(Invalidation::Attr { ino });
        return;
    }
    for range in &change.file_updated {
        out.push(Invalidation::FileRange { ino, range: *range });
    }
    if !change.dir_updated.is_empty() {
        out.push(Invalidation::DirEntries {
            ino,
            names: change.dir_updated.clone(),
        });
    }
}

impl Invalidation {
    pub(crate) fn run(&self, notifier: &dyn KernelNotifier) -> io::Result<()> {
        match self {
            Invalidation::FileRange { ino, range } => {
                if range.is_truncate() {
                    // Everything from the new size to the old end is gone.
                    match i64::try_from(range.off) {
                        Ok(off) => notifier.invalidate_node_data_range(*ino, off, -1),
                        Err(_) => notifier.invalidate_node_data(*ino),
                    }
                } else {
                    match (i64::try_from(range.off), i64::try_from(range.len)) {
                        (Ok(off), Ok(len)) => notifier.invalidate_node_data_range(*ino, off, len),
                        _ => notifier.invalidate_node_data(*ino),
                    }
                }
            }
            Invalidation::DirEntries { ino, names } => {
                notifier.invalidate_node_data(*ino)?;
                for name in names {
                    notifier.invalidate_entry(*ino, OsStr::new(name))?;
                }
                Ok(())
            }
            Invalidation::Attr { ino } => notifier.invalidate_node_attr(*ino),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    enum Call {
        Data(u64),
        Range(u64, i64, i64),
        Attr(u64),
        Entry(u64, OsString),
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Call>>,
    }

    impl KernelNotifier for Recorder {
        fn invalidate_node_data(&self, ino: u64) -> io::Result<()> {
            self.calls.lock().push(Call::Data(ino));
            Ok(())
        }

        fn invalidate_node_data_range(&self, ino: u64, off: i64, len: i64) -> io::Result<()> {
            self.calls.lock().push(Call::Range(ino, off, len));
            Ok(())
        }

        fn invalidate_node_attr(&self, ino: u64) -> io::Result<()> {
            self.calls.lock().push(Call::Attr(ino));
            Ok(())
        }

        fn invalidate_entry(&self, parent: u64, name: &OsStr) -> io::Result<()> {
            self.calls.lock().push(Call::Entry(parent, name.to_owned()));
            Ok(())
        }
    }

    fn run(inval: Invalidation) -> Vec<Call> {
        let recorder = Recorder::default();
        inval.run(&recorder).unwrap();
        recorder.calls.into_inner()
    }

    #[test]
    fn write_range_is_precise() {
        let calls = run(Invalidation::FileRange {
            ino: 7,
            range: WriteRange { off: 100, len: 13 },
        });
        assert_eq!(calls, [Call::Range(7, 100, 13)]);
    }

    #[test]
    fn truncate_invalidates_to_end() {
        let calls = run(Invalidation::FileRange {
            ino: 7,
            range: WriteRange { off: 100, len: 0 },
        });
        assert_eq!(calls, [Call::Range(7, 100, -1)]);
    }

    #[test]
    fn oversized_range_invalidates_whole_file() {
        for range in [
            WriteRange {
                off: u64::MAX,
                len: 1,
            },
            WriteRange {
                off: 0,
                len: u64::MAX,
            },
            WriteRange {
                off: u64::MAX,
                len: 0,
            },
        ] {
            let calls = run(Invalidation::FileRange { ino: 7, range });
            assert_eq!(calls, [Call::Data(7)], "range {range:?}");
        }
    }

    #[test]
    fn dir_change_invalidates_contents_and_entries() {
        let calls = run(Invalidation::DirEntries {
            ino: 3,
            names: vec!["a".to_string(), "b".to_string()],
        });
        assert_eq!(
            calls,
            [
                Call::Data(3),
                Call::Entry(3, OsString::from("a")),
                Call::Entry(3, OsString::from("b")),
            ]
        );
    }

    #[test]
    fn empty_change_invalidates_attributes() {
        let mut out = Vec::new();
        collect_invalidations(5, &NodeChange::attr_only(NodeId(9)), &mut out);
        assert_eq!(out, [Invalidation::Attr { ino: 5 }]);
        assert_eq!(run(out.remove(0)), [Call::Attr(5)]);
    }
}
