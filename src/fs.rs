//! Mount-wide state and request routing.
//!
//! [`KbfsFs`] owns the inode table, the fixed virtual namespace (root plus
//! the two folder lists), the notification dispatcher, and the kernel
//! notifier handle. Kernel requests arrive through the thin shim in
//! `fuse.rs` and are routed here by node type.
//!
//! Lock order: the inode table mutex is taken before any folder-list or
//! folder node-map mutex, and no lock is ever held across an operations
//! layer call or a kernel invalidation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::SystemTime;

use fuser::FileAttr;
use fuser::FileType;
use fuser::TimeOrNow;
use log::debug;
use log::warn;
use parking_lot::Mutex;
use parking_lot::RwLock;

use crate::dir::DirNode;
use crate::dispatch::Dispatcher;
use crate::errno::Errno;
use crate::file::FileNode;
use crate::folder::Folder;
use crate::folder::Invalidation;
use crate::folderlist::FolderList;
use crate::folderlist::TlfPlaceholder;
use crate::notify::KernelNotifier;
use crate::ops::EntryInfo;
use crate::ops::EntryType;
use crate::ops::Kbpki;
use crate::ops::KbfsOps;
use crate::ops::MountId;
use crate::ops::NodeId;
use crate::ops::Observer;
use crate::ops::OpContext;
use crate::ops::OpsError;
use crate::reporter::Reporter;
use crate::special::SpecialKind;
use crate::special::SpecialNode;
use crate::symlink::SymlinkNode;

/// Inode of the mount root.
pub const ROOT_INO: u64 = 1;
/// Inode of `/private`.
pub const PRIVATE_INO: u64 = 2;
/// Inode of `/public`.
pub const PUBLIC_INO: u64 = 3;
const FIRST_DYNAMIC_INO: u64 = 4;

/// Inode number reported for directory entries that have no wrapper yet;
/// lookup is what assigns real inodes.
pub(crate) const UNKNOWN_INO: u64 = 0xffff_ffff;

/// How many reported errors the error pseudo-file keeps.
const MAX_REPORTED_ERRORS: usize = 50;

static NEXT_MOUNT_ID: AtomicU64 = AtomicU64::new(1);

/// The collaborators a mount is built from.
pub struct Config {
    ops: Arc<dyn KbfsOps>,
    kbpki: Arc<dyn Kbpki>,
    reporter: Arc<Reporter>,
}

impl Config {
    /// Bundle an operations layer and an identity service.
    pub fn new(ops: Arc<dyn KbfsOps>, kbpki: Arc<dyn Kbpki>) -> Config {
        Config {
            ops,
            kbpki,
            reporter: Arc::new(Reporter::new(MAX_REPORTED_ERRORS)),
        }
    }

    /// The operations layer.
    pub fn kbfs_ops(&self) -> &Arc<dyn KbfsOps> {
        &self.ops
    }

    /// The identity service.
    pub fn kbpki(&self) -> &Arc<dyn Kbpki> {
        &self.kbpki
    }

    /// The error reporter backing the error pseudo-file.
    pub fn reporter(&self) -> &Arc<Reporter> {
        &self.reporter
    }
}

/// A looked-up or created entry, ready for a kernel reply.
#[derive(Clone, Debug)]
pub struct EntryOut {
    /// The inode now holding a kernel reference.
    pub ino: u64,
    /// Its attributes.
    pub attr: FileAttr,
}

/// One directory listing entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntryOut {
    /// Advisory inode number.
    pub ino: u64,
    /// Entry kind.
    pub kind: FileType,
    /// Entry name.
    pub name: String,
}

/// The attribute changes requested by a kernel setattr.
#[derive(Clone, Copy, Debug, Default)]
pub struct SetattrRequest {
    /// New mode bits.
    pub mode: Option<u32>,
    /// New owner; never supported.
    pub uid: Option<u32>,
    /// New group; never supported.
    pub gid: Option<u32>,
    /// New size (truncate).
    pub size: Option<u64>,
    /// New access time; accepted and dropped.
    pub atime: Option<TimeOrNow>,
    /// New modification time.
    pub mtime: Option<TimeOrNow>,
    /// New change time; accepted and dropped.
    pub ctime: Option<SystemTime>,
    /// New creation time; never supported.
    pub crtime: Option<SystemTime>,
    /// New change time (macOS); never supported.
    pub chgtime: Option<SystemTime>,
    /// New backup time (macOS); never supported.
    pub bkuptime: Option<SystemTime>,
    /// New BSD flags; never supported.
    pub flags: Option<u32>,
}

/// Result alias for kernel-ingress operations.
pub type FsResult<T> = Result<T, Errno>;

#[derive(Clone)]
pub(crate) enum NodeRef {
    Root,
    FolderList(Arc<FolderList>),
    Tlf(Arc<TlfPlaceholder>),
    Dir(Arc<DirNode>),
    File(Arc<FileNode>),
    Symlink(Arc<SymlinkNode>),
    Special(Arc<SpecialNode>),
}

struct Slot {
    node: NodeRef,
    nlookup: u64,
}

struct NodeTable {
    map: HashMap<u64, Slot>,
    next_ino: u64,
}

impl NodeTable {
    fn new(private: Arc<FolderList>, public: Arc<FolderList>) -> NodeTable {
        let mut map = HashMap::new();
        map.insert(
            ROOT_INO,
            Slot {
                node: NodeRef::Root,
                nlookup: 0,
            },
        );
        map.insert(
            PRIVATE_INO,
            Slot {
                node: NodeRef::FolderList(private),
                nlookup: 0,
            },
        );
        map.insert(
            PUBLIC_INO,
            Slot {
                node: NodeRef::FolderList(public),
                nlookup: 0,
            },
        );
        NodeTable {
            map,
            next_ino: FIRST_DYNAMIC_INO,
        }
    }

    fn insert(&mut self, node: NodeRef) -> u64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        self.map.insert(ino, Slot { node, nlookup: 1 });
        ino
    }

    fn get(&self, ino: u64) -> Option<NodeRef> {
        self.map.get(&ino).map(|slot| slot.node.clone())
    }

    fn set(&mut self, ino: u64, node: NodeRef) {
        if let Some(slot) = self.map.get_mut(&ino) {
            slot.node = node;
        }
    }

    fn bump(&mut self, ino: u64) {
        if let Some(slot) = self.map.get_mut(&ino) {
            slot.nlookup += 1;
        }
    }

    /// Drop `nlookup` references; returns the node once no references
    /// remain and the slot has been removed.
    fn forget(&mut self, ino: u64, nlookup: u64) -> Option<NodeRef> {
        let slot = self.map.get_mut(&ino)?;
        slot.nlookup = slot.nlookup.saturating_sub(nlookup);
        if slot.nlookup > 0 {
            return None;
        }
        self.map.remove(&ino).map(|slot| slot.node)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counter(AtomicU64);

impl Counter {
    fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Operation counters surfaced by the metrics pseudo-file.
#[derive(Debug, Default)]
pub(crate) struct Metrics {
    lookups: Counter,
    attrs: Counter,
    reads: Counter,
    writes: Counter,
    dir_ops: Counter,
    notifications: Counter,
}

impl Metrics {
    pub(crate) fn render(&self) -> String {
        format!(
            "lookups {}\nattrs {}\nreads {}\nwrites {}\ndir_ops {}\nnotifications {}\n",
            self.lookups.get(),
            self.attrs.get(),
            self.reads.get(),
            self.writes.get(),
            self.dir_ops.get(),
            self.notifications.get(),
        )
    }
}

/// One mount of the filesystem. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct KbfsFs {
    inner: Arc<FsInner>,
}

pub(crate) struct FsInner {
    id: MountId,
    config: Arc<Config>,
    uid: u32,
    gid: u32,
    start_time: SystemTime,
    nodes: Mutex<NodeTable>,
    notifier: RwLock<Option<Arc<dyn KernelNotifier>>>,
    dispatcher: Dispatcher,
    metrics: Metrics,
    weak: Weak<FsInner>,
}

impl KbfsFs {
    /// A new mount over the given collaborators.
    pub fn new(config: Arc<Config>) -> KbfsFs {
        let private = Arc::new(FolderList::new(false));
        let public = Arc::new(FolderList::new(true));
        let inner = Arc::new_cyclic(|weak| FsInner {
            id: MountId(NEXT_MOUNT_ID.fetch_add(1, Ordering::Relaxed)),
            config,
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            start_time: SystemTime::now(),
            nodes: Mutex::new(NodeTable::new(private, public)),
            notifier: RwLock::new(None),
            dispatcher: Dispatcher::new(),
            metrics: Metrics::default(),
            weak: weak.clone(),
        });
        KbfsFs { inner }
    }

    /// The shared configuration.
    pub fn config(&self) -> &Arc<Config> {
        &self.inner.config
    }

    /// Install the kernel invalidation channel. Until one is installed,
    /// change notifications are dropped.
    pub fn set_notifier(&self, notifier: Arc<dyn KernelNotifier>) {
        *self.inner.notifier.write() = Some(notifier);
    }

    /// Block until every queued kernel invalidation has been issued.
    pub fn wait_for_notifications(&self) {
        self.inner.dispatcher.wait();
    }

    /// Record an error for the error pseudo-file.
    pub fn report_err(&self, message: impl Into<String>) {
        self.inner.reporter().report_err(message);
    }

    // ---- kernel ingress ----

    /// Look up `name` under `parent`, taking a kernel reference on the
    /// result.
    pub fn lookup(&self, parent: u64, name: &str) -> FsResult<EntryOut> {
        self.inner.metrics.lookups.inc();
        let ctx = self.inner.new_ctx();
        match self.inner.node(parent)? {
            NodeRef::Root => self.inner.root_lookup(&ctx, name),
            NodeRef::FolderList(list) => list.lookup(&self.inner, &ctx, name),
            NodeRef::Tlf(ph) => {
                let dir = self.inner.resolve_tlf(&ctx, parent, &ph)?;
                dir.lookup(&self.inner, &ctx, name)
            }
            NodeRef::Dir(dir) => dir.lookup(&self.inner, &ctx, name),
            _ => Err(Errno::ENOTDIR),
        }
    }

    /// Attributes of `ino`.
    pub fn getattr(&self, ino: u64) -> FsResult<FileAttr> {
        self.inner.metrics.attrs.inc();
        let ctx = self.inner.new_ctx();
        match self.inner.node(ino)? {
            NodeRef::Root | NodeRef::FolderList(_) => Ok(self.inner.virtual_dir_attr(ino)),
            // The folder is known but its root node hasn't been fetched;
            // answer with a zero stat instead of a transient error.
            NodeRef::Tlf(ph) => Ok(self.inner.dir_stub_attr(ino, ph.handle.public())),
            NodeRef::Dir(dir) => dir.attr(&self.inner, &ctx, ino),
            NodeRef::File(file) => file.attr(&self.inner, &ctx, ino),
            NodeRef::Symlink(link) => link.attr(&self.inner, &ctx, ino),
            NodeRef::Special(special) => self.inner.special_attr(&ctx, ino, &special),
        }
    }

    /// Apply attribute changes and return the resulting attributes.
    pub fn setattr(&self, ino: u64, req: &SetattrRequest) -> FsResult<FileAttr> {
        self.inner.metrics.attrs.inc();
        let ctx = self.inner.new_ctx();
        match self.inner.node(ino)? {
            NodeRef::Tlf(ph) => {
                let dir = self.inner.resolve_tlf(&ctx, ino, &ph)?;
                dir.setattr(&self.inner, &ctx, ino, req)
            }
            NodeRef::Dir(dir) => dir.setattr(&self.inner, &ctx, ino, req),
            NodeRef::File(file) => file.setattr(&self.inner, &ctx, ino, req),
            NodeRef::Special(special) => {
                if req.mode.is_some() {
                    return Err(Errno::EPERM);
                }
                if unhandled_setattr_bits(req) {
                    return Err(Errno::ENOSYS);
                }
                // O_TRUNC on a control file arrives as a size change;
                // accept it, there is nothing to truncate.
                self.inner.special_attr(&ctx, ino, &special)
            }
            _ => {
                if req.mode.is_some() {
                    return Err(Errno::EPERM);
                }
                if unhandled_setattr_bits(req) || req.size.is_some() {
                    return Err(Errno::ENOSYS);
                }
                self.getattr(ino)
            }
        }
    }

    /// Target of a symlink.
    pub fn readlink(&self, ino: u64) -> FsResult<String> {
        let ctx = self.inner.new_ctx();
        match self.inner.node(ino)? {
            NodeRef::Symlink(link) => link.readlink(&self.inner, &ctx),
            _ => Err(Errno::EINVAL),
        }
    }

    /// Create and reference a file; `mode` only contributes the
    /// executable bit.
    pub fn create(&self, parent: u64, name: &str, mode: u32) -> FsResult<EntryOut> {
        self.inner.metrics.dir_ops.inc();
        let ctx = self.inner.new_ctx();
        let dir = self.inner.dir_at(&ctx, parent)?;
        dir.create(&self.inner, &ctx, name, mode)
    }

    /// Create and reference a directory.
    pub fn mkdir(&self, parent: u64, name: &str) -> FsResult<EntryOut> {
        self.inner.metrics.dir_ops.inc();
        let ctx = self.inner.new_ctx();
        let dir = self.inner.dir_at(&ctx, parent)?;
        dir.mkdir(&self.inner, &ctx, name)
    }

    /// Create and reference a symlink.
    pub fn symlink(&self, parent: u64, name: &str, target: &str) -> FsResult<EntryOut> {
        self.inner.metrics.dir_ops.inc();
        let ctx = self.inner.new_ctx();
        let dir = self.inner.dir_at(&ctx, parent)?;
        dir.symlink(&self.inner, &ctx, name, target)
    }

    /// Rename within one folder; anything across folders is EXDEV.
    pub fn rename(
        &self,
        parent: u64,
        name: &str,
        new_parent: u64,
        new_name: &str,
    ) -> FsResult<()> {
        self.inner.metrics.dir_ops.inc();
        let ctx = self.inner.new_ctx();
        let src = self.inner.dir_at(&ctx, parent)?;
        let dst = match self.inner.node(new_parent)? {
            NodeRef::Dir(dir) => dir,
            NodeRef::Tlf(ph) => self.inner.resolve_tlf(&ctx, new_parent, &ph)?,
            // The virtual directories are not part of any folder.
            NodeRef::Root | NodeRef::FolderList(_) => return Err(Errno::EXDEV),
            _ => return Err(Errno::ENOTDIR),
        };
        src.rename_to(&self.inner, &ctx, name, &dst, new_name)
    }

    /// Remove an entry; `dir` selects rmdir semantics.
    pub fn remove(&self, parent: u64, name: &str, dir: bool) -> FsResult<()> {
        self.inner.metrics.dir_ops.inc();
        let ctx = self.inner.new_ctx();
        match self.inner.node(parent)? {
            // Folders are detached by quiescence, never removed here.
            NodeRef::Root | NodeRef::FolderList(_) => Err(Errno::EPERM),
            NodeRef::Tlf(ph) => {
                let parent_dir = self.inner.resolve_tlf(&ctx, parent, &ph)?;
                parent_dir.remove(&self.inner, &ctx, name, dir)
            }
            NodeRef::Dir(parent_dir) => parent_dir.remove(&self.inner, &ctx, name, dir),
            _ => Err(Errno::ENOTDIR),
        }
    }

    /// Full listing of a directory, without `.`/`..`.
    pub fn readdir(&self, ino: u64) -> FsResult<Vec<DirEntryOut>> {
        self.inner.metrics.dir_ops.inc();
        let ctx = self.inner.new_ctx();
        match self.inner.node(ino)? {
            NodeRef::Root => Ok(vec![
                DirEntryOut {
                    ino: PRIVATE_INO,
                    kind: FileType::Directory,
                    name: "private".to_string(),
                },
                DirEntryOut {
                    ino: PUBLIC_INO,
                    kind: FileType::Directory,
                    name: "public".to_string(),
                },
            ]),
            NodeRef::FolderList(list) => list.readdir(&self.inner, &ctx),
            NodeRef::Tlf(ph) => {
                let dir = self.inner.resolve_tlf(&ctx, ino, &ph)?;
                dir.readdir(&self.inner, &ctx)
            }
            NodeRef::Dir(dir) => dir.readdir(&self.inner, &ctx),
            _ => Err(Errno::ENOTDIR),
        }
    }

    /// Read up to `size` bytes at `off`.
    pub fn read(&self, ino: u64, off: u64, size: u32) -> FsResult<Vec<u8>> {
        self.inner.metrics.reads.inc();
        let ctx = self.inner.new_ctx();
        match self.inner.node(ino)? {
            NodeRef::File(file) => file.read(&self.inner, &ctx, off, size),
            NodeRef::Special(special) => {
                if special.is_control() {
                    return Err(Errno::EPERM);
                }
                let (bytes, _) = special
                    .content(&self.inner, &ctx)
                    .map_err(|err| self.inner.report_errno("read", err))?;
                let start = (off as usize).min(bytes.len());
                let end = (start + size as usize).min(bytes.len());
                Ok(bytes[start..end].to_vec())
            }
            NodeRef::Root | NodeRef::FolderList(_) | NodeRef::Tlf(_) | NodeRef::Dir(_) => {
                Err(Errno::EISDIR)
            }
            NodeRef::Symlink(_) => Err(Errno::EINVAL),
        }
    }

    /// Write `data` at `off`, returning the bytes accepted.
    pub fn write(&self, ino: u64, off: u64, data: &[u8]) -> FsResult<u32> {
        self.inner.metrics.writes.inc();
        let ctx = self.inner.new_ctx();
        match self.inner.node(ino)? {
            NodeRef::File(file) => file.write(&self.inner, &ctx, off, data),
            NodeRef::Special(special) => {
                if !special.is_control() {
                    return Err(Errno::EPERM);
                }
                special
                    .write(&self.inner, &ctx, data)
                    .map_err(|err| self.inner.report_errno("write", err))?;
                Ok(data.len() as u32)
            }
            NodeRef::Root | NodeRef::FolderList(_) | NodeRef::Tlf(_) | NodeRef::Dir(_) => {
                Err(Errno::EISDIR)
            }
            NodeRef::Symlink(_) => Err(Errno::EINVAL),
        }
    }

    /// Push buffered writes of a file to the server.
    pub fn fsync(&self, ino: u64) -> FsResult<()> {
        let ctx = self.inner.new_ctx();
        match self.inner.node(ino)? {
            NodeRef::File(file) => file.sync(&self.inner, &ctx),
            _ => Ok(()),
        }
    }

    /// Flush on close; surfaces write errors like fsync.
    pub fn flush(&self, ino: u64) -> FsResult<()> {
        self.fsync(ino)
    }

    /// Open flags for `ino`: files keep the page cache (the invalidation
    /// protocol keeps it honest), pseudo-files bypass it so recomputed
    /// content is never hidden by a stale cached size.
    pub(crate) fn open_flags(&self, ino: u64) -> FsResult<u32> {
        match self.inner.node(ino)? {
            NodeRef::File(_) => Ok(fuser::consts::FOPEN_KEEP_CACHE),
            NodeRef::Special(_) => Ok(fuser::consts::FOPEN_DIRECT_IO),
            _ => Ok(0),
        }
    }

    /// Drop kernel references. At zero the wrapper is disposed, and a
    /// folder whose last wrapper goes detaches from its folder list.
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino < FIRST_DYNAMIC_INO {
            return;
        }
        let removed = self.inner.nodes.lock().forget(ino, nlookup);
        match removed {
            Some(NodeRef::Dir(dir)) => dir.folder.forget_node(dir.id),
            Some(NodeRef::File(file)) => file.folder.forget_node(file.id),
            Some(NodeRef::Tlf(ph)) => ph.list.forget_folder(&ph.handle.canonical_name()),
            Some(_) => {}
            None => {}
        }
    }
}

impl FsInner {
    pub(crate) fn id(&self) -> MountId {
        self.id
    }

    pub(crate) fn ops(&self) -> &Arc<dyn KbfsOps> {
        self.config.kbfs_ops()
    }

    pub(crate) fn kbpki(&self) -> &Arc<dyn Kbpki> {
        self.config.kbpki()
    }

    pub(crate) fn reporter(&self) -> &Arc<Reporter> {
        self.config.reporter()
    }

    pub(crate) fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub(crate) fn start_time(&self) -> SystemTime {
        self.start_time
    }

    fn new_ctx(&self) -> OpContext {
        OpContext::new(self.id)
    }

    pub(crate) fn has_invalidate(&self) -> bool {
        self.notifier.read().is_some()
    }

    /// Hand one invalidation to the dispatcher. Failures are logged and
    /// dropped; there is no recovery path.
    pub(crate) fn queue_invalidation(&self, inval: Invalidation) {
        let Some(notifier) = self.notifier.read().clone() else {
            return;
        };
        self.metrics.notifications.inc();
        self.dispatcher.queue(move || {
            debug!("kernel invalidation: {inval:?}");
            if let Err(err) = inval.run(notifier.as_ref()) {
                warn!("kernel invalidation failed: {err}");
            }
        });
    }

    fn node(&self, ino: u64) -> FsResult<NodeRef> {
        self.nodes.lock().get(ino).ok_or(Errno::ESTALE)
    }

    /// Resolve `ino` to a directory, promoting a TLF placeholder first.
    fn dir_at(&self, ctx: &OpContext, ino: u64) -> FsResult<Arc<DirNode>> {
        match self.node(ino)? {
            NodeRef::Dir(dir) => Ok(dir),
            NodeRef::Tlf(ph) => self.resolve_tlf(ctx, ino, &ph),
            NodeRef::Root | NodeRef::FolderList(_) => Err(Errno::EPERM),
            _ => Err(Errno::ENOTDIR),
        }
    }

    fn root_lookup(&self, ctx: &OpContext, name: &str) -> FsResult<EntryOut> {
        if let Some(kind) = crate::special::mount_special(name) {
            return self.special_entry(ctx, kind);
        }
        let ino = match name {
            "private" => PRIVATE_INO,
            "public" => PUBLIC_INO,
            _ => return Err(Errno::ENOENT),
        };
        self.nodes.lock().bump(ino);
        Ok(EntryOut {
            ino,
            attr: self.virtual_dir_attr(ino),
        })
    }

    /// Look up an already-known folder by name, taking a reference.
    pub(crate) fn existing_folder_entry(
        &self,
        list: &FolderList,
        name: &str,
    ) -> Option<(u64, NodeRef)> {
        let mut table = self.nodes.lock();
        let ino = list.get(name)?;
        let node = table.get(ino)?;
        table.bump(ino);
        Some((ino, node))
    }

    /// Record a parsed-but-unfetched folder under its canonical name.
    pub(crate) fn insert_tlf_placeholder(
        &self,
        list: &Arc<FolderList>,
        handle: crate::handle::TlfHandle,
    ) -> EntryOut {
        let name = handle.canonical_name();
        let public = handle.public();
        let mut table = self.nodes.lock();
        if let Some(ino) = list.get(&name) {
            // Raced with another lookup of the same name.
            table.bump(ino);
            return EntryOut {
                ino,
                attr: self.dir_stub_attr(ino, public),
            };
        }
        let ino = table.insert(NodeRef::Tlf(Arc::new(TlfPlaceholder {
            handle,
            list: Arc::clone(list),
        })));
        list.set(&name, ino);
        EntryOut {
            ino,
            attr: self.dir_stub_attr(ino, public),
        }
    }

    /// Promote a placeholder to the folder's root directory, fetching the
    /// root node and wiring up change notifications.
    pub(crate) fn resolve_tlf(
        &self,
        ctx: &OpContext,
        ino: u64,
        ph: &Arc<TlfPlaceholder>,
    ) -> FsResult<Arc<DirNode>> {
        let (root, fb, _) = self
            .ops()
            .get_or_create_root_node(ctx, &ph.handle)
            .map_err(|err| self.report_errno("open folder", err))?;
        let folder = Arc::new(Folder::new(
            self.weak.clone(),
            Arc::clone(&ph.list),
            ph.handle.clone(),
            fb,
        ));
        let observer = self
            .ops()
            .register_for_changes(fb, Arc::clone(&folder) as Arc<dyn Observer>);
        folder.set_observer(observer);

        let raced = {
            let mut table = self.nodes.lock();
            match table.get(ino) {
                Some(NodeRef::Tlf(_)) => {
                    let dir = Arc::new(DirNode {
                        folder: Arc::clone(&folder),
                        id: root,
                    });
                    folder.install(root, ino);
                    table.set(ino, NodeRef::Dir(Arc::clone(&dir)));
                    return Ok(dir);
                }
                Some(NodeRef::Dir(dir)) => Ok(dir),
                _ => Err(Errno::ESTALE),
            }
        };
        // Someone else promoted (or the kernel forgot the inode) while we
        // fetched the root node; discard our registration.
        self.ops().unregister_from_changes(fb, observer);
        raced
    }

    /// One wrapper per live node: return the existing inode when present,
    /// install a fresh wrapper otherwise.
    pub(crate) fn install_wrapper(
        &self,
        folder: &Arc<Folder>,
        id: NodeId,
        ei: &EntryInfo,
    ) -> EntryOut {
        let mut table = self.nodes.lock();
        if let Some(ino) = folder.node_ino(id) {
            // A concurrent Forget may have dropped the slot already; only
            // reuse wrappers the table still holds.
            if table.get(ino).is_some() {
                table.bump(ino);
                return EntryOut {
                    ino,
                    attr: self.entry_attr(ino, ei, folder.public()),
                };
            }
        }
        let node = match ei.entry_type {
            EntryType::Dir => NodeRef::Dir(Arc::new(DirNode {
                folder: Arc::clone(folder),
                id,
            })),
            _ => NodeRef::File(Arc::new(FileNode {
                folder: Arc::clone(folder),
                id,
            })),
        };
        let ino = table.insert(node);
        folder.install(id, ino);
        EntryOut {
            ino,
            attr: self.entry_attr(ino, ei, folder.public()),
        }
    }

    /// Symlinks never enter the folder's node map; every lookup makes a
    /// fresh wrapper.
    pub(crate) fn insert_symlink_entry(
        &self,
        parent: &Arc<DirNode>,
        name: &str,
        ei: &EntryInfo,
    ) -> EntryOut {
        let size = ei.sym_path.as_ref().map_or(ei.size, |t| t.len() as u64);
        let mtime = ei.mtime;
        let node = NodeRef::Symlink(Arc::new(SymlinkNode::Entry {
            parent: Arc::clone(parent),
            name: name.to_string(),
        }));
        let ino = self.nodes.lock().insert(node);
        EntryOut {
            ino,
            attr: self.symlink_attr(ino, size, mtime),
        }
    }

    /// An alias redirecting a non-canonical folder name.
    pub(crate) fn insert_alias(&self, target: String) -> EntryOut {
        let size = target.len() as u64;
        let node = NodeRef::Symlink(Arc::new(SymlinkNode::Alias { target }));
        let ino = self.nodes.lock().insert(node);
        EntryOut {
            ino,
            attr: self.symlink_attr(ino, size, self.start_time),
        }
    }

    /// A pseudo-file; content is computed now so the entry carries a real
    /// size.
    pub(crate) fn special_entry(&self, ctx: &OpContext, kind: SpecialKind) -> FsResult<EntryOut> {
        let node = Arc::new(SpecialNode::new(kind));
        let (mode, size, mtime) = self.special_parts(ctx, &node)?;
        let ino = self.nodes.lock().insert(NodeRef::Special(node));
        Ok(EntryOut {
            ino,
            attr: self.special_file_attr(ino, mode, size, mtime),
        })
    }

    pub(crate) fn special_attr(
        &self,
        ctx: &OpContext,
        ino: u64,
        node: &Arc<SpecialNode>,
    ) -> FsResult<FileAttr> {
        let (mode, size, mtime) = self.special_parts(ctx, node)?;
        Ok(self.special_file_attr(ino, mode, size, mtime))
    }

    fn special_parts(
        &self,
        ctx: &OpContext,
        node: &SpecialNode,
    ) -> FsResult<(u16, u64, SystemTime)> {
        if node.is_control() {
            return Ok((node.mode(), 0, self.start_time));
        }
        let (bytes, mtime) = node
            .content(self, ctx)
            .map_err(|err| self.report_errno("getattr", err))?;
        Ok((node.mode(), bytes.len() as u64, mtime))
    }

    // ---- attribute projection ----

    fn base_attr(
        &self,
        ino: u64,
        kind: FileType,
        perm: u16,
        size: u64,
        mtime: SystemTime,
    ) -> FileAttr {
        FileAttr {
            ino,
            size,
            blocks: size.div_ceil(512),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    pub(crate) fn entry_attr(&self, ino: u64, ei: &EntryInfo, public: bool) -> FileAttr {
        match ei.entry_type {
            EntryType::File => self.base_attr(ino, FileType::RegularFile, 0o644, ei.size, ei.mtime),
            EntryType::Exec => self.base_attr(ino, FileType::RegularFile, 0o755, ei.size, ei.mtime),
            EntryType::Dir => self.base_attr(
                ino,
                FileType::Directory,
                if public { 0o755 } else { 0o700 },
                ei.size,
                ei.mtime,
            ),
            EntryType::Sym => self.symlink_attr(ino, ei.size, ei.mtime),
        }
    }

    /// Stat of a folder root not yet fetched; also used for raced lookups.
    pub(crate) fn dir_stub_attr(&self, ino: u64, public: bool) -> FileAttr {
        self.base_attr(
            ino,
            FileType::Directory,
            if public { 0o755 } else { 0o700 },
            0,
            self.start_time,
        )
    }

    fn virtual_dir_attr(&self, ino: u64) -> FileAttr {
        self.base_attr(ino, FileType::Directory, 0o755, 0, self.start_time)
    }

    pub(crate) fn symlink_attr(&self, ino: u64, size: u64, mtime: SystemTime) -> FileAttr {
        self.base_attr(ino, FileType::Symlink, 0o777, size, mtime)
    }

    fn special_file_attr(&self, ino: u64, mode: u16, size: u64, mtime: SystemTime) -> FileAttr {
        self.base_attr(ino, FileType::RegularFile, mode, size, mtime)
    }

    /// Fill attributes for a node the kernel already references.
    pub(crate) fn stat_attr(
        &self,
        ctx: &OpContext,
        ino: u64,
        id: NodeId,
        public: bool,
    ) -> FsResult<FileAttr> {
        match self.ops().stat(ctx, id) {
            Ok(ei) => Ok(self.entry_attr(ino, &ei, public)),
            // The layer below no longer knows a node we still hold.
            Err(OpsError::NoSuchName(_) | OpsError::StaleNode) => Err(Errno::ESTALE),
            Err(err) => Err(self.report_errno("getattr", err)),
        }
    }

    /// Map an operations error to an errno, recording everything except
    /// plain not-found in the reporter.
    pub(crate) fn report_errno(&self, op: &str, err: OpsError) -> Errno {
        let errno = errno_of(&err);
        if errno != Errno::ENOENT {
            self.reporter().report_err(format!("{op}: {err}"));
        }
        errno
    }
}

fn errno_of(err: &OpsError) -> Errno {
    match err {
        OpsError::NoSuchName(_) | OpsError::NoSuchUser(_) => Errno::ENOENT,
        OpsError::NameExists(_) => Errno::EEXIST,
        OpsError::NotDir(_) => Errno::ENOTDIR,
        OpsError::NotFile(_) => Errno::EPERM,
        OpsError::DirNotEmpty(_) => Errno::ENOTEMPTY,
        OpsError::ReadAccess { .. } | OpsError::WriteAccess { .. } => Errno::EACCES,
        OpsError::RenameAcrossFolders => Errno::EXDEV,
        OpsError::StaleNode => Errno::ESTALE,
        OpsError::Canceled => Errno::EINTR,
        OpsError::Other(_) => Errno::EIO,
    }
}

/// Whether the request carries attribute bits this filesystem never
/// handles; surfacing ENOSYS keeps silent feature creep out.
pub(crate) fn unhandled_setattr_bits(req: &SetattrRequest) -> bool {
    req.uid.is_some()
        || req.gid.is_some()
        || req.flags.is_some()
        || req.crtime.is_some()
        || req.chgtime.is_some()
        || req.bkuptime.is_some()
}

pub(crate) fn time_of(time: TimeOrNow) -> Option<SystemTime> {
    match time {
        TimeOrNow::SpecificTime(t) => Some(t),
        TimeOrNow::Now => None,
    }
}

pub(crate) fn file_type_of(entry_type: EntryType) -> FileType {
    match entry_type {
        EntryType::File | EntryType::Exec => FileType::RegularFile,
        EntryType::Dir => FileType::Directory,
        EntryType::Sym => FileType::Symlink,
    }
}
