//! In-memory operations layer.
//!
//! Backs `--server-in-memory` and the test suite with full tree
//! semantics: sparse writes, unlinked-but-open reads, favorites, update
//! pausing with buffered change delivery, and observer fan-out that
//! preserves the originating context so mounts can suppress their own
//! changes. Nothing is persisted.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::SyncSender;
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::handle::TlfHandle;
use crate::ops::BranchName;
use crate::ops::EntryInfo;
use crate::ops::EntryType;
use crate::ops::Favorite;
use crate::ops::FolderBranch;
use crate::ops::FolderStatus;
use crate::ops::Kbpki;
use crate::ops::KbfsOps;
use crate::ops::NodeChange;
use crate::ops::NodeId;
use crate::ops::Observer;
use crate::ops::ObserverId;
use crate::ops::OpContext;
use crate::ops::OpsError;
use crate::ops::Result;
use crate::ops::TlfId;
use crate::ops::WriteRange;

/// Identity provider over a fixed set of local users.
pub struct LocalKbpki {
    users: Vec<String>,
    current: Option<String>,
}

impl LocalKbpki {
    /// A provider knowing `users`, logged in as `current`.
    pub fn new<I, S>(users: I, current: Option<String>) -> LocalKbpki
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        LocalKbpki {
            users: users.into_iter().map(Into::into).collect(),
            current,
        }
    }
}

impl Kbpki for LocalKbpki {
    fn current_user(&self, ctx: &OpContext) -> Result<Option<String>> {
        ctx.check_canceled()?;
        Ok(self.current.clone())
    }

    fn resolve_user(&self, ctx: &OpContext, assertion: &str) -> Result<String> {
        ctx.check_canceled()?;
        if self.users.iter().any(|u| u == assertion) {
            Ok(assertion.to_string())
        } else {
            Err(OpsError::NoSuchUser(assertion.to_string()))
        }
    }
}

struct MemNode {
    tlf: TlfId,
    kind: EntryType,
    data: Vec<u8>,
    mtime: SystemTime,
    children: BTreeMap<String, NodeId>,
    sym: Option<String>,
}

impl MemNode {
    fn new(tlf: TlfId, kind: EntryType, sym: Option<String>) -> MemNode {
        MemNode {
            tlf,
            kind,
            data: Vec::new(),
            mtime: SystemTime::now(),
            children: BTreeMap::new(),
            sym,
        }
    }

    fn entry_info(&self) -> EntryInfo {
        let size = match self.kind {
            EntryType::Sym => self.sym.as_ref().map_or(0, |t| t.len() as u64),
            EntryType::Dir => 0,
            _ => self.data.len() as u64,
        };
        EntryInfo {
            entry_type: self.kind,
            size,
            mtime: self.mtime,
            sym_path: self.sym.clone(),
        }
    }

    fn is_dir(&self) -> bool {
        self.kind == EntryType::Dir
    }

    fn is_file(&self) -> bool {
        matches!(self.kind, EntryType::File | EntryType::Exec)
    }
}

struct Paused {
    resume: Receiver<()>,
    buffered: Vec<(OpContext, Vec<NodeChange>)>,
}

struct TlfInfo {
    name: String,
    root: NodeId,
    fb: FolderBranch,
    staged: bool,
    rekeys: u64,
    paused: Option<Paused>,
}

#[derive(Default)]
struct State {
    nodes: HashMap<NodeId, MemNode>,
    tlfs: HashMap<TlfId, TlfInfo>,
    roots: HashMap<(String, bool), TlfId>,
    observers: HashMap<TlfId, Vec<(ObserverId, Arc<dyn Observer>)>>,
    favorites: BTreeSet<Favorite>,
    next_node: u64,
    next_tlf: u64,
    next_observer: u64,
}

impl State {
    fn alloc_node(&mut self) -> NodeId {
        self.next_node += 1;
        NodeId(self.next_node)
    }

    fn node(&self, id: NodeId) -> Result<&MemNode> {
        self.nodes.get(&id).ok_or(OpsError::StaleNode)
    }

    fn dir(&self, id: NodeId) -> Result<&MemNode> {
        let node = self.node(id)?;
        if !node.is_dir() {
            return Err(OpsError::NotDir(format!("node {}", id.0)));
        }
        Ok(node)
    }

    fn child_of(&self, dir: NodeId, name: &str) -> Result<NodeId> {
        self.dir(dir)?
            .children
            .get(name)
            .copied()
            .ok_or_else(|| OpsError::NoSuchName(name.to_string()))
    }
}

enum Delivery {
    Local(NodeId, WriteRange),
    Batch(Vec<NodeChange>),
}

impl Delivery {
    fn into_changes(self) -> Vec<NodeChange> {
        match self {
            Delivery::Local(node, write) => vec![NodeChange {
                node,
                dir_updated: Vec::new(),
                file_updated: vec![write],
            }],
            Delivery::Batch(changes) => changes,
        }
    }
}

/// In-memory [`KbfsOps`].
pub struct MemFs {
    kbpki: Arc<dyn Kbpki>,
    state: Mutex<State>,
}

impl MemFs {
    /// An empty in-memory filesystem; `kbpki` gates private folders.
    pub fn new(kbpki: Arc<dyn Kbpki>) -> MemFs {
        MemFs {
            kbpki,
            state: Mutex::new(State::default()),
        }
    }

    /// Fan a change out to the folder's observers. While updates are
    /// paused the change is buffered (and the folder marked staged);
    /// buffered changes flush once the resume channel has been signaled.
    fn deliver(&self, ctx: &OpContext, tlf: TlfId, delivery: Delivery) {
        let mut flushed = Vec::new();
        let observers: Vec<Arc<dyn Observer>> = {
            let mut st = self.state.lock();
            if let Some(info) = st.tlfs.get_mut(&tlf) {
                let resumed = match info.paused.as_mut() {
                    Some(paused) => {
                        if paused.resume.try_recv().is_ok() {
                            true
                        } else {
                            paused.buffered.push((ctx.clone(), delivery.into_changes()));
                            info.staged = true;
                            return;
                        }
                    }
                    None => false,
                };
                if resumed {
                    if let Some(paused) = info.paused.take() {
                        flushed = paused.buffered;
                    }
                }
            }
            st.observers
                .get(&tlf)
                .map(|list| list.iter().map(|(_, o)| Arc::clone(o)).collect())
                .unwrap_or_default()
        };
        for (buffered_ctx, changes) in &flushed {
            for observer in &observers {
                observer.batch_changes(buffered_ctx, changes);
            }
        }
        match delivery {
            Delivery::Local(node, write) => {
                for observer in &observers {
                    observer.local_change(ctx, node, write);
                }
            }
            Delivery::Batch(changes) => {
                if changes.is_empty() {
                    return;
                }
                for observer in &observers {
                    observer.batch_changes(ctx, &changes);
                }
            }
        }
    }

    fn create_entry(
        &self,
        ctx: &OpContext,
        dir: NodeId,
        name: &str,
        kind: EntryType,
        sym: Option<String>,
    ) -> Result<(NodeId, EntryInfo)> {
        ctx.check_canceled()?;
        let (tlf, id, ei) = {
            let mut st = self.state.lock();
            let parent = st.dir(dir)?;
            if parent.children.contains_key(name) {
                return Err(OpsError::NameExists(name.to_string()));
            }
            let tlf = parent.tlf;
            let id = st.alloc_node();
            st.nodes.insert(id, MemNode::new(tlf, kind, sym));
            let ei = st.nodes[&id].entry_info();
            let parent = st.nodes.get_mut(&dir).expect("parent checked above");
            parent.children.insert(name.to_string(), id);
            parent.mtime = SystemTime::now();
            (tlf, id, ei)
        };
        self.deliver(
            ctx,
            tlf,
            Delivery::Batch(vec![NodeChange {
                node: dir,
                dir_updated: vec![name.to_string()],
                file_updated: Vec::new(),
            }]),
        );
        Ok((id, ei))
    }

    fn remove_common(&self, ctx: &OpContext, dir: NodeId, name: &str, want_dir: bool) -> Result<()> {
        ctx.check_canceled()?;
        let tlf = {
            let mut st = self.state.lock();
            let child = st.child_of(dir, name)?;
            let child_node = st.node(child)?;
            if want_dir {
                if !child_node.is_dir() {
                    return Err(OpsError::NotDir(name.to_string()));
                }
                if !child_node.children.is_empty() {
                    return Err(OpsError::DirNotEmpty(name.to_string()));
                }
            } else if child_node.is_dir() {
                return Err(OpsError::NotFile(name.to_string()));
            }
            // The node itself stays alive: open handles keep reading the
            // unlinked content until the last reference goes away.
            let parent = st.nodes.get_mut(&dir).expect("parent checked above");
            parent.children.remove(name);
            parent.mtime = SystemTime::now();
            parent.tlf
        };
        self.deliver(
            ctx,
            tlf,
            Delivery::Batch(vec![NodeChange {
                node: dir,
                dir_updated: vec![name.to_string()],
                file_updated: Vec::new(),
            }]),
        );
        Ok(())
    }
}

impl KbfsOps for MemFs {
    fn get_or_create_root_node(
        &self,
        ctx: &OpContext,
        handle: &TlfHandle,
    ) -> Result<(NodeId, FolderBranch, EntryInfo)> {
        ctx.check_canceled()?;
        let canonical = handle.canonical_name();
        if !handle.public() {
            let user = self.kbpki.current_user(ctx)?;
            let allowed = user.as_deref().is_some_and(|u| handle.has_reader(u));
            if !allowed {
                return Err(OpsError::ReadAccess {
                    user: user.unwrap_or_else(|| "nobody".to_string()),
                    folder: canonical,
                });
            }
        }
        let mut st = self.state.lock();
        let key = (canonical.clone(), handle.public());
        let tlf = match st.roots.get(&key) {
            Some(&tlf) => tlf,
            None => {
                st.next_tlf += 1;
                let tlf = TlfId(st.next_tlf);
                let root = st.alloc_node();
                st.nodes.insert(root, MemNode::new(tlf, EntryType::Dir, None));
                st.tlfs.insert(
                    tlf,
                    TlfInfo {
                        name: canonical.clone(),
                        root,
                        fb: FolderBranch {
                            tlf,
                            branch: BranchName::Master,
                        },
                        staged: false,
                        rekeys: 0,
                        paused: None,
                    },
                );
                st.roots.insert(key, tlf);
                tlf
            }
        };
        st.favorites.insert(Favorite {
            name: canonical,
            public: handle.public(),
        });
        let info = &st.tlfs[&tlf];
        let (root, fb) = (info.root, info.fb);
        let ei = st.nodes[&root].entry_info();
        Ok((root, fb, ei))
    }

    fn lookup(
        &self,
        ctx: &OpContext,
        dir: NodeId,
        name: &str,
    ) -> Result<(Option<NodeId>, EntryInfo)> {
        ctx.check_canceled()?;
        let st = self.state.lock();
        let child = st.child_of(dir, name)?;
        let node = st.node(child)?;
        let ei = node.entry_info();
        if node.kind == EntryType::Sym {
            Ok((None, ei))
        } else {
            Ok((Some(child), ei))
        }
    }

    fn create_file(
        &self,
        ctx: &OpContext,
        dir: NodeId,
        name: &str,
        exec: bool,
    ) -> Result<(NodeId, EntryInfo)> {
        let kind = if exec { EntryType::Exec } else { EntryType::File };
        self.create_entry(ctx, dir, name, kind, None)
    }

    fn create_dir(&self, ctx: &OpContext, dir: NodeId, name: &str) -> Result<(NodeId, EntryInfo)> {
        self.create_entry(ctx, dir, name, EntryType::Dir, None)
    }

    fn create_link(
        &self,
        ctx: &OpContext,
        dir: NodeId,
        name: &str,
        target: &str,
    ) -> Result<EntryInfo> {
        let (_, ei) = self.create_entry(ctx, dir, name, EntryType::Sym, Some(target.to_string()))?;
        Ok(ei)
    }

    fn rename(
        &self,
        ctx: &OpContext,
        old_dir: NodeId,
        old_name: &str,
        new_dir: NodeId,
        new_name: &str,
    ) -> Result<()> {
        ctx.check_canceled()?;
        let tlf = {
            let mut st = self.state.lock();
            let src_tlf = st.dir(old_dir)?.tlf;
            let dst_tlf = st.dir(new_dir)?.tlf;
            if src_tlf != dst_tlf {
                return Err(OpsError::RenameAcrossFolders);
            }
            let moved = st.child_of(old_dir, old_name)?;
            if let Some(&existing) = st.dir(new_dir)?.children.get(new_name) {
                let existing = st.node(existing)?;
                if existing.is_dir() && !existing.children.is_empty() {
                    return Err(OpsError::DirNotEmpty(new_name.to_string()));
                }
            }
            let now = SystemTime::now();
            let old_parent = st.nodes.get_mut(&old_dir).expect("parent checked above");
            old_parent.children.remove(old_name);
            old_parent.mtime = now;
            // An overwritten destination node stays alive for any open
            // handles, same as remove.
            let new_parent = st.nodes.get_mut(&new_dir).expect("parent checked above");
            new_parent.children.insert(new_name.to_string(), moved);
            new_parent.mtime = now;
            src_tlf
        };
        let changes = if old_dir == new_dir {
            vec![NodeChange {
                node: old_dir,
                dir_updated: vec![old_name.to_string(), new_name.to_string()],
                file_updated: Vec::new(),
            }]
        } else {
            vec![
                NodeChange {
                    node: old_dir,
                    dir_updated: vec![old_name.to_string()],
                    file_updated: Vec::new(),
                },
                NodeChange {
                    node: new_dir,
                    dir_updated: vec![new_name.to_string()],
                    file_updated: Vec::new(),
                },
            ]
        };
        self.deliver(ctx, tlf, Delivery::Batch(changes));
        Ok(())
    }

    fn remove_dir(&self, ctx: &OpContext, dir: NodeId, name: &str) -> Result<()> {
        self.remove_common(ctx, dir, name, true)
    }

    fn remove_entry(&self, ctx: &OpContext, dir: NodeId, name: &str) -> Result<()> {
        self.remove_common(ctx, dir, name, false)
    }

    fn get_dir_children(&self, ctx: &OpContext, dir: NodeId) -> Result<BTreeMap<String, EntryType>> {
        ctx.check_canceled()?;
        let st = self.state.lock();
        let parent = st.dir(dir)?;
        parent
            .children
            .iter()
            .map(|(name, &id)| Ok((name.clone(), st.node(id)?.kind)))
            .collect()
    }

    fn stat(&self, ctx: &OpContext, node: NodeId) -> Result<EntryInfo> {
        ctx.check_canceled()?;
        Ok(self.state.lock().node(node)?.entry_info())
    }

    fn read(&self, ctx: &OpContext, file: NodeId, off: u64, buf: &mut [u8]) -> Result<usize> {
        ctx.check_canceled()?;
        let st = self.state.lock();
        let node = st.node(file)?;
        if !node.is_file() {
            return Err(OpsError::NotFile(format!("node {}", file.0)));
        }
        let start = (off as usize).min(node.data.len());
        let end = (start + buf.len()).min(node.data.len());
        let n = end - start;
        buf[..n].copy_from_slice(&node.data[start..end]);
        Ok(n)
    }

    fn write(&self, ctx: &OpContext, file: NodeId, off: u64, data: &[u8]) -> Result<()> {
        ctx.check_canceled()?;
        if data.is_empty() {
            return Ok(());
        }
        let tlf = {
            let mut st = self.state.lock();
            let node = st.nodes.get_mut(&file).ok_or(OpsError::StaleNode)?;
            if !node.is_file() {
                return Err(OpsError::NotFile(format!("node {}", file.0)));
            }
            let end = off as usize + data.len();
            if node.data.len() < end {
                node.data.resize(end, 0);
            }
            node.data[off as usize..end].copy_from_slice(data);
            node.mtime = SystemTime::now();
            node.tlf
        };
        self.deliver(
            ctx,
            tlf,
            Delivery::Local(
                file,
                WriteRange {
                    off,
                    len: data.len() as u64,
                },
            ),
        );
        Ok(())
    }

    fn truncate(&self, ctx: &OpContext, file: NodeId, size: u64) -> Result<()> {
        ctx.check_canceled()?;
        let tlf = {
            let mut st = self.state.lock();
            let node = st.nodes.get_mut(&file).ok_or(OpsError::StaleNode)?;
            if !node.is_file() {
                return Err(OpsError::NotFile(format!("node {}", file.0)));
            }
            node.data.resize(size as usize, 0);
            node.mtime = SystemTime::now();
            node.tlf
        };
        self.deliver(ctx, tlf, Delivery::Local(file, WriteRange { off: size, len: 0 }));
        Ok(())
    }

    fn set_ex(&self, ctx: &OpContext, file: NodeId, exec: bool) -> Result<()> {
        ctx.check_canceled()?;
        let changed = {
            let mut st = self.state.lock();
            let node = st.nodes.get_mut(&file).ok_or(OpsError::StaleNode)?;
            if !node.is_file() {
                return Err(OpsError::NotFile(format!("node {}", file.0)));
            }
            let kind = if exec { EntryType::Exec } else { EntryType::File };
            let changed = node.kind != kind;
            node.kind = kind;
            changed.then_some(node.tlf)
        };
        if let Some(tlf) = changed {
            self.deliver(ctx, tlf, Delivery::Batch(vec![NodeChange::attr_only(file)]));
        }
        Ok(())
    }

    fn set_mtime(&self, ctx: &OpContext, node: NodeId, mtime: Option<SystemTime>) -> Result<()> {
        ctx.check_canceled()?;
        let tlf = {
            let mut st = self.state.lock();
            let n = st.nodes.get_mut(&node).ok_or(OpsError::StaleNode)?;
            n.mtime = mtime.unwrap_or_else(SystemTime::now);
            n.tlf
        };
        self.deliver(ctx, tlf, Delivery::Batch(vec![NodeChange::attr_only(node)]));
        Ok(())
    }

    fn sync(&self, ctx: &OpContext, file: NodeId) -> Result<()> {
        ctx.check_canceled()?;
        self.state.lock().node(file)?;
        Ok(())
    }

    fn status(&self, ctx: &OpContext, fb: FolderBranch) -> Result<FolderStatus> {
        ctx.check_canceled()?;
        let st = self.state.lock();
        let info = st
            .tlfs
            .get(&fb.tlf)
            .ok_or_else(|| OpsError::Other(format!("unknown folder {}", fb.tlf.0)))?;
        Ok(FolderStatus {
            folder: info.name.clone(),
            branch: fb.branch.to_string(),
            staged: info.staged,
            updates_paused: info.paused.is_some(),
            rekeys: info.rekeys,
        })
    }

    fn sync_from_server(&self, ctx: &OpContext, fb: FolderBranch) -> Result<()> {
        ctx.check_canceled()?;
        {
            let st = self.state.lock();
            if !st.tlfs.contains_key(&fb.tlf) {
                return Err(OpsError::Other(format!("unknown folder {}", fb.tlf.0)));
            }
        }
        // Everything is already in memory; the only pending work is any
        // buffered notification backlog from a resumed pause.
        self.deliver(ctx, fb.tlf, Delivery::Batch(Vec::new()));
        Ok(())
    }

    fn unstage(&self, ctx: &OpContext, fb: FolderBranch) -> Result<()> {
        ctx.check_canceled()?;
        let (root, names) = {
            let mut st = self.state.lock();
            let info = st
                .tlfs
                .get_mut(&fb.tlf)
                .ok_or_else(|| OpsError::Other(format!("unknown folder {}", fb.tlf.0)))?;
            info.staged = false;
            let root = info.root;
            let names = st.nodes[&root].children.keys().cloned().collect();
            (root, names)
        };
        self.deliver(
            ctx,
            fb.tlf,
            Delivery::Batch(vec![NodeChange {
                node: root,
                dir_updated: names,
                file_updated: Vec::new(),
            }]),
        );
        Ok(())
    }

    fn rekey(&self, ctx: &OpContext, tlf: TlfId) -> Result<()> {
        ctx.check_canceled()?;
        let mut st = self.state.lock();
        let info = st
            .tlfs
            .get_mut(&tlf)
            .ok_or_else(|| OpsError::Other(format!("unknown folder {}", tlf.0)))?;
        info.rekeys += 1;
        Ok(())
    }

    fn disable_updates(&self, ctx: &OpContext, fb: FolderBranch) -> Result<SyncSender<()>> {
        ctx.check_canceled()?;
        let (tx, rx) = mpsc::sync_channel(1);
        let mut st = self.state.lock();
        let info = st
            .tlfs
            .get_mut(&fb.tlf)
            .ok_or_else(|| OpsError::Other(format!("unknown folder {}", fb.tlf.0)))?;
        info.paused = Some(Paused {
            resume: rx,
            buffered: Vec::new(),
        });
        Ok(tx)
    }

    fn get_favorites(&self, ctx: &OpContext) -> Result<Vec<Favorite>> {
        ctx.check_canceled()?;
        Ok(self.state.lock().favorites.iter().cloned().collect())
    }

    fn register_for_changes(&self, fb: FolderBranch, observer: Arc<dyn Observer>) -> ObserverId {
        let mut st = self.state.lock();
        st.next_observer += 1;
        let id = ObserverId(st.next_observer);
        st.observers.entry(fb.tlf).or_default().push((id, observer));
        id
    }

    fn unregister_from_changes(&self, fb: FolderBranch, id: ObserverId) {
        let mut st = self.state.lock();
        if let Some(list) = st.observers.get_mut(&fb.tlf) {
            list.retain(|(existing, _)| *existing != id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::parse_tlf_handle;

    fn memfs() -> (MemFs, OpContext) {
        let kbpki = Arc::new(LocalKbpki::new(
            ["jdoe", "wsmith"],
            Some("jdoe".to_string()),
        ));
        (MemFs::new(kbpki), OpContext::background())
    }

    fn root_of(fs: &MemFs, ctx: &OpContext, name: &str) -> (NodeId, FolderBranch) {
        let kbpki = LocalKbpki::new(["jdoe", "wsmith"], Some("jdoe".to_string()));
        let handle = parse_tlf_handle(ctx, &kbpki, name, false).unwrap();
        let (root, fb, _) = fs.get_or_create_root_node(ctx, &handle).unwrap();
        (root, fb)
    }

    #[test]
    fn write_read_round_trip() {
        let (fs, ctx) = memfs();
        let (root, _) = root_of(&fs, &ctx, "jdoe");
        let (file, _) = fs.create_file(&ctx, root, "myfile", false).unwrap();
        fs.write(&ctx, file, 0, b"hello, world\n").unwrap();
        let mut buf = [0; 32];
        let n = fs.read(&ctx, file, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello, world\n");
    }

    #[test]
    fn sparse_write_zero_fills() {
        let (fs, ctx) = memfs();
        let (root, _) = root_of(&fs, &ctx, "jdoe");
        let (file, _) = fs.create_file(&ctx, root, "sparse", false).unwrap();
        fs.write(&ctx, file, 5, b"x").unwrap();
        let mut buf = [0xffu8; 8];
        let n = fs.read(&ctx, file, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"\0\0\0\0\0x");
    }

    #[test]
    fn unlinked_file_stays_readable() {
        let (fs, ctx) = memfs();
        let (root, _) = root_of(&fs, &ctx, "jdoe");
        let (file, _) = fs.create_file(&ctx, root, "gone", false).unwrap();
        fs.write(&ctx, file, 0, b"content").unwrap();
        fs.remove_entry(&ctx, root, "gone").unwrap();
        assert!(matches!(
            fs.lookup(&ctx, root, "gone"),
            Err(OpsError::NoSuchName(_))
        ));
        let mut buf = [0; 16];
        let n = fs.read(&ctx, file, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"content");
    }

    #[test]
    fn remove_twice_reports_missing() {
        let (fs, ctx) = memfs();
        let (root, _) = root_of(&fs, &ctx, "jdoe");
        fs.create_file(&ctx, root, "f", false).unwrap();
        fs.remove_entry(&ctx, root, "f").unwrap();
        assert!(matches!(
            fs.remove_entry(&ctx, root, "f"),
            Err(OpsError::NoSuchName(_))
        ));
    }

    #[test]
    fn rename_refuses_nonempty_destination() {
        let (fs, ctx) = memfs();
        let (root, _) = root_of(&fs, &ctx, "jdoe");
        let (dir, _) = fs.create_dir(&ctx, root, "full").unwrap();
        fs.create_file(&ctx, dir, "inner", false).unwrap();
        fs.create_dir(&ctx, root, "src").unwrap();
        assert!(matches!(
            fs.rename(&ctx, root, "src", root, "full"),
            Err(OpsError::DirNotEmpty(_))
        ));
    }

    #[test]
    fn rename_across_folders_refused() {
        let (fs, ctx) = memfs();
        let (root_a, _) = root_of(&fs, &ctx, "jdoe");
        let (root_b, _) = root_of(&fs, &ctx, "jdoe,wsmith");
        fs.create_file(&ctx, root_a, "f", false).unwrap();
        assert!(matches!(
            fs.rename(&ctx, root_a, "f", root_b, "f"),
            Err(OpsError::RenameAcrossFolders)
        ));
    }

    #[test]
    fn foreign_private_folder_denied() {
        let (fs, ctx) = memfs();
        let kbpki = LocalKbpki::new(["jdoe", "wsmith"], Some("jdoe".to_string()));
        let handle = parse_tlf_handle(&ctx, &kbpki, "wsmith", false).unwrap();
        assert!(matches!(
            fs.get_or_create_root_node(&ctx, &handle),
            Err(OpsError::ReadAccess { .. })
        ));
    }

    #[test]
    fn paused_updates_buffer_until_resume() {
        use parking_lot::Mutex as PlMutex;

        #[derive(Default)]
        struct Recorder {
            batches: PlMutex<Vec<Vec<NodeChange>>>,
        }
        impl Observer for Recorder {
            fn local_change(&self, _ctx: &OpContext, node: NodeId, write: WriteRange) {
                self.batches.lock().push(vec![NodeChange {
                    node,
                    dir_updated: Vec::new(),
                    file_updated: vec![write],
                }]);
            }
            fn batch_changes(&self, _ctx: &OpContext, changes: &[NodeChange]) {
                self.batches.lock().push(changes.to_vec());
            }
        }

        let (fs, ctx) = memfs();
        let (root, fb) = root_of(&fs, &ctx, "jdoe");
        let recorder = Arc::new(Recorder::default());
        fs.register_for_changes(fb, recorder.clone());

        let resume = fs.disable_updates(&ctx, fb).unwrap();
        fs.create_file(&ctx, root, "held", false).unwrap();
        assert!(recorder.batches.lock().is_empty());
        assert!(fs.status(&ctx, fb).unwrap().staged);

        resume.send(()).unwrap();
        fs.sync_from_server(&ctx, fb).unwrap();
        let batches = recorder.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].dir_updated, ["held"]);
    }

    #[test]
    fn rekey_counts() {
        let (fs, ctx) = memfs();
        let (_, fb) = root_of(&fs, &ctx, "jdoe");
        fs.rekey(&ctx, fb.tlf).unwrap();
        fs.rekey(&ctx, fb.tlf).unwrap();
        assert_eq!(fs.status(&ctx, fb).unwrap().rekeys, 2);
    }
}
