//! The seam between the kernel adapter and the KBFS operations layer.
//!
//! Everything below the mount is consumed through [`KbfsOps`]: metadata,
//! blocks, crypto, and conflict resolution live behind it. The adapter's
//! job is limited to translating kernel requests into these calls and
//! kernel invalidations out of the [`Observer`] callbacks.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc::SyncSender;
use std::time::SystemTime;

use serde::Serialize;

use crate::handle::TlfHandle;

/// Identity of a live KBFS node within the operations layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(pub u64);

/// Identity of a top-level folder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TlfId(pub u64);

/// Handle for an observer registration, used to unregister.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObserverId(pub u64);

/// Identity of one mount; changes carry the mount they originated on so
/// the originating side can skip redundant kernel invalidations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MountId(pub u64);

impl MountId {
    /// Origin used for contexts not tied to any mount.
    pub const NONE: MountId = MountId(0);
}

/// The branch of a folder being served.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BranchName {
    /// The merged, server-synchronized branch.
    Master,
}

impl fmt::Display for BranchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchName::Master => f.write_str("master"),
        }
    }
}

/// A top-level folder plus the branch of it being served.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FolderBranch {
    /// The folder.
    pub tlf: TlfId,
    /// The branch.
    pub branch: BranchName,
}

/// The type of a directory entry as reported by the operations layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryType {
    /// Regular file.
    File,
    /// Regular file with the executable bit set.
    Exec,
    /// Directory.
    Dir,
    /// Symbolic link.
    Sym,
}

/// Stat information for one entry.
#[derive(Clone, Debug)]
pub struct EntryInfo {
    /// Entry type.
    pub entry_type: EntryType,
    /// Size in bytes.
    pub size: u64,
    /// Modification time.
    pub mtime: SystemTime,
    /// Link target, present only for [`EntryType::Sym`].
    pub sym_path: Option<String>,
}

/// A modified byte range within a file. `len == 0` encodes a truncate to
/// `off`, affecting everything from `off` to the end of the file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteRange {
    /// Start offset of the change.
    pub off: u64,
    /// Length of the change, or zero for a truncate.
    pub len: u64,
}

impl WriteRange {
    /// Whether this range encodes a truncate.
    pub fn is_truncate(&self) -> bool {
        self.len == 0
    }
}

/// One changed node inside a batch notification.
#[derive(Clone, Debug)]
pub struct NodeChange {
    /// The changed node.
    pub node: NodeId,
    /// Names of directory entries that changed under this node.
    pub dir_updated: Vec<String>,
    /// Byte ranges that changed, when the node is a file.
    pub file_updated: Vec<WriteRange>,
}

impl NodeChange {
    /// A change touching only the node's attributes.
    pub fn attr_only(node: NodeId) -> NodeChange {
        NodeChange {
            node,
            dir_updated: Vec::new(),
            file_updated: Vec::new(),
        }
    }
}

/// A folder a user has pinned.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Favorite {
    /// Canonical folder name.
    pub name: String,
    /// Whether the folder lives in the public namespace.
    pub public: bool,
}

/// Status of one folder-branch, as surfaced by the status pseudo-file.
#[derive(Clone, Debug, Serialize)]
pub struct FolderStatus {
    /// Canonical folder name.
    pub folder: String,
    /// Branch being served.
    pub branch: String,
    /// Whether local changes are staged away from the server view.
    pub staged: bool,
    /// Whether applying server updates is currently paused.
    pub updates_paused: bool,
    /// How many rekeys have been requested.
    pub rekeys: u64,
}

/// Per-call context threaded through every [`KbfsOps`] invocation.
///
/// Carries the identity of the mount the call originated on (observers
/// compare it to suppress self-invalidation) and a cancellation flag the
/// operations layer is expected to poll.
#[derive(Clone, Debug)]
pub struct OpContext {
    origin: MountId,
    canceled: Arc<AtomicBool>,
}

impl OpContext {
    /// A context originating on the given mount.
    pub fn new(origin: MountId) -> OpContext {
        OpContext {
            origin,
            canceled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A context with no originating mount (background work, tests).
    pub fn background() -> OpContext {
        OpContext::new(MountId::NONE)
    }

    /// The mount this call originated on.
    pub fn origin(&self) -> MountId {
        self.origin
    }

    /// Request cancellation of the call carrying this context.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Fail with [`OpsError::Canceled`] if cancellation has been requested.
    pub fn check_canceled(&self) -> Result<()> {
        if self.is_canceled() {
            Err(OpsError::Canceled)
        } else {
            Ok(())
        }
    }
}

/// Errors reported by the operations layer.
#[derive(Clone, Debug)]
pub enum OpsError {
    /// The named entry does not exist.
    NoSuchName(String),
    /// The named user does not exist.
    NoSuchUser(String),
    /// The target entry already exists.
    NameExists(String),
    /// The operation requires a directory.
    NotDir(String),
    /// The operation requires a file.
    NotFile(String),
    /// The named directory is not empty.
    DirNotEmpty(String),
    /// The user may not read the folder.
    ReadAccess {
        /// The denied user.
        user: String,
        /// The folder being read.
        folder: String,
    },
    /// The user may not write the folder.
    WriteAccess {
        /// The denied user.
        user: String,
        /// The folder being written.
        folder: String,
    },
    /// Source and destination of a rename live in different folders.
    RenameAcrossFolders,
    /// The node is no longer known to the operations layer.
    StaleNode,
    /// The call was canceled.
    Canceled,
    /// Any other failure, kept as text.
    Other(String),
}

impl fmt::Display for OpsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpsError::NoSuchName(name) => write!(f, "{name} doesn't exist"),
            OpsError::NoSuchUser(user) => write!(f, "{user} is not a known user"),
            OpsError::NameExists(name) => write!(f, "{name} already exists"),
            OpsError::NotDir(name) => write!(f, "{name} is not a directory"),
            OpsError::NotFile(name) => write!(f, "{name} is not a file"),
            OpsError::DirNotEmpty(name) => write!(f, "directory {name} is not empty"),
            OpsError::ReadAccess { user, folder } => {
                write!(f, "{user} does not have read access to {folder}")
            }
            OpsError::WriteAccess { user, folder } => {
                write!(f, "{user} does not have write access to {folder}")
            }
            OpsError::RenameAcrossFolders => {
                f.write_str("renames across top-level folders are not supported")
            }
            OpsError::StaleNode => f.write_str("node is no longer known"),
            OpsError::Canceled => f.write_str("operation canceled"),
            OpsError::Other(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for OpsError {}

/// Result alias for operations-layer calls.
pub type Result<T> = std::result::Result<T, OpsError>;

/// Receiver of change notifications for one folder-branch.
///
/// [`Observer::local_change`] reports changes made through this process;
/// [`Observer::batch_changes`] reports changes from anywhere, including
/// other hosts. Both run on the operations layer's own workers and must
/// not call back into [`KbfsOps`].
pub trait Observer: Send + Sync {
    /// A write or truncate performed in this process.
    fn local_change(&self, ctx: &OpContext, node: NodeId, write: WriteRange);

    /// A batch of committed changes, possibly from another host.
    fn batch_changes(&self, ctx: &OpContext, changes: &[NodeChange]);
}

/// The KBFS operations layer.
///
/// Implementations are internally synchronized; calls may arrive from any
/// number of kernel worker threads at once.
pub trait KbfsOps: Send + Sync {
    /// Fetch or create the root node for a folder handle.
    fn get_or_create_root_node(
        &self,
        ctx: &OpContext,
        handle: &TlfHandle,
    ) -> Result<(NodeId, FolderBranch, EntryInfo)>;

    /// Look up `name` under `dir`. Symlinks report no node of their own.
    fn lookup(&self, ctx: &OpContext, dir: NodeId, name: &str) -> Result<(Option<NodeId>, EntryInfo)>;

    /// Create a regular file, executable when `exec` is set.
    fn create_file(
        &self,
        ctx: &OpContext,
        dir: NodeId,
        name: &str,
        exec: bool,
    ) -> Result<(NodeId, EntryInfo)>;

    /// Create a directory.
    fn create_dir(&self, ctx: &OpContext, dir: NodeId, name: &str) -> Result<(NodeId, EntryInfo)>;

    /// Create a symlink to `target`.
    fn create_link(&self, ctx: &OpContext, dir: NodeId, name: &str, target: &str)
    -> Result<EntryInfo>;

    /// Atomically rename within one folder.
    fn rename(
        &self,
        ctx: &OpContext,
        old_dir: NodeId,
        old_name: &str,
        new_dir: NodeId,
        new_name: &str,
    ) -> Result<()>;

    /// Remove an empty directory.
    fn remove_dir(&self, ctx: &OpContext, dir: NodeId, name: &str) -> Result<()>;

    /// Remove a file or symlink entry.
    fn remove_entry(&self, ctx: &OpContext, dir: NodeId, name: &str) -> Result<()>;

    /// List the children of a directory with their entry types.
    fn get_dir_children(&self, ctx: &OpContext, dir: NodeId) -> Result<BTreeMap<String, EntryType>>;

    /// Stat a node.
    fn stat(&self, ctx: &OpContext, node: NodeId) -> Result<EntryInfo>;

    /// Read from a file at `off` into `buf`, returning the bytes read.
    fn read(&self, ctx: &OpContext, file: NodeId, off: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write `data` to a file at `off`, extending it as needed.
    fn write(&self, ctx: &OpContext, file: NodeId, off: u64, data: &[u8]) -> Result<()>;

    /// Truncate (or extend with zeroes) a file to `size`.
    fn truncate(&self, ctx: &OpContext, file: NodeId, size: u64) -> Result<()>;

    /// Toggle the executable bit of a file.
    fn set_ex(&self, ctx: &OpContext, file: NodeId, exec: bool) -> Result<()>;

    /// Set a node's mtime; `None` means the current time.
    fn set_mtime(&self, ctx: &OpContext, node: NodeId, mtime: Option<SystemTime>) -> Result<()>;

    /// Flush buffered writes of a file to the server.
    fn sync(&self, ctx: &OpContext, file: NodeId) -> Result<()>;

    /// Current status of a folder-branch.
    fn status(&self, ctx: &OpContext, fb: FolderBranch) -> Result<FolderStatus>;

    /// Block until the folder-branch reflects the server's current view.
    fn sync_from_server(&self, ctx: &OpContext, fb: FolderBranch) -> Result<()>;

    /// Abandon staged local changes and return to the server view.
    fn unstage(&self, ctx: &OpContext, fb: FolderBranch) -> Result<()>;

    /// Request a rekey of the folder.
    fn rekey(&self, ctx: &OpContext, tlf: TlfId) -> Result<()>;

    /// Pause applying server updates. Sending on the returned channel
    /// resumes them.
    fn disable_updates(&self, ctx: &OpContext, fb: FolderBranch) -> Result<SyncSender<()>>;

    /// The current user's pinned folders.
    fn get_favorites(&self, ctx: &OpContext) -> Result<Vec<Favorite>>;

    /// Register an observer for a folder-branch.
    fn register_for_changes(&self, fb: FolderBranch, observer: Arc<dyn Observer>) -> ObserverId;

    /// Remove a previously registered observer.
    fn unregister_from_changes(&self, fb: FolderBranch, id: ObserverId);
}

/// Identity and name resolution service.
pub trait Kbpki: Send + Sync {
    /// The logged-in user's name, if any.
    fn current_user(&self, ctx: &OpContext) -> Result<Option<String>>;

    /// Resolve a user assertion to a canonical username.
    fn resolve_user(&self, ctx: &OpContext, assertion: &str) -> Result<String>;
}
