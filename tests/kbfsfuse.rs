//! End-to-end scenarios over the in-memory operations layer.
//!
//! These drive the kernel-ingress API of `KbfsFs` directly, with a
//! recording notifier standing in for the kernel's invalidation channel,
//! so no actual mount is needed.

use std::ffi::OsStr;
use std::ffi::OsString;
use std::io;
use std::sync::Arc;

use fuser::FileType;
use kbfsfuse::Config;
use kbfsfuse::Errno;
use kbfsfuse::KbfsFs;
use kbfsfuse::KernelNotifier;
use kbfsfuse::PRIVATE_INO;
use kbfsfuse::PUBLIC_INO;
use kbfsfuse::ROOT_INO;
use kbfsfuse::SetattrRequest;
use kbfsfuse::handle::parse_tlf_handle;
use kbfsfuse::memfs::LocalKbpki;
use kbfsfuse::memfs::MemFs;
use kbfsfuse::ops::KbfsOps;
use kbfsfuse::ops::OpContext;
use kbfsfuse::special::DISABLE_UPDATES_FILE_NAME;
use kbfsfuse::special::ENABLE_UPDATES_FILE_NAME;
use kbfsfuse::special::ERROR_FILE_NAME;
use kbfsfuse::special::METRICS_FILE_NAME;
use kbfsfuse::special::REKEY_FILE_NAME;
use kbfsfuse::special::STATUS_FILE_NAME;
use kbfsfuse::special::UNSTAGE_FILE_NAME;
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Inval {
    Data(u64),
    Range(u64, i64, i64),
    Attr(u64),
    Entry(u64, OsString),
}

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<Inval>>,
}

impl Recorder {
    fn calls(&self) -> Vec<Inval> {
        self.calls.lock().clone()
    }

    fn clear(&self) {
        self.calls.lock().clear();
    }
}

impl KernelNotifier for Recorder {
    fn invalidate_node_data(&self, ino: u64) -> io::Result<()> {
        self.calls.lock().push(Inval::Data(ino));
        Ok(())
    }

    fn invalidate_node_data_range(&self, ino: u64, off: i64, len: i64) -> io::Result<()> {
        self.calls.lock().push(Inval::Range(ino, off, len));
        Ok(())
    }

    fn invalidate_node_attr(&self, ino: u64) -> io::Result<()> {
        self.calls.lock().push(Inval::Attr(ino));
        Ok(())
    }

    fn invalidate_entry(&self, parent: u64, name: &OsStr) -> io::Result<()> {
        self.calls.lock().push(Inval::Entry(parent, name.to_owned()));
        Ok(())
    }
}

const USERS: [&str; 4] = ["jdoe", "wsmith", "user1", "user2"];

fn collaborators(current: &str) -> (Arc<MemFs>, Arc<LocalKbpki>) {
    let kbpki = Arc::new(LocalKbpki::new(USERS, Some(current.to_string())));
    let ops = Arc::new(MemFs::new(kbpki.clone()));
    (ops, kbpki)
}

fn mount(ops: &Arc<MemFs>, kbpki: &Arc<LocalKbpki>) -> (KbfsFs, Arc<Recorder>) {
    let config = Arc::new(Config::new(ops.clone(), kbpki.clone()));
    let fs = KbfsFs::new(config);
    let recorder = Arc::new(Recorder::default());
    fs.set_notifier(recorder.clone());
    (fs, recorder)
}

fn new_fs(current: &str) -> (KbfsFs, Arc<Recorder>) {
    let (ops, kbpki) = collaborators(current);
    mount(&ops, &kbpki)
}

fn private_folder(fs: &KbfsFs, name: &str) -> u64 {
    fs.lookup(PRIVATE_INO, name).unwrap().ino
}

fn read_all(fs: &KbfsFs, ino: u64) -> Vec<u8> {
    fs.read(ino, 0, 1 << 20).unwrap()
}

fn names_of(entries: &[kbfsfuse::DirEntryOut]) -> Vec<&str> {
    entries.iter().map(|e| e.name.as_str()).collect()
}

#[test]
fn create_then_read_back() {
    let (fs, _) = new_fs("jdoe");
    let private = fs.lookup(ROOT_INO, "private").unwrap().ino;
    assert_eq!(private, PRIVATE_INO);
    let folder = private_folder(&fs, "jdoe");
    let file = fs.create(folder, "myfile", 0o644).unwrap();
    assert_eq!(fs.write(file.ino, 0, b"hello, world\n").unwrap(), 13);
    assert_eq!(read_all(&fs, file.ino), b"hello, world\n");
    let attr = fs.getattr(file.ino).unwrap();
    assert_eq!(attr.kind, FileType::RegularFile);
    assert_eq!(attr.perm, 0o644);
    assert_eq!(attr.size, 13);
}

#[test]
fn cross_folder_rename_fails_with_exdev() {
    let (fs, _) = new_fs("jdoe");
    let src_dir = private_folder(&fs, "jdoe");
    let dst_dir = private_folder(&fs, "jdoe,wsmith");
    let file = fs.create(src_dir, "old", 0o644).unwrap();
    fs.write(file.ino, 0, b"hello, world\n").unwrap();

    assert_eq!(
        fs.rename(src_dir, "old", dst_dir, "new").unwrap_err(),
        Errno::EXDEV
    );
    // Source is untouched, destination never appeared.
    let still = fs.lookup(src_dir, "old").unwrap();
    assert_eq!(read_all(&fs, still.ino), b"hello, world\n");
    assert_eq!(fs.lookup(dst_dir, "new").unwrap_err(), Errno::ENOENT);
}

#[test]
fn removed_file_stays_readable_while_open() {
    let (fs, _) = new_fs("jdoe");
    let folder = private_folder(&fs, "jdoe");
    let file = fs.create(folder, "myfile", 0o644).unwrap();
    fs.write(file.ino, 0, b"hello, world\n").unwrap();
    assert!(names_of(&fs.readdir(folder).unwrap()).contains(&"myfile"));

    fs.remove(folder, "myfile", false).unwrap();
    // The kernel still holds the wrapper: content remains readable.
    assert_eq!(read_all(&fs, file.ino), b"hello, world\n");
    assert!(!names_of(&fs.readdir(folder).unwrap()).contains(&"myfile"));
    assert_eq!(fs.lookup(folder, "myfile").unwrap_err(), Errno::ENOENT);
}

#[test]
fn cross_mount_write_invalidates_other_mount_only() {
    let (ops, kbpki) = collaborators("user1");
    let (fs1, recorder1) = mount(&ops, &kbpki);
    let (fs2, recorder2) = mount(&ops, &kbpki);

    let folder1 = private_folder(&fs1, "user1,user2");
    let file1 = fs1.create(folder1, "myfile", 0o644).unwrap();
    fs1.write(file1.ino, 0, b"input round one").unwrap();

    let folder2 = private_folder(&fs2, "user1,user2");
    let file2 = fs2.lookup(folder2, "myfile").unwrap();
    assert_eq!(read_all(&fs2, file2.ino), b"input round one");

    fs1.wait_for_notifications();
    fs2.wait_for_notifications();
    recorder1.clear();
    recorder2.clear();

    let round_two = b"second round of content";
    fs1.write(file1.ino, 0, round_two).unwrap();
    fs1.wait_for_notifications();
    fs2.wait_for_notifications();

    // The second mount gets a precise data invalidation; the mount that
    // wrote sees nothing (the kernel on that side already knows).
    assert_eq!(
        recorder2.calls(),
        [Inval::Range(file2.ino, 0, round_two.len() as i64)]
    );
    assert_eq!(recorder1.calls(), []);

    let ctx = OpContext::background();
    let handle = parse_tlf_handle(&ctx, kbpki.as_ref(), "user1,user2", false).unwrap();
    let (_, fb, _) = ops.get_or_create_root_node(&ctx, &handle).unwrap();
    ops.sync_from_server(&ctx, fb).unwrap();
    assert_eq!(read_all(&fs2, file2.ino), round_two);
}

#[test]
fn cross_mount_create_invalidates_directory() {
    let (ops, kbpki) = collaborators("user1");
    let (fs1, _) = mount(&ops, &kbpki);
    let (fs2, recorder2) = mount(&ops, &kbpki);

    let folder1 = private_folder(&fs1, "user1,user2");
    let folder2 = private_folder(&fs2, "user1,user2");
    // Resolve the second mount's root so its wrapper is tracked.
    fs2.readdir(folder2).unwrap();
    fs2.wait_for_notifications();
    recorder2.clear();

    fs1.create(folder1, "fresh", 0o644).unwrap();
    fs2.wait_for_notifications();
    assert_eq!(
        recorder2.calls(),
        [
            Inval::Data(folder2),
            Inval::Entry(folder2, OsString::from("fresh")),
        ]
    );
}

#[test]
fn truncate_grow_zero_fills() {
    let (fs, _) = new_fs("jdoe");
    let folder = private_folder(&fs, "jdoe");
    let file = fs.create(folder, "grow", 0o644).unwrap();
    fs.write(file.ino, 0, b"hello, world\n").unwrap();

    let req = SetattrRequest {
        size: Some(100),
        ..Default::default()
    };
    let attr = fs.setattr(file.ino, &req).unwrap();
    assert_eq!(attr.size, 100);

    let mut expected = b"hello, world\n".to_vec();
    expected.resize(100, 0);
    assert_eq!(read_all(&fs, file.ino), expected);
}

#[test]
fn non_canonical_name_resolves_to_alias() {
    let (fs, _) = new_fs("jdoe");
    let alias = fs.lookup(PRIVATE_INO, "jdoe,jdoe").unwrap();
    assert_eq!(alias.attr.kind, FileType::Symlink);
    assert_eq!(alias.attr.perm, 0o777);
    assert_eq!(fs.readlink(alias.ino).unwrap(), "jdoe");

    let multi = fs.lookup(PRIVATE_INO, "wsmith,jdoe").unwrap();
    assert_eq!(fs.readlink(multi.ino).unwrap(), "jdoe,wsmith");
}

#[test]
fn chmod_on_directory_is_refused() {
    let (fs, _) = new_fs("jdoe");
    let folder = private_folder(&fs, "jdoe");
    let dir = fs.mkdir(folder, "mydir").unwrap();
    let req = SetattrRequest {
        mode: Some(0o655),
        ..Default::default()
    };
    assert_eq!(fs.setattr(dir.ino, &req).unwrap_err(), Errno::EPERM);
}

#[test]
fn folder_modes_follow_visibility() {
    let (fs, _) = new_fs("jdoe");
    let private = private_folder(&fs, "jdoe");
    // Resolve so the attribute comes from the real root node.
    fs.readdir(private).unwrap();
    let attr = fs.getattr(private).unwrap();
    assert_eq!(attr.kind, FileType::Directory);
    assert_eq!(attr.perm, 0o700);

    let public = fs.lookup(PUBLIC_INO, "jdoe").unwrap();
    assert_eq!(public.attr.perm, 0o755);
    assert_eq!(fs.getattr(ROOT_INO).unwrap().perm, 0o755);
    assert_eq!(fs.getattr(PRIVATE_INO).unwrap().perm, 0o755);
}

#[test]
fn lookup_forget_refcounts_track_the_kernel() {
    let (fs, _) = new_fs("jdoe");
    let folder = private_folder(&fs, "jdoe");
    let created = fs.create(folder, "counted", 0o644).unwrap();
    let once = fs.lookup(folder, "counted").unwrap();
    let twice = fs.lookup(folder, "counted").unwrap();
    assert_eq!(created.ino, once.ino);
    assert_eq!(once.ino, twice.ino);

    fs.forget(created.ino, 2);
    assert!(fs.getattr(created.ino).is_ok());
    fs.forget(created.ino, 1);
    assert_eq!(fs.getattr(created.ino).unwrap_err(), Errno::ESTALE);
}

#[test]
fn folder_detaches_when_last_wrapper_is_forgotten() {
    let (fs, _) = new_fs("jdoe");
    let placeholder = fs.lookup(PRIVATE_INO, "jdoe").unwrap();
    let file = fs.create(placeholder.ino, "only", 0o644).unwrap();

    fs.forget(file.ino, 1);
    fs.forget(placeholder.ino, 1);

    // The name resolves again from scratch, under a fresh inode.
    let again = fs.lookup(PRIVATE_INO, "jdoe").unwrap();
    assert_ne!(again.ino, placeholder.ino);
    fs.readdir(again.ino).unwrap();
}

#[test]
fn remove_is_not_idempotent() {
    let (fs, _) = new_fs("jdoe");
    let folder = private_folder(&fs, "jdoe");
    fs.create(folder, "once", 0o644).unwrap();
    fs.remove(folder, "once", false).unwrap();
    assert_eq!(fs.remove(folder, "once", false).unwrap_err(), Errno::ENOENT);
}

#[test]
fn rmdir_of_nonempty_directory_fails() {
    let (fs, _) = new_fs("jdoe");
    let folder = private_folder(&fs, "jdoe");
    let dir = fs.mkdir(folder, "full").unwrap();
    fs.create(dir.ino, "inner", 0o644).unwrap();
    assert_eq!(fs.remove(folder, "full", true).unwrap_err(), Errno::ENOTEMPTY);
}

#[test]
fn virtual_directories_refuse_writes() {
    let (fs, _) = new_fs("jdoe");
    assert_eq!(fs.create(ROOT_INO, "x", 0o644).unwrap_err(), Errno::EPERM);
    assert_eq!(fs.mkdir(PRIVATE_INO, "x").unwrap_err(), Errno::EPERM);
    assert_eq!(fs.remove(PRIVATE_INO, "jdoe", true).unwrap_err(), Errno::EPERM);
    assert_eq!(fs.lookup(ROOT_INO, "nonsense").unwrap_err(), Errno::ENOENT);
}

#[test]
fn finder_probes_and_unknown_users_are_not_found() {
    let (fs, _) = new_fs("jdoe");
    assert_eq!(fs.lookup(PRIVATE_INO, "._probe").unwrap_err(), Errno::ENOENT);
    assert_eq!(fs.lookup(PRIVATE_INO, "nobody").unwrap_err(), Errno::ENOENT);
    // Readers are not allowed on public folders.
    assert_eq!(
        fs.lookup(PUBLIC_INO, "jdoe#wsmith").unwrap_err(),
        Errno::ENOENT
    );
}

#[test]
fn foreign_private_folder_is_denied() {
    let (fs, _) = new_fs("jdoe");
    let placeholder = fs.lookup(PRIVATE_INO, "wsmith").unwrap();
    // The name parses, so the placeholder exists; fetching the root is
    // what gets refused.
    assert_eq!(fs.readdir(placeholder.ino).unwrap_err(), Errno::EACCES);
}

#[test]
fn favorites_populate_folder_lists() {
    let (fs, _) = new_fs("jdoe");
    let shared = private_folder(&fs, "jdoe,wsmith");
    fs.readdir(shared).unwrap();
    let own = private_folder(&fs, "jdoe");
    fs.readdir(own).unwrap();
    let public = fs.lookup(PUBLIC_INO, "jdoe").unwrap();
    fs.readdir(public.ino).unwrap();

    let private_names = fs.readdir(PRIVATE_INO).unwrap();
    assert_eq!(names_of(&private_names), ["jdoe", "jdoe,wsmith"]);
    let public_names = fs.readdir(PUBLIC_INO).unwrap();
    assert_eq!(names_of(&public_names), ["jdoe"]);
    assert_eq!(
        names_of(&fs.readdir(ROOT_INO).unwrap()),
        ["private", "public"]
    );
}

#[test]
fn write_read_round_trip_at_offsets() {
    let (fs, _) = new_fs("jdoe");
    let folder = private_folder(&fs, "jdoe");
    let file = fs.create(folder, "offsets", 0o644).unwrap();
    fs.write(file.ino, 3, b"abc").unwrap();
    fs.write(file.ino, 0, b"xy").unwrap();
    assert_eq!(read_all(&fs, file.ino), b"xy\0abc");
    assert_eq!(fs.read(file.ino, 4, 2).unwrap(), b"bc");
    assert_eq!(fs.read(file.ino, 100, 10).unwrap(), b"");
}

#[test]
fn exec_bit_round_trips_through_setattr() {
    let (fs, _) = new_fs("jdoe");
    let folder = private_folder(&fs, "jdoe");
    let file = fs.create(folder, "tool", 0o755).unwrap();
    assert_eq!(file.attr.perm, 0o755);

    let plain = SetattrRequest {
        mode: Some(0o644),
        ..Default::default()
    };
    assert_eq!(fs.setattr(file.ino, &plain).unwrap().perm, 0o644);
    let exec = SetattrRequest {
        mode: Some(0o700),
        ..Default::default()
    };
    assert_eq!(fs.setattr(file.ino, &exec).unwrap().perm, 0o755);
}

#[test]
fn unsupported_setattr_bits_are_enosys() {
    let (fs, _) = new_fs("jdoe");
    let folder = private_folder(&fs, "jdoe");
    let file = fs.create(folder, "f", 0o644).unwrap();
    let req = SetattrRequest {
        uid: Some(0),
        ..Default::default()
    };
    assert_eq!(fs.setattr(file.ino, &req).unwrap_err(), Errno::ENOSYS);
}

#[test]
fn symlinks_inside_folders_resolve() {
    let (fs, _) = new_fs("jdoe");
    let folder = private_folder(&fs, "jdoe");
    fs.create(folder, "target", 0o644).unwrap();
    let link = fs.symlink(folder, "link", "target").unwrap();
    assert_eq!(link.attr.kind, FileType::Symlink);
    assert_eq!(fs.readlink(link.ino).unwrap(), "target");
    // Lookup returns the symlink itself, untracked by the folder.
    let looked = fs.lookup(folder, "link").unwrap();
    assert_eq!(looked.attr.kind, FileType::Symlink);
    assert_eq!(fs.readlink(looked.ino).unwrap(), "target");
}

#[test]
fn control_files_drive_folder_state() {
    let (fs, _) = new_fs("jdoe");
    let folder = private_folder(&fs, "jdoe");
    fs.readdir(folder).unwrap();

    let status_of = |fs: &KbfsFs| -> serde_json::Value {
        let status = fs.lookup(folder, STATUS_FILE_NAME).unwrap();
        serde_json::from_slice(&read_all(fs, status.ino)).unwrap()
    };
    assert_eq!(status_of(&fs)["staged"], false);
    assert_eq!(status_of(&fs)["updates_paused"], false);

    let disable = fs.lookup(folder, DISABLE_UPDATES_FILE_NAME).unwrap();
    assert_eq!(disable.attr.perm, 0o222);
    fs.write(disable.ino, 0, b"off\n").unwrap();
    assert_eq!(status_of(&fs)["updates_paused"], true);

    let file = fs.create(folder, "held", 0o644).unwrap();
    fs.write(file.ino, 0, b"data").unwrap();
    assert_eq!(status_of(&fs)["staged"], true);

    let enable = fs.lookup(folder, ENABLE_UPDATES_FILE_NAME).unwrap();
    fs.write(enable.ino, 0, b"on\n").unwrap();
    let unstage = fs.lookup(folder, UNSTAGE_FILE_NAME).unwrap();
    fs.write(unstage.ino, 0, b"x").unwrap();
    assert_eq!(status_of(&fs)["staged"], false);

    let rekey = fs.lookup(folder, REKEY_FILE_NAME).unwrap();
    fs.write(rekey.ino, 0, b"now").unwrap();
    fs.write(rekey.ino, 0, b"again").unwrap();
    assert_eq!(status_of(&fs)["rekeys"], 2);

    // Control files reject reads, status rejects writes.
    assert_eq!(fs.read(rekey.ino, 0, 16).unwrap_err(), Errno::EPERM);
    let status = fs.lookup(folder, STATUS_FILE_NAME).unwrap();
    assert_eq!(fs.write(status.ino, 0, b"no").unwrap_err(), Errno::EPERM);
}

#[test]
fn error_file_reflects_reported_failures() {
    let (fs, _) = new_fs("jdoe");
    let folder = private_folder(&fs, "jdoe");
    fs.create(folder, "dup", 0o644).unwrap();
    assert_eq!(fs.mkdir(folder, "dup").unwrap_err(), Errno::EEXIST);

    let error_file = fs.lookup(ROOT_INO, ERROR_FILE_NAME).unwrap();
    assert_eq!(error_file.attr.perm, 0o444);
    let text = String::from_utf8(read_all(&fs, error_file.ino)).unwrap();
    assert!(text.contains("mkdir: dup already exists"), "{text}");
    assert!(text.starts_with("ERROR "), "{text}");
    // The same file is visible inside folders too.
    let nested = fs.lookup(folder, ERROR_FILE_NAME).unwrap();
    let nested_text = String::from_utf8(read_all(&fs, nested.ino)).unwrap();
    assert!(nested_text.contains("mkdir: dup already exists"));
}

#[test]
fn metrics_file_counts_operations() {
    let (fs, _) = new_fs("jdoe");
    let folder = private_folder(&fs, "jdoe");
    fs.readdir(folder).unwrap();
    let metrics = fs.lookup(PRIVATE_INO, METRICS_FILE_NAME).unwrap();
    let text = String::from_utf8(read_all(&fs, metrics.ino)).unwrap();
    assert!(text.lines().any(|l| l.starts_with("lookups ")), "{text}");
    assert!(text.lines().any(|l| l.starts_with("dir_ops ")), "{text}");
}

#[test]
fn truncate_propagates_as_truncate_invalidation() {
    let (ops, kbpki) = collaborators("user1");
    let (fs1, _) = mount(&ops, &kbpki);
    let (fs2, recorder2) = mount(&ops, &kbpki);

    let folder1 = private_folder(&fs1, "user1,user2");
    let file1 = fs1.create(folder1, "f", 0o644).unwrap();
    fs1.write(file1.ino, 0, b"0123456789").unwrap();

    let folder2 = private_folder(&fs2, "user1,user2");
    let file2 = fs2.lookup(folder2, "f").unwrap();
    fs2.wait_for_notifications();
    recorder2.clear();

    let req = SetattrRequest {
        size: Some(4),
        ..Default::default()
    };
    fs1.setattr(file1.ino, &req).unwrap();
    fs2.wait_for_notifications();
    assert_eq!(recorder2.calls(), [Inval::Range(file2.ino, 4, -1)]);
}

#[test]
fn attr_only_changes_invalidate_attributes() {
    let (ops, kbpki) = collaborators("user1");
    let (fs1, _) = mount(&ops, &kbpki);
    let (fs2, recorder2) = mount(&ops, &kbpki);

    let folder1 = private_folder(&fs1, "user1,user2");
    let file1 = fs1.create(folder1, "f", 0o644).unwrap();
    let folder2 = private_folder(&fs2, "user1,user2");
    let file2 = fs2.lookup(folder2, "f").unwrap();
    fs2.wait_for_notifications();
    recorder2.clear();

    let req = SetattrRequest {
        mode: Some(0o755),
        ..Default::default()
    };
    fs1.setattr(file1.ino, &req).unwrap();
    fs2.wait_for_notifications();
    assert_eq!(recorder2.calls(), [Inval::Attr(file2.ino)]);
}
