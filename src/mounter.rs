//! Mount and unmount strategies.
//!
//! The default strategy mounts once and unmounts with the platform's
//! standard call. The force strategy retries a failed mount after an
//! unmount, and escalates a failed unmount to the platform's forced
//! variant: a lazy detach on Linux, `diskutil unmount force` on Darwin.

use std::io;
use std::path::Path;
use std::process::Command;
use std::process::Stdio;

use fuser::Filesystem;
use fuser::MountOption;
use fuser::Session;
use log::debug;
use log::warn;

/// Which strategy to mount with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MountType {
    /// Mount once; standard unmount.
    #[default]
    Default,
    /// Retry a failed mount after forcing an unmount.
    Force,
}

/// Platform mount/unmount front end.
#[derive(Clone, Copy, Debug)]
pub struct Mounter {
    mount_type: MountType,
}

impl Mounter {
    /// A mounter using the given strategy.
    pub fn new(mount_type: MountType) -> Mounter {
        Mounter { mount_type }
    }

    /// Mount `fs` at `mountpoint`. Under the force strategy a failed
    /// mount is retried once after unmounting whatever is in the way.
    /// # Errors
    /// Returns the mount error when mounting (and any retry) fails.
    pub fn mount<FS>(
        &self,
        fs: FS,
        mountpoint: &Path,
        options: &[MountOption],
    ) -> io::Result<Session<FS>>
    where
        FS: Filesystem + Clone,
    {
        match Session::new(fs.clone(), mountpoint, options) {
            Ok(session) => Ok(session),
            Err(err) => match self.mount_type {
                MountType::Default => Err(err),
                MountType::Force => {
                    warn!(
                        "mount of {} failed ({err}); unmounting and retrying",
                        mountpoint.display()
                    );
                    if let Err(unmount_err) = self.unmount(mountpoint) {
                        debug!(
                            "pre-retry unmount of {} failed: {unmount_err}",
                            mountpoint.display()
                        );
                    }
                    Session::new(fs, mountpoint, options)
                }
            },
        }
    }

    /// Unmount `mountpoint`, escalating to the forced variant under the
    /// force strategy.
    /// # Errors
    /// Returns the unmount error once every applicable variant failed.
    pub fn unmount(&self, mountpoint: &Path) -> io::Result<()> {
        match standard_unmount(mountpoint) {
            Ok(()) => Ok(()),
            Err(err) => match self.mount_type {
                MountType::Default => Err(err),
                MountType::Force => {
                    warn!(
                        "unmount of {} failed ({err}); forcing",
                        mountpoint.display()
                    );
                    force_unmount(mountpoint)
                }
            },
        }
    }
}

#[cfg(target_os = "linux")]
fn standard_unmount(mountpoint: &Path) -> io::Result<()> {
    run_unmount_command("fusermount", &["-u", "--"], mountpoint)
        .or_else(|_| run_unmount_command("fusermount3", &["-u", "--"], mountpoint))
}

#[cfg(target_os = "macos")]
fn standard_unmount(mountpoint: &Path) -> io::Result<()> {
    nix::mount::unmount(mountpoint, nix::mount::MntFlags::empty())?;
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn standard_unmount(_mountpoint: &Path) -> io::Result<()> {
    Err(io::Error::other("unmount is not supported on this platform"))
}

#[cfg(target_os = "linux")]
fn force_unmount(mountpoint: &Path) -> io::Result<()> {
    // A lazy detach gets the name out of the namespace even while busy.
    match nix::mount::umount2(mountpoint, nix::mount::MntFlags::MNT_DETACH) {
        Ok(()) => Ok(()),
        // Unprivileged processes fall back to the setuid helper.
        Err(nix::errno::Errno::EPERM) => {
            run_unmount_command("fusermount", &["-u", "-z", "--"], mountpoint)
                .or_else(|_| run_unmount_command("fusermount3", &["-u", "-z", "--"], mountpoint))
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(target_os = "macos")]
fn force_unmount(mountpoint: &Path) -> io::Result<()> {
    run_unmount_command("/usr/sbin/diskutil", &["unmount", "force"], mountpoint)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn force_unmount(_mountpoint: &Path) -> io::Result<()> {
    Err(io::Error::other(
        "forced unmount is not supported on this platform",
    ))
}

#[allow(dead_code)]
fn run_unmount_command(program: &str, args: &[&str], mountpoint: &Path) -> io::Result<()> {
    let output = Command::new(program)
        .args(args)
        .arg(mountpoint)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()?;
    debug!(
        "{program} stdout on {}: {}",
        mountpoint.display(),
        String::from_utf8_lossy(&output.stdout)
    );
    debug!(
        "{program} stderr on {}: {}",
        mountpoint.display(),
        String::from_utf8_lossy(&output.stderr)
    );
    if output.status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}
