//! Startup orchestration.
//!
//! Composes a configured operations layer with a mount and serves kernel
//! requests until the connection closes. Failures carry a structured
//! exit code so the process can distinguish init, mount, and serve
//! problems.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use fuser::MountOption;
use log::info;

use crate::fs::Config;
use crate::fs::KbfsFs;
use crate::info::write_info_file;
use crate::mounter::MountType;
use crate::mounter::Mounter;
use crate::notify::FuseNotifier;

/// Exit code for failures before any mount was attempted.
pub const EXIT_INIT_FAILURE: i32 = 1;
/// Exit code for mount failures.
pub const EXIT_MOUNT_FAILURE: i32 = 2;
/// Exit code for failures while serving.
pub const EXIT_SERVE_FAILURE: i32 = 3;

/// A startup or serve failure with its process exit code.
#[derive(Debug)]
pub struct StartError {
    code: i32,
    message: String,
}

impl StartError {
    fn new(code: i32, message: impl Into<String>) -> StartError {
        StartError {
            code,
            message: message.into(),
        }
    }

    /// The exit code the process should terminate with.
    pub fn code(&self) -> i32 {
        self.code
    }
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for StartError {}

/// How to bring the mount up.
#[derive(Debug)]
pub struct StartOptions {
    /// Where to mount.
    pub mount_point: PathBuf,
    /// Mount strategy.
    pub mount_type: MountType,
    /// Directory for the process info file, if any.
    pub runtime_dir: Option<PathBuf>,
    /// Label recorded in the process info file.
    pub label: Option<String>,
}

fn default_mount_options() -> Vec<MountOption> {
    vec![
        MountOption::FSName("kbfs".to_string()),
        // The kernel enforces the fixed mode scheme, keeping foreign
        // private folders unreadable without a round trip.
        MountOption::DefaultPermissions,
        MountOption::NoAtime,
    ]
}

/// Mount and serve until the kernel closes the connection.
/// # Errors
/// Returns a [`StartError`] carrying the appropriate exit code.
pub fn start(config: Arc<Config>, options: StartOptions) -> Result<(), StartError> {
    if let Some(dir) = &options.runtime_dir {
        let path = write_info_file(dir, options.label.as_deref()).map_err(|err| {
            StartError::new(
                EXIT_INIT_FAILURE,
                format!("writing process info file: {err}"),
            )
        })?;
        info!("wrote process info to {}", path.display());
    }

    let fs = KbfsFs::new(config);
    let mounter = Mounter::new(options.mount_type);
    let mut session = mounter
        .mount(fs.clone(), &options.mount_point, &default_mount_options())
        .map_err(|err| {
            StartError::new(
                EXIT_MOUNT_FAILURE,
                format!("mounting at {}: {err}", options.mount_point.display()),
            )
        })?;
    fs.set_notifier(Arc::new(FuseNotifier::new(session.notifier())));
    info!("KBFS mounted at {}", options.mount_point.display());

    let served = session.run();
    // Dropping the session unmounts; drain pending invalidations first.
    fs.wait_for_notifications();
    drop(session);
    served.map_err(|err| StartError::new(EXIT_SERVE_FAILURE, format!("serving: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_error_carries_code() {
        let err = StartError::new(EXIT_MOUNT_FAILURE, "mounting at /x: busy");
        assert_eq!(err.code(), EXIT_MOUNT_FAILURE);
        assert_eq!(err.to_string(), "mounting at /x: busy");
    }

    #[test]
    fn mount_options_pin_permissions() {
        assert!(default_mount_options().contains(&MountOption::DefaultPermissions));
    }
}
