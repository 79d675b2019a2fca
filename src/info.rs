//! The process info file.
//!
//! When a runtime directory is configured, `kbfs.info` records which
//! process is serving the mount so other tools can find (and health
//! check) it.

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use serde::Serialize;

/// Name of the info file inside the runtime directory.
pub const INFO_FILE_NAME: &str = "kbfs.info";

const BUILD_TAG: &str = match option_env!("KBFS_BUILD_TAG") {
    Some(tag) => tag,
    None => "dev",
};

/// What `kbfs.info` contains.
#[derive(Debug, Serialize)]
pub struct ProcessInfo {
    /// Serving process id.
    pub pid: u32,
    /// Operator-chosen label.
    pub label: String,
    /// Crate version.
    pub version: String,
    /// Build tag.
    pub build: String,
}

impl ProcessInfo {
    /// Info describing the current process.
    pub fn current(label: Option<&str>) -> ProcessInfo {
        ProcessInfo {
            pid: std::process::id(),
            label: label.unwrap_or_default().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            build: BUILD_TAG.to_string(),
        }
    }
}

/// Write `kbfs.info` under `runtime_dir`, creating the directory as
/// needed. Returns the path written.
/// # Errors
/// Returns any filesystem error encountered.
pub fn write_info_file(runtime_dir: &Path, label: Option<&str>) -> io::Result<PathBuf> {
    fs::create_dir_all(runtime_dir)?;
    let info = ProcessInfo::current(label);
    let mut data = serde_json::to_vec_pretty(&info).map_err(io::Error::other)?;
    data.push(b'\n');
    let path = runtime_dir.join(INFO_FILE_NAME);
    fs::write(&path, data)?;
    Ok(path)
}
