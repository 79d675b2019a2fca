//! Command-line entry point: configure an operations layer, mount, serve.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use clap::ValueEnum;
use log::error;
use log::warn;

use kbfsfuse::Config;
use kbfsfuse::memfs::LocalKbpki;
use kbfsfuse::memfs::MemFs;
use kbfsfuse::mounter::MountType;
use kbfsfuse::run;
use kbfsfuse::run::EXIT_INIT_FAILURE;
use kbfsfuse::run::StartOptions;

/// Test users the local identity provider always knows.
const LOCAL_USERS: [&str; 3] = ["strib", "max", "chris"];

#[derive(Parser)]
#[command(name = "kbfsfuse", version, about = "Mount the Keybase filesystem (KBFS)")]
struct Args {
    /// Print debug logging.
    #[arg(long)]
    debug: bool,

    /// Write a CPU profile to this file (accepted for compatibility).
    #[arg(long, value_name = "FILE")]
    cpuprofile: Option<PathBuf>,

    /// Remote block server address (not supported by this build).
    #[arg(long, value_name = "ADDR")]
    bserver: Option<String>,

    /// Remote metadata server address (not supported by this build).
    #[arg(long, value_name = "ADDR")]
    mdserver: Option<String>,

    /// Keep all metadata and blocks in memory.
    #[arg(long)]
    server_in_memory: bool,

    /// Root directory for local server data.
    #[arg(long, value_name = "DIR")]
    server_root: Option<PathBuf>,

    /// Log in as this local test user.
    #[arg(long, value_name = "USER", default_value = "strib")]
    localuser: String,

    /// Directory for the process info file.
    #[arg(long, value_name = "DIR")]
    runtime_dir: Option<PathBuf>,

    /// Label recorded in the process info file.
    #[arg(long)]
    label: Option<String>,

    /// Mount strategy.
    #[arg(long, value_enum, default_value_t = MountTypeArg::Default)]
    mount_type: MountTypeArg,

    /// Where to mount the filesystem.
    mount_point: PathBuf,
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum MountTypeArg {
    #[default]
    Default,
    Force,
}

impl From<MountTypeArg> for MountType {
    fn from(arg: MountTypeArg) -> MountType {
        match arg {
            MountTypeArg::Default => MountType::Default,
            MountTypeArg::Force => MountType::Force,
        }
    }
}

fn main() {
    let args = Args::parse();
    env_logger::Builder::from_default_env()
        .filter_level(if args.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    if args.bserver.is_some() || args.mdserver.is_some() {
        eprintln!("kbfsfuse: remote servers are not supported by this build; use --server-in-memory");
        process::exit(EXIT_INIT_FAILURE);
    }
    if args.cpuprofile.is_some() {
        warn!("--cpuprofile is not supported by this build; ignoring");
    }
    if let Some(root) = &args.server_root {
        warn!(
            "--server-root {} given, but this build keeps data in memory; nothing is persisted",
            root.display()
        );
    }
    if !args.server_in_memory && args.server_root.is_none() {
        warn!("no server configured; defaulting to in-memory storage");
    }

    let mut users: Vec<String> = LOCAL_USERS.iter().map(|u| u.to_string()).collect();
    if !users.contains(&args.localuser) {
        users.push(args.localuser.clone());
    }
    let kbpki = Arc::new(LocalKbpki::new(users, Some(args.localuser.clone())));
    let ops = Arc::new(MemFs::new(kbpki.clone()));
    let config = Arc::new(Config::new(ops, kbpki));

    let options = StartOptions {
        mount_point: args.mount_point,
        mount_type: args.mount_type.into(),
        runtime_dir: args.runtime_dir,
        label: args.label,
    };
    if let Err(err) = run::start(config, options) {
        error!("{err}");
        eprintln!("kbfsfuse: {err}");
        process::exit(err.code());
    }
}
