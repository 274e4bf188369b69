//! Privileged btrfs quota group operations on behalf of layerstore.
//!
//! Installed setuid (or with CAP_SYS_ADMIN), it performs exactly one qgroup
//! operation per invocation and nothing else. Failures go to stderr, which
//! the store reports verbatim.

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
    process::Command as Process,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fn_error_context::context;
use log::debug;

/// layerstore-quota
#[derive(Debug, Parser)]
#[clap(name = "layerstore-quota", version)]
pub struct App {
    /// Path to the btrfs tool
    #[clap(long, env = "LAYERSTORE_BTRFS_BIN", default_value = "btrfs")]
    btrfs_bin: PathBuf,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Limits the disk usage of a volume
    Limit {
        #[clap(long)]
        volume_path: PathBuf,
        #[clap(long)]
        disk_limit_bytes: u64,
        /// Count only data not shared with other volumes
        #[clap(long)]
        exclusive: bool,
    },
    /// Destroys the quota group of a volume
    Destroy {
        #[clap(long)]
        volume_path: PathBuf,
    },
}

fn btrfs(bin: &Path, args: &[&OsStr]) -> Result<String> {
    debug!("running {} {args:?}", bin.display());
    let output = Process::new(bin)
        .args(args)
        .output()
        .with_context(|| format!("running {}", bin.display()))?;
    if !output.status.success() {
        bail!(
            "{} {}: {}",
            bin.display(),
            args.iter()
                .map(|arg| arg.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[context("Limiting {} to {bytes} bytes", volume_path.display())]
fn limit(bin: &Path, volume_path: &Path, bytes: u64, exclusive: bool) -> Result<()> {
    let bytes = bytes.to_string();
    let mut args = vec![OsStr::new("qgroup"), OsStr::new("limit")];
    if exclusive {
        args.push(OsStr::new("-e"));
    }
    args.push(OsStr::new(&bytes));
    args.push(volume_path.as_os_str());
    btrfs(bin, &args)?;
    Ok(())
}

#[context("Destroying quota group of {}", volume_path.display())]
fn destroy(bin: &Path, volume_path: &Path) -> Result<()> {
    let root_id = btrfs(
        bin,
        &[
            OsStr::new("inspect-internal"),
            OsStr::new("rootid"),
            volume_path.as_os_str(),
        ],
    )?;
    let root_id: u64 = root_id
        .parse()
        .with_context(|| format!("parsing subvolume id {root_id:?}"))?;
    let qgroup = format!("0/{root_id}");
    btrfs(
        bin,
        &[
            OsStr::new("qgroup"),
            OsStr::new("destroy"),
            OsStr::new(&qgroup),
            volume_path.as_os_str(),
        ],
    )?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();
    match args.cmd {
        Command::Limit {
            ref volume_path,
            disk_limit_bytes,
            exclusive,
        } => limit(&args.btrfs_bin, volume_path, disk_limit_bytes, exclusive),
        Command::Destroy { ref volume_path } => destroy(&args.btrfs_bin, volume_path),
    }
}
