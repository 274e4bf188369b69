//! A volume driver using btrfs subvolumes.
//!
//! Each volume is a subvolume; child volumes and bundle root filesystems are
//! snapshots of their parent, so shared data is stored once. Disk limits are
//! btrfs qgroup limits applied by the quota helper.

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
};

use log::{debug, warn};

use super::{
    discard, incomplete_path, prune_incomplete_with, publish, Populate, Publish, QuotaHelper,
    VolumeDriver,
};
use crate::{
    digest::ChainId,
    error::{IoContext, Result, StoreError},
};

pub const DEFAULT_BTRFS_BIN: &str = "btrfs";

pub struct BtrfsDriver {
    volumes_dir: PathBuf,
    btrfs_bin: PathBuf,
    quota: Arc<dyn QuotaHelper>,
}

impl BtrfsDriver {
    pub fn new(volumes_dir: impl AsRef<Path>, quota: Arc<dyn QuotaHelper>) -> Self {
        Self::with_btrfs_bin(volumes_dir, DEFAULT_BTRFS_BIN, quota)
    }

    pub fn with_btrfs_bin(
        volumes_dir: impl AsRef<Path>,
        btrfs_bin: impl Into<PathBuf>,
        quota: Arc<dyn QuotaHelper>,
    ) -> Self {
        BtrfsDriver {
            volumes_dir: volumes_dir.as_ref().to_path_buf(),
            btrfs_bin: btrfs_bin.into(),
            quota,
        }
    }

    fn btrfs(&self, args: &[&OsStr]) -> Result<()> {
        let command = format!(
            "{} {}",
            self.btrfs_bin.display(),
            args.iter()
                .map(|arg| arg.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );
        debug!("running {command}");

        let output = Command::new(&self.btrfs_bin)
            .args(args)
            .output()
            .io_context(|| format!("running {command}"))?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(StoreError::Command {
                command,
                message: if stderr.is_empty() {
                    output.status.to_string()
                } else {
                    stderr
                },
            })
        }
    }

    fn create_subvolume(&self, path: &Path) -> Result<()> {
        self.btrfs(&[OsStr::new("subvolume"), OsStr::new("create"), path.as_os_str()])
    }

    fn snapshot_subvolume(&self, source: &Path, dest: &Path) -> Result<()> {
        self.btrfs(&[
            OsStr::new("subvolume"),
            OsStr::new("snapshot"),
            source.as_os_str(),
            dest.as_os_str(),
        ])
    }

    fn delete_subvolume(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        self.btrfs(&[OsStr::new("subvolume"), OsStr::new("delete"), path.as_os_str()])
    }
}

impl VolumeDriver for BtrfsDriver {
    fn volumes_dir(&self) -> &Path {
        &self.volumes_dir
    }

    fn create(
        &self,
        parent: Option<&ChainId>,
        id: &ChainId,
        populate: Populate<'_>,
    ) -> Result<PathBuf> {
        let target = self.volume_path(id);
        let incomplete = incomplete_path(&self.volumes_dir, id);

        match parent {
            Some(parent) => {
                let parent_path = self.volume_path(parent);
                if !parent_path.is_dir() {
                    return Err(StoreError::NotFound(format!("parent volume {parent}")));
                }
                self.snapshot_subvolume(&parent_path, &incomplete)?
            }
            None => self.create_subvolume(&incomplete)?,
        }

        match populate(&incomplete).and_then(|()| publish(&incomplete, &target)) {
            Ok(Publish::Published) => Ok(target),
            Ok(Publish::Lost) => {
                debug!("volume {id} was created concurrently, discarding ours");
                discard(&incomplete, |path| self.delete_subvolume(path));
                Ok(target)
            }
            Err(err) => {
                discard(&incomplete, |path| self.delete_subvolume(path));
                Err(err)
            }
        }
    }

    fn destroy(&self, id: &ChainId) -> Result<()> {
        debug!("destroying volume {id}");
        self.delete_subvolume(&self.volume_path(id))
    }

    fn snapshot(&self, id: &ChainId, dest: &Path) -> Result<()> {
        let source = self.volume_path(id);
        if !source.is_dir() {
            return Err(StoreError::NotFound(format!("volume {id}")));
        }
        self.snapshot_subvolume(&source, dest)
    }

    fn destroy_snapshot(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        // A stale qgroup only wastes accounting, the subvolume is what matters.
        if let Err(err) = self.quota.destroy(path) {
            warn!("failed to destroy qgroup of {}: {err}", path.display());
        }
        self.delete_subvolume(path)
    }

    fn apply_quota(&self, path: &Path, bytes: u64, exclusive: bool) -> Result<()> {
        self.quota.limit(path, bytes, exclusive)
    }

    fn prune_incomplete(&self) -> Result<usize> {
        prune_incomplete_with(&self.volumes_dir, |path| self.delete_subvolume(path))
    }
}
