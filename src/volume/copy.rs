//! A volume driver using plain directories.
//!
//! Child volumes and snapshots are full copies of their parent. This works on
//! any filesystem and needs no privileges, at the cost of disk space.

use std::{
    fs,
    os::unix::fs::{lchown, MetadataExt, PermissionsExt},
    path::{Path, PathBuf},
    sync::Arc,
};

use log::debug;
use rustix::{
    fs::{mknodat, FileType, Mode, CWD},
    process::geteuid,
};

use super::{
    discard, incomplete_path, prune_incomplete_with, publish, remove_tree, Populate, Publish,
    QuotaHelper, VolumeDriver,
};
use crate::{
    digest::ChainId,
    error::{IoContext, Result, StoreError},
};

pub struct CopyDriver {
    volumes_dir: PathBuf,
    quota: Arc<dyn QuotaHelper>,
}

impl CopyDriver {
    pub fn new(volumes_dir: impl AsRef<Path>, quota: Arc<dyn QuotaHelper>) -> Self {
        CopyDriver {
            volumes_dir: volumes_dir.as_ref().to_path_buf(),
            quota,
        }
    }
}

impl VolumeDriver for CopyDriver {
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

        let result = match parent {
            Some(parent) => {
                let parent_path = self.volume_path(parent);
                if !parent_path.is_dir() {
                    return Err(StoreError::NotFound(format!("parent volume {parent}")));
                }
                copy_tree(&parent_path, &incomplete)
            }
            None => fs::create_dir(&incomplete)
                .io_context(|| format!("creating volume {}", incomplete.display())),
        }
        .and_then(|()| populate(&incomplete))
        .and_then(|()| publish(&incomplete, &target));

        match result {
            Ok(Publish::Published) => {
                debug!("created volume {}", target.display());
                Ok(target)
            }
            Ok(Publish::Lost) => {
                debug!("volume {id} was created concurrently, discarding ours");
                discard(&incomplete, remove_tree);
                Ok(target)
            }
            Err(err) => {
                discard(&incomplete, remove_tree);
                Err(err)
            }
        }
    }

    fn destroy(&self, id: &ChainId) -> Result<()> {
        debug!("destroying volume {id}");
        remove_tree(&self.volume_path(id))
    }

    fn snapshot(&self, id: &ChainId, dest: &Path) -> Result<()> {
        let source = self.volume_path(id);
        if !source.is_dir() {
            return Err(StoreError::NotFound(format!("volume {id}")));
        }
        copy_tree(&source, dest).inspect_err(|_| discard(dest, remove_tree))
    }

    fn destroy_snapshot(&self, path: &Path) -> Result<()> {
        remove_tree(path)
    }

    fn apply_quota(&self, path: &Path, bytes: u64, exclusive: bool) -> Result<()> {
        self.quota.limit(path, bytes, exclusive)
    }

    fn prune_incomplete(&self) -> Result<usize> {
        prune_incomplete_with(&self.volumes_dir, remove_tree)
    }
}

/// Recursively copy `source` to `dest`, which must not exist yet.
///
/// Modes, symlinks and special files are preserved; ownership too when
/// running as root.
pub(crate) fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    let privileged = geteuid().is_root();
    copy_entry(source, dest, privileged)
}

fn copy_entry(source: &Path, dest: &Path, privileged: bool) -> Result<()> {
    let metadata = fs::symlink_metadata(source)
        .io_context(|| format!("reading {}", source.display()))?;
    let file_type = metadata.file_type();
    let context = || format!("copying {} to {}", source.display(), dest.display());

    if file_type.is_dir() {
        fs::create_dir(dest).io_context(context)?;
        for entry in fs::read_dir(source).io_context(context)? {
            let entry = entry.io_context(context)?;
            copy_entry(&entry.path(), &dest.join(entry.file_name()), privileged)?;
        }
    } else if file_type.is_symlink() {
        let target = fs::read_link(source).io_context(context)?;
        std::os::unix::fs::symlink(target, dest).io_context(context)?;
    } else if file_type.is_file() {
        fs::copy(source, dest).io_context(context)?;
    } else if privileged {
        let mode = metadata.mode();
        mknodat(
            CWD,
            dest,
            FileType::from_raw_mode(mode),
            Mode::from_raw_mode(mode & 0o7777),
            metadata.rdev(),
        )
        .io_context(context)?;
    } else {
        debug!("skipping special file {} without privileges", source.display());
        return Ok(());
    }

    if privileged {
        lchown(dest, Some(metadata.uid()), Some(metadata.gid())).io_context(context)?;
    }
    if !file_type.is_symlink() {
        // After the contents, so read-only directories can still be filled.
        fs::set_permissions(dest, fs::Permissions::from_mode(metadata.mode() & 0o7777))
            .io_context(context)?;
    }
    Ok(())
}
