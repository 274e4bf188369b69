//! Immutable layer volumes and the drivers that materialize them.
//!
//! Every distinct ChainID gets exactly one volume under `volumes/<chain-hex>`.
//! A volume is built in a hidden `volumes/.incomplete-<hex>-<random>`
//! directory and renamed into place only once it is complete, so a reader
//! never observes a half-unpacked layer and a killed process leaves at most a
//! hidden directory that [`VolumeDriver::prune_incomplete`] removes later.
//!
//! Bundles get a writable snapshot of their top volume, on which a disk quota
//! can be applied through a [`QuotaHelper`].

use std::{
    collections::HashSet,
    fs,
    io::{self, Write},
    os::unix::fs::{MetadataExt, PermissionsExt},
    path::{Path, PathBuf},
};

use log::{debug, warn};
use rand::{distr::Alphanumeric, Rng};
use rustix::{
    fs::{renameat_with, RenameFlags, CWD},
    io::Errno,
};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::{
    digest::ChainId,
    error::{IoContext, NotFoundFilter, Result, StoreError},
};

pub mod btrfs;
pub mod copy;
pub mod quota;

pub use btrfs::BtrfsDriver;
pub use copy::CopyDriver;
pub use quota::{ProcessQuotaHelper, QuotaHelper};

const INCOMPLETE_PREFIX: &str = ".incomplete-";

/// Fills a freshly created volume. Called with the hidden, incomplete path.
pub type Populate<'a> = &'a mut dyn FnMut(&Path) -> Result<()>;

/// A copy-on-write volume backend.
pub trait VolumeDriver: Send + Sync {
    /// The directory holding the volumes.
    fn volumes_dir(&self) -> &Path;

    /// Create the volume `id` as a copy of `parent` (empty when `None`), let
    /// `populate` write into it, and publish it atomically.
    ///
    /// When another creator publishes the same volume first, our copy is
    /// discarded and the existing volume is returned. Any failure discards the
    /// partial volume.
    fn create(
        &self,
        parent: Option<&ChainId>,
        id: &ChainId,
        populate: Populate<'_>,
    ) -> Result<PathBuf>;

    /// Destroy a volume. Destroying a missing volume succeeds.
    fn destroy(&self, id: &ChainId) -> Result<()>;

    /// Create a writable copy of volume `id` at `dest`.
    fn snapshot(&self, id: &ChainId, dest: &Path) -> Result<()>;

    /// Remove a snapshot made by [`snapshot`](Self::snapshot).
    fn destroy_snapshot(&self, path: &Path) -> Result<()>;

    /// Limit the disk usage of the snapshot at `path`.
    ///
    /// An exclusive limit counts only data written to the snapshot; an
    /// inclusive one also counts the data it shares with its volume.
    fn apply_quota(&self, path: &Path, bytes: u64, exclusive: bool) -> Result<()>;

    /// Remove hidden volumes left behind by interrupted creations.
    fn prune_incomplete(&self) -> Result<usize>;

    fn volume_path(&self, id: &ChainId) -> PathBuf {
        self.volumes_dir().join(id.hex())
    }

    fn exists(&self, id: &ChainId) -> bool {
        self.volume_path(id).is_dir()
    }

    /// Disk usage of a volume in bytes.
    fn measure(&self, id: &ChainId) -> Result<u64> {
        let path = self.volume_path(id);
        if !path.is_dir() {
            return Err(StoreError::NotFound(format!("volume {id}")));
        }
        disk_usage(&path)
    }

    /// Every published volume.
    fn volumes(&self) -> Result<Vec<ChainId>> {
        list_volumes(self.volumes_dir())
    }
}

/// What a volume was built from. Stored beside the volume as
/// `meta/volume-<hex>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMeta {
    pub blob_digest: String,
    pub size: u64,
    /// The ID mappings the layer was unpacked through, see
    /// [`IdMapper::namespace`](crate::idmap::IdMapper::namespace).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl VolumeMeta {
    fn path(meta_dir: &Path, id: &ChainId) -> PathBuf {
        meta_dir.join(format!("volume-{}.json", id.hex()))
    }

    pub fn write(&self, meta_dir: &Path, id: &ChainId) -> Result<()> {
        let path = Self::path(meta_dir, id);
        let data = serde_json::to_vec(self).map_err(|source| StoreError::Metadata {
            path: path.display().to_string(),
            source,
        })?;
        let mut tmp = NamedTempFile::new_in(meta_dir)
            .io_context(|| format!("creating volume metadata for {id}"))?;
        tmp.write_all(&data)
            .io_context(|| format!("writing volume metadata for {id}"))?;
        tmp.persist(&path)
            .map_err(|err| err.error)
            .io_context(|| format!("persisting volume metadata {}", path.display()))?;
        Ok(())
    }

    pub fn read(meta_dir: &Path, id: &ChainId) -> Result<Option<VolumeMeta>> {
        let path = Self::path(meta_dir, id);
        let Some(data) = fs::read(&path)
            .filter_not_found()
            .io_context(|| format!("reading volume metadata {}", path.display()))?
        else {
            return Ok(None);
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|source| StoreError::Metadata {
                path: path.display().to_string(),
                source,
            })
    }

    pub fn remove(meta_dir: &Path, id: &ChainId) -> Result<()> {
        let path = Self::path(meta_dir, id);
        fs::remove_file(&path)
            .filter_not_found()
            .io_context(|| format!("removing volume metadata {}", path.display()))?;
        Ok(())
    }
}

pub(crate) fn generate_tmpname(prefix: &str) -> String {
    let rand_string: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    format!("{prefix}{rand_string}")
}

pub(crate) fn incomplete_path(volumes_dir: &Path, id: &ChainId) -> PathBuf {
    volumes_dir.join(generate_tmpname(&format!("{INCOMPLETE_PREFIX}{}-", id.hex())))
}

/// Whether the volume was published by us or by a racing creator.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Publish {
    Published,
    Lost,
}

/// Rename `incomplete` to `target` unless `target` already exists.
pub(crate) fn publish(incomplete: &Path, target: &Path) -> Result<Publish> {
    let context = || format!("publishing volume {}", target.display());
    match renameat_with(CWD, incomplete, CWD, target, RenameFlags::NOREPLACE) {
        Ok(()) => Ok(Publish::Published),
        Err(Errno::EXIST) | Err(Errno::NOTEMPTY) => Ok(Publish::Lost),
        // Not every filesystem supports RENAME_NOREPLACE.
        Err(Errno::INVAL) | Err(Errno::NOSYS) => {
            if target.exists() {
                return Ok(Publish::Lost);
            }
            match fs::rename(incomplete, target) {
                Ok(()) => Ok(Publish::Published),
                Err(err)
                    if matches!(
                        Errno::from_io_error(&err),
                        Some(Errno::EXIST | Errno::NOTEMPTY)
                    ) =>
                {
                    Ok(Publish::Lost)
                }
                Err(err) => Err(err).io_context(context),
            }
        }
        Err(errno) => Err(errno).io_context(context),
    }
}

/// List published volumes in `volumes_dir`. Hidden entries are skipped.
pub(crate) fn list_volumes(volumes_dir: &Path) -> Result<Vec<ChainId>> {
    let mut volumes = Vec::new();
    let entries = fs::read_dir(volumes_dir)
        .io_context(|| format!("listing {}", volumes_dir.display()))?;
    for entry in entries {
        let entry = entry.io_context(|| format!("listing {}", volumes_dir.display()))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        match ChainId::parse(name) {
            Ok(id) => volumes.push(id),
            Err(_) => debug!("ignoring stray entry {name} in volumes"),
        }
    }
    volumes.sort();
    Ok(volumes)
}

/// Remove every incomplete volume under `volumes_dir` with `remove`.
pub(crate) fn prune_incomplete_with(
    volumes_dir: &Path,
    remove: impl Fn(&Path) -> Result<()>,
) -> Result<usize> {
    let mut pruned = 0;
    let entries = fs::read_dir(volumes_dir)
        .io_context(|| format!("listing {}", volumes_dir.display()))?;
    for entry in entries {
        let entry = entry.io_context(|| format!("listing {}", volumes_dir.display()))?;
        if !entry.file_name().to_string_lossy().starts_with(INCOMPLETE_PREFIX) {
            continue;
        }
        let path = entry.path();
        debug!("pruning incomplete volume {}", path.display());
        remove(&path)?;
        pruned += 1;
    }
    Ok(pruned)
}

/// Remove a directory tree, making read-only directories writable first if
/// that is what stands in the way.
pub(crate) fn remove_tree(path: &Path) -> Result<()> {
    let context = || format!("removing {}", path.display());
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
            debug!("{}: making directories writable before removal", path.display());
            make_dirs_writable(path).io_context(context)?;
            fs::remove_dir_all(path)
                .filter_not_found()
                .io_context(context)?;
            Ok(())
        }
        Err(err) => Err(err).io_context(context),
    }
}

fn make_dirs_writable(root: &Path) -> io::Result<()> {
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Some(metadata) = fs::symlink_metadata(&dir).filter_not_found()? else {
            continue;
        };
        if !metadata.is_dir() {
            continue;
        }
        let mode = metadata.permissions().mode();
        if mode & 0o700 != 0o700 {
            fs::set_permissions(&dir, fs::Permissions::from_mode(mode | 0o700))?;
        }
        let Some(entries) = fs::read_dir(&dir).filter_not_found()? else {
            continue;
        };
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                pending.push(entry.path());
            }
        }
    }
    Ok(())
}

/// Disk usage of everything under `root`, counted in allocated blocks.
///
/// Files removed while the walk is in progress are skipped; hard links are
/// counted once.
pub fn disk_usage(root: &Path) -> Result<u64> {
    let mut total = 0;
    let mut seen = HashSet::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(path) = pending.pop() {
        let Some(metadata) = fs::symlink_metadata(&path)
            .filter_not_found()
            .io_context(|| format!("measuring {}", path.display()))?
        else {
            continue;
        };
        if metadata.nlink() > 1
            && !metadata.is_dir()
            && !seen.insert((metadata.dev(), metadata.ino()))
        {
            continue;
        }
        total += metadata.blocks() * 512;

        if metadata.is_dir() {
            let Some(entries) = fs::read_dir(&path)
                .filter_not_found()
                .io_context(|| format!("measuring {}", path.display()))?
            else {
                continue;
            };
            for entry in entries {
                match entry {
                    Ok(entry) => pending.push(entry.path()),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                    Err(err) => {
                        return Err(err).io_context(|| format!("measuring {}", path.display()))
                    }
                }
            }
        }
    }
    Ok(total)
}

/// Log and swallow a failure to clean up after an earlier error.
pub(crate) fn discard(path: &Path, remove: impl FnOnce(&Path) -> Result<()>) {
    if let Err(err) = remove(path) {
        warn!("failed to discard {}: {err}", path.display());
    }
}
