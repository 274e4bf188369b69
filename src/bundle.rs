//! Bundles: the caller-named root filesystems handed out by `create`.
//!
//! ```text
//! images/<id>/
//! ├── rootfs/        writable snapshot of the top layer volume
//! └── image.json     what the bundle was built from
//! ```

use std::{
    fs,
    io::{self, Write},
    os::unix::fs::{lchown, MetadataExt},
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{debug, info, warn};
use rustix::process::geteuid;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::{
    digest::ChainId,
    error::{IoContext, NotFoundFilter, Result, StoreError},
    puller::BaseImage,
    volume::{remove_tree, VolumeDriver},
};

const ROOTFS: &str = "rootfs";
const IMAGE_JSON: &str = "image.json";

/// Check that `id` is usable as a bundle directory and lock name.
pub fn validate_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.');
    if valid {
        Ok(())
    } else {
        Err(StoreError::invalid_input(format!(
            "invalid image id `{id}`: use letters, digits, `.`, `_` and `-`"
        )))
    }
}

/// A bundle, as recorded in its `image.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub id: String,
    pub path: PathBuf,
    pub rootfs: PathBuf,
    pub base_image: String,
    /// The ID mappings the base image was unpacked through, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub chain_ids: Vec<ChainId>,
    pub base_image_size: u64,
    /// Zero when unlimited.
    pub disk_limit: u64,
    /// Whether the limit covers only data written to the bundle.
    pub exclusive_limit: bool,
}

/// How to build a bundle.
#[derive(Debug, Clone)]
pub struct BundleSpec<'a> {
    pub id: &'a str,
    pub base_image: &'a BaseImage,
    pub disk_limit: u64,
    pub exclude_base_image_from_quota: bool,
}

pub struct Bundler {
    images_dir: PathBuf,
    driver: Arc<dyn VolumeDriver>,
}

impl Bundler {
    pub fn new(images_dir: impl AsRef<Path>, driver: Arc<dyn VolumeDriver>) -> Self {
        Bundler {
            images_dir: images_dir.as_ref().to_path_buf(),
            driver,
        }
    }

    fn bundle_path(&self, id: &str) -> PathBuf {
        self.images_dir.join(id)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.bundle_path(id).is_dir()
    }

    /// Build `images/<id>`. Any failure removes whatever was built.
    pub fn create(&self, spec: &BundleSpec<'_>) -> Result<Bundle> {
        validate_id(spec.id)?;
        let Some(top) = spec.base_image.top() else {
            return Err(StoreError::invalid_input(format!(
                "base image `{}` has no layers",
                spec.base_image.reference
            )));
        };

        let path = self.bundle_path(spec.id);
        match fs::create_dir(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StoreError::AlreadyExists(format!(
                    "image for id `{}`",
                    spec.id
                )))
            }
            Err(err) => {
                return Err(err).io_context(|| format!("creating {}", path.display()));
            }
        }

        let bundle = Bundle {
            id: spec.id.to_string(),
            rootfs: path.join(ROOTFS),
            path,
            base_image: spec.base_image.reference.clone(),
            namespace: spec.base_image.namespace.clone(),
            chain_ids: spec.base_image.chain_ids.clone(),
            base_image_size: spec.base_image.base_image_size,
            disk_limit: spec.disk_limit,
            exclusive_limit: spec.exclude_base_image_from_quota,
        };

        match self.populate(&bundle, top) {
            Ok(()) => {
                info!("created image {} at {}", bundle.id, bundle.rootfs.display());
                Ok(bundle)
            }
            Err(err) => {
                self.remove(&bundle.path);
                Err(err)
            }
        }
    }

    fn populate(&self, bundle: &Bundle, top: &ChainId) -> Result<()> {
        self.driver.snapshot(top, &bundle.rootfs)?;
        self.match_root_owner(top, &bundle.rootfs)?;
        if bundle.disk_limit > 0 {
            debug!(
                "limiting {} to {} bytes (exclusive: {})",
                bundle.id, bundle.disk_limit, bundle.exclusive_limit
            );
            self.driver
                .apply_quota(&bundle.rootfs, bundle.disk_limit, bundle.exclusive_limit)?;
        }
        write_image_json(bundle)
    }

    /// Give `rootfs` the owner of the volume root it was snapshotted from, so
    /// the container's `/` belongs to its namespace root.
    fn match_root_owner(&self, top: &ChainId, rootfs: &Path) -> Result<()> {
        if !geteuid().is_root() {
            return Ok(());
        }
        let volume = self.driver.volume_path(top);
        let source = fs::symlink_metadata(&volume)
            .io_context(|| format!("inspecting {}", volume.display()))?;
        let target = fs::symlink_metadata(rootfs)
            .io_context(|| format!("inspecting {}", rootfs.display()))?;
        if (source.uid(), source.gid()) != (target.uid(), target.gid()) {
            debug!(
                "rootfs {} owned by {}:{}",
                rootfs.display(),
                source.uid(),
                source.gid()
            );
            lchown(rootfs, Some(source.uid()), Some(source.gid()))
                .io_context(|| format!("changing owner of {}", rootfs.display()))?;
        }
        Ok(())
    }

    /// Best-effort removal after a failed creation.
    fn remove(&self, path: &Path) {
        let rootfs = path.join(ROOTFS);
        if rootfs.exists() {
            if let Err(err) = self.driver.destroy_snapshot(&rootfs) {
                warn!("removing {}: {err}", rootfs.display());
            }
        }
        if let Err(err) = remove_tree(path) {
            warn!("removing {}: {err}", path.display());
        }
    }

    /// Remove the bundle `id`.
    pub fn destroy(&self, id: &str) -> Result<()> {
        validate_id(id)?;
        let path = self.bundle_path(id);
        if !path.is_dir() {
            return Err(StoreError::NotFound(format!("image path for id `{id}`")));
        }

        let rootfs = path.join(ROOTFS);
        if rootfs.exists() {
            self.driver.destroy_snapshot(&rootfs)?;
        } else {
            debug!("{} has no rootfs", path.display());
        }
        remove_tree(&path)?;
        info!("destroyed image {id}");
        Ok(())
    }

    /// Read back the bundle `id`.
    pub fn load(&self, id: &str) -> Result<Bundle> {
        validate_id(id)?;
        let path = self.bundle_path(id).join(IMAGE_JSON);
        let Some(data) = fs::read(&path)
            .filter_not_found()
            .io_context(|| format!("reading {}", path.display()))?
        else {
            return Err(StoreError::NotFound(format!("image for id `{id}`")));
        };
        serde_json::from_slice(&data).map_err(|source| StoreError::Metadata {
            path: path.display().to_string(),
            source,
        })
    }

    /// Ids of every bundle.
    pub fn ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let entries = fs::read_dir(&self.images_dir)
            .io_context(|| format!("listing {}", self.images_dir.display()))?;
        for entry in entries {
            let entry = entry.io_context(|| format!("listing {}", self.images_dir.display()))?;
            if let Some(id) = entry.file_name().to_str() {
                if validate_id(id).is_ok() {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

fn write_image_json(bundle: &Bundle) -> Result<()> {
    let path = bundle.path.join(IMAGE_JSON);
    let data = serde_json::to_vec_pretty(bundle).map_err(|source| StoreError::Metadata {
        path: path.display().to_string(),
        source,
    })?;
    let mut tmp = NamedTempFile::new_in(&bundle.path)
        .io_context(|| format!("writing {}", path.display()))?;
    tmp.write_all(&data)
        .io_context(|| format!("writing {}", path.display()))?;
    tmp.persist(&path)
        .map_err(|err| err.error)
        .io_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
