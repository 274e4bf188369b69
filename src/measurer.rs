//! Disk usage of the store, for threshold comparisons.
//!
//! Measurement takes no locks. Concurrent creation or collection can make
//! the result stale, which is fine for deciding whether to clean.

use std::path::{Path, PathBuf};

use log::debug;

use crate::{error::Result, volume::disk_usage};

#[derive(Debug, Clone)]
pub struct StoreMeasurer {
    volumes_dir: PathBuf,
    images_dir: PathBuf,
    cache_dir: PathBuf,
}

impl StoreMeasurer {
    pub fn new(
        volumes_dir: impl AsRef<Path>,
        images_dir: impl AsRef<Path>,
        cache_dir: impl AsRef<Path>,
    ) -> Self {
        StoreMeasurer {
            volumes_dir: volumes_dir.as_ref().to_path_buf(),
            images_dir: images_dir.as_ref().to_path_buf(),
            cache_dir: cache_dir.as_ref().to_path_buf(),
        }
    }

    /// Bytes used by layer volumes, bundles and cached blobs together.
    pub fn measure_store(&self) -> Result<u64> {
        let volumes = disk_usage(&self.volumes_dir)?;
        let images = disk_usage(&self.images_dir)?;
        let cache = self.measure_cache()?;
        debug!("store usage: volumes {volumes}, images {images}, cache {cache}");
        Ok(volumes + images + cache)
    }

    /// Bytes used by cached blobs.
    pub fn measure_cache(&self) -> Result<u64> {
        disk_usage(&self.cache_dir)
    }
}
