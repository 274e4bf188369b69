//! Turning a base image reference into a chain of layer volumes.
//!
//! Layers are processed base first. Each layer's volume is named by its
//! ChainID, so a layer already present from an earlier pull (of this or any
//! image sharing the same prefix) is reused without fetching anything.
//! Pulls through user namespace ID mappings use the namespaced form of the
//! ChainID instead, and only share volumes with pulls through the same
//! mappings. Creation of each volume happens under its lock; two pullers
//! racing for the same layer end up with one of them unpacking it and the
//! other reusing the result.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{debug, info, warn};

use crate::{
    digest::ChainId,
    error::{Result, StoreError},
    fetcher::{Fetcher, LayerDescriptor},
    idmap::IdMapper,
    locksmith::{chain_lock_key, LockGuard, Locksmith},
    metrics::{MetricsEmitter, Timer, UNPACK_TIME},
    unpack::Unpacker,
    volume::{VolumeDriver, VolumeMeta},
};

/// What to pull.
#[derive(Debug, Clone)]
pub struct BaseImageSpec {
    pub reference: String,
    /// Ownership translation applied to every unpacked file.
    pub mapper: IdMapper,
}

/// A pulled base image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseImage {
    pub reference: String,
    /// The ID mappings its volumes were unpacked through, if any.
    pub namespace: Option<String>,
    /// Volume IDs of every layer, base first.
    pub chain_ids: Vec<ChainId>,
    /// Sum of the uncompressed sizes of the layers.
    pub base_image_size: u64,
}

impl BaseImage {
    /// The ChainID of the top layer.
    pub fn top(&self) -> Option<&ChainId> {
        self.chain_ids.last()
    }
}

pub struct BaseImagePuller {
    fetcher: Arc<dyn Fetcher>,
    driver: Arc<dyn VolumeDriver>,
    locksmith: Arc<dyn Locksmith>,
    metrics: Arc<dyn MetricsEmitter>,
    meta_dir: PathBuf,
}

impl BaseImagePuller {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        driver: Arc<dyn VolumeDriver>,
        locksmith: Arc<dyn Locksmith>,
        metrics: Arc<dyn MetricsEmitter>,
        meta_dir: impl Into<PathBuf>,
    ) -> Self {
        BaseImagePuller {
            fetcher,
            driver,
            locksmith,
            metrics,
            meta_dir: meta_dir.into(),
        }
    }

    /// Make sure every layer of `spec.reference` has a volume.
    pub fn pull(&self, spec: &BaseImageSpec) -> Result<BaseImage> {
        info!("pulling {}", spec.reference);
        let result = self.pull_layers(spec);
        if let Err(err) = self.fetcher.close(&spec.reference) {
            warn!("closing {}: {err}", spec.reference);
        }
        result
    }

    fn pull_layers(&self, spec: &BaseImageSpec) -> Result<BaseImage> {
        let info = self.fetcher.base_image_info(&spec.reference)?;
        if info.layers.is_empty() {
            return Err(StoreError::invalid_input(format!(
                "base image `{}` has no layers",
                spec.reference
            )));
        }

        let unpacker = Unpacker::new(spec.mapper.clone());
        let namespace = spec.mapper.namespace();
        let mut base_image = BaseImage {
            reference: spec.reference.clone(),
            namespace: namespace.clone(),
            chain_ids: Vec::with_capacity(info.layers.len()),
            base_image_size: 0,
        };

        for layer in LayerDescriptor::chain(&info.layers, namespace.as_deref())? {
            let _guard =
                LockGuard::acquire(self.locksmith.as_ref(), &chain_lock_key(&layer.volume_id))?;
            let size = if self.driver.exists(&layer.volume_id) {
                debug!("reusing volume {}", layer.volume_id);
                self.volume_size(&layer.volume_id)?
            } else {
                self.create_volume(spec, &unpacker, &layer, namespace.as_deref())?
            };
            base_image.base_image_size += size;
            base_image.chain_ids.push(layer.volume_id);
        }

        info!(
            "pulled {} ({} layers, {} bytes)",
            spec.reference,
            base_image.chain_ids.len(),
            base_image.base_image_size
        );
        Ok(base_image)
    }

    fn volume_size(&self, chain_id: &ChainId) -> Result<u64> {
        match VolumeMeta::read(&self.meta_dir, chain_id)? {
            Some(meta) => Ok(meta.size),
            None => self.driver.measure(chain_id),
        }
    }

    fn create_volume(
        &self,
        spec: &BaseImageSpec,
        unpacker: &Unpacker,
        layer: &LayerDescriptor,
        namespace: Option<&str>,
    ) -> Result<u64> {
        debug!(
            "creating volume {} for layer {} from {}",
            layer.volume_id, layer.chain_id, layer.info.blob_digest
        );

        let _timer = Timer::start(self.metrics.as_ref(), UNPACK_TIME);
        let mut unpacked = None;
        self.driver.create(layer.parent.as_ref(), &layer.volume_id, &mut |path: &Path| {
            if layer.parent.is_none() {
                unpacker.prepare_root(path)?;
            }
            let (stream, _) = self.fetcher.stream_blob(&spec.reference, &layer.info)?;
            unpacked = Some(unpacker.unpack(stream, path, &layer.info)?);
            Ok(())
        })?;

        let size = match unpacked {
            Some(unpacked) => unpacked.size,
            None => self.driver.measure(&layer.volume_id)?,
        };
        VolumeMeta {
            blob_digest: layer.info.blob_digest.clone(),
            size,
            namespace: namespace.map(str::to_string),
        }
        .write(&self.meta_dir, &layer.volume_id)?;
        Ok(size)
    }
}
