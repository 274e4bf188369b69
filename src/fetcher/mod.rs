//! Where base images come from.
//!
//! A [`Fetcher`] resolves a base image reference into its ordered list of
//! layers and streams each layer's blob. The puller does not care whether the
//! bytes come from a registry, a tarball, or a directory on disk.

use std::{io::Read, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{digest::ChainId, error::Result};

pub mod cache;
pub mod local;
pub mod remote;

pub use cache::{CacheDriver, CachePruned};
pub use local::LocalFetcher;
pub use remote::{RemoteFetcher, RemoteOptions};

/// One layer as the fetcher describes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerInfo {
    /// `sha256:<hex>` of the blob as transferred (possibly compressed).
    pub blob_digest: String,
    /// `sha256:<hex>` of the uncompressed tar.
    pub diff_id: String,
    /// Size of the blob as transferred.
    pub size: u64,
    /// Whether the digests are content hashes that can be checked. Layers
    /// synthesised from local directories carry made-up digests.
    pub verify: bool,
}

/// A base image, base layer first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseImageInfo {
    pub layers: Vec<LayerInfo>,
}

/// A layer with its position in the chain resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerDescriptor {
    pub info: LayerInfo,
    /// The layer's ChainID.
    pub chain_id: ChainId,
    /// The volume holding this layer: the ChainID itself, or its namespaced
    /// form when the layer is unpacked through ID mappings.
    pub volume_id: ChainId,
    /// The volume of the layer beneath.
    pub parent: Option<ChainId>,
}

impl LayerDescriptor {
    /// Compute ChainIDs and volume IDs for `layers`, given base first.
    pub fn chain(layers: &[LayerInfo], namespace: Option<&str>) -> Result<Vec<LayerDescriptor>> {
        let mut descriptors: Vec<LayerDescriptor> = Vec::with_capacity(layers.len());
        for info in layers {
            let (parent_chain, parent) = match descriptors.last() {
                Some(below) => (Some(&below.chain_id), Some(below.volume_id.clone())),
                None => (None, None),
            };
            let chain_id = ChainId::compute(parent_chain, &info.diff_id)?;
            let volume_id = match namespace {
                Some(namespace) => chain_id.namespaced(namespace),
                None => chain_id.clone(),
            };
            descriptors.push(LayerDescriptor {
                info: info.clone(),
                chain_id,
                volume_id,
                parent,
            });
        }
        Ok(descriptors)
    }
}

/// A blob stream and its size in bytes.
pub type BlobStream = (Box<dyn Read + Send>, u64);

/// A source of base images.
pub trait Fetcher: Send + Sync {
    fn base_image_info(&self, reference: &str) -> Result<BaseImageInfo>;

    fn stream_blob(&self, reference: &str, layer: &LayerInfo) -> Result<BlobStream>;

    /// Release whatever the fetcher holds for `reference`.
    fn close(&self, _reference: &str) -> Result<()> {
        Ok(())
    }
}

/// Transports understood by the image proxy.
const TRANSPORTS: &[&str] = &[
    "docker://",
    "docker-archive:",
    "docker-daemon:",
    "oci:",
    "oci-archive:",
    "containers-storage:",
];

/// Whether `reference` names an image behind the image proxy rather than a
/// local path.
pub fn is_remote_reference(reference: &str) -> bool {
    TRANSPORTS
        .iter()
        .any(|transport| reference.starts_with(transport))
}

/// Dispatches remote references to one fetcher and local paths to another.
pub struct FetcherSelector {
    local: Arc<dyn Fetcher>,
    remote: Arc<dyn Fetcher>,
}

impl FetcherSelector {
    pub fn new(local: Arc<dyn Fetcher>, remote: Arc<dyn Fetcher>) -> Self {
        FetcherSelector { local, remote }
    }

    fn select(&self, reference: &str) -> &dyn Fetcher {
        if is_remote_reference(reference) {
            self.remote.as_ref()
        } else {
            self.local.as_ref()
        }
    }
}

impl Fetcher for FetcherSelector {
    fn base_image_info(&self, reference: &str) -> Result<BaseImageInfo> {
        self.select(reference).base_image_info(reference)
    }

    fn stream_blob(&self, reference: &str, layer: &LayerInfo) -> Result<BlobStream> {
        self.select(reference).stream_blob(reference, layer)
    }

    fn close(&self, reference: &str) -> Result<()> {
        self.select(reference).close(reference)
    }
}
