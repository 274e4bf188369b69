//! Reclaiming layer volumes nothing depends on any more.
//!
//! The collector takes no locks: the caller must hold [`GLOBAL_LOCK_KEY`] so
//! no creation can be building on a volume while it is judged unreferenced.
//! Under that lock no pull is running either, which is what lets a collection
//! also sweep the blob cache and drop the per-chain lock files of the volumes
//! it removed.
//!
//! [`GLOBAL_LOCK_KEY`]: crate::locksmith::GLOBAL_LOCK_KEY

use std::{
    collections::HashSet,
    path::PathBuf,
    sync::Arc,
};

use log::{debug, info, warn};

use crate::{
    dependency::{ArtifactId, DependencyManager},
    digest::ChainId,
    error::{CollectFailure, Result, StoreError},
    fetcher::CacheDriver,
    locksmith::{chain_lock_key, Locksmith},
    volume::{VolumeDriver, VolumeMeta},
};

/// What a collection removed (or, for a dry run, would remove).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcResult {
    /// Layer volumes destroyed.
    pub volumes_removed: Vec<ChainId>,
    /// Uncompressed size of those volumes, as recorded when they were built.
    pub volumes_bytes: u64,
    /// Cached blobs no remaining volume was unpacked from.
    pub blobs_removed: u64,
    /// Partial downloads left in the cache by interrupted pulls.
    pub partials_removed: u64,
    /// Base image records whose top layer is gone.
    pub records_pruned: u64,
    /// Hidden volumes abandoned by interrupted creations.
    pub incomplete_pruned: u64,
}

pub struct GarbageCollector {
    driver: Arc<dyn VolumeDriver>,
    deps: DependencyManager,
    cache: Option<Arc<CacheDriver>>,
    locksmith: Arc<dyn Locksmith>,
    meta_dir: PathBuf,
}

impl GarbageCollector {
    pub fn new(
        driver: Arc<dyn VolumeDriver>,
        deps: DependencyManager,
        cache: Option<Arc<CacheDriver>>,
        locksmith: Arc<dyn Locksmith>,
        meta_dir: impl Into<PathBuf>,
    ) -> Self {
        GarbageCollector {
            driver,
            deps,
            cache,
            locksmith,
            meta_dir: meta_dir.into(),
        }
    }

    /// Destroy every volume not needed by `keep` or by a live bundle.
    ///
    /// One failing volume does not stop the others from being reclaimed;
    /// all failures are returned together as [`StoreError::Collect`].
    pub fn collect(&self, keep: &[ArtifactId]) -> Result<GcResult> {
        self.collect_impl(keep, false)
    }

    /// Report what [`collect`](Self::collect) would remove without removing it.
    pub fn dry_run(&self, keep: &[ArtifactId]) -> Result<GcResult> {
        self.collect_impl(keep, true)
    }

    fn roots(&self, keep: &[ArtifactId]) -> Result<Vec<ArtifactId>> {
        let mut roots = keep.to_vec();
        for artifact in self.deps.artifacts()? {
            if roots.contains(&artifact) {
                continue;
            }
            if artifact.is_image() {
                debug!("{artifact} lives as a bundle");
                roots.push(artifact);
            } else if artifact.is_kept_by(keep) {
                debug!("{artifact} is kept");
                roots.push(artifact);
            }
        }
        Ok(roots)
    }

    fn collect_impl(&self, keep: &[ArtifactId], dry_run: bool) -> Result<GcResult> {
        let mut result = GcResult::default();
        if !dry_run {
            result.incomplete_pruned = self.driver.prune_incomplete()? as u64;
        }

        let present = self.driver.volumes()?;
        let roots = self.roots(keep)?;
        let unreferenced = self.deps.unreferenced(&present, &roots)?;

        let mut failures = Vec::new();
        for chain_id in unreferenced {
            let meta = match VolumeMeta::read(&self.meta_dir, &chain_id) {
                Ok(meta) => meta,
                Err(err) => {
                    warn!("reading metadata of volume {chain_id}: {err}");
                    None
                }
            };
            if dry_run {
                debug!("would remove volume {chain_id}");
            } else if let Err(error) = self.remove_volume(&chain_id) {
                warn!("failed to collect volume {chain_id}: {error}");
                failures.push(CollectFailure {
                    volume: chain_id.to_string(),
                    error,
                });
                continue;
            }
            result.volumes_bytes += meta.map_or(0, |meta| meta.size);
            result.volumes_removed.push(chain_id);
        }

        result.records_pruned = self.prune_records(keep, &result.volumes_removed, dry_run)?;

        if let Some(cache) = &self.cache {
            let removed: HashSet<ChainId> = result.volumes_removed.iter().cloned().collect();
            let remaining = present.iter().filter(|chain_id| !removed.contains(chain_id));
            if let Err(error) = self.sweep_cache(cache, remaining, dry_run, &mut result) {
                warn!("failed to sweep the blob cache: {error}");
                failures.push(CollectFailure {
                    volume: "blob cache".to_string(),
                    error,
                });
            }
        }

        info!(
            "{} {} volume(s), {} bytes",
            if dry_run { "would collect" } else { "collected" },
            result.volumes_removed.len(),
            result.volumes_bytes
        );
        if failures.is_empty() {
            Ok(result)
        } else {
            Err(StoreError::Collect(failures))
        }
    }

    fn remove_volume(&self, chain_id: &ChainId) -> Result<()> {
        debug!("removing volume {chain_id}");
        self.driver.destroy(chain_id)?;
        VolumeMeta::remove(&self.meta_dir, chain_id)?;
        self.locksmith.forget(&chain_lock_key(chain_id))
    }

    /// Drop cached blobs that none of the `remaining` volumes came from,
    /// along with abandoned partial downloads.
    fn sweep_cache<'a>(
        &self,
        cache: &CacheDriver,
        remaining: impl Iterator<Item = &'a ChainId>,
        dry_run: bool,
        result: &mut GcResult,
    ) -> Result<()> {
        let mut referenced = HashSet::new();
        for chain_id in remaining {
            match VolumeMeta::read(&self.meta_dir, chain_id) {
                Ok(Some(meta)) => {
                    referenced.insert(meta.blob_digest);
                }
                Ok(None) => {}
                Err(err) => warn!("reading metadata of volume {chain_id}: {err}"),
            }
        }
        let pruned = cache.prune(&referenced, dry_run)?;
        result.blobs_removed = pruned.blobs;
        result.partials_removed = pruned.partials;
        Ok(())
    }

    /// Drop base image records (not in `keep`) whose top layer was removed or
    /// is otherwise missing; they no longer describe anything reusable.
    fn prune_records(
        &self,
        keep: &[ArtifactId],
        removed: &[ChainId],
        dry_run: bool,
    ) -> Result<u64> {
        let removed: HashSet<_> = removed.iter().collect();
        let mut pruned = 0;
        for artifact in self.deps.artifacts()? {
            if artifact.is_image() || artifact.is_kept_by(keep) {
                continue;
            }
            let chain_ids = match self.deps.dependencies(&artifact) {
                Ok(chain_ids) => chain_ids,
                Err(StoreError::NotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            let stale = chain_ids
                .last()
                .is_none_or(|top| removed.contains(top) || !self.driver.exists(top));
            if !stale {
                continue;
            }
            if !dry_run {
                debug!("pruning stale record {artifact}");
                self.deps.deregister(&artifact)?;
            }
            pruned += 1;
        }
        Ok(pruned)
    }
}
