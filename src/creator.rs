//! Creating bundles from base images.

use std::sync::Arc;

use log::{info, warn};

use crate::{
    bundle::{validate_id, Bundle, BundleSpec, Bundler},
    cleaner::Cleaner,
    dependency::{ArtifactId, DependencyManager},
    error::{Result, StoreError},
    idmap::{IdMapper, IdMapping},
    locksmith::{image_lock_key, LockGuard, Locksmith, GLOBAL_LOCK_KEY},
    metrics::{MetricsEmitter, Timer, IMAGE_CREATION_TIME},
    puller::{BaseImagePuller, BaseImageSpec},
};

/// Everything `create` needs to know.
#[derive(Debug, Clone, Default)]
pub struct CreateSpec {
    pub id: String,
    pub base_image: String,
    pub uid_mappings: Vec<IdMapping>,
    pub gid_mappings: Vec<IdMapping>,
    /// Zero for no limit.
    pub disk_limit: u64,
    pub exclude_base_image_from_quota: bool,
    /// Collect unreferenced volumes first if the store is over the clean
    /// threshold.
    pub clean_on_create: bool,
}

pub struct Creator {
    locksmith: Arc<dyn Locksmith>,
    puller: Arc<BaseImagePuller>,
    bundler: Arc<Bundler>,
    deps: DependencyManager,
    cleaner: Arc<Cleaner>,
    clean_threshold: u64,
    metrics: Arc<dyn MetricsEmitter>,
}

impl Creator {
    pub fn new(
        locksmith: Arc<dyn Locksmith>,
        puller: Arc<BaseImagePuller>,
        bundler: Arc<Bundler>,
        deps: DependencyManager,
        cleaner: Arc<Cleaner>,
        clean_threshold: u64,
        metrics: Arc<dyn MetricsEmitter>,
    ) -> Self {
        Creator {
            locksmith,
            puller,
            bundler,
            deps,
            cleaner,
            clean_threshold,
            metrics,
        }
    }

    /// Build the bundle `spec.id` from `spec.base_image`.
    ///
    /// The global lock is held throughout, so a collection cannot judge the
    /// layers being pulled unreferenced before the bundle's record exists.
    pub fn create(&self, spec: &CreateSpec) -> Result<Bundle> {
        let _timer = Timer::start(self.metrics.as_ref(), IMAGE_CREATION_TIME);
        validate_id(&spec.id)?;
        if spec.base_image.is_empty() {
            return Err(StoreError::invalid_input("base image reference is empty"));
        }
        let mapper = IdMapper::new(spec.uid_mappings.clone(), spec.gid_mappings.clone());

        info!("creating image {} from {}", spec.id, spec.base_image);
        let global = LockGuard::acquire(self.locksmith.as_ref(), GLOBAL_LOCK_KEY)?;
        let image = LockGuard::acquire(self.locksmith.as_ref(), &image_lock_key(&spec.id))?;

        let bundle = self.create_locked(spec, mapper)?;

        image.release()?;
        global.release()?;
        info!("created image {}", spec.id);
        Ok(bundle)
    }

    fn create_locked(&self, spec: &CreateSpec, mapper: IdMapper) -> Result<Bundle> {
        if spec.clean_on_create {
            // Creation goes ahead even if cleaning fails.
            let keep = [ArtifactId::base_image(&spec.base_image)];
            if let Err(err) = self.cleaner.clean(self.clean_threshold, &keep, false) {
                warn!("cleaning before creating {}: {err}", spec.id);
            }
        }

        if self.bundler.exists(&spec.id) {
            return Err(StoreError::AlreadyExists(format!(
                "image for id `{}`",
                spec.id
            )));
        }

        let base_image = self.puller.pull(&BaseImageSpec {
            reference: spec.base_image.clone(),
            mapper,
        })?;

        if spec.disk_limit > 0
            && !spec.exclude_base_image_from_quota
            && spec.disk_limit < base_image.base_image_size
        {
            return Err(StoreError::invalid_input(format!(
                "disk limit {} is smaller than the base image ({} bytes)",
                spec.disk_limit, base_image.base_image_size
            )));
        }

        let bundle = self.bundler.create(&BundleSpec {
            id: &spec.id,
            base_image: &base_image,
            disk_limit: spec.disk_limit,
            exclude_base_image_from_quota: spec.exclude_base_image_from_quota,
        })?;

        let base_artifact =
            ArtifactId::namespaced_base_image(&spec.base_image, base_image.namespace.as_deref());
        let image_artifact = ArtifactId::image(&spec.id);
        let registered = self
            .deps
            .register(&base_artifact, &base_image.chain_ids)
            .and_then(|()| self.deps.register(&image_artifact, &base_image.chain_ids));
        if let Err(err) = registered {
            if let Err(cleanup) = self.deps.deregister(&image_artifact) {
                warn!("deregistering {image_artifact}: {cleanup}");
            }
            if let Err(cleanup) = self.bundler.destroy(&spec.id) {
                warn!("removing image {}: {cleanup}", spec.id);
            }
            return Err(err);
        }

        Ok(bundle)
    }
}
