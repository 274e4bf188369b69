//! Deleting bundles.

use std::sync::Arc;

use log::info;

use crate::{
    bundle::{validate_id, Bundler},
    dependency::{ArtifactId, DependencyManager},
    error::{Result, StoreError},
    locksmith::{image_lock_key, LockGuard, Locksmith},
    metrics::{MetricsEmitter, Timer, IMAGE_DELETION_TIME},
};

pub struct Deleter {
    locksmith: Arc<dyn Locksmith>,
    bundler: Arc<Bundler>,
    deps: DependencyManager,
    metrics: Arc<dyn MetricsEmitter>,
}

impl Deleter {
    pub fn new(
        locksmith: Arc<dyn Locksmith>,
        bundler: Arc<Bundler>,
        deps: DependencyManager,
        metrics: Arc<dyn MetricsEmitter>,
    ) -> Self {
        Deleter {
            locksmith,
            bundler,
            deps,
            metrics,
        }
    }

    /// Remove the bundle `id` and forget its dependencies.
    ///
    /// Its layers stay until the next collection. A bundle that is already
    /// gone still has any leftover record removed before `NotFound` is
    /// reported.
    pub fn delete(&self, id: &str) -> Result<()> {
        let _timer = Timer::start(self.metrics.as_ref(), IMAGE_DELETION_TIME);
        validate_id(id)?;
        let guard = LockGuard::acquire(self.locksmith.as_ref(), &image_lock_key(id))?;

        let destroyed = self.bundler.destroy(id);
        if let Err(err) = &destroyed {
            if !matches!(err, StoreError::NotFound(_)) {
                return destroyed;
            }
        }
        self.deps.deregister(&ArtifactId::image(id))?;
        destroyed?;

        guard.release()?;
        info!("deleted image {id}");
        Ok(())
    }
}
