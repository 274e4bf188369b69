//! Threshold-triggered garbage collection.

use std::sync::Arc;

use log::{debug, info};

use crate::{
    dependency::ArtifactId,
    error::Result,
    gc::{GarbageCollector, GcResult},
    locksmith::{LockGuard, Locksmith, GLOBAL_LOCK_KEY},
    measurer::StoreMeasurer,
    metrics::{MetricsEmitter, Timer, IMAGE_CLEAN_TIME},
};

/// What a [`Cleaner::clean`] call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanOutcome {
    /// The store was within the threshold; nothing was collected.
    Noop { usage: u64 },
    Collected(GcResult),
}

impl CleanOutcome {
    pub fn is_noop(&self) -> bool {
        matches!(self, CleanOutcome::Noop { .. })
    }
}

pub struct Cleaner {
    locksmith: Arc<dyn Locksmith>,
    measurer: StoreMeasurer,
    gc: Arc<GarbageCollector>,
    metrics: Arc<dyn MetricsEmitter>,
}

impl Cleaner {
    pub fn new(
        locksmith: Arc<dyn Locksmith>,
        measurer: StoreMeasurer,
        gc: Arc<GarbageCollector>,
        metrics: Arc<dyn MetricsEmitter>,
    ) -> Self {
        Cleaner {
            locksmith,
            measurer,
            gc,
            metrics,
        }
    }

    /// Collect unreferenced volumes if the store uses more than `threshold`
    /// bytes. A zero threshold always collects.
    ///
    /// Pass `acquire_lock = false` only when the caller already holds
    /// [`GLOBAL_LOCK_KEY`]; locks are not re-entrant.
    pub fn clean(
        &self,
        threshold: u64,
        keep: &[ArtifactId],
        acquire_lock: bool,
    ) -> Result<CleanOutcome> {
        let _timer = Timer::start(self.metrics.as_ref(), IMAGE_CLEAN_TIME);
        if threshold > 0 {
            let usage = self.measurer.measure_store()?;
            if usage <= threshold {
                debug!("store uses {usage} of {threshold} bytes, not cleaning");
                return Ok(CleanOutcome::Noop { usage });
            }
            info!("store uses {usage} bytes, over the {threshold} byte threshold");
        }

        let guard = if acquire_lock {
            Some(LockGuard::acquire(self.locksmith.as_ref(), GLOBAL_LOCK_KEY)?)
        } else {
            None
        };
        let result = self.gc.collect(keep)?;
        if let Some(guard) = guard {
            guard.release()?;
        }
        Ok(CleanOutcome::Collected(result))
    }
}
