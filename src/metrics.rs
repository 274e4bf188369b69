//! Durations of store operations.
//!
//! Emitting is best effort: an emitter has no way to fail the operation it
//! times. [`LogEmitter`] writes to the `layerstore::metrics` log target; an
//! embedder can forward to its own metrics system instead.

use std::time::{Duration, Instant};

use log::info;

/// Time taken by a whole `create`.
pub const IMAGE_CREATION_TIME: &str = "ImageCreationTime";
/// Time taken by a whole `delete`.
pub const IMAGE_DELETION_TIME: &str = "ImageDeletionTime";
/// Time taken by a `clean`, including threshold checks that end in a noop.
pub const IMAGE_CLEAN_TIME: &str = "ImageCleanTime";
/// Time taken to fetch and unpack one layer.
pub const UNPACK_TIME: &str = "UnpackTime";

pub trait MetricsEmitter: Send + Sync {
    fn emit_duration(&self, name: &str, duration: Duration);
}

/// Logs every metric at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEmitter;

impl MetricsEmitter for LogEmitter {
    fn emit_duration(&self, name: &str, duration: Duration) {
        info!(target: "layerstore::metrics", "{name}: {} ms", duration.as_millis());
    }
}

/// Emits the time between its creation and its drop.
pub struct Timer<'a> {
    emitter: &'a dyn MetricsEmitter,
    name: &'static str,
    start: Instant,
}

impl<'a> Timer<'a> {
    pub fn start(emitter: &'a dyn MetricsEmitter, name: &'static str) -> Self {
        Timer {
            emitter,
            name,
            start: Instant::now(),
        }
    }
}

impl Drop for Timer<'_> {
    fn drop(&mut self) {
        self.emitter.emit_duration(self.name, self.start.elapsed());
    }
}
