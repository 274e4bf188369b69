#![allow(dead_code)]

use std::{
    collections::HashMap,
    io::{self, Cursor, Read},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tempfile::TempDir;

use layerstore::{
    digest::sha256_digest,
    error::{FetchErrorKind, Result, StoreError},
    fetcher::{BaseImageInfo, BlobStream, CacheDriver, Fetcher, LayerInfo},
    locksmith::{Locksmith, MemoryLocksmith},
    metrics::MetricsEmitter,
    store::{configure_store, Components, Store, StoreLayout},
    volume::{CopyDriver, QuotaHelper},
};

/// An entry of a test layer.
pub enum Entry<'a> {
    Dir(&'a str),
    File(&'a str, &'a [u8]),
}

/// An uncompressed tar layer.
pub fn layer(entries: &[Entry]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for entry in entries {
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        match entry {
            Entry::Dir(path) => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                builder.append_data(&mut header, path, io::empty()).unwrap();
            }
            Entry::File(path, data) => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(0o644);
                header.set_size(data.len() as u64);
                builder.append_data(&mut header, path, *data).unwrap();
            }
        }
    }
    builder.into_inner().unwrap()
}

/// Serves base images from memory and counts blob downloads.
#[derive(Default)]
pub struct MemoryFetcher {
    images: Mutex<HashMap<String, Vec<Vec<u8>>>>,
    streamed: Mutex<HashMap<String, usize>>,
    /// Cut every blob stream off halfway with an I/O error.
    pub interrupt: AtomicBool,
}

impl MemoryFetcher {
    pub fn add_image(&self, reference: &str, layers: Vec<Vec<u8>>) {
        self.images
            .lock()
            .unwrap()
            .insert(reference.to_string(), layers);
    }

    /// How often the blob of `layer` was streamed.
    pub fn streamed(&self, layer: &[u8]) -> usize {
        self.streamed
            .lock()
            .unwrap()
            .get(&sha256_digest(layer))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_streamed(&self) -> usize {
        self.streamed.lock().unwrap().values().sum()
    }

    fn layers(&self, reference: &str) -> Result<Vec<Vec<u8>>> {
        self.images
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| StoreError::fetch(FetchErrorKind::NotFound, reference, "manifest unknown"))
    }
}

impl Fetcher for MemoryFetcher {
    fn base_image_info(&self, reference: &str) -> Result<BaseImageInfo> {
        let layers = self
            .layers(reference)?
            .iter()
            .map(|blob| LayerInfo {
                blob_digest: sha256_digest(blob),
                diff_id: sha256_digest(blob),
                size: blob.len() as u64,
                verify: true,
            })
            .collect();
        Ok(BaseImageInfo { layers })
    }

    fn stream_blob(&self, reference: &str, layer: &LayerInfo) -> Result<BlobStream> {
        let blob = self
            .layers(reference)?
            .into_iter()
            .find(|blob| sha256_digest(blob) == layer.blob_digest)
            .ok_or_else(|| StoreError::fetch(FetchErrorKind::NotFound, reference, "blob unknown"))?;
        *self
            .streamed
            .lock()
            .unwrap()
            .entry(layer.blob_digest.clone())
            .or_default() += 1;

        let size = blob.len() as u64;
        if self.interrupt.load(Ordering::SeqCst) {
            let half = blob[..blob.len() / 2].to_vec();
            return Ok((Box::new(Cursor::new(half).chain(Broken)), size));
        }
        Ok((Box::new(Cursor::new(blob)), size))
    }
}

/// A reader that fails like a dropped connection.
struct Broken;

impl Read for Broken {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer"))
    }
}

/// Keeps the names of emitted metrics.
#[derive(Default)]
pub struct RecordingMetrics(Mutex<Vec<String>>);

impl RecordingMetrics {
    pub fn count(&self, name: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|n| *n == name).count()
    }
}

impl MetricsEmitter for RecordingMetrics {
    fn emit_duration(&self, name: &str, _duration: Duration) {
        self.0.lock().unwrap().push(name.to_string());
    }
}

/// Records quota requests instead of applying them.
#[derive(Default)]
pub struct RecordingQuota {
    pub limits: Mutex<Vec<(PathBuf, u64, bool)>>,
    pub fail: AtomicBool,
}

impl QuotaHelper for RecordingQuota {
    fn limit(&self, volume_path: &Path, bytes: u64, exclusive: bool) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Quota("qgroup limit: operation not permitted".into()));
        }
        self.limits
            .lock()
            .unwrap()
            .push((volume_path.to_path_buf(), bytes, exclusive));
        Ok(())
    }

    fn destroy(&self, _volume_path: &Path) -> Result<()> {
        Ok(())
    }
}

pub struct TestStore {
    pub tmp: TempDir,
    pub layout: StoreLayout,
    pub fetcher: Arc<MemoryFetcher>,
    pub quota: Arc<RecordingQuota>,
    pub locksmith: Arc<dyn Locksmith>,
    pub memory_locks: Option<Arc<MemoryLocksmith>>,
    pub cache: Arc<CacheDriver>,
    pub metrics: Arc<RecordingMetrics>,
    pub store: Store,
}

impl TestStore {
    /// A fresh store with in-process locks.
    pub fn new() -> Self {
        let locks = Arc::new(MemoryLocksmith::new());
        let mut store = Self::with_locksmith(|_| locks.clone());
        store.memory_locks = Some(locks);
        store
    }

    pub fn with_locksmith(locksmith: impl FnOnce(&StoreLayout) -> Arc<dyn Locksmith>) -> Self {
        let tmp = tempfile::Builder::new()
            .prefix("layerstore-it-")
            .tempdir()
            .unwrap();
        let layout = StoreLayout::new(tmp.path().join("store"));
        configure_store(&layout, None).unwrap();
        let locksmith = locksmith(&layout);

        let fetcher = Arc::new(MemoryFetcher::default());
        let quota = Arc::new(RecordingQuota::default());
        let cache = Arc::new(CacheDriver::new(fetcher.clone(), layout.cache_dir()));
        let metrics = Arc::new(RecordingMetrics::default());
        let store = build(&layout, &quota, &cache, &locksmith, &metrics, 0);

        TestStore {
            tmp,
            layout,
            fetcher,
            quota,
            locksmith,
            memory_locks: None,
            cache,
            metrics,
            store,
        }
    }

    /// Another store on the same root, as a second process would see it.
    pub fn reopen(&self, clean_threshold: u64) -> Store {
        build(
            &self.layout,
            &self.quota,
            &self.cache,
            &self.locksmith,
            &self.metrics,
            clean_threshold,
        )
    }

    pub fn volume_count(&self) -> usize {
        self.store.driver().volumes().unwrap().len()
    }

    /// Whether any lock is still held, when using in-process locks.
    pub fn any_locked(&self, keys: &[&str]) -> bool {
        let locks = self.memory_locks.as_ref().unwrap();
        keys.iter().any(|key| locks.is_locked(key))
    }
}

fn build(
    layout: &StoreLayout,
    quota: &Arc<RecordingQuota>,
    cache: &Arc<CacheDriver>,
    locksmith: &Arc<dyn Locksmith>,
    metrics: &Arc<RecordingMetrics>,
    clean_threshold: u64,
) -> Store {
    Store::with_components(
        layout.clone(),
        Components {
            driver: Arc::new(CopyDriver::new(layout.volumes_dir(), quota.clone())),
            fetcher: cache.clone(),
            locksmith: locksmith.clone(),
            cache: Some(cache.clone()),
            clean_threshold,
            metrics: metrics.clone(),
        },
    )
}
