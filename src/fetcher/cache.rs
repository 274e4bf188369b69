//! A blob cache in front of a fetcher.
//!
//! Blobs are kept in `cache/<blob-hex>`. On a miss the blob is streamed from
//! the wrapped fetcher to the caller and written to
//! `cache/.partial-<hex>-<random>` at the same time; only when the stream
//! reaches its end with the advertised digest is the partial file renamed into
//! place. A stream that is dropped early, fails, or has the wrong digest never
//! produces a cache entry.

use std::{
    collections::HashSet,
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{debug, warn};
use sha2::{Digest as _, Sha256};

use super::{BaseImageInfo, BlobStream, Fetcher, LayerInfo};
use crate::{
    digest::{digest_hex, format_digest, parse_digest, Sha256Digest},
    error::{IoContext, NotFoundFilter, Result},
    volume::generate_tmpname,
};

pub struct CacheDriver {
    inner: Arc<dyn Fetcher>,
    cache_dir: PathBuf,
}

impl CacheDriver {
    pub fn new(inner: Arc<dyn Fetcher>, cache_dir: impl AsRef<Path>) -> Self {
        CacheDriver {
            inner,
            cache_dir: cache_dir.as_ref().to_path_buf(),
        }
    }

    fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        let digest = parse_digest(digest)?;
        Ok(self.cache_dir.join(digest_hex(&digest)))
    }

    /// Whether `digest` is cached.
    pub fn contains(&self, digest: &str) -> Result<bool> {
        Ok(self.blob_path(digest)?.is_file())
    }

    /// Drop a cached blob. Removing an absent blob succeeds.
    pub fn remove(&self, digest: &str) -> Result<()> {
        let path = self.blob_path(digest)?;
        debug!("removing cached blob {}", path.display());
        fs::remove_file(&path)
            .filter_not_found()
            .io_context(|| format!("removing {}", path.display()))?;
        Ok(())
    }

    /// Drop abandoned partial downloads and every blob whose digest is not
    /// in `referenced`. Entries that are neither are left alone.
    ///
    /// The caller must hold the global lock so no download is in flight.
    pub fn prune(&self, referenced: &HashSet<String>, dry_run: bool) -> Result<CachePruned> {
        let keep: HashSet<String> = referenced
            .iter()
            .filter_map(|digest| parse_digest(digest).ok())
            .map(|digest| digest_hex(&digest).to_string())
            .collect();

        let mut pruned = CachePruned::default();
        let Some(entries) = fs::read_dir(&self.cache_dir)
            .filter_not_found()
            .io_context(|| format!("listing {}", self.cache_dir.display()))?
        else {
            return Ok(pruned);
        };
        for entry in entries {
            let entry = entry.io_context(|| format!("listing {}", self.cache_dir.display()))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with(PARTIAL_PREFIX) {
                pruned.partials += 1;
            } else if is_blob_name(name) && !keep.contains(name) {
                pruned.blobs += 1;
            } else {
                continue;
            }
            let path = entry.path();
            if dry_run {
                debug!("would remove {}", path.display());
                continue;
            }
            debug!("removing {}", path.display());
            fs::remove_file(&path)
                .filter_not_found()
                .io_context(|| format!("removing {}", path.display()))?;
        }
        Ok(pruned)
    }
}

/// Entries removed by [`CacheDriver::prune`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CachePruned {
    pub blobs: u64,
    pub partials: u64,
}

const PARTIAL_PREFIX: &str = ".partial-";

fn is_blob_name(name: &str) -> bool {
    name.len() == 64 && name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

impl Fetcher for CacheDriver {
    fn base_image_info(&self, reference: &str) -> Result<BaseImageInfo> {
        self.inner.base_image_info(reference)
    }

    fn stream_blob(&self, reference: &str, layer: &LayerInfo) -> Result<BlobStream> {
        if !layer.verify {
            // made-up digests name nothing worth keeping
            return self.inner.stream_blob(reference, layer);
        }

        let path = self.blob_path(&layer.blob_digest)?;
        if let Some(file) = File::open(&path)
            .filter_not_found()
            .io_context(|| format!("opening {}", path.display()))?
        {
            debug!("cache hit for {}", layer.blob_digest);
            let size = file
                .metadata()
                .io_context(|| format!("inspecting {}", path.display()))?
                .len();
            return Ok((Box::new(file), size));
        }

        debug!("cache miss for {}", layer.blob_digest);
        let (stream, size) = self.inner.stream_blob(reference, layer)?;
        let partial_path = self.cache_dir.join(generate_tmpname(&format!(
            "{PARTIAL_PREFIX}{}-",
            digest_hex(&layer.blob_digest)
        )));
        let partial = File::create(&partial_path)
            .io_context(|| format!("creating {}", partial_path.display()))?;

        Ok((
            Box::new(TeeReader {
                inner: stream,
                partial: Some(partial),
                partial_path,
                final_path: path,
                expected: layer.blob_digest.clone(),
                hasher: Sha256::new(),
            }),
            size,
        ))
    }

    fn close(&self, reference: &str) -> Result<()> {
        self.inner.close(reference)
    }
}

/// Copies everything read into a partial cache file, publishing it at EOF.
struct TeeReader {
    inner: Box<dyn Read + Send>,
    partial: Option<File>,
    partial_path: PathBuf,
    final_path: PathBuf,
    expected: String,
    hasher: Sha256,
}

impl TeeReader {
    fn abandon(&mut self) {
        if self.partial.take().is_some() {
            if let Err(err) = fs::remove_file(&self.partial_path) {
                warn!("removing {}: {err}", self.partial_path.display());
            }
        }
    }

    fn publish(&mut self) -> io::Result<()> {
        let Some(file) = self.partial.take() else {
            return Ok(());
        };
        let value: Sha256Digest = std::mem::take(&mut self.hasher).finalize().into();
        let actual = format_digest(&value);
        if actual != self.expected {
            // The consumer checks the digest itself and reports the mismatch.
            warn!(
                "not caching {}: content hashes to {actual}",
                self.expected
            );
            self.partial = Some(file);
            self.abandon();
            return Ok(());
        }

        file.sync_all()?;
        drop(file);
        fs::rename(&self.partial_path, &self.final_path).inspect_err(|_| {
            let _ = fs::remove_file(&self.partial_path);
        })?;
        debug!("cached {}", self.final_path.display());
        Ok(())
    }
}

impl Read for TeeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 {
            self.publish()?;
            return Ok(0);
        }
        if let Some(file) = self.partial.as_mut() {
            self.hasher.update(&buf[..n]);
            if let Err(err) = file.write_all(&buf[..n]) {
                self.abandon();
                return Err(err);
            }
        }
        Ok(n)
    }
}

impl Drop for TeeReader {
    fn drop(&mut self) {
        self.abandon();
    }
}
