//! Base images from the local filesystem.
//!
//! A reference is a path to either
//!
//!  - a tar archive (plain, gzip or zstd), which becomes a single layer whose
//!    digests are computed from its content, or
//!  - a root filesystem directory, which becomes a single layer streamed as
//!    a tar archive built on the fly. Its digests are synthesised from the
//!    path and modification time so that touching the directory produces a
//!    new layer; they cannot be verified.

use std::{
    fs::{self, File},
    io::{BufReader, Seek, SeekFrom},
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

use log::debug;

use super::{BaseImageInfo, BlobStream, Fetcher, LayerInfo};
use crate::{
    digest::{sha256_digest, HashingReader},
    error::{FetchErrorKind, IoContext, Result, StoreError},
    unpack::decompress,
};

pub struct LocalFetcher {
    tmp_dir: PathBuf,
}

impl LocalFetcher {
    /// Directory layers are staged as tar files in `tmp_dir`.
    pub fn new(tmp_dir: impl AsRef<Path>) -> Self {
        LocalFetcher {
            tmp_dir: tmp_dir.as_ref().to_path_buf(),
        }
    }

    fn stat(reference: &str) -> Result<fs::Metadata> {
        fs::metadata(reference).map_err(|err| {
            let kind = match err.kind() {
                std::io::ErrorKind::NotFound => FetchErrorKind::NotFound,
                std::io::ErrorKind::PermissionDenied => FetchErrorKind::Unauthorized,
                _ => FetchErrorKind::Other,
            };
            StoreError::fetch(kind, reference, err)
        })
    }

    fn archive_layer(reference: &str) -> Result<LayerInfo> {
        let file = File::open(reference).io_context(|| format!("opening {reference}"))?;
        let mut blob = HashingReader::new(file);
        let diff_id = {
            let mut tar_stream = HashingReader::new(decompress(BufReader::new(&mut blob))?);
            tar_stream
                .drain()
                .io_context(|| format!("reading {reference}"))?;
            tar_stream.finish().0
        };
        blob.drain().io_context(|| format!("reading {reference}"))?;
        let (blob_digest, size) = blob.finish();

        Ok(LayerInfo {
            blob_digest,
            diff_id,
            size,
            verify: true,
        })
    }

    fn directory_layer(reference: &str, metadata: &fs::Metadata) -> LayerInfo {
        let digest = sha256_digest(format!(
            "{reference}-{}.{}",
            metadata.mtime(),
            metadata.mtime_nsec()
        ));
        LayerInfo {
            blob_digest: digest.clone(),
            diff_id: digest,
            size: 0,
            verify: false,
        }
    }

    fn stream_directory(&self, reference: &str) -> Result<BlobStream> {
        let context = || format!("archiving {reference}");
        let file = tempfile::tempfile_in(&self.tmp_dir).io_context(context)?;

        let mut builder = tar::Builder::new(file);
        builder.follow_symlinks(false);
        builder.append_dir_all("", reference).io_context(context)?;
        let mut file = builder.into_inner().io_context(context)?;

        let size = file.seek(SeekFrom::End(0)).io_context(context)?;
        file.seek(SeekFrom::Start(0)).io_context(context)?;
        debug!("archived {reference} into {size} bytes");
        Ok((Box::new(file), size))
    }
}

impl Fetcher for LocalFetcher {
    fn base_image_info(&self, reference: &str) -> Result<BaseImageInfo> {
        let metadata = Self::stat(reference)?;
        let layer = if metadata.is_dir() {
            Self::directory_layer(reference, &metadata)
        } else {
            Self::archive_layer(reference)?
        };
        Ok(BaseImageInfo {
            layers: vec![layer],
        })
    }

    fn stream_blob(&self, reference: &str, _layer: &LayerInfo) -> Result<BlobStream> {
        let metadata = Self::stat(reference)?;
        if metadata.is_dir() {
            self.stream_directory(reference)
        } else {
            let file = File::open(reference).io_context(|| format!("opening {reference}"))?;
            Ok((Box::new(file), metadata.len()))
        }
    }
}
