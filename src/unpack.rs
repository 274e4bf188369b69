//! Applying a layer blob onto a volume.
//!
//! Blobs are plain, gzip or zstd compressed tar archives; the compression is
//! recognised from the leading magic bytes. While unpacking, the compressed
//! stream is hashed against the layer's blob digest and the tar stream
//! against its diff ID.
//!
//! OCI whiteouts are honoured: `.wh.<name>` removes `<name>` from the lower
//! layers and `.wh..wh..opq` empties the directory it appears in. Neither is
//! written to the volume.
//!
//! A `./` entry describes the volume root itself; its owner and mode are
//! applied to the volume directory.

use std::{
    fs,
    io::{BufRead, BufReader, Read},
    os::unix::fs::{lchown, PermissionsExt},
    path::{Component, Path, PathBuf},
};

use log::{debug, trace};
use rustix::process::geteuid;
use tar::EntryType;

use crate::{
    digest::{verify_digest, HashingReader},
    error::{IoContext, NotFoundFilter, Result, StoreError},
    fetcher::LayerInfo,
    idmap::IdMapper,
    volume::remove_tree,
};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

/// Wrap `reader` in the decoder its magic bytes call for.
pub(crate) fn decompress<'a, R: BufRead + Send + 'a>(
    mut reader: R,
) -> Result<Box<dyn Read + Send + 'a>> {
    let head = reader.fill_buf().io_context(|| "reading layer header")?;
    if head.starts_with(GZIP_MAGIC) {
        trace!("layer is gzip compressed");
        Ok(Box::new(flate2::bufread::GzDecoder::new(reader)))
    } else if head.starts_with(ZSTD_MAGIC) {
        trace!("layer is zstd compressed");
        Ok(Box::new(
            zstd::Decoder::with_buffer(reader).io_context(|| "starting zstd decoder")?,
        ))
    } else {
        Ok(Box::new(reader))
    }
}

/// Digests and size observed while unpacking a layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unpacked {
    pub blob_digest: String,
    pub diff_id: String,
    /// Size of the uncompressed tar stream.
    pub size: u64,
}

/// Unpacks layer blobs, translating ownership through an [`IdMapper`].
#[derive(Debug, Clone)]
pub struct Unpacker {
    mapper: IdMapper,
    privileged: bool,
}

impl Unpacker {
    pub fn new(mapper: IdMapper) -> Self {
        Unpacker {
            mapper,
            privileged: geteuid().is_root(),
        }
    }

    /// Hand the root of a fresh base volume to the namespace root user.
    ///
    /// Volumes are created by the store's own user; without this, a layer
    /// lacking a `./` entry would leave the container's `/` owned by host
    /// root. Does nothing without privileges or when the mappings do not
    /// cover namespace root.
    pub fn prepare_root(&self, dest: &Path) -> Result<()> {
        if !self.privileged {
            return Ok(());
        }
        match self.mapper.root_owner() {
            Ok((uid, gid)) => {
                trace!("volume root {} owned by {uid}:{gid}", dest.display());
                lchown(dest, Some(uid), Some(gid))
                    .io_context(|| format!("changing owner of {}", dest.display()))
            }
            Err(err) => {
                debug!("leaving owner of {} alone: {err}", dest.display());
                Ok(())
            }
        }
    }

    /// Unpack the blob in `reader` onto the volume at `dest`.
    ///
    /// Without root privileges, ownership is validated against the mappings
    /// but files stay owned by the calling user, and device nodes are skipped.
    pub fn unpack(&self, reader: impl Read + Send, dest: &Path, layer: &LayerInfo) -> Result<Unpacked> {
        debug!("unpacking {} into {}", layer.diff_id, dest.display());
        let dest_canonical = fs::canonicalize(dest)
            .io_context(|| format!("resolving {}", dest.display()))?;

        let mut blob = HashingReader::new(reader);
        let (diff_id, size) = {
            let decoded = decompress(BufReader::new(&mut blob))?;
            let mut tar_stream = HashingReader::new(decoded);
            self.apply(&mut tar::Archive::new(&mut tar_stream), dest, &dest_canonical)?;
            tar_stream
                .drain()
                .io_context(|| format!("reading layer {}", layer.diff_id))?;
            tar_stream.finish()
        };
        blob.drain()
            .io_context(|| format!("reading layer {}", layer.diff_id))?;
        let (blob_digest, _) = blob.finish();

        if layer.verify {
            verify_digest(&layer.blob_digest, &blob_digest)?;
            verify_digest(&layer.diff_id, &diff_id)?;
        }

        Ok(Unpacked {
            blob_digest,
            diff_id,
            size,
        })
    }

    fn apply<R: Read>(
        &self,
        archive: &mut tar::Archive<R>,
        dest: &Path,
        dest_canonical: &Path,
    ) -> Result<()> {
        archive.set_preserve_permissions(true);
        archive.set_preserve_mtime(true);
        archive.set_overwrite(true);

        let context = || format!("unpacking into {}", dest.display());
        for entry in archive.entries().io_context(context)? {
            let mut entry = entry.io_context(context)?;
            let raw_path = entry.path().io_context(context)?.into_owned();
            let Some(relative) = normalize(&raw_path)? else {
                if entry.header().entry_type() == EntryType::Directory {
                    let (uid, gid) = self.host_owner(entry.header())?;
                    self.restore_owner(dest, uid, gid, entry.header())?;
                }
                continue;
            };
            let Some(name) = relative.file_name().and_then(|name| name.to_str()) else {
                continue;
            };

            if name == OPAQUE_WHITEOUT {
                if let Some(dir) = resolve_parent(dest, dest_canonical, &relative)? {
                    trace!("opaque whiteout in {}", dir.display());
                    clear_dir(&dir)?;
                }
                continue;
            }
            if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
                if let Some(dir) = resolve_parent(dest, dest_canonical, &relative)? {
                    trace!("whiteout {}", dir.join(hidden).display());
                    remove_path(&dir.join(hidden))?;
                }
                continue;
            }

            let entry_type = entry.header().entry_type();
            if matches!(entry_type, EntryType::Char | EntryType::Block) && !self.privileged {
                debug!("skipping device node {} without privileges", relative.display());
                continue;
            }

            let (host_uid, host_gid) = self.host_owner(entry.header())?;

            if let Some(parent) = resolve_parent(dest, dest_canonical, &relative)? {
                if let Some(name) = relative.file_name() {
                    let target = parent.join(name);
                    if let Some(existing) = fs::symlink_metadata(&target)
                        .filter_not_found()
                        .io_context(|| format!("inspecting {}", target.display()))?
                    {
                        // Directories merge with lower layers, everything else replaces.
                        if !(existing.is_dir() && entry_type == EntryType::Directory) {
                            remove_path(&target)?;
                        }
                    }
                }
            }

            let unpacked = entry
                .unpack_in(dest)
                .io_context(|| format!("unpacking {}", relative.display()))?;
            if !unpacked {
                return Err(StoreError::invalid_input(format!(
                    "layer entry `{}` escapes the volume",
                    raw_path.display()
                )));
            }

            self.restore_owner(&dest.join(&relative), host_uid, host_gid, entry.header())?;
        }
        Ok(())
    }

    /// The host owner of an entry, through the mappings.
    fn host_owner(&self, header: &tar::Header) -> Result<(u32, u32)> {
        let context = || "reading entry owner";
        let uid = header.uid().io_context(context)?;
        let gid = header.gid().io_context(context)?;
        Ok((
            self.mapper.map_uid(id_from_header(uid, "uid")?)?,
            self.mapper.map_gid(id_from_header(gid, "gid")?)?,
        ))
    }

    fn restore_owner(&self, path: &Path, uid: u32, gid: u32, header: &tar::Header) -> Result<()> {
        if !self.privileged {
            return Ok(());
        }
        lchown(path, Some(uid), Some(gid))
            .io_context(|| format!("changing owner of {}", path.display()))?;
        // chown clears setuid and setgid bits
        let entry_type = header.entry_type();
        if entry_type != EntryType::Symlink && entry_type != EntryType::Link {
            let mode = header
                .mode()
                .io_context(|| format!("reading mode of {}", path.display()))?
                & 0o7777;
            fs::set_permissions(path, fs::Permissions::from_mode(mode))
                .io_context(|| format!("changing mode of {}", path.display()))?;
        }
        Ok(())
    }
}

fn id_from_header(id: u64, what: &str) -> Result<u32> {
    u32::try_from(id)
        .map_err(|_| StoreError::invalid_input(format!("{what} {id} in layer is out of range")))
}

/// Turn an archive path into a relative path without `.` components.
///
/// Returns `None` for the archive root and an error for paths containing
/// `..`.
fn normalize(path: &Path) -> Result<Option<PathBuf>> {
    let mut relative = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(StoreError::invalid_input(format!(
                    "layer entry `{}` escapes the volume",
                    path.display()
                )))
            }
        }
    }
    Ok((!relative.as_os_str().is_empty()).then_some(relative))
}

/// Resolve the directory containing `relative`, following symlinks already in
/// the volume but refusing any that lead out of it. `None` when the directory
/// does not exist.
fn resolve_parent(dest: &Path, dest_canonical: &Path, relative: &Path) -> Result<Option<PathBuf>> {
    let parent = match relative.parent() {
        Some(parent) => dest.join(parent),
        None => dest.to_path_buf(),
    };
    let Some(resolved) = fs::canonicalize(&parent)
        .filter_not_found()
        .io_context(|| format!("resolving {}", parent.display()))?
    else {
        return Ok(None);
    };
    if !resolved.starts_with(dest_canonical) {
        return Err(StoreError::invalid_input(format!(
            "layer entry `{}` escapes the volume",
            relative.display()
        )));
    }
    Ok(Some(resolved))
}

fn remove_path(path: &Path) -> Result<()> {
    let Some(metadata) = fs::symlink_metadata(path)
        .filter_not_found()
        .io_context(|| format!("inspecting {}", path.display()))?
    else {
        return Ok(());
    };
    if metadata.is_dir() {
        remove_tree(path)
    } else {
        fs::remove_file(path)
            .filter_not_found()
            .io_context(|| format!("removing {}", path.display()))?;
        Ok(())
    }
}

fn clear_dir(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir).io_context(|| format!("listing {}", dir.display()))? {
        let entry = entry.io_context(|| format!("listing {}", dir.display()))?;
        remove_path(&entry.path())?;
    }
    Ok(())
}
