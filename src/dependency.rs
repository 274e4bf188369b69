//! Persistent record of which layers each artifact depends on.
//!
//! Every bundle (`image:<id>`) and every pulled base image
//! (`baseimage:<reference>`) has one record listing the ChainIDs it keeps
//! alive. A base image pulled through a user namespace mapping is recorded
//! as `baseimage:<reference>#namespaced-<tag>`, since its volumes differ from
//! the unmapped ones. Records live under `meta/dependencies/`, one JSON file each:
//!
//! ```text
//! meta/dependencies/
//! ├── image-my-container.json
//! └── baseimage-4e67eaccd9fd….json    # sha256 of the reference
//! ```
//!
//! Distinct artifacts never share a file, and each file is replaced through a
//! rename, so concurrent writers of different artifacts cannot corrupt each
//! other and a reader never sees a half-written record.

use std::{
    collections::BTreeSet,
    fmt,
    fs,
    io::Write,
    path::{Path, PathBuf},
    str::FromStr,
};

use log::debug;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::{
    digest::{digest_hex, sha256_digest, ChainId},
    error::{IoContext, NotFoundFilter, Result, StoreError},
    idmap::NAMESPACE_PREFIX,
};

const IMAGE_PREFIX: &str = "image:";
const BASE_IMAGE_PREFIX: &str = "baseimage:";
const NAMESPACE_SEPARATOR: char = '#';

/// A top-level artifact that can hold layers alive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ArtifactId {
    /// A bundle created by `create`, named by the caller.
    Image(String),
    /// A base image, named by the reference it was pulled from.
    BaseImage(String),
}

impl ArtifactId {
    pub fn image(id: impl Into<String>) -> Self {
        ArtifactId::Image(id.into())
    }

    pub fn base_image(reference: impl Into<String>) -> Self {
        ArtifactId::BaseImage(reference.into())
    }

    /// The base image `reference` as pulled into `namespace`, or the plain
    /// base image for an unmapped pull.
    pub fn namespaced_base_image(reference: &str, namespace: Option<&str>) -> Self {
        match namespace {
            Some(namespace) => {
                ArtifactId::BaseImage(format!("{reference}{NAMESPACE_SEPARATOR}{namespace}"))
            }
            None => ArtifactId::base_image(reference),
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, ArtifactId::Image(_))
    }

    /// The reference a base image was pulled from, without its namespace tag.
    pub fn base_reference(&self) -> Option<&str> {
        let ArtifactId::BaseImage(reference) = self else {
            return None;
        };
        match reference.rsplit_once(NAMESPACE_SEPARATOR) {
            Some((base, tag)) if tag.starts_with(NAMESPACE_PREFIX) => Some(base),
            _ => Some(reference),
        }
    }

    /// Whether keeping `keep` keeps this artifact. A kept base image covers
    /// every namespace it was pulled into.
    pub fn is_kept_by(&self, keep: &[ArtifactId]) -> bool {
        keep.iter().any(|kept| match kept {
            ArtifactId::BaseImage(reference) => {
                kept == self || self.base_reference() == Some(reference.as_str())
            }
            ArtifactId::Image(_) => kept == self,
        })
    }

    fn file_name(&self) -> String {
        match self {
            ArtifactId::Image(id) => format!("image-{id}.json"),
            ArtifactId::BaseImage(reference) => {
                format!("baseimage-{}.json", digest_hex(&sha256_digest(reference)))
            }
        }
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactId::Image(id) => write!(f, "{IMAGE_PREFIX}{id}"),
            ArtifactId::BaseImage(reference) => write!(f, "{BASE_IMAGE_PREFIX}{reference}"),
        }
    }
}

impl FromStr for ArtifactId {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self> {
        if let Some(id) = value.strip_prefix(IMAGE_PREFIX) {
            Ok(ArtifactId::Image(id.to_string()))
        } else if let Some(reference) = value.strip_prefix(BASE_IMAGE_PREFIX) {
            Ok(ArtifactId::BaseImage(reference.to_string()))
        } else {
            Err(StoreError::invalid_input(format!(
                "unknown artifact `{value}`"
            )))
        }
    }
}

impl TryFrom<String> for ArtifactId {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ArtifactId> for String {
    fn from(value: ArtifactId) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DependencyRecord {
    artifact: ArtifactId,
    chain_ids: Vec<ChainId>,
}

/// Reads and writes dependency records.
#[derive(Debug, Clone)]
pub struct DependencyManager {
    dir: PathBuf,
}

impl DependencyManager {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        DependencyManager {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn record_path(&self, artifact: &ArtifactId) -> PathBuf {
        self.dir.join(artifact.file_name())
    }

    /// Record that `artifact` depends on `chain_ids`, replacing any earlier record.
    pub fn register(&self, artifact: &ArtifactId, chain_ids: &[ChainId]) -> Result<()> {
        let path = self.record_path(artifact);
        debug!("registering {artifact} with {} layer(s)", chain_ids.len());

        let record = DependencyRecord {
            artifact: artifact.clone(),
            chain_ids: chain_ids.to_vec(),
        };
        let data = serde_json::to_vec(&record).map_err(|source| StoreError::Metadata {
            path: path.display().to_string(),
            source,
        })?;

        let mut tmp = NamedTempFile::new_in(&self.dir)
            .io_context(|| format!("creating dependency record for {artifact}"))?;
        tmp.write_all(&data)
            .and_then(|()| tmp.as_file().sync_all())
            .io_context(|| format!("writing dependency record for {artifact}"))?;
        tmp.persist(&path)
            .map_err(|err| err.error)
            .io_context(|| format!("persisting dependency record {}", path.display()))?;
        Ok(())
    }

    /// Forget `artifact`. Forgetting an unknown artifact is not an error.
    pub fn deregister(&self, artifact: &ArtifactId) -> Result<()> {
        let path = self.record_path(artifact);
        debug!("deregistering {artifact}");
        fs::remove_file(&path)
            .filter_not_found()
            .io_context(|| format!("removing dependency record {}", path.display()))?;
        Ok(())
    }

    fn read_record(&self, path: &Path) -> Result<Option<DependencyRecord>> {
        let Some(data) = fs::read(path)
            .filter_not_found()
            .io_context(|| format!("reading dependency record {}", path.display()))?
        else {
            return Ok(None);
        };
        let record = serde_json::from_slice(&data).map_err(|source| StoreError::Metadata {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Some(record))
    }

    /// The ChainIDs `artifact` depends on, base layer first.
    pub fn dependencies(&self, artifact: &ArtifactId) -> Result<Vec<ChainId>> {
        match self.read_record(&self.record_path(artifact))? {
            Some(record) => Ok(record.chain_ids),
            None => Err(StoreError::NotFound(format!(
                "dependency record for {artifact}"
            ))),
        }
    }

    /// Every artifact with a record.
    pub fn artifacts(&self) -> Result<Vec<ArtifactId>> {
        let mut artifacts = Vec::new();
        let Some(entries) = fs::read_dir(&self.dir)
            .filter_not_found()
            .io_context(|| format!("listing {}", self.dir.display()))?
        else {
            return Ok(artifacts);
        };

        for entry in entries {
            let entry = entry.io_context(|| format!("listing {}", self.dir.display()))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            // A record can disappear between the listing and the read.
            if let Some(record) = self.read_record(&entry.path())? {
                artifacts.push(record.artifact);
            }
        }
        artifacts.sort();
        Ok(artifacts)
    }

    /// The subset of `present` that no artifact in `keep` depends on.
    ///
    /// Records may name ChainIDs that are no longer present; those are simply
    /// not reported. Artifacts in `keep` without a record protect nothing.
    pub fn unreferenced<'a>(
        &self,
        present: impl IntoIterator<Item = &'a ChainId>,
        keep: &[ArtifactId],
    ) -> Result<Vec<ChainId>> {
        let mut referenced = BTreeSet::new();
        for artifact in keep {
            match self.dependencies(artifact) {
                Ok(chain_ids) => referenced.extend(chain_ids),
                Err(StoreError::NotFound(_)) => {
                    debug!("{artifact} has no dependency record");
                }
                Err(err) => return Err(err),
            }
        }

        let unreferenced: BTreeSet<_> = present
            .into_iter()
            .filter(|chain_id| !referenced.contains(*chain_id))
            .cloned()
            .collect();
        Ok(unreferenced.into_iter().collect())
    }
}
