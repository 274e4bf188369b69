//! Content digests and layer chain identifiers.
//!
//! Layers are identified by `sha256:<hex>` digests. A layer's ChainID folds in
//! the ChainIDs of every layer beneath it, as defined by OCI image-spec:
//!
//! ```text
//! ChainID(L0)      = DiffID(L0)
//! ChainID(L0..Ln)  = sha256(ChainID(L0..Ln-1) + " " + DiffID(Ln))
//! ```
//!
//! Two images that share a prefix of layers therefore share the ChainIDs of
//! that prefix, which is what lets the store keep one volume per ChainID.
//!
//! Layers unpacked through user namespace ID mappings hold different file
//! owners than the same layers unpacked without. Their volumes are named by
//! [`ChainId::namespaced`], which folds a tag for the mappings into the
//! ChainID the same way a diff ID is folded in.

use std::{
    fmt,
    io::{Read, Result as IoResult},
};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{Result, StoreError};

const SHA256_PREFIX: &str = "sha256:";

/// A utility type representing a SHA-256 digest in binary.
pub type Sha256Digest = [u8; 32];

/// Parse a string containing a SHA256 digest in hexidecimal form into a Sha256Digest.
///
/// The string must contain exactly 64 characters and consist entirely of [0-9a-f], case
/// insensitive.
pub fn parse_sha256(string: impl AsRef<str>) -> Result<Sha256Digest> {
    let mut value = [0u8; 32];
    hex::decode_to_slice(string.as_ref(), &mut value).map_err(|source| {
        StoreError::invalid_input(format!(
            "invalid sha256 digest `{}`: {source}",
            string.as_ref()
        ))
    })?;
    Ok(value)
}

/// Validate and normalise a `sha256:<hex>` digest string.
pub fn parse_digest(digest: &str) -> Result<String> {
    let Some(rest) = digest.strip_prefix(SHA256_PREFIX) else {
        return Err(StoreError::invalid_input(format!(
            "digest `{digest}` is not sha256"
        )));
    };
    Ok(format!("{SHA256_PREFIX}{}", hex::encode(parse_sha256(rest)?)))
}

/// Return the hex part of a `sha256:<hex>` digest.
pub fn digest_hex(digest: &str) -> &str {
    digest.strip_prefix(SHA256_PREFIX).unwrap_or(digest)
}

/// Format a binary SHA-256 value as a `sha256:<hex>` digest.
pub fn format_digest(value: &Sha256Digest) -> String {
    format!("{SHA256_PREFIX}{}", hex::encode(value))
}

/// Hash `bytes` into a `sha256:<hex>` digest.
pub fn sha256_digest(bytes: impl AsRef<[u8]>) -> String {
    let value: Sha256Digest = Sha256::digest(bytes.as_ref()).into();
    format_digest(&value)
}

/// Identifier of a layer composed with all of its ancestors.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChainId(String);

impl ChainId {
    /// Compute the ChainID of a layer with the given diff ID on top of `parent`.
    pub fn compute(parent: Option<&ChainId>, diff_id: &str) -> Result<ChainId> {
        let diff_id = parse_digest(diff_id)?;
        Ok(match parent {
            None => ChainId(diff_id),
            Some(parent) => ChainId(sha256_digest(format!("{} {diff_id}", parent.0))),
        })
    }

    /// The identifier of this layer chain as unpacked under `namespace`
    /// (see [`IdMapper::namespace`](crate::idmap::IdMapper::namespace)).
    pub fn namespaced(&self, namespace: &str) -> ChainId {
        ChainId(sha256_digest(format!("{} {namespace}", self.0)))
    }

    /// Compute the ChainIDs of every layer in `diff_ids`, base first.
    pub fn compute_all<'a>(diff_ids: impl IntoIterator<Item = &'a str>) -> Result<Vec<ChainId>> {
        let mut chain: Vec<ChainId> = Vec::new();
        for diff_id in diff_ids {
            let next = ChainId::compute(chain.last(), diff_id)?;
            chain.push(next);
        }
        Ok(chain)
    }

    /// Parse a `sha256:<hex>` string or bare 64-character hex string.
    pub fn parse(value: &str) -> Result<ChainId> {
        if value.starts_with(SHA256_PREFIX) {
            Ok(ChainId(parse_digest(value)?))
        } else {
            Ok(ChainId(format!(
                "{SHA256_PREFIX}{}",
                hex::encode(parse_sha256(value)?)
            )))
        }
    }

    /// The hex part, used as the volume name on disk.
    pub fn hex(&self) -> &str {
        digest_hex(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChainId({})", self.0)
    }
}

impl TryFrom<String> for ChainId {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self> {
        ChainId::parse(&value)
    }
}

impl From<ChainId> for String {
    fn from(value: ChainId) -> Self {
        value.0
    }
}

/// A reader that hashes and counts everything read through it.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    bytes: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        HashingReader {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    /// Drain whatever is left in the underlying reader into the hash.
    ///
    /// Tar archives end with zero blocks that the tar parser may not consume;
    /// they are part of the digest all the same.
    pub fn drain(&mut self) -> IoResult<()> {
        std::io::copy(self, &mut std::io::sink())?;
        Ok(())
    }

    /// Return the `sha256:<hex>` digest and byte count of everything read.
    pub fn finish(self) -> (String, u64) {
        let value: Sha256Digest = self.hasher.finalize().into();
        (format_digest(&value), self.bytes)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }
}

/// Check that `actual` matches `expected`, producing an integrity error otherwise.
pub fn verify_digest(expected: &str, actual: &str) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(StoreError::Integrity {
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}
