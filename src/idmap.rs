//! User namespace ID translation for unpacked files.
//!
//! Image layers record file ownership as seen from inside the container. When
//! the container runs in a user namespace, those IDs have to be shifted to the
//! host IDs the namespace maps them to before the files land on disk, or the
//! container would see its own files owned by `nobody`.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    digest::{digest_hex, sha256_digest},
    error::{Result, StoreError},
};

/// Prefix of the tag [`IdMapper::namespace`] returns.
pub(crate) const NAMESPACE_PREFIX: &str = "namespaced-";

/// A single `namespace_id:host_id:size` range, as in `/proc/<pid>/uid_map`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    pub namespace_id: u32,
    pub host_id: u32,
    pub size: u32,
}

impl IdMapping {
    fn translate(&self, id: u32) -> Option<u32> {
        let offset = id.checked_sub(self.namespace_id)?;
        if offset < self.size {
            self.host_id.checked_add(offset)
        } else {
            None
        }
    }
}

impl fmt::Display for IdMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace_id, self.host_id, self.size)
    }
}

impl FromStr for IdMapping {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self> {
        let invalid = || {
            StoreError::invalid_input(format!(
                "invalid id mapping `{value}`, expected <namespace id>:<host id>:<size>"
            ))
        };

        let mut parts = value.split(':');
        let mut next = || -> Result<u32> {
            parts
                .next()
                .ok_or_else(invalid)?
                .parse::<u32>()
                .map_err(|_| invalid())
        };
        let mapping = IdMapping {
            namespace_id: next()?,
            host_id: next()?,
            size: next()?,
        };
        if parts.next().is_some() || mapping.size == 0 {
            return Err(invalid());
        }
        if mapping.host_id.checked_add(mapping.size - 1).is_none()
            || mapping.namespace_id.checked_add(mapping.size - 1).is_none()
        {
            return Err(invalid());
        }
        Ok(mapping)
    }
}

/// Translates file ownership from namespace IDs to host IDs.
///
/// With no mappings configured, IDs pass through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMapper {
    uid_mappings: Vec<IdMapping>,
    gid_mappings: Vec<IdMapping>,
}

impl IdMapper {
    pub fn new(uid_mappings: Vec<IdMapping>, gid_mappings: Vec<IdMapping>) -> Self {
        IdMapper {
            uid_mappings,
            gid_mappings,
        }
    }

    /// True when no translation happens.
    pub fn is_identity(&self) -> bool {
        self.uid_mappings.is_empty() && self.gid_mappings.is_empty()
    }

    /// A tag naming these mappings, `None` when no translation happens.
    ///
    /// Volumes unpacked through different mappings hold different file
    /// owners, so they must not be shared; the tag keeps them apart.
    pub fn namespace(&self) -> Option<String> {
        if self.is_identity() {
            return None;
        }
        let join = |mappings: &[IdMapping]| {
            mappings
                .iter()
                .map(IdMapping::to_string)
                .collect::<Vec<_>>()
                .join(",")
        };
        let digest = sha256_digest(format!(
            "uid={};gid={}",
            join(&self.uid_mappings),
            join(&self.gid_mappings)
        ));
        Some(format!("{NAMESPACE_PREFIX}{}", &digest_hex(&digest)[..16]))
    }

    pub fn map_uid(&self, uid: u32) -> Result<u32> {
        Self::map(&self.uid_mappings, uid, "uid")
    }

    pub fn map_gid(&self, gid: u32) -> Result<u32> {
        Self::map(&self.gid_mappings, gid, "gid")
    }

    /// The host IDs that namespace root maps to, used as the owner of
    /// directories the store creates on behalf of the namespace.
    pub fn root_owner(&self) -> Result<(u32, u32)> {
        Ok((self.map_uid(0)?, self.map_gid(0)?))
    }

    fn map(mappings: &[IdMapping], id: u32, what: &str) -> Result<u32> {
        if mappings.is_empty() {
            return Ok(id);
        }
        mappings
            .iter()
            .find_map(|mapping| mapping.translate(id))
            .ok_or_else(|| {
                StoreError::invalid_input(format!("{what} {id} is not covered by any mapping"))
            })
    }
}

/// Parse a list of `N:H:S` strings.
pub fn parse_mappings<S: AsRef<str>>(values: &[S]) -> Result<Vec<IdMapping>> {
    values.iter().map(|value| value.as_ref().parse()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_parse_mapping() {
        let mapping: IdMapping = "0:100000:65536".parse().unwrap();
        assert_eq!(
            mapping,
            IdMapping {
                namespace_id: 0,
                host_id: 100000,
                size: 65536
            }
        );
        assert_eq!(mapping.to_string(), "0:100000:65536");
    }

    #[test]
    fn test_parse_mapping_rejects_garbage() {
        for bad in [
            "",
            "1:2",
            "1:2:3:4",
            "a:b:c",
            "-1:0:1",
            "0:0:0",
            "0:4294967295:2",
        ] {
            let err = bad.parse::<IdMapping>().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput, "{bad}");
        }
    }

    #[test]
    fn test_identity_without_mappings() {
        let mapper = IdMapper::default();
        assert!(mapper.is_identity());
        assert_eq!(mapper.namespace(), None);
        assert_eq!(mapper.map_uid(1234).unwrap(), 1234);
        assert_eq!(mapper.map_gid(0).unwrap(), 0);
    }

    #[test]
    fn test_translation_through_ranges() {
        let mapper = IdMapper::new(
            parse_mappings(&["0:4294967294:1", "1:1:4294967293"]).unwrap(),
            parse_mappings(&["0:100000:1000"]).unwrap(),
        );
        assert_eq!(mapper.map_uid(0).unwrap(), 4294967294);
        assert_eq!(mapper.map_uid(1000).unwrap(), 1000);
        assert_eq!(mapper.map_gid(0).unwrap(), 100000);
        assert_eq!(mapper.map_gid(999).unwrap(), 100999);
        assert_eq!(mapper.root_owner().unwrap(), (4294967294, 100000));

        let err = mapper.map_gid(1000).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_namespace_tags_the_mappings() {
        let mapped = |uid: &str, gid: &str| {
            IdMapper::new(
                parse_mappings(&[uid]).unwrap(),
                parse_mappings(&[gid]).unwrap(),
            )
        };
        let tag = mapped("0:100000:65536", "0:100000:65536").namespace().unwrap();
        assert!(tag.starts_with("namespaced-"), "{tag}");
        assert_eq!(
            mapped("0:100000:65536", "0:100000:65536").namespace(),
            Some(tag.clone())
        );
        assert_ne!(
            mapped("0:200000:65536", "0:100000:65536").namespace(),
            Some(tag.clone())
        );
        // uid and gid mappings are not interchangeable
        assert_ne!(
            mapped("0:100000:1", "0:200000:1").namespace(),
            mapped("0:200000:1", "0:100000:1").namespace()
        );
    }
}
