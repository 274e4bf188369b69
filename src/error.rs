//! Error types for the layer store.
//!
//! Every fallible library operation returns [`Result<T>`], an alias for
//! `Result<T, StoreError>`. Variants follow the failure classes callers need to
//! tell apart:
//!
//! - **Input errors**: [`InvalidInput`], rejected before the store is touched
//! - **Fetch errors**: [`Fetch`], carrying a [`FetchErrorKind`] so the CLI can
//!   give an actionable message
//! - **Integrity errors**: [`Integrity`], a blob or layer digest mismatch
//! - **Resource errors**: [`Io`], [`Quota`], [`Command`]; see
//!   [`StoreError::kind`] for disk-full and permission classification
//! - **Concurrency errors**: [`Lock`]
//! - **Entity errors**: [`AlreadyExists`], [`NotFound`]
//! - **Aggregates**: [`Collect`], one entry per volume the collector could not
//!   reclaim
//!
//! [`InvalidInput`]: StoreError::InvalidInput
//! [`Fetch`]: StoreError::Fetch
//! [`Integrity`]: StoreError::Integrity
//! [`Io`]: StoreError::Io
//! [`Quota`]: StoreError::Quota
//! [`Command`]: StoreError::Command
//! [`Lock`]: StoreError::Lock
//! [`AlreadyExists`]: StoreError::AlreadyExists
//! [`NotFound`]: StoreError::NotFound
//! [`Collect`]: StoreError::Collect

use std::{fmt, io};

use rustix::io::Errno;

/// Result type alias for operations that may return a StoreError.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Why a fetcher could not provide an image or blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// The image or blob does not exist at the source.
    NotFound,
    /// The source rejected our credentials (or we had none).
    Unauthorized,
    /// The registry only speaks plain HTTP or has an untrusted certificate.
    InsecureRegistry,
    /// Anything else: network failure, malformed manifest, proxy failure.
    Other,
}

/// Stable classification of a [`StoreError`], used by the CLI to choose a
/// message and exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    Fetch(FetchErrorKind),
    Integrity,
    DiskFull,
    PermissionDenied,
    Resource,
    Quota,
    Lock,
    AlreadyExists,
    NotFound,
    Collect,
}

/// One volume the garbage collector failed to reclaim.
#[derive(Debug)]
pub struct CollectFailure {
    pub volume: String,
    pub error: StoreError,
}

impl fmt::Display for CollectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.volume, self.error)
    }
}

fn join_failures(failures: &[CollectFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Error types for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Malformed caller input (ids, mappings, limits).
    #[error("{0}")]
    InvalidInput(String),

    /// The fetcher could not resolve the image or stream a blob.
    #[error("fetching `{reference}`: {message}")]
    Fetch {
        kind: FetchErrorKind,
        reference: String,
        message: String,
    },

    /// Downloaded or unpacked content does not hash to its advertised digest.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    /// I/O error with a description of what we were doing.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The privileged quota helper rejected the request.
    #[error("applying disk quota: {0}")]
    Quota(String),

    /// An external tool (btrfs, the quota helper) exited unsuccessfully.
    #[error("running `{command}`: {message}")]
    Command { command: String, message: String },

    /// A lock could not be acquired or released.
    #[error("lock `{key}`: {source}")]
    Lock {
        key: String,
        #[source]
        source: io::Error,
    },

    /// The entity already exists.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// The entity does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Garbage collection could not reclaim some volumes.
    #[error("garbage collection failed: {}", join_failures(.0))]
    Collect(Vec<CollectFailure>),

    /// Metadata could not be (de)serialized.
    #[error("metadata at {path}: {source}")]
    Metadata {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        StoreError::InvalidInput(message.into())
    }

    pub fn fetch(
        kind: FetchErrorKind,
        reference: impl Into<String>,
        message: impl fmt::Display,
    ) -> Self {
        StoreError::Fetch {
            kind,
            reference: reference.into(),
            message: message.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::InvalidInput(_) => ErrorKind::InvalidInput,
            StoreError::Fetch { kind, .. } => ErrorKind::Fetch(*kind),
            StoreError::Integrity { .. } => ErrorKind::Integrity,
            StoreError::Io { source, .. } => match Errno::from_io_error(source) {
                Some(Errno::NOSPC) | Some(Errno::DQUOT) => ErrorKind::DiskFull,
                Some(Errno::ACCESS) | Some(Errno::PERM) => ErrorKind::PermissionDenied,
                _ => ErrorKind::Resource,
            },
            StoreError::Quota(_) => ErrorKind::Quota,
            StoreError::Command { .. } | StoreError::Metadata { .. } => ErrorKind::Resource,
            StoreError::Lock { .. } => ErrorKind::Lock,
            StoreError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::Collect(_) => ErrorKind::Collect,
        }
    }
}

/// Attach a description to an `io::Result`, turning it into a store [`Result`].
pub(crate) trait IoContext<T> {
    fn io_context<C: Into<String>>(self, context: impl FnOnce() -> C) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context<C: Into<String>>(self, context: impl FnOnce() -> C) -> Result<T> {
        self.map_err(|source| StoreError::Io {
            context: context().into(),
            source,
        })
    }
}

impl<T> IoContext<T> for rustix::io::Result<T> {
    fn io_context<C: Into<String>>(self, context: impl FnOnce() -> C) -> Result<T> {
        self.map_err(|errno| StoreError::Io {
            context: context().into(),
            source: errno.into(),
        })
    }
}

/// Treat `NotFound` as an absent value rather than an error.
pub(crate) trait NotFoundFilter<T> {
    fn filter_not_found(self) -> io::Result<Option<T>>;
}

impl<T> NotFoundFilter<T> for io::Result<T> {
    fn filter_not_found(self) -> io::Result<Option<T>> {
        match self {
            Ok(result) => Ok(Some(result)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}
