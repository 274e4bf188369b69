//! A shared on-disk store of layered container root filesystems.
//!
//! Base images (local tarballs and directories, or anything the containers
//! image proxy can reach) are unpacked layer by layer into immutable volumes
//! named by ChainID, so images sharing a prefix share its volumes. Bundles
//! are writable snapshots of a top volume with an optional disk quota.
//! Dependency records track which volumes each bundle and base image needs;
//! the garbage collector reclaims the rest. Every mutation runs under
//! cross-process locks from a [`locksmith::Locksmith`].
//!
//! Most users want [`store::Store`].

pub mod bundle;
pub mod cleaner;
pub mod creator;
pub mod deleter;
pub mod dependency;
pub mod digest;
pub mod error;
pub mod fetcher;
pub mod gc;
pub mod idmap;
pub mod locksmith;
pub mod measurer;
pub mod metrics;
pub mod puller;
pub mod store;
pub mod unpack;
pub mod volume;


pub use error::{ErrorKind, FetchErrorKind, Result, StoreError};
pub use store::{Store, StoreConfig};
