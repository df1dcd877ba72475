//! Shared identity, sizing configuration, and error types for the
//! slabtree storage and container crates.
//!
//! This crate has no notion of trees, digesters, or wire encoding — it
//! only fixes the vocabulary ([`SlabId`], [`Header`], [`StorageConfig`],
//! [`Error`]) that the storage and container layers build on, so that
//! both can depend on it without depending on each other.

#![warn(missing_docs)]

mod config;
mod error;
mod header;
mod slab_id;

pub use config::{StorageConfig, ThresholdGuard, DEFAULT_TARGET_THRESHOLD};
pub use error::{Error, Result};
pub use header::Header;
pub use slab_id::{Address, SlabId};
