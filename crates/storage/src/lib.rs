//! Slab wire format, the Storable codec, and the cached slab storage
//! engine atop a pluggable [`BlobStore`].
//!
//! This crate knows how to turn a [`Slab`] into bytes and back, and how
//! to cache, batch, and commit those bytes through a backing key-value
//! store. It has no notion of a B+-tree: split/merge/rebalance policy
//! and digester routing live one layer up, in `slabtree-containers`.

#![warn(missing_docs)]

mod blob_store;
mod cache;
mod slab;
mod storable;

pub use blob_store::{BlobStore, InMemoryBlobStore};
pub use cache::{SlabHandle, SlabStorage};
pub use slab::{ArrayChild, CollisionBody, CollisionGroup, Decoded, GroupNode, MapChild, MapElement, Slab};
pub use storable::{SpillDecision, Storable, POINTER_ENCODED_LEN};
