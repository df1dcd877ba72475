//! Array and Map B+-trees (C4, C5), the map key digester (C6), the
//! structural validator (C7), and the bottom-up batch builder (C8) atop
//! `slabtree-storage`'s slabs and cache.
//!
//! This crate owns everything the spec calls "the B+-tree rebalancing
//! discipline": split/merge/rebalance policy (shared by both trees via
//! [`policy`]), digest-based map routing, and the deep-copy/deep-remove
//! walks that keep the reference graph a tree. It knows nothing about
//! concrete value types — `ElementCodec`/`TypeInfo`/`MapKey` (see
//! [`typeinfo`]) are the seam application code plugs into.

#![warn(missing_docs)]

mod array;
mod batch;
mod codec;
mod deep;
mod digester;
mod map;
mod policy;
mod typeinfo;
mod util;
mod validator;

pub use array::{Array, ArrayIter};
pub use batch::{batch_build_array, batch_build_map};
pub use digester::Digester;
pub use map::{Map, MapIter};
pub use typeinfo::{ElementCodec, MapKey, TypeInfo};
pub use validator::{validate, ValidationReport};

use slabtree_storage::{BlobStore, SlabStorage};
use std::cell::RefCell;
use std::rc::Rc;

/// A shared handle to the slab storage cache a container is built over.
///
/// Every `Array`/`Map` instance sharing one address holds a clone of this
/// `Rc`, matching the spec's "single logical owner" model (§5): mutation
/// through one container is immediately visible through any other
/// sharing the same storage, and `commit()` is the caller's
/// responsibility, not automatic.
pub type StorageHandle<B> = Rc<RefCell<SlabStorage<B>>>;

/// Construct a fresh [`StorageHandle`] wrapping `storage`.
pub fn storage_handle<B: BlobStore>(storage: SlabStorage<B>) -> StorageHandle<B> {
    Rc::new(RefCell::new(storage))
}
