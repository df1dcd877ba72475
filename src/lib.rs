//! # slabtree
//!
//! A scalable persistent container library: an ordered indexed sequence
//! ([`Array`]) and an ordered associative map ([`Map`]), both built atop
//! a slab-addressed, copy-on-write, high-fanout B+-tree suitable as the
//! on-chain storage layer of a smart-contract runtime.
//!
//! Every mutation is deterministic — equal inputs yield byte-identical
//! persisted layout — and values may themselves be other containers
//! (composition). Oversized leaf elements spill to their own slab,
//! referenced by [`SlabId`].
//!
//! # Quick start
//!
//! ```
//! use slabtree::{storage_handle, Array, ElementCodec, InMemoryBlobStore, SlabStorage, TypeInfo};
//! use slabtree_core::{Address, Result, StorageConfig};
//!
//! #[derive(Clone, Debug, PartialEq)]
//! struct Count(u64);
//!
//! impl ElementCodec for Count {
//!     fn encode(&self) -> Vec<u8> {
//!         self.0.to_be_bytes().to_vec()
//!     }
//!     fn decode(bytes: &[u8]) -> Result<Self> {
//!         let mut buf = [0u8; 8];
//!         buf.copy_from_slice(bytes);
//!         Ok(Count(u64::from_be_bytes(buf)))
//!     }
//! }
//!
//! #[derive(Clone, Debug, PartialEq)]
//! struct NoTypeInfo;
//!
//! impl TypeInfo for NoTypeInfo {
//!     fn encode(&self) -> Vec<u8> {
//!         Vec::new()
//!     }
//!     fn decode(_bytes: &[u8]) -> Result<Self> {
//!         Ok(NoTypeInfo)
//!     }
//! }
//!
//! # fn main() -> Result<()> {
//! let storage = storage_handle(SlabStorage::new(
//!     Address::from_u64(1),
//!     StorageConfig::default(),
//!     InMemoryBlobStore::new(),
//!     0,
//! ));
//! let mut array = Array::new(storage, NoTypeInfo);
//! array.append(Count(42))?;
//! assert_eq!(array.get(0)?, Count(42));
//! array.commit()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Components
//!
//! | Crate | Responsibility |
//! |-------|----------------|
//! | `slabtree-core` | `SlabId`/`Address`, `Header`, `Error`, `StorageConfig`. |
//! | `slabtree-storage` | Slab wire codec, `Storable` inline/spill codec, the cached `SlabStorage` engine. |
//! | `slabtree-containers` | `Array`, `Map`, the key digester, the structural validator, deep-copy/deep-remove, and the batch builder. |
//!
//! Only this crate's re-exported surface is meant for downstream use;
//! the member crates are path dependencies of this one, not separately
//! published.

pub use slabtree_containers::*;
pub use slabtree_core::{
    Address, Error, Header, Result, SlabId, StorageConfig, ThresholdGuard,
    DEFAULT_TARGET_THRESHOLD,
};
pub use slabtree_storage::{
    ArrayChild, BlobStore, CollisionBody, CollisionGroup, Decoded, GroupNode, InMemoryBlobStore,
    MapChild, MapElement, Slab, SlabHandle, SlabStorage, SpillDecision, Storable,
    POINTER_ENCODED_LEN,
};
