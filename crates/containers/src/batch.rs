//! Bottom-up batch construction (C8).
//!
//! §4.6 names two correctness postconditions for a batch builder: (i)
//! the resulting tree obeys §3's invariants end-to-end, and (ii) for any
//! input it is byte-identical to performing `append`/`set` of the same
//! sequence on a fresh container. Postcondition (ii) is the binding one
//! — it pins the exact split/merge/rebalance decisions (and therefore
//! the exact `SlabId` allocation order) a from-scratch bulk loader would
//! have to reproduce bit-for-bit to be a legal alternative implementation.
//!
//! `Array::append`/`Map::set` already make exactly those decisions one
//! element at a time via [`crate::policy`], so this module builds the
//! tree by replaying the same sequence through the ordinary incremental
//! path rather than duplicating the split-boundary/rebalance arithmetic
//! in a second, independently-written packer that could drift from it.
//! Postcondition (ii) then holds trivially (it is the same code path),
//! and (i) holds because `Array`/`Map` maintain §3's invariants after
//! every single mutation. See `DESIGN.md` for why an independent
//! greedy-fill packer was not pursued.

use crate::typeinfo::{ElementCodec, MapKey, TypeInfo};
use crate::{Array, Map, StorageHandle};
use slabtree_core::Result;
use slabtree_storage::BlobStore;

/// Build a new [`Array`] from `values`, in order.
pub fn batch_build_array<B, V, TI>(
    storage: StorageHandle<B>,
    type_info: TI,
    values: impl IntoIterator<Item = V>,
) -> Result<Array<B, V, TI>>
where
    B: BlobStore,
    V: ElementCodec,
    TI: TypeInfo,
{
    let mut array = Array::new(storage, type_info);
    for v in values {
        array.append(v)?;
    }
    Ok(array)
}

/// Build a new [`Map`] from `entries`, in order. Later entries for an
/// already-seen key overwrite earlier ones, matching `Map::set`.
pub fn batch_build_map<B, K, V, TI>(
    storage: StorageHandle<B>,
    type_info: TI,
    entries: impl IntoIterator<Item = (K, V)>,
) -> Result<Map<B, K, V, TI>>
where
    B: BlobStore,
    K: MapKey,
    V: ElementCodec,
    TI: TypeInfo,
{
    let mut map = Map::new(storage, type_info);
    for (k, v) in entries {
        map.set(k, v)?;
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_handle;
    use slabtree_core::{Address, StorageConfig};
    use slabtree_storage::InMemoryBlobStore;

    #[derive(Clone, Debug, PartialEq, Eq)]
    struct U64(u64);

    impl ElementCodec for U64 {
        fn encode(&self) -> Vec<u8> {
            self.0.to_be_bytes().to_vec()
        }
        fn decode(bytes: &[u8]) -> Result<Self> {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(bytes);
            Ok(U64(u64::from_be_bytes(buf)))
        }
    }

    #[derive(Clone, Debug, PartialEq)]
    struct Unit;

    impl TypeInfo for Unit {
        fn encode(&self) -> Vec<u8> {
            Vec::new()
        }
        fn decode(_bytes: &[u8]) -> Result<Self> {
            Ok(Unit)
        }
    }

    fn new_storage(target_threshold: u32) -> StorageHandle<InMemoryBlobStore> {
        storage_handle(slabtree_storage::SlabStorage::new(
            Address::from_u64(1),
            StorageConfig::new(target_threshold, 0),
            InMemoryBlobStore::new(),
            0,
        ))
    }

    #[test]
    fn batch_array_matches_incremental_append() {
        let values: Vec<U64> = (0..500u64).map(U64).collect();

        let batched_storage = new_storage(256);
        let batched = batch_build_array(batched_storage.clone(), Unit, values.clone()).unwrap();
        batched.commit().unwrap();

        let incremental_storage = new_storage(256);
        let mut incremental: Array<_, U64, Unit> = Array::new(incremental_storage.clone(), Unit);
        for v in values {
            incremental.append(v).unwrap();
        }
        incremental.commit().unwrap();

        assert_eq!(batched.root_id(), incremental.root_id());
        assert_eq!(
            snapshot(&batched_storage),
            snapshot(&incremental_storage),
            "batch_build_array must be byte-identical to sequential append"
        );
    }

    #[test]
    fn batch_map_matches_incremental_set() {
        let entries: Vec<(U64, U64)> = (0..300u64).map(|i| (U64(i), U64(i * 7))).collect();

        let batched_storage = new_storage(256);
        let batched = batch_build_map(batched_storage.clone(), Unit, entries.clone()).unwrap();
        batched.commit().unwrap();

        let incremental_storage = new_storage(256);
        let mut incremental: Map<_, U64, U64, Unit> = Map::new(incremental_storage.clone(), Unit);
        for (k, v) in entries {
            incremental.set(k, v).unwrap();
        }
        incremental.commit().unwrap();

        assert_eq!(batched.root_id(), incremental.root_id());
        assert_eq!(
            snapshot(&batched_storage),
            snapshot(&incremental_storage),
            "batch_build_map must be byte-identical to sequential set"
        );
    }

    /// Every slab's encoded bytes, sorted by id, for whole-tree byte
    /// comparison between two independently built storages.
    fn snapshot(storage: &StorageHandle<InMemoryBlobStore>) -> Vec<(slabtree_core::SlabId, Vec<u8>)> {
        let s = storage.borrow();
        let mut out: Vec<_> = s.backing_snapshot().into_iter().collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }
}
