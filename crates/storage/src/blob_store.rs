//! The backing key-value blob store.
//!
//! Iteration over raw persistence is an external dependency of this
//! engine, not part of its core: implementors own durability, replication
//! and on-disk format. [`BlobStore`] is the seam the slab cache talks to.

use rustc_hash::FxHashMap;
use slabtree_core::{Address, SlabId};
use std::collections::HashSet;

/// A keyed, batched byte blob store.
///
/// `commit` on the slab cache calls `put_batch` once and `delete_batch`
/// once per address, so an implementation only needs atomicity within a
/// single call, not across calls.
pub trait BlobStore {
    /// Fetch the raw bytes for `id`, if present.
    fn get(&self, id: SlabId) -> Option<Vec<u8>>;

    /// Write a batch of `(id, bytes)` pairs. All ids in one call share an
    /// address; the store must make the whole batch visible atomically.
    fn put_batch(&mut self, address: Address, writes: Vec<(SlabId, Vec<u8>)>);

    /// Delete a batch of ids sharing an address, atomically with respect
    /// to that address.
    fn delete_batch(&mut self, address: Address, deletes: Vec<SlabId>);

    /// Iterate every id currently present in the store. Order is
    /// unspecified.
    fn iter(&self) -> Vec<SlabId>;
}

/// A reference [`BlobStore`] backed by an in-process hash map.
///
/// Useful for tests, for the batch builder's scratch space, and as a
/// template for a real on-disk implementation: it implements exactly the
/// contract `SlabStorage` relies on and nothing more.
#[derive(Default)]
pub struct InMemoryBlobStore {
    entries: FxHashMap<SlabId, Vec<u8>>,
}

impl InMemoryBlobStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently persisted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl BlobStore for InMemoryBlobStore {
    fn get(&self, id: SlabId) -> Option<Vec<u8>> {
        self.entries.get(&id).cloned()
    }

    fn put_batch(&mut self, _address: Address, writes: Vec<(SlabId, Vec<u8>)>) {
        for (id, bytes) in writes {
            self.entries.insert(id, bytes);
        }
    }

    fn delete_batch(&mut self, _address: Address, deletes: Vec<SlabId>) {
        let deletes: HashSet<SlabId> = deletes.into_iter().collect();
        for id in deletes {
            self.entries.remove(&id);
        }
    }

    fn iter(&self) -> Vec<SlabId> {
        self.entries.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let mut store = InMemoryBlobStore::new();
        let id = SlabId::new(Address::from_u64(1), 1);
        store.put_batch(id.address, vec![(id, vec![1, 2, 3])]);
        assert_eq!(store.get(id), Some(vec![1, 2, 3]));
    }

    #[test]
    fn delete_removes_entry() {
        let mut store = InMemoryBlobStore::new();
        let id = SlabId::new(Address::from_u64(1), 1);
        store.put_batch(id.address, vec![(id, vec![9])]);
        store.delete_batch(id.address, vec![id]);
        assert_eq!(store.get(id), None);
        assert!(store.is_empty());
    }
}
