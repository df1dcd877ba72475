//! The cached slab storage engine (C3).
//!
//! `SlabStorage` sits between the container trees and a [`BlobStore`]:
//! it issues ids, decodes and caches slabs on first touch, and defers
//! all writes until `commit()`. Per the single-threaded cooperative
//! model this engine targets (see the crate-level docs), the cache uses
//! plain interior mutability (`RefCell`) rather than locking — a
//! multi-threaded embedder is responsible for serializing access to one
//! `SlabStorage` externally.

use crate::blob_store::BlobStore;
use crate::slab::Slab;
use rustc_hash::{FxHashMap, FxHashSet};
use slabtree_core::{Address, Error, Result, SlabId, StorageConfig};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, trace};

/// A shared, mutable handle to a cached slab.
///
/// Every `retrieve` of the same id returns a clone of the same `Rc`, so
/// mutation through one handle is visible to every other holder —
/// callers must not retain a handle across an operation that could have
/// replaced or deleted the underlying slab (e.g. a sibling split).
pub type SlabHandle = Rc<RefCell<Slab>>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum DirtyKind {
    /// Never persisted; `remove` can just drop it, no tombstone needed.
    New,
    /// Already committed at least once; `remove` must record a
    /// tombstone so the next commit deletes it from the backing store.
    Existing,
}

/// The in-memory slab cache over a [`BlobStore`] for one [`Address`].
pub struct SlabStorage<B: BlobStore> {
    address: Address,
    config: StorageConfig,
    backing: B,
    next_index: RefCell<u64>,
    cache: RefCell<FxHashMap<SlabId, SlabHandle>>,
    dirty: RefCell<FxHashMap<SlabId, DirtyKind>>,
    deleted: RefCell<FxHashSet<SlabId>>,
}

impl<B: BlobStore> SlabStorage<B> {
    /// Open a slab storage for `address` over `backing`, starting the
    /// id counter at `next_index` (pass `0` for a brand-new address).
    pub fn new(address: Address, config: StorageConfig, backing: B, next_index: u64) -> Self {
        SlabStorage {
            address,
            config,
            backing,
            next_index: RefCell::new(next_index.max(1)),
            cache: RefCell::new(FxHashMap::default()),
            dirty: RefCell::new(FxHashMap::default()),
            deleted: RefCell::new(FxHashSet::default()),
        }
    }

    /// The address this storage issues ids for.
    pub fn address(&self) -> Address {
        self.address
    }

    /// The sizing configuration in force for this storage.
    pub fn config(&self) -> StorageConfig {
        self.config
    }

    /// Issue a fresh id for this storage's address. Never returns the
    /// sentinel.
    pub fn generate_id(&self) -> SlabId {
        let mut next = self.next_index.borrow_mut();
        let index = *next;
        *next += 1;
        let id = SlabId::new(self.address, index);
        debug_assert!(!id.is_sentinel(), "generated index must never be zero");
        trace!(?id, "generated slab id");
        id
    }

    /// Fetch a live handle to `id`, decoding and caching it from the
    /// backing store on first touch.
    pub fn retrieve(&self, id: SlabId) -> Result<SlabHandle> {
        if let Some(handle) = self.cache.borrow().get(&id) {
            return Ok(handle.clone());
        }
        if self.deleted.borrow().contains(&id) {
            return Err(Error::SlabNotFound { id });
        }
        let bytes = self
            .backing
            .get(id)
            .ok_or(Error::SlabNotFound { id })?;
        let decoded = Slab::decode(id, &bytes)?;
        let handle = Rc::new(RefCell::new(decoded.slab));
        self.cache.borrow_mut().insert(id, handle.clone());
        Ok(handle)
    }

    /// Record `slab` as dirty in the cache. No I/O happens until
    /// `commit`.
    pub fn store(&self, id: SlabId, slab: Slab) -> SlabHandle {
        let handle = Rc::new(RefCell::new(slab));
        self.cache.borrow_mut().insert(id, handle.clone());
        let was_pending_delete = self.deleted.borrow_mut().remove(&id);
        let mut dirty = self.dirty.borrow_mut();
        let kind = if let Some(existing) = dirty.get(&id) {
            *existing
        } else if was_pending_delete || self.backing.get(id).is_some() {
            // Already persisted at least once (possibly pending
            // deletion from an earlier op in this same batch).
            DirtyKind::Existing
        } else {
            DirtyKind::New
        };
        dirty.insert(id, kind);
        handle
    }

    /// Record `id` as deleted. If it was dirty-new (never committed),
    /// it is simply dropped with no tombstone.
    pub fn remove(&self, id: SlabId) {
        self.cache.borrow_mut().remove(&id);
        let was_new = matches!(self.dirty.borrow_mut().remove(&id), Some(DirtyKind::New));
        if !was_new {
            self.deleted.borrow_mut().insert(id);
        }
    }

    /// Number of live slabs: committed entries still on the backing
    /// store, plus dirty-new entries, minus deletions, all as observed
    /// right now (before the next `commit`).
    pub fn count(&self) -> usize {
        let mut ids: FxHashSet<SlabId> = self.backing.iter().into_iter().collect();
        for id in self.dirty.borrow().keys() {
            ids.insert(*id);
        }
        for id in self.deleted.borrow().iter() {
            ids.remove(id);
        }
        ids.len()
    }

    /// Flush dirty slabs and deletions to the backing store, then clear
    /// the dirty set. The write set for this address is handed to the
    /// backing store in one batch, per its atomic-per-address contract.
    pub fn commit(&mut self) -> Result<()> {
        let dirty_ids: Vec<SlabId> = self.dirty.borrow().keys().copied().collect();
        let mut writes = Vec::with_capacity(dirty_ids.len());
        for id in &dirty_ids {
            let handle = self
                .cache
                .borrow()
                .get(id)
                .cloned()
                .ok_or(Error::SlabNotFound { id: *id })?;
            let bytes = handle.borrow().encode(None);
            writes.push((*id, bytes));
        }
        let deletes: Vec<SlabId> = self.deleted.borrow().iter().copied().collect();
        debug!(
            address = %self.address,
            writes = writes.len(),
            deletes = deletes.len(),
            "committing slab storage"
        );
        if !writes.is_empty() {
            self.backing.put_batch(self.address, writes);
        }
        if !deletes.is_empty() {
            self.backing.delete_batch(self.address, deletes);
        }
        self.dirty.borrow_mut().clear();
        self.deleted.borrow_mut().clear();
        Ok(())
    }

    /// A full snapshot of every slab's persisted bytes, keyed by id, as
    /// currently visible on the backing store (i.e. as of the last
    /// `commit`/`commit_root`, ignoring anything still only dirty in the
    /// cache). Used by tests that compare two independently built
    /// storages for byte-identical layout (§8, property 6).
    pub fn backing_snapshot(&self) -> Vec<(SlabId, Vec<u8>)> {
        self.backing
            .iter()
            .into_iter()
            .filter_map(|id| self.backing.get(id).map(|bytes| (id, bytes)))
            .collect()
    }

    /// Decode just the extra-data preamble carried by `id`'s persisted
    /// bytes, bypassing the slab cache. Used by a container's `open` to
    /// recover its `TypeInfo` without otherwise disturbing the cache.
    /// Only the backing store is consulted, so this only sees what the
    /// most recent `commit`/`commit_root` wrote: a root not yet
    /// committed in this process has no preamble to read back yet.
    pub fn read_extra_data(&self, id: SlabId) -> Result<Option<Vec<u8>>> {
        let bytes = self.backing.get(id).ok_or(Error::SlabNotFound { id })?;
        let decoded = Slab::decode(id, &bytes)?;
        Ok(decoded.extra_data)
    }

    /// Encode and commit `root_id` as a container root, carrying
    /// `extra_data` (the opaque `TypeInfo` preamble) in its own entry
    /// rather than the plain encoding `commit` would otherwise use for
    /// it. Call this after `commit` has flushed every other dirty slab,
    /// or combine by calling this first and excluding `root_id` from a
    /// subsequent plain commit.
    pub fn commit_root(&mut self, root_id: SlabId, extra_data: &[u8]) -> Result<()> {
        let handle = self
            .cache
            .borrow()
            .get(&root_id)
            .cloned()
            .ok_or(Error::SlabNotFound { id: root_id })?;
        let bytes = handle.borrow().encode(Some(extra_data));
        self.backing
            .put_batch(self.address, vec![(root_id, bytes)]);
        self.dirty.borrow_mut().remove(&root_id);
        self.deleted.borrow_mut().remove(&root_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::InMemoryBlobStore;
    use crate::storable::Storable;

    fn addr() -> Address {
        Address::from_u64(1)
    }

    #[test]
    fn generate_id_is_monotonic_and_never_sentinel() {
        let storage = SlabStorage::new(addr(), StorageConfig::default(), InMemoryBlobStore::new(), 0);
        let a = storage.generate_id();
        let b = storage.generate_id();
        assert!(b.index > a.index);
        assert!(!a.is_sentinel());
    }

    #[test]
    fn store_then_retrieve_returns_shared_handle() {
        let storage = SlabStorage::new(addr(), StorageConfig::default(), InMemoryBlobStore::new(), 0);
        let id = storage.generate_id();
        let slab = Slab::ArrayData {
            id,
            next: SlabId::sentinel(),
            elements: vec![Storable::Inline(vec![1])],
        };
        let handle = storage.store(id, slab);
        handle.borrow_mut();
        let retrieved = storage.retrieve(id).unwrap();
        assert!(Rc::ptr_eq(&handle, &retrieved));
    }

    #[test]
    fn remove_of_dirty_new_id_drops_without_tombstone() {
        let mut storage = SlabStorage::new(addr(), StorageConfig::default(), InMemoryBlobStore::new(), 0);
        let id = storage.generate_id();
        storage.store(
            id,
            Slab::ArrayData {
                id,
                next: SlabId::sentinel(),
                elements: vec![],
            },
        );
        storage.remove(id);
        storage.commit().unwrap();
        assert_eq!(storage.count(), 0);
        assert!(storage.retrieve(id).is_err());
    }

    #[test]
    fn commit_then_retrieve_round_trips_through_backing_store() {
        let mut storage = SlabStorage::new(addr(), StorageConfig::default(), InMemoryBlobStore::new(), 0);
        let id = storage.generate_id();
        let slab = Slab::ArrayData {
            id,
            next: SlabId::sentinel(),
            elements: vec![Storable::Inline(vec![5, 6, 7])],
        };
        storage.store(id, slab.clone());
        storage.commit().unwrap();
        assert_eq!(storage.count(), 1);

        // Fresh storage over the same (now populated) backing store.
        let backing = std::mem::replace(&mut storage.backing, InMemoryBlobStore::new());
        let storage2 = SlabStorage::new(addr(), StorageConfig::default(), backing, 2);
        let handle = storage2.retrieve(id).unwrap();
        assert_eq!(*handle.borrow(), slab);
    }

    #[test]
    fn not_found_for_unknown_id() {
        let storage = SlabStorage::new(addr(), StorageConfig::default(), InMemoryBlobStore::new(), 0);
        let err = storage.retrieve(SlabId::new(addr(), 999)).unwrap_err();
        assert!(matches!(err, Error::SlabNotFound { .. }));
    }
}
