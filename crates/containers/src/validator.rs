//! Structural validator (C7).
//!
//! Walks every slab reachable from a container's root, checking each
//! invariant from §3 and the encode/decode round trip §4.7 calls out
//! explicitly:
//!
//! - a child header's recorded `size`/`count` agrees with a fresh
//!   re-encode of that child (§3 invariants 2 and 3);
//! - every non-root slab's encoded size sits in `[minThreshold,
//!   maxThreshold]`;
//! - array/map data is in the order §3 invariant 4 requires;
//! - every referenced `SlabId` resolves in storage, and no id is
//!   visited twice (§3 invariant 1: the reference graph is a tree);
//! - `encode -> decode -> re-encode` is byte-identical for every slab.
//!
//! This module knows nothing about `ElementCodec`/`TypeInfo` — it only
//! sees the slab-level structure `slabtree-storage` exposes, so one
//! `validate` call works for both `Array` and `Map` roots.

use slabtree_core::{Error, Result, SlabId, StorageConfig};
use slabtree_storage::{
    BlobStore, CollisionBody, CollisionGroup, GroupNode, MapElement, Slab, SlabStorage, Storable,
};
use std::collections::HashSet;

/// Summary of a successful [`validate`] walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValidationReport {
    /// Total number of distinct slabs reachable from the root (the root
    /// itself, plus every meta/data/Storable/collision slab beneath
    /// it). Nested container roots reached through a pointer `Storable`
    /// count once here but are not themselves descended into.
    pub slabs_visited: usize,
    /// The root's recursive element count (array elements, or map
    /// key/value pairs), as independently recomputed by the walk.
    pub count: u32,
    /// Root-to-leaf depth of the tree proper (meta/data slabs only),
    /// the root counted as depth 1. A single-leaf root is depth 1; one
    /// level of meta above data slabs is depth 2, and so on.
    pub depth: u32,
    /// Number of `ArrayMeta`/`MapMeta` slabs visited.
    pub meta_slabs: usize,
    /// Number of `ArrayData`/`MapData` slabs visited.
    pub data_slabs: usize,
}

/// Running counters accumulated across the whole walk, independent of
/// the per-subtree `(count, size, depth)` each recursive call returns.
#[derive(Default)]
struct WalkStats {
    meta_slabs: usize,
    data_slabs: usize,
}

/// Validate every invariant from §3 across the whole tree rooted at
/// `root`. Fails fast on the first violation found, via
/// `Error::Corruption` identifying the offending slab.
pub fn validate<B: BlobStore>(
    storage: &SlabStorage<B>,
    root: SlabId,
    config: StorageConfig,
) -> Result<ValidationReport> {
    let mut visited = HashSet::new();
    let mut stats = WalkStats::default();
    let (count, _size, depth) = walk(storage, root, config, true, &mut visited, &mut stats)?;
    Ok(ValidationReport {
        slabs_visited: visited.len(),
        count,
        depth,
        meta_slabs: stats.meta_slabs,
        data_slabs: stats.data_slabs,
    })
}

/// Visit one slab, recursing into its children/elements, and return its
/// recomputed `(count, size, depth)`. `is_root` suppresses the
/// size-envelope check (root slabs may be smaller than `minThreshold`,
/// §3 invariant 2). `depth` counts meta/data levels only, root at 1.
fn walk<B: BlobStore>(
    storage: &SlabStorage<B>,
    id: SlabId,
    config: StorageConfig,
    is_root: bool,
    visited: &mut HashSet<SlabId>,
    stats: &mut WalkStats,
) -> Result<(u32, u32, u32)> {
    if !visited.insert(id) {
        return Err(corrupt(id, "slab id referenced more than once (tree-shape invariant)"));
    }
    let handle = storage.retrieve(id)?;
    let slab = handle.borrow().clone();

    let encoded = slab.encode(None);
    let redecoded = Slab::decode(id, &encoded)?;
    if redecoded.slab.encode(None) != encoded {
        return Err(corrupt(id, "encode -> decode -> re-encode is not byte-identical"));
    }

    let size = 2 + slab.body_size(false);
    if !is_root && !(config.min_threshold()..=config.max_threshold()).contains(&size) {
        return Err(corrupt(
            id,
            &format!(
                "slab size {size} outside [{}, {}]",
                config.min_threshold(),
                config.max_threshold()
            ),
        ));
    }

    let (count, depth) = match &slab {
        Slab::ArrayData { elements, .. } => {
            stats.data_slabs += 1;
            for e in elements {
                walk_storable(storage, e, config, visited, stats)?;
            }
            (elements.len() as u32, 1)
        }
        Slab::ArrayMeta { children, .. } => {
            stats.meta_slabs += 1;
            let mut total = 0u32;
            let mut max_child_depth = 0u32;
            for c in children {
                let (actual_count, actual_size, child_depth) =
                    walk(storage, c.id, config, false, visited, stats)?;
                check_header(c.id, c.count, actual_count, c.size, actual_size)?;
                total += actual_count;
                max_child_depth = max_child_depth.max(child_depth);
            }
            if slab.count() != total {
                return Err(corrupt(id, "meta count is not the sum of children counts"));
            }
            (total, max_child_depth + 1)
        }
        Slab::MapData { elements, .. } => {
            stats.data_slabs += 1;
            let mut prev: Option<u64> = None;
            let mut total = 0u32;
            for e in elements {
                let d = e.digest0();
                if prev.is_some_and(|p| d <= p) {
                    return Err(corrupt(id, "map data elements not strictly increasing by digest0"));
                }
                prev = Some(d);
                total += walk_element(storage, e, config, visited, stats)?;
            }
            (total, 1)
        }
        Slab::MapMeta { children, .. } => {
            stats.meta_slabs += 1;
            let mut prev: Option<u64> = None;
            let mut total = 0u32;
            let mut max_child_depth = 0u32;
            for c in children {
                if prev.is_some_and(|p| c.first_digest <= p) {
                    return Err(corrupt(id, "map meta children not strictly increasing by first_digest"));
                }
                prev = Some(c.first_digest);
                let (actual_count, actual_size, child_depth) =
                    walk(storage, c.header.id, config, false, visited, stats)?;
                check_header(c.header.id, c.header.count, actual_count, c.header.size, actual_size)?;
                total += actual_count;
                max_child_depth = max_child_depth.max(child_depth);
            }
            if slab.count() != total {
                return Err(corrupt(id, "meta count is not the sum of children counts"));
            }
            (total, max_child_depth + 1)
        }
        Slab::Storable { .. } => (0, 1),
        Slab::MapCollision { body, .. } => {
            let total = walk_body(storage, body, config, visited, stats)?;
            if total != body.count() {
                return Err(corrupt(id, "collision body count disagrees with CollisionBody::count()"));
            }
            (total, 1)
        }
    };
    Ok((count, size, depth))
}

fn check_header(
    id: SlabId,
    declared_count: u32,
    actual_count: u32,
    declared_size: u32,
    actual_size: u32,
) -> Result<()> {
    if declared_count != actual_count {
        return Err(corrupt(
            id,
            &format!("header count {declared_count} disagrees with recomputed {actual_count}"),
        ));
    }
    if declared_size != actual_size {
        return Err(corrupt(
            id,
            &format!("header size {declared_size} disagrees with re-encoded length {actual_size}"),
        ));
    }
    Ok(())
}

fn walk_storable<B: BlobStore>(
    storage: &SlabStorage<B>,
    storable: &Storable,
    config: StorageConfig,
    visited: &mut HashSet<SlabId>,
    stats: &mut WalkStats,
) -> Result<()> {
    let Storable::Pointer(id) = storable else {
        return Ok(());
    };
    let handle = storage.retrieve(*id)?;
    let is_storable_slab = matches!(&*handle.borrow(), Slab::Storable { .. });
    if is_storable_slab {
        // A spilled leaf payload: part of this tree.
        walk(storage, *id, config, false, visited, stats)?;
    } else {
        // The root of a separate container held as a value (§3
        // invariant 1): verify presence and that it is not shared with
        // this tree, but do not descend into its own structure.
        if !visited.insert(*id) {
            return Err(corrupt(*id, "nested container root id collides with this tree"));
        }
    }
    Ok(())
}

fn walk_element<B: BlobStore>(
    storage: &SlabStorage<B>,
    e: &MapElement,
    config: StorageConfig,
    visited: &mut HashSet<SlabId>,
    stats: &mut WalkStats,
) -> Result<u32> {
    match e {
        MapElement::Single { key, value, .. } => {
            walk_storable(storage, key, config, visited, stats)?;
            walk_storable(storage, value, config, visited, stats)?;
            Ok(1)
        }
        MapElement::Collision { group, .. } => walk_group(storage, group, config, visited, stats),
    }
}

fn walk_group<B: BlobStore>(
    storage: &SlabStorage<B>,
    group: &CollisionGroup,
    config: StorageConfig,
    visited: &mut HashSet<SlabId>,
    stats: &mut WalkStats,
) -> Result<u32> {
    match group {
        CollisionGroup::Inline(body) => walk_body(storage, body, config, visited, stats),
        CollisionGroup::External { id, count } => {
            let (actual_count, _, _) = walk(storage, *id, config, false, visited, stats)?;
            if actual_count != *count {
                return Err(corrupt(
                    *id,
                    "externalized collision group count disagrees with recorded count",
                ));
            }
            Ok(actual_count)
        }
    }
}

fn walk_body<B: BlobStore>(
    storage: &SlabStorage<B>,
    body: &CollisionBody,
    config: StorageConfig,
    visited: &mut HashSet<SlabId>,
    stats: &mut WalkStats,
) -> Result<u32> {
    let mut total = 0u32;
    let mut prev: Option<u64> = None;
    for (digest, node) in &body.entries {
        if prev.is_some_and(|p| *digest <= p) {
            return Err(corrupt(
                SlabId::sentinel(),
                "collision body entries not strictly increasing by digest",
            ));
        }
        prev = Some(*digest);
        total += match node {
            GroupNode::Entry(k, v) => {
                walk_storable(storage, k, config, visited, stats)?;
                walk_storable(storage, v, config, visited, stats)?;
                1
            }
            GroupNode::SubGroup(sub) => walk_body(storage, sub, config, visited, stats)?,
        };
    }
    for (k, v) in &body.bucket {
        walk_storable(storage, k, config, visited, stats)?;
        walk_storable(storage, v, config, visited, stats)?;
        total += 1;
    }
    Ok(total)
}

fn corrupt(id: SlabId, reason: &str) -> Error {
    Error::Corruption {
        id,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{storage_handle, Array, Map};
    use slabtree_core::Address;
    use slabtree_storage::InMemoryBlobStore;

    #[derive(Clone, Debug, PartialEq, Eq)]
    struct U64(u64);

    impl crate::ElementCodec for U64 {
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

    impl crate::TypeInfo for Unit {
        fn encode(&self) -> Vec<u8> {
            Vec::new()
        }
        fn decode(_bytes: &[u8]) -> Result<Self> {
            Ok(Unit)
        }
    }

    fn new_storage(target_threshold: u32) -> crate::StorageHandle<InMemoryBlobStore> {
        storage_handle(SlabStorage::new(
            Address::from_u64(1),
            StorageConfig::new(target_threshold, 0),
            InMemoryBlobStore::new(),
            0,
        ))
    }

    #[test]
    fn validates_a_single_leaf_array() {
        let storage = new_storage(1024);
        let mut array: Array<_, U64, Unit> = Array::new(storage.clone(), Unit);
        for i in 0..5u64 {
            array.append(U64(i)).unwrap();
        }
        let report = array.validate().unwrap();
        assert_eq!(report.count, 5);
        assert_eq!(report.slabs_visited, 1);
    }

    #[test]
    fn validates_a_multi_level_array() {
        let storage = new_storage(128);
        let mut array: Array<_, U64, Unit> = Array::new(storage, Unit);
        for i in 0..300u64 {
            array.append(U64(i)).unwrap();
        }
        let report = array.validate().unwrap();
        assert_eq!(report.count, 300);
        assert!(report.slabs_visited > 1);
    }

    #[test]
    fn validates_a_map_with_collisions() {
        let storage = new_storage(1024);
        let s = storage.borrow();
        let seed = s.config().hash_seed();
        drop(s);
        use crate::Digester;
        use std::collections::HashMap;
        let mut by_digest: HashMap<u64, u64> = HashMap::new();
        let mut pair = None;
        for i in 0u64..100_000 {
            let d = Digester::new(&i.to_be_bytes(), seed).digest(0);
            if let Some(&other) = by_digest.get(&d) {
                pair = Some((other, i));
                break;
            }
            by_digest.insert(d, i);
        }
        let (a, b) = pair.expect("expected a level-0 digest collision within 100k keys");
        let mut map: Map<_, U64, U64, Unit> = Map::new(storage, Unit);
        map.set(U64(a), U64(a)).unwrap();
        map.set(U64(b), U64(b)).unwrap();
        let report = map.validate().unwrap();
        assert_eq!(report.count, 2);
    }

    #[test]
    fn detects_a_corrupted_child_count() {
        let storage = new_storage(128);
        let mut array: Array<_, U64, Unit> = Array::new(storage.clone(), Unit);
        for i in 0..300u64 {
            array.append(U64(i)).unwrap();
        }
        // Directly tamper with the persisted tree: lie about the first
        // child's count in the root meta slab.
        let s = storage.borrow();
        let root = array.root_id();
        let handle = s.retrieve(root).unwrap();
        let mut slab = handle.borrow().clone();
        match &mut slab {
            Slab::ArrayMeta { children, .. } => {
                children[0].count += 1;
            }
            _ => panic!("expected a meta root after 300 appends"),
        }
        s.store(root, slab);
        drop(s);
        let err = array.validate().unwrap_err();
        assert!(matches!(err, Error::Corruption { .. }));
    }

    #[test]
    fn detects_an_oversized_non_root_slab() {
        let storage = new_storage(128);
        let mut array: Array<_, U64, Unit> = Array::new(storage.clone(), Unit);
        for i in 0..300u64 {
            array.append(U64(i)).unwrap();
        }
        let s = storage.borrow();
        let root = array.root_id();
        let first_child_id = match &*s.retrieve(root).unwrap().borrow() {
            Slab::ArrayMeta { children, .. } => children[0].id,
            _ => panic!("expected a meta root"),
        };
        let handle = s.retrieve(first_child_id).unwrap();
        let mut slab = handle.borrow().clone();
        match &mut slab {
            Slab::ArrayData { elements, .. } => {
                for _ in 0..50 {
                    elements.push(Storable::Inline(vec![0u8; 8]));
                }
            }
            _ => panic!("expected a data child"),
        }
        s.store(first_child_id, slab);
        drop(s);
        let err = array.validate().unwrap_err();
        assert!(matches!(err, Error::Corruption { .. }));
    }
}
