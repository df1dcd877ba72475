//! The Map tree (C5): an ordered key/value store keyed by layered
//! digests, sharing the Array's split/merge/rebalance policy (§4.3) but
//! routing by digest rather than by index and additionally managing
//! collision groups.
//!
//! Routing descends meta children by comparing the lookup key's level-0
//! digest against each child's recorded `first_digest`, picking the
//! rightmost child whose `first_digest` is no greater (§4.3). Within a
//! leaf, elements are kept sorted by `digest0`; two keys sharing a
//! `digest0` form a collision group, resolved by requesting
//! successively deeper [`Digester`] levels until they diverge or the
//! digester is exhausted, at which point both fall into a linear bucket
//! compared by the key's own `PartialEq`.

use crate::codec::{make_storable, resolve_storable, storable_bytes};
use crate::digester::Digester;
use crate::policy;
use crate::typeinfo::{decode_root_extra, encode_root_extra, ElementCodec, MapKey, TypeInfo, ROOT_KIND_MAP};
use crate::util::{encoded_len, relocate};
use crate::{deep, StorageHandle};
use slabtree_core::{Error, Header, Result, SlabId, StorageConfig};
use slabtree_storage::{
    BlobStore, CollisionBody, CollisionGroup, GroupNode, MapChild, MapElement, Slab, SlabStorage,
    Storable,
};
use std::marker::PhantomData;

const MAP_DATA_FIXED_OVERHEAD: u32 = 2 + 3 + 16; // version+flags, 0x99 len header, next pointer
const MAP_META_FIXED_OVERHEAD: u32 = 2 + 2; // version+flags, child count u16
const MAP_CHILD_ENCODED_LEN: u32 = Header::ENCODED_LEN as u32 + 8; // header + first_digest

enum Outcome {
    Updated(MapChild),
    Split(MapChild, MapChild),
}

/// Outcome of removing a key from a collision group.
enum GroupOutcome {
    /// The group has no entries left; the parent element disappears.
    Empty,
    /// Exactly one entry remains; the parent reverts to a plain `Single`.
    Collapsed(Storable, Storable),
    /// Two or more entries remain.
    Remains(CollisionGroup),
}

/// An ordered key/value store keyed by digest.
pub struct Map<B: BlobStore, K: MapKey, V: ElementCodec, TI: TypeInfo> {
    storage: StorageHandle<B>,
    root: SlabId,
    type_info: TI,
    _marker: PhantomData<(K, V)>,
}

impl<B: BlobStore, K: MapKey, V: ElementCodec, TI: TypeInfo> Map<B, K, V, TI> {
    /// Create a brand-new, empty map rooted at a freshly issued slab.
    pub fn new(storage: StorageHandle<B>, type_info: TI) -> Self {
        let root = {
            let s = storage.borrow();
            let id = s.generate_id();
            s.store(
                id,
                Slab::MapData {
                    id,
                    next: SlabId::sentinel(),
                    elements: Vec::new(),
                },
            );
            id
        };
        Map {
            storage,
            root,
            type_info,
            _marker: PhantomData,
        }
    }

    /// Open a previously committed map by its root id.
    pub fn open(storage: StorageHandle<B>, root: SlabId) -> Result<Self> {
        let type_info = {
            let s = storage.borrow();
            let extra = s.read_extra_data(root)?;
            match extra {
                Some(bytes) => decode_root_extra::<TI>(&bytes, ROOT_KIND_MAP, "Map", root)?,
                None => {
                    return Err(Error::TypeInfoMismatch {
                        id: root,
                        expected: "Map",
                    })
                }
            }
        };
        Ok(Map {
            storage,
            root,
            type_info,
            _marker: PhantomData,
        })
    }

    /// This map's root id, stable across every mutation.
    pub fn root_id(&self) -> SlabId {
        self.root
    }

    /// The opaque type descriptor this map was created or opened with.
    pub fn type_info(&self) -> &TI {
        &self.type_info
    }

    /// Number of key/value pairs in the map.
    pub fn count(&self) -> Result<u32> {
        let s = self.storage.borrow();
        Ok(s.retrieve(self.root)?.borrow().count())
    }

    /// Look up `key`, returning its value if present.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let s = self.storage.borrow();
        let key_bytes = key.encode();
        let hash_seed = s.config().hash_seed();
        let digest0 = Digester::new(&key_bytes, hash_seed).digest(0);
        get_rec::<B, K, V>(&s, self.root, key, &key_bytes, digest0, hash_seed)
    }

    /// Insert or replace `key`'s value, returning the previous value if
    /// the key was already present.
    pub fn set(&mut self, key: K, value: V) -> Result<Option<V>> {
        let old = {
            let s = self.storage.borrow();
            let key_bytes = key.encode();
            let hash_seed = s.config().hash_seed();
            let digest0 = Digester::new(&key_bytes, hash_seed).digest(0);
            let key_storable = make_storable(&s, &key)?;
            let value_storable = make_storable(&s, &value)?;
            let config = s.config();
            let (old, outcome) = set_rec::<B, K>(
                &s,
                self.root,
                &key,
                &key_bytes,
                digest0,
                key_storable,
                value_storable,
                hash_seed,
                config,
            )?;
            apply_root_outcome(&s, self.root, outcome)?;
            old
        };
        match old {
            Some(storable) => {
                let s = self.storage.borrow();
                Ok(Some(resolve_storable::<B, V>(&s, &storable)?))
            }
            None => Ok(None),
        }
    }

    /// Remove `key`, returning its value if it was present.
    pub fn remove(&mut self, key: &K) -> Result<Option<V>> {
        let old = {
            let s = self.storage.borrow();
            let key_bytes = key.encode();
            let hash_seed = s.config().hash_seed();
            let digest0 = Digester::new(&key_bytes, hash_seed).digest(0);
            let config = s.config();
            let (old, outcome) =
                remove_rec::<B, K>(&s, self.root, key, &key_bytes, digest0, hash_seed, config)?;
            apply_root_outcome(&s, self.root, outcome)?;
            old
        };
        match old {
            Some(storable) => {
                let s = self.storage.borrow();
                Ok(Some(resolve_storable::<B, V>(&s, &storable)?))
            }
            None => Ok(None),
        }
    }

    /// Visit every key/value pair in digest order, stopping early if `f`
    /// returns `Ok(false)`.
    pub fn iterate<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(K, V) -> Result<bool>,
    {
        let s = self.storage.borrow();
        let mut leaf_id = Some(leftmost_leaf(&s, self.root)?);
        while let Some(id) = leaf_id {
            let handle = s.retrieve(id)?;
            let (elements, next) = match &*handle.borrow() {
                Slab::MapData { elements, next, .. } => (elements.clone(), *next),
                other => {
                    return Err(Error::WrongSlabType {
                        id,
                        expected: "MapData",
                        found: other.kind_name(),
                    })
                }
            };
            for e in &elements {
                if !walk_element::<B, K, V, F>(&s, e, &mut f)? {
                    return Ok(());
                }
            }
            leaf_id = if next.is_sentinel() { None } else { Some(next) };
        }
        Ok(())
    }

    /// A lazy, forward iterator over the map's key/value pairs.
    pub fn iterator(&self) -> Result<MapIter<'_, B, K, V, TI>> {
        let s = self.storage.borrow();
        let leaf = leftmost_leaf(&s, self.root)?;
        Ok(MapIter {
            map: self,
            next_leaf: Some(leaf),
            buf: Vec::new().into_iter(),
        })
    }

    /// Free every slab reachable from this map's root.
    pub fn deep_remove(self) -> Result<()> {
        let s = self.storage.borrow();
        deep::deep_remove(&s, self.root)
    }

    /// Rebuild this map under a fresh address, returning the new root id.
    /// The new root is committed immediately, carrying this map's
    /// `TypeInfo` preamble, so it can be reopened via `Map::open`
    /// without a further explicit `commit()`.
    pub fn deep_copy(&self, dest: &StorageHandle<B>) -> Result<SlabId> {
        let new_root = {
            let src = self.storage.borrow();
            let dst = dest.borrow();
            deep::deep_copy(&src, &dst, self.root)?
        };
        let mut dst = dest.borrow_mut();
        let extra = encode_root_extra(ROOT_KIND_MAP, &self.type_info);
        dst.commit_root(new_root, &extra)?;
        dst.commit()?;
        Ok(new_root)
    }

    /// Commit this map's root (carrying its `TypeInfo` preamble) and
    /// every other dirty slab in the shared storage.
    pub fn commit(&self) -> Result<()> {
        let mut s = self.storage.borrow_mut();
        let extra = encode_root_extra(ROOT_KIND_MAP, &self.type_info);
        s.commit_root(self.root, &extra)?;
        s.commit()
    }

    /// Check every structural invariant across this map's whole tree
    /// (see [`crate::validate`]).
    pub fn validate(&self) -> Result<crate::ValidationReport> {
        let s = self.storage.borrow();
        crate::validate(&s, self.root, s.config())
    }
}

/// A lazy, forward iterator over a [`Map`]'s key/value pairs.
pub struct MapIter<'a, B: BlobStore, K: MapKey, V: ElementCodec, TI: TypeInfo> {
    map: &'a Map<B, K, V, TI>,
    next_leaf: Option<SlabId>,
    buf: std::vec::IntoIter<(K, V)>,
}

impl<'a, B: BlobStore, K: MapKey, V: ElementCodec, TI: TypeInfo> Iterator for MapIter<'a, B, K, V, TI> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(pair) = self.buf.next() {
                return Some(Ok(pair));
            }
            let leaf_id = self.next_leaf.take()?;
            let s = self.map.storage.borrow();
            let handle = match s.retrieve(leaf_id) {
                Ok(h) => h,
                Err(e) => return Some(Err(e)),
            };
            let (elements, next) = match &*handle.borrow() {
                Slab::MapData { elements, next, .. } => (elements.clone(), *next),
                other => {
                    return Some(Err(Error::WrongSlabType {
                        id: leaf_id,
                        expected: "MapData",
                        found: other.kind_name(),
                    }))
                }
            };
            if !next.is_sentinel() {
                self.next_leaf = Some(next);
            }
            let mut pairs = Vec::new();
            for e in &elements {
                let mut sink = |k: K, v: V| -> Result<bool> {
                    pairs.push((k, v));
                    Ok(true)
                };
                if let Err(err) = walk_element::<B, K, V, _>(&s, e, &mut sink) {
                    return Some(Err(err));
                }
            }
            self.buf = pairs.into_iter();
        }
    }
}

fn leftmost_leaf<B: BlobStore>(s: &SlabStorage<B>, id: SlabId) -> Result<SlabId> {
    let handle = s.retrieve(id)?;
    let first_child = match &*handle.borrow() {
        Slab::MapData { .. } => return Ok(id),
        Slab::MapMeta { children, .. } => children[0].header.id,
        other => {
            return Err(Error::WrongSlabType {
                id,
                expected: "Map",
                found: other.kind_name(),
            })
        }
    };
    leftmost_leaf(s, first_child)
}

/// The rightmost child whose `first_digest` is `<= digest0`, or child 0
/// if `digest0` is smaller than every child's `first_digest` (the
/// catch-all for keys that would become the new leftmost entry).
fn locate_child_for_digest(children: &[MapChild], digest0: u64) -> usize {
    let mut idx = 0;
    for (i, c) in children.iter().enumerate() {
        if c.first_digest <= digest0 {
            idx = i;
        } else {
            break;
        }
    }
    idx
}

fn walk_element<B: BlobStore, K: MapKey, V: ElementCodec, F>(
    s: &SlabStorage<B>,
    e: &MapElement,
    f: &mut F,
) -> Result<bool>
where
    F: FnMut(K, V) -> Result<bool>,
{
    match e {
        MapElement::Single { key, value, .. } => {
            let k = resolve_storable::<B, K>(s, key)?;
            let v = resolve_storable::<B, V>(s, value)?;
            f(k, v)
        }
        MapElement::Collision { group, .. } => walk_group::<B, K, V, F>(s, group, f),
    }
}

fn walk_group<B: BlobStore, K: MapKey, V: ElementCodec, F>(
    s: &SlabStorage<B>,
    group: &CollisionGroup,
    f: &mut F,
) -> Result<bool>
where
    F: FnMut(K, V) -> Result<bool>,
{
    match group {
        CollisionGroup::Inline(body) => walk_body::<B, K, V, F>(s, body, f),
        CollisionGroup::External { id, .. } => {
            let handle = s.retrieve(*id)?;
            let slab = handle.borrow();
            match &*slab {
                Slab::MapCollision { body, .. } => walk_body::<B, K, V, F>(s, body, f),
                other => Err(Error::WrongSlabType {
                    id: *id,
                    expected: "MapCollision",
                    found: other.kind_name(),
                }),
            }
        }
    }
}

fn walk_body<B: BlobStore, K: MapKey, V: ElementCodec, F>(
    s: &SlabStorage<B>,
    body: &CollisionBody,
    f: &mut F,
) -> Result<bool>
where
    F: FnMut(K, V) -> Result<bool>,
{
    for (_, node) in &body.entries {
        match node {
            GroupNode::Entry(k, v) => {
                let kv = resolve_storable::<B, K>(s, k)?;
                let vv = resolve_storable::<B, V>(s, v)?;
                if !f(kv, vv)? {
                    return Ok(false);
                }
            }
            GroupNode::SubGroup(sub) => {
                if !walk_body::<B, K, V, F>(s, sub, f)? {
                    return Ok(false);
                }
            }
        }
    }
    for (k, v) in &body.bucket {
        let kv = resolve_storable::<B, K>(s, k)?;
        let vv = resolve_storable::<B, V>(s, v)?;
        if !f(kv, vv)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn get_rec<B: BlobStore, K: MapKey, V: ElementCodec>(
    s: &SlabStorage<B>,
    id: SlabId,
    key: &K,
    key_bytes: &[u8],
    digest0: u64,
    hash_seed: u64,
) -> Result<Option<V>> {
    let handle = s.retrieve(id)?;
    let child_id = match &*handle.borrow() {
        Slab::MapData { elements, .. } => {
            return match elements.binary_search_by_key(&digest0, MapElement::digest0) {
                Ok(idx) => {
                    resolve_element_value::<B, K, V>(s, &elements[idx], key, key_bytes, hash_seed, 1)
                }
                Err(_) => Ok(None),
            };
        }
        Slab::MapMeta { children, .. } => children[locate_child_for_digest(children, digest0)].header.id,
        other => {
            return Err(Error::WrongSlabType {
                id,
                expected: "Map",
                found: other.kind_name(),
            })
        }
    };
    get_rec::<B, K, V>(s, child_id, key, key_bytes, digest0, hash_seed)
}

fn resolve_element_value<B: BlobStore, K: MapKey, V: ElementCodec>(
    s: &SlabStorage<B>,
    e: &MapElement,
    key: &K,
    key_bytes: &[u8],
    hash_seed: u64,
    level: u32,
) -> Result<Option<V>> {
    match e {
        MapElement::Single { key: ek, value, .. } => {
            let ek_value = resolve_storable::<B, K>(s, ek)?;
            if ek_value == *key {
                Ok(Some(resolve_storable::<B, V>(s, value)?))
            } else {
                Ok(None)
            }
        }
        MapElement::Collision { group, .. } => {
            resolve_group_value::<B, K, V>(s, group, key, key_bytes, hash_seed, level)
        }
    }
}

fn resolve_group_value<B: BlobStore, K: MapKey, V: ElementCodec>(
    s: &SlabStorage<B>,
    group: &CollisionGroup,
    key: &K,
    key_bytes: &[u8],
    hash_seed: u64,
    level: u32,
) -> Result<Option<V>> {
    match group {
        CollisionGroup::Inline(body) => resolve_body_value::<B, K, V>(s, body, key, key_bytes, hash_seed, level),
        CollisionGroup::External { id, .. } => {
            let handle = s.retrieve(*id)?;
            let slab = handle.borrow();
            match &*slab {
                Slab::MapCollision { body, .. } => {
                    resolve_body_value::<B, K, V>(s, body, key, key_bytes, hash_seed, level)
                }
                other => Err(Error::WrongSlabType {
                    id: *id,
                    expected: "MapCollision",
                    found: other.kind_name(),
                }),
            }
        }
    }
}

fn resolve_body_value<B: BlobStore, K: MapKey, V: ElementCodec>(
    s: &SlabStorage<B>,
    body: &CollisionBody,
    key: &K,
    key_bytes: &[u8],
    hash_seed: u64,
    level: u32,
) -> Result<Option<V>> {
    if level >= Digester::MAX_LEVELS {
        for (k, v) in &body.bucket {
            let kv = resolve_storable::<B, K>(s, k)?;
            if kv == *key {
                return Ok(Some(resolve_storable::<B, V>(s, v)?));
            }
        }
        return Ok(None);
    }
    let digest = Digester::new(key_bytes, hash_seed).digest(level);
    match body.entries.binary_search_by_key(&digest, |(d, _)| *d) {
        Ok(idx) => match &body.entries[idx].1 {
            GroupNode::Entry(ek, ev) => {
                let ek_value = resolve_storable::<B, K>(s, ek)?;
                if ek_value == *key {
                    Ok(Some(resolve_storable::<B, V>(s, ev)?))
                } else {
                    Ok(None)
                }
            }
            GroupNode::SubGroup(sub) => {
                resolve_body_value::<B, K, V>(s, sub, key, key_bytes, hash_seed, level + 1)
            }
        },
        Err(_) => Ok(None),
    }
}

fn set_rec<B: BlobStore, K: MapKey>(
    s: &SlabStorage<B>,
    id: SlabId,
    key: &K,
    key_bytes: &[u8],
    digest0: u64,
    key_storable: Storable,
    value_storable: Storable,
    hash_seed: u64,
    config: StorageConfig,
) -> Result<(Option<Storable>, Outcome)> {
    let handle = s.retrieve(id)?;
    let is_meta = matches!(&*handle.borrow(), Slab::MapMeta { .. });
    if !is_meta {
        let mut slab = handle.borrow().clone();
        let old = match &mut slab {
            Slab::MapData { elements, .. } => upsert_in_elements::<B, K>(
                s,
                elements,
                key,
                key_bytes,
                digest0,
                key_storable,
                value_storable,
                hash_seed,
            )?,
            other => {
                return Err(Error::WrongSlabType {
                    id,
                    expected: "MapData",
                    found: other.kind_name(),
                })
            }
        };
        let outcome = finish_leaf_map(s, id, slab, config)?;
        return Ok((old, outcome));
    }
    let (child_id, child_idx) = {
        let slab = handle.borrow();
        match &*slab {
            Slab::MapMeta { children, .. } => {
                let idx = locate_child_for_digest(children, digest0);
                (children[idx].header.id, idx)
            }
            _ => unreachable!(),
        }
    };
    let (old, child_outcome) = set_rec::<B, K>(
        s,
        child_id,
        key,
        key_bytes,
        digest0,
        key_storable,
        value_storable,
        hash_seed,
        config,
    )?;
    let mut slab = handle.borrow().clone();
    let children = match &mut slab {
        Slab::MapMeta { children, .. } => children,
        _ => unreachable!(),
    };
    splice_child_outcome_map(s, children, child_idx, child_outcome, config)?;
    let outcome = finish_meta_map(s, id, slab, config)?;
    Ok((old, outcome))
}

fn remove_rec<B: BlobStore, K: MapKey>(
    s: &SlabStorage<B>,
    id: SlabId,
    key: &K,
    key_bytes: &[u8],
    digest0: u64,
    hash_seed: u64,
    config: StorageConfig,
) -> Result<(Option<Storable>, Outcome)> {
    let handle = s.retrieve(id)?;
    let is_meta = matches!(&*handle.borrow(), Slab::MapMeta { .. });
    if !is_meta {
        let mut slab = handle.borrow().clone();
        let old = match &mut slab {
            Slab::MapData { elements, .. } => {
                remove_in_elements::<B, K>(s, elements, key, key_bytes, digest0, hash_seed)?
            }
            other => {
                return Err(Error::WrongSlabType {
                    id,
                    expected: "MapData",
                    found: other.kind_name(),
                })
            }
        };
        let outcome = finish_leaf_map(s, id, slab, config)?;
        return Ok((old, outcome));
    }
    let (child_id, child_idx) = {
        let slab = handle.borrow();
        match &*slab {
            Slab::MapMeta { children, .. } => {
                let idx = locate_child_for_digest(children, digest0);
                (children[idx].header.id, idx)
            }
            _ => unreachable!(),
        }
    };
    let (old, child_outcome) =
        remove_rec::<B, K>(s, child_id, key, key_bytes, digest0, hash_seed, config)?;
    let mut slab = handle.borrow().clone();
    let children = match &mut slab {
        Slab::MapMeta { children, .. } => children,
        _ => unreachable!(),
    };
    splice_child_outcome_map(s, children, child_idx, child_outcome, config)?;
    let outcome = finish_meta_map(s, id, slab, config)?;
    Ok((old, outcome))
}

fn upsert_in_elements<B: BlobStore, K: MapKey>(
    s: &SlabStorage<B>,
    elements: &mut Vec<MapElement>,
    key: &K,
    key_bytes: &[u8],
    digest0: u64,
    key_storable: Storable,
    value_storable: Storable,
    hash_seed: u64,
) -> Result<Option<Storable>> {
    match elements.binary_search_by_key(&digest0, MapElement::digest0) {
        Ok(pos) => {
            let existing = elements[pos].clone();
            let (new_elem, old) = upsert_into_element::<B, K>(
                s,
                existing,
                key,
                key_bytes,
                key_storable,
                value_storable,
                hash_seed,
            )?;
            elements[pos] = new_elem;
            Ok(old)
        }
        Err(pos) => {
            elements.insert(
                pos,
                MapElement::Single {
                    digest0,
                    key: key_storable,
                    value: value_storable,
                },
            );
            Ok(None)
        }
    }
}

fn upsert_into_element<B: BlobStore, K: MapKey>(
    s: &SlabStorage<B>,
    existing: MapElement,
    key: &K,
    key_bytes: &[u8],
    key_storable: Storable,
    value_storable: Storable,
    hash_seed: u64,
) -> Result<(MapElement, Option<Storable>)> {
    match existing {
        MapElement::Single {
            digest0,
            key: ek,
            value: ev,
        } => {
            let ek_value = resolve_storable::<B, K>(s, &ek)?;
            if ek_value == *key {
                Ok((
                    MapElement::Single {
                        digest0,
                        key: ek,
                        value: value_storable,
                    },
                    Some(ev),
                ))
            } else {
                let ek_bytes = storable_bytes(s, &ek)?;
                let body = build_group_for_two(&ek_bytes, ek, ev, key_bytes, key_storable, value_storable, 1, hash_seed);
                let group = externalize_if_needed(s, body)?;
                Ok((MapElement::Collision { digest0, group }, None))
            }
        }
        MapElement::Collision { digest0, group } => {
            let (new_group, old) = upsert_into_group::<B, K>(
                s,
                group,
                key,
                key_bytes,
                key_storable,
                value_storable,
                hash_seed,
                1,
            )?;
            Ok((MapElement::Collision { digest0, group: new_group }, old))
        }
    }
}

/// Build the smallest collision body that separates two keys, nesting
/// one level per shared digest until they diverge or the digester is
/// exhausted (falling back to the linear bucket).
fn build_group_for_two(
    a_bytes: &[u8],
    a_key: Storable,
    a_value: Storable,
    b_bytes: &[u8],
    b_key: Storable,
    b_value: Storable,
    level: u32,
    hash_seed: u64,
) -> CollisionBody {
    if level >= Digester::MAX_LEVELS {
        return CollisionBody {
            level,
            entries: Vec::new(),
            bucket: vec![(a_key, a_value), (b_key, b_value)],
        };
    }
    let da = Digester::new(a_bytes, hash_seed).digest(level);
    let db = Digester::new(b_bytes, hash_seed).digest(level);
    if da != db {
        let mut entries = vec![
            (da, GroupNode::Entry(a_key, a_value)),
            (db, GroupNode::Entry(b_key, b_value)),
        ];
        entries.sort_by_key(|(d, _)| *d);
        CollisionBody {
            level,
            entries,
            bucket: Vec::new(),
        }
    } else {
        let sub = build_group_for_two(a_bytes, a_key, a_value, b_bytes, b_key, b_value, level + 1, hash_seed);
        CollisionBody {
            level,
            entries: vec![(da, GroupNode::SubGroup(Box::new(sub)))],
            bucket: Vec::new(),
        }
    }
}

fn externalize_if_needed<B: BlobStore>(s: &SlabStorage<B>, body: CollisionBody) -> Result<CollisionGroup> {
    let cap = s.config().max_inline_element_size();
    if body.encoded_size() > cap {
        let id = s.generate_id();
        let count = body.count();
        s.store(id, Slab::MapCollision { id, body });
        Ok(CollisionGroup::External { id, count })
    } else {
        Ok(CollisionGroup::Inline(body))
    }
}

fn upsert_into_group<B: BlobStore, K: MapKey>(
    s: &SlabStorage<B>,
    group: CollisionGroup,
    key: &K,
    key_bytes: &[u8],
    key_storable: Storable,
    value_storable: Storable,
    hash_seed: u64,
    level: u32,
) -> Result<(CollisionGroup, Option<Storable>)> {
    match group {
        CollisionGroup::Inline(mut body) => {
            let old = upsert_into_body::<B, K>(s, &mut body, key, key_bytes, key_storable, value_storable, hash_seed, level)?;
            Ok((externalize_if_needed(s, body)?, old))
        }
        CollisionGroup::External { id, .. } => {
            let mut body = match &*s.retrieve(id)?.borrow() {
                Slab::MapCollision { body, .. } => body.clone(),
                other => {
                    return Err(Error::WrongSlabType {
                        id,
                        expected: "MapCollision",
                        found: other.kind_name(),
                    })
                }
            };
            let old = upsert_into_body::<B, K>(s, &mut body, key, key_bytes, key_storable, value_storable, hash_seed, level)?;
            let cap = s.config().max_inline_element_size();
            if body.encoded_size() <= cap {
                s.remove(id);
                Ok((CollisionGroup::Inline(body), old))
            } else {
                let count = body.count();
                s.store(id, Slab::MapCollision { id, body });
                Ok((CollisionGroup::External { id, count }, old))
            }
        }
    }
}

fn upsert_into_body<B: BlobStore, K: MapKey>(
    s: &SlabStorage<B>,
    body: &mut CollisionBody,
    key: &K,
    key_bytes: &[u8],
    key_storable: Storable,
    value_storable: Storable,
    hash_seed: u64,
    level: u32,
) -> Result<Option<Storable>> {
    if level >= Digester::MAX_LEVELS {
        for (k, v) in body.bucket.iter_mut() {
            let kv = resolve_storable::<B, K>(s, k)?;
            if kv == *key {
                return Ok(Some(std::mem::replace(v, value_storable)));
            }
        }
        body.bucket.push((key_storable, value_storable));
        return Ok(None);
    }
    let digest = Digester::new(key_bytes, hash_seed).digest(level);
    match body.entries.binary_search_by_key(&digest, |(d, _)| *d) {
        Ok(idx) => {
            let node = body.entries[idx].1.clone();
            match node {
                GroupNode::Entry(ek, ev) => {
                    let ek_value = resolve_storable::<B, K>(s, &ek)?;
                    if ek_value == *key {
                        body.entries[idx].1 = GroupNode::Entry(ek, value_storable);
                        Ok(Some(ev))
                    } else {
                        let ek_bytes = storable_bytes(s, &ek)?;
                        let sub = build_group_for_two(&ek_bytes, ek, ev, key_bytes, key_storable, value_storable, level + 1, hash_seed);
                        body.entries[idx].1 = GroupNode::SubGroup(Box::new(sub));
                        Ok(None)
                    }
                }
                GroupNode::SubGroup(mut sub) => {
                    let old = upsert_into_body::<B, K>(s, &mut sub, key, key_bytes, key_storable, value_storable, hash_seed, level + 1)?;
                    body.entries[idx].1 = GroupNode::SubGroup(sub);
                    Ok(old)
                }
            }
        }
        Err(pos) => {
            body.entries
                .insert(pos, (digest, GroupNode::Entry(key_storable, value_storable)));
            Ok(None)
        }
    }
}

fn remove_in_elements<B: BlobStore, K: MapKey>(
    s: &SlabStorage<B>,
    elements: &mut Vec<MapElement>,
    key: &K,
    key_bytes: &[u8],
    digest0: u64,
    hash_seed: u64,
) -> Result<Option<Storable>> {
    let pos = match elements.binary_search_by_key(&digest0, MapElement::digest0) {
        Ok(pos) => pos,
        Err(_) => return Ok(None),
    };
    let existing = elements[pos].clone();
    match existing {
        MapElement::Single { key: ek, value: ev, .. } => {
            let ek_value = resolve_storable::<B, K>(s, &ek)?;
            if ek_value == *key {
                elements.remove(pos);
                Ok(Some(ev))
            } else {
                Ok(None)
            }
        }
        MapElement::Collision { digest0, group } => {
            let (outcome, old) = remove_from_group::<B, K>(s, group, key, key_bytes, hash_seed, 1)?;
            match outcome {
                GroupOutcome::Empty => {
                    elements.remove(pos);
                }
                GroupOutcome::Collapsed(k, v) => {
                    elements[pos] = MapElement::Single { digest0, key: k, value: v };
                }
                GroupOutcome::Remains(group) => {
                    elements[pos] = MapElement::Collision { digest0, group };
                }
            }
            Ok(old)
        }
    }
}

fn remove_from_group<B: BlobStore, K: MapKey>(
    s: &SlabStorage<B>,
    group: CollisionGroup,
    key: &K,
    key_bytes: &[u8],
    hash_seed: u64,
    level: u32,
) -> Result<(GroupOutcome, Option<Storable>)> {
    match group {
        CollisionGroup::Inline(mut body) => {
            let old = remove_from_body::<B, K>(s, &mut body, key, key_bytes, hash_seed, level)?;
            if old.is_none() {
                return Ok((GroupOutcome::Remains(CollisionGroup::Inline(body)), None));
            }
            Ok((group_outcome_from_body(body), old))
        }
        CollisionGroup::External { id, count } => {
            let mut body = match &*s.retrieve(id)?.borrow() {
                Slab::MapCollision { body, .. } => body.clone(),
                other => {
                    return Err(Error::WrongSlabType {
                        id,
                        expected: "MapCollision",
                        found: other.kind_name(),
                    })
                }
            };
            let old = remove_from_body::<B, K>(s, &mut body, key, key_bytes, hash_seed, level)?;
            if old.is_none() {
                return Ok((GroupOutcome::Remains(CollisionGroup::External { id, count }), None));
            }
            let cnt = body.count();
            if cnt == 0 {
                s.remove(id);
                return Ok((GroupOutcome::Empty, old));
            }
            if cnt == 1 {
                s.remove(id);
                let (k, v) = extract_single(&body).expect("count==1 implies exactly one entry");
                return Ok((GroupOutcome::Collapsed(k, v), old));
            }
            let cap = s.config().max_inline_element_size();
            if body.encoded_size() <= cap {
                s.remove(id);
                Ok((GroupOutcome::Remains(CollisionGroup::Inline(body)), old))
            } else {
                s.store(id, Slab::MapCollision { id, body });
                Ok((GroupOutcome::Remains(CollisionGroup::External { id, count: cnt }), old))
            }
        }
    }
}

fn group_outcome_from_body(body: CollisionBody) -> GroupOutcome {
    match body.count() {
        0 => GroupOutcome::Empty,
        1 => {
            let (k, v) = extract_single(&body).expect("count==1 implies exactly one entry");
            GroupOutcome::Collapsed(k, v)
        }
        _ => GroupOutcome::Remains(CollisionGroup::Inline(body)),
    }
}

/// If `body` holds exactly one key/value pair, return it.
fn extract_single(body: &CollisionBody) -> Option<(Storable, Storable)> {
    if body.entries.len() == 1 && body.bucket.is_empty() {
        return match &body.entries[0].1 {
            GroupNode::Entry(k, v) => Some((k.clone(), v.clone())),
            GroupNode::SubGroup(sub) => extract_single(sub),
        };
    }
    if body.entries.is_empty() && body.bucket.len() == 1 {
        return Some(body.bucket[0].clone());
    }
    None
}

fn remove_from_body<B: BlobStore, K: MapKey>(
    s: &SlabStorage<B>,
    body: &mut CollisionBody,
    key: &K,
    key_bytes: &[u8],
    hash_seed: u64,
    level: u32,
) -> Result<Option<Storable>> {
    if level >= Digester::MAX_LEVELS {
        for i in 0..body.bucket.len() {
            let kv = resolve_storable::<B, K>(s, &body.bucket[i].0)?;
            if kv == *key {
                let (_, v) = body.bucket.remove(i);
                return Ok(Some(v));
            }
        }
        return Ok(None);
    }
    let digest = Digester::new(key_bytes, hash_seed).digest(level);
    let idx = match body.entries.binary_search_by_key(&digest, |(d, _)| *d) {
        Ok(idx) => idx,
        Err(_) => return Ok(None),
    };
    match body.entries[idx].1.clone() {
        GroupNode::Entry(ek, ev) => {
            let ek_value = resolve_storable::<B, K>(s, &ek)?;
            if ek_value == *key {
                body.entries.remove(idx);
                Ok(Some(ev))
            } else {
                Ok(None)
            }
        }
        GroupNode::SubGroup(mut sub) => {
            let old = remove_from_body::<B, K>(s, &mut sub, key, key_bytes, hash_seed, level + 1)?;
            if old.is_some() {
                if let Some((k, v)) = extract_single(&sub) {
                    body.entries[idx].1 = GroupNode::Entry(k, v);
                } else if sub.count() == 0 {
                    body.entries.remove(idx);
                } else {
                    body.entries[idx].1 = GroupNode::SubGroup(sub);
                }
            }
            Ok(old)
        }
    }
}

fn splice_child_outcome_map<B: BlobStore>(
    s: &SlabStorage<B>,
    children: &mut Vec<MapChild>,
    child_idx: usize,
    outcome: Outcome,
    config: StorageConfig,
) -> Result<()> {
    match outcome {
        Outcome::Updated(c) => {
            let underfull = c.header.size < config.min_threshold();
            children[child_idx] = c;
            if underfull {
                fix_underfull_child_map(s, children, child_idx, config)?;
            }
        }
        Outcome::Split(c1, c2) => {
            children[child_idx] = c1;
            children.insert(child_idx + 1, c2);
        }
    }
    Ok(())
}

fn finish_leaf_map<B: BlobStore>(
    s: &SlabStorage<B>,
    id: SlabId,
    slab: Slab,
    config: StorageConfig,
) -> Result<Outcome> {
    let size = encoded_len(&slab);
    if size <= config.max_threshold() {
        let first_digest = match &slab {
            Slab::MapData { elements, .. } => elements[0].digest0(),
            _ => unreachable!(),
        };
        let header = Header::new(id, slab.count(), size);
        s.store(id, slab);
        return Ok(Outcome::Updated(MapChild { header, first_digest }));
    }
    let (next, elements) = match slab {
        Slab::MapData { next, elements, .. } => (next, elements),
        _ => unreachable!("finish_leaf_map called on non-leaf slab"),
    };
    let sizes: Vec<u32> = elements.iter().map(MapElement::encoded_size).collect();
    let k = policy::split_boundary(&sizes, MAP_DATA_FIXED_OVERHEAD, config.min_threshold());
    let mut elements = elements;
    let right_elements = elements.split_off(k);
    let right_id = s.generate_id();
    let left_first_digest = elements[0].digest0();
    let right_first_digest = right_elements[0].digest0();
    let left = Slab::MapData {
        id,
        next: right_id,
        elements,
    };
    let right = Slab::MapData {
        id: right_id,
        next,
        elements: right_elements,
    };
    let lc = MapChild {
        header: Header::new(id, left.count(), encoded_len(&left)),
        first_digest: left_first_digest,
    };
    let rc = MapChild {
        header: Header::new(right_id, right.count(), encoded_len(&right)),
        first_digest: right_first_digest,
    };
    s.store(id, left);
    s.store(right_id, right);
    Ok(Outcome::Split(lc, rc))
}

fn finish_meta_map<B: BlobStore>(
    s: &SlabStorage<B>,
    id: SlabId,
    slab: Slab,
    config: StorageConfig,
) -> Result<Outcome> {
    let size = encoded_len(&slab);
    if size <= config.max_threshold() {
        let first_digest = match &slab {
            Slab::MapMeta { children, .. } => children[0].first_digest,
            _ => unreachable!(),
        };
        let header = Header::new(id, slab.count(), size);
        s.store(id, slab);
        return Ok(Outcome::Updated(MapChild { header, first_digest }));
    }
    let children = match slab {
        Slab::MapMeta { children, .. } => children,
        _ => unreachable!("finish_meta_map called on non-meta slab"),
    };
    let sizes = vec![MAP_CHILD_ENCODED_LEN; children.len()];
    let k = policy::split_boundary(&sizes, MAP_META_FIXED_OVERHEAD, config.min_threshold());
    let mut children = children;
    let right_children = children.split_off(k);
    let right_id = s.generate_id();
    let left_first_digest = children[0].first_digest;
    let right_first_digest = right_children[0].first_digest;
    let left = Slab::MapMeta { id, children };
    let right = Slab::MapMeta {
        id: right_id,
        children: right_children,
    };
    let lc = MapChild {
        header: Header::new(id, left.count(), encoded_len(&left)),
        first_digest: left_first_digest,
    };
    let rc = MapChild {
        header: Header::new(right_id, right.count(), encoded_len(&right)),
        first_digest: right_first_digest,
    };
    s.store(id, left);
    s.store(right_id, right);
    Ok(Outcome::Split(lc, rc))
}

fn fix_underfull_child_map<B: BlobStore>(
    s: &SlabStorage<B>,
    children: &mut Vec<MapChild>,
    idx: usize,
    config: StorageConfig,
) -> Result<()> {
    if children.len() <= 1 || children[idx].header.size >= config.min_threshold() {
        return Ok(());
    }
    if idx + 1 < children.len() && try_fix_pair_map(s, children, idx, idx + 1, config)? {
        return Ok(());
    }
    if idx > 0 {
        try_fix_pair_map(s, children, idx - 1, idx, config)?;
    }
    Ok(())
}

fn try_fix_pair_map<B: BlobStore>(
    s: &SlabStorage<B>,
    children: &mut Vec<MapChild>,
    left_idx: usize,
    right_idx: usize,
    config: StorageConfig,
) -> Result<bool> {
    let left_id = children[left_idx].header.id;
    let is_meta = matches!(&*s.retrieve(left_id)?.borrow(), Slab::MapMeta { .. });
    if is_meta {
        fix_pair_meta_map(s, children, left_idx, right_idx, config)
    } else {
        fix_pair_leaf_map(s, children, left_idx, right_idx, config)
    }
}

fn fix_pair_leaf_map<B: BlobStore>(
    s: &SlabStorage<B>,
    children: &mut Vec<MapChild>,
    left_idx: usize,
    right_idx: usize,
    config: StorageConfig,
) -> Result<bool> {
    let left_id = children[left_idx].header.id;
    let right_id = children[right_idx].header.id;
    let mut left_elems = match s.retrieve(left_id)?.borrow().clone() {
        Slab::MapData { elements, .. } => elements,
        other => {
            return Err(Error::WrongSlabType {
                id: left_id,
                expected: "MapData",
                found: other.kind_name(),
            })
        }
    };
    let (right_next, mut right_elems) = match s.retrieve(right_id)?.borrow().clone() {
        Slab::MapData { next, elements, .. } => (next, elements),
        other => {
            return Err(Error::WrongSlabType {
                id: right_id,
                expected: "MapData",
                found: other.kind_name(),
            })
        }
    };
    let left_total = children[left_idx].header.size;
    let right_total = children[right_idx].header.size;
    let underfull_is_left = left_total < config.min_threshold();

    let rebalanced = if underfull_is_left {
        let donor_sizes: Vec<u32> = right_elems.iter().map(MapElement::encoded_size).collect();
        policy::rebalance_count(left_total, right_total, &donor_sizes, config.min_threshold(), config.max_threshold())
            .map(|k| {
                let moved: Vec<_> = right_elems.drain(..k).collect();
                left_elems.extend(moved);
            })
    } else {
        let donor_sizes: Vec<u32> = left_elems.iter().rev().map(MapElement::encoded_size).collect();
        policy::rebalance_count(right_total, left_total, &donor_sizes, config.min_threshold(), config.max_threshold())
            .map(|k| {
                let split_at = left_elems.len() - k;
                let mut moved = left_elems.split_off(split_at);
                moved.extend(right_elems.drain(..));
                right_elems = moved;
            })
    };

    if rebalanced.is_some() {
        let left_first_digest = left_elems[0].digest0();
        let right_first_digest = right_elems[0].digest0();
        let left_slab = Slab::MapData {
            id: left_id,
            next: right_id,
            elements: left_elems,
        };
        let right_slab = Slab::MapData {
            id: right_id,
            next: right_next,
            elements: right_elems,
        };
        children[left_idx] = MapChild {
            header: Header::new(left_id, left_slab.count(), encoded_len(&left_slab)),
            first_digest: left_first_digest,
        };
        children[right_idx] = MapChild {
            header: Header::new(right_id, right_slab.count(), encoded_len(&right_slab)),
            first_digest: right_first_digest,
        };
        s.store(left_id, left_slab);
        s.store(right_id, right_slab);
        return Ok(true);
    }

    if policy::can_merge(left_total, right_total, MAP_DATA_FIXED_OVERHEAD, config.max_threshold()) {
        left_elems.extend(right_elems);
        let left_first_digest = left_elems[0].digest0();
        let merged = Slab::MapData {
            id: left_id,
            next: right_next,
            elements: left_elems,
        };
        children[left_idx] = MapChild {
            header: Header::new(left_id, merged.count(), encoded_len(&merged)),
            first_digest: left_first_digest,
        };
        s.store(left_id, merged);
        s.remove(right_id);
        children.remove(right_idx);
        return Ok(true);
    }

    Ok(false)
}

fn fix_pair_meta_map<B: BlobStore>(
    s: &SlabStorage<B>,
    children: &mut Vec<MapChild>,
    left_idx: usize,
    right_idx: usize,
    config: StorageConfig,
) -> Result<bool> {
    let left_id = children[left_idx].header.id;
    let right_id = children[right_idx].header.id;
    let mut left_children = match s.retrieve(left_id)?.borrow().clone() {
        Slab::MapMeta { children, .. } => children,
        other => {
            return Err(Error::WrongSlabType {
                id: left_id,
                expected: "MapMeta",
                found: other.kind_name(),
            })
        }
    };
    let mut right_children = match s.retrieve(right_id)?.borrow().clone() {
        Slab::MapMeta { children, .. } => children,
        other => {
            return Err(Error::WrongSlabType {
                id: right_id,
                expected: "MapMeta",
                found: other.kind_name(),
            })
        }
    };
    let left_total = children[left_idx].header.size;
    let right_total = children[right_idx].header.size;
    let underfull_is_left = left_total < config.min_threshold();

    let rebalanced = if underfull_is_left {
        let donor_sizes = vec![MAP_CHILD_ENCODED_LEN; right_children.len()];
        policy::rebalance_count(left_total, right_total, &donor_sizes, config.min_threshold(), config.max_threshold())
            .map(|k| {
                let moved: Vec<_> = right_children.drain(..k).collect();
                left_children.extend(moved);
            })
    } else {
        let donor_sizes = vec![MAP_CHILD_ENCODED_LEN; left_children.len()];
        policy::rebalance_count(right_total, left_total, &donor_sizes, config.min_threshold(), config.max_threshold())
            .map(|k| {
                let split_at = left_children.len() - k;
                let mut moved = left_children.split_off(split_at);
                moved.extend(right_children.drain(..));
                right_children = moved;
            })
    };

    if rebalanced.is_some() {
        let left_first_digest = left_children[0].first_digest;
        let right_first_digest = right_children[0].first_digest;
        let left_slab = Slab::MapMeta {
            id: left_id,
            children: left_children,
        };
        let right_slab = Slab::MapMeta {
            id: right_id,
            children: right_children,
        };
        children[left_idx] = MapChild {
            header: Header::new(left_id, left_slab.count(), encoded_len(&left_slab)),
            first_digest: left_first_digest,
        };
        children[right_idx] = MapChild {
            header: Header::new(right_id, right_slab.count(), encoded_len(&right_slab)),
            first_digest: right_first_digest,
        };
        s.store(left_id, left_slab);
        s.store(right_id, right_slab);
        return Ok(true);
    }

    if policy::can_merge(left_total, right_total, MAP_META_FIXED_OVERHEAD, config.max_threshold()) {
        left_children.extend(right_children);
        let left_first_digest = left_children[0].first_digest;
        let merged = Slab::MapMeta {
            id: left_id,
            children: left_children,
        };
        children[left_idx] = MapChild {
            header: Header::new(left_id, merged.count(), encoded_len(&merged)),
            first_digest: left_first_digest,
        };
        s.store(left_id, merged);
        s.remove(right_id);
        children.remove(right_idx);
        return Ok(true);
    }

    Ok(false)
}

fn apply_root_outcome<B: BlobStore>(s: &SlabStorage<B>, root: SlabId, outcome: Outcome) -> Result<()> {
    if let Outcome::Split(left, right) = outcome {
        debug_assert_eq!(left.header.id, root);
        let new_left_id = s.generate_id();
        let left_handle = s.retrieve(left.header.id)?;
        let left_slab = left_handle.borrow().clone();
        let relocated = relocate(left_slab, new_left_id);
        s.store(new_left_id, relocated);
        s.remove(root);
        let new_left = MapChild {
            header: Header::new(new_left_id, left.header.count, left.header.size),
            first_digest: left.first_digest,
        };
        s.store(
            root,
            Slab::MapMeta {
                id: root,
                children: vec![new_left, right],
            },
        );
    }
    collapse_if_singleton(s, root)
}

fn collapse_if_singleton<B: BlobStore>(s: &SlabStorage<B>, root: SlabId) -> Result<()> {
    loop {
        let handle = s.retrieve(root)?;
        let only_child_id = match &*handle.borrow() {
            Slab::MapMeta { children, .. } if children.len() == 1 => children[0].header.id,
            _ => return Ok(()),
        };
        let child_slab = s.retrieve(only_child_id)?.borrow().clone();
        let relocated = relocate(child_slab, root);
        s.store(root, relocated);
        s.remove(only_child_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slabtree_core::Address;
    use slabtree_storage::InMemoryBlobStore;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Debug, PartialEq, Eq)]
    struct U64Key(u64);

    impl ElementCodec for U64Key {
        fn encode(&self) -> Vec<u8> {
            self.0.to_be_bytes().to_vec()
        }
        fn decode(bytes: &[u8]) -> Result<Self> {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(bytes);
            Ok(U64Key(u64::from_be_bytes(buf)))
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    struct Str(String);

    impl ElementCodec for Str {
        fn encode(&self) -> Vec<u8> {
            self.0.as_bytes().to_vec()
        }
        fn decode(bytes: &[u8]) -> Result<Self> {
            Ok(Str(String::from_utf8_lossy(bytes).into_owned()))
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
        let config = StorageConfig::new(target_threshold, 0);
        Rc::new(RefCell::new(SlabStorage::new(
            Address::from_u64(1),
            config,
            InMemoryBlobStore::new(),
            0,
        )))
    }

    #[test]
    fn set_then_get_round_trips() {
        let storage = new_storage(1024);
        let mut map: Map<_, U64Key, Str, Unit> = Map::new(storage, Unit);
        assert_eq!(map.set(U64Key(1), Str("one".into())).unwrap(), None);
        assert_eq!(map.get(&U64Key(1)).unwrap(), Some(Str("one".into())));
        assert_eq!(map.count().unwrap(), 1);
    }

    #[test]
    fn set_replaces_and_returns_old_value() {
        let storage = new_storage(1024);
        let mut map: Map<_, U64Key, Str, Unit> = Map::new(storage, Unit);
        map.set(U64Key(1), Str("one".into())).unwrap();
        let old = map.set(U64Key(1), Str("uno".into())).unwrap();
        assert_eq!(old, Some(Str("one".into())));
        assert_eq!(map.get(&U64Key(1)).unwrap(), Some(Str("uno".into())));
        assert_eq!(map.count().unwrap(), 1);
    }

    #[test]
    fn get_of_absent_key_is_none() {
        let storage = new_storage(1024);
        let map: Map<_, U64Key, Str, Unit> = Map::new(storage, Unit);
        assert_eq!(map.get(&U64Key(42)).unwrap(), None);
    }

    #[test]
    fn remove_of_absent_key_is_none() {
        let storage = new_storage(1024);
        let mut map: Map<_, U64Key, Str, Unit> = Map::new(storage, Unit);
        map.set(U64Key(1), Str("one".into())).unwrap();
        assert_eq!(map.remove(&U64Key(99)).unwrap(), None);
        assert_eq!(map.count().unwrap(), 1);
    }

    #[test]
    fn remove_returns_and_deletes_key() {
        let storage = new_storage(1024);
        let mut map: Map<_, U64Key, Str, Unit> = Map::new(storage, Unit);
        map.set(U64Key(1), Str("one".into())).unwrap();
        map.set(U64Key(2), Str("two".into())).unwrap();
        assert_eq!(map.remove(&U64Key(1)).unwrap(), Some(Str("one".into())));
        assert_eq!(map.get(&U64Key(1)).unwrap(), None);
        assert_eq!(map.get(&U64Key(2)).unwrap(), Some(Str("two".into())));
        assert_eq!(map.count().unwrap(), 1);
    }

    #[test]
    fn many_insertions_force_splits_and_all_keys_resolve() {
        let storage = new_storage(128);
        let mut map: Map<_, U64Key, U64Key, Unit> = Map::new(storage, Unit);
        for i in 0..500u64 {
            map.set(U64Key(i), U64Key(i * 2)).unwrap();
        }
        assert_eq!(map.count().unwrap(), 500);
        for i in 0..500u64 {
            assert_eq!(map.get(&U64Key(i)).unwrap(), Some(U64Key(i * 2)));
        }
    }

    #[test]
    fn removing_everything_leaves_an_empty_map_with_stable_root() {
        let storage = new_storage(128);
        let mut map: Map<_, U64Key, U64Key, Unit> = Map::new(storage, Unit);
        let root = map.root_id();
        for i in 0..200u64 {
            map.set(U64Key(i), U64Key(i)).unwrap();
        }
        for i in 0..200u64 {
            map.remove(&U64Key(i)).unwrap();
        }
        assert_eq!(map.count().unwrap(), 0);
        assert_eq!(map.root_id(), root);
    }

    #[test]
    fn iterate_visits_every_key_once_in_digest_order() {
        let storage = new_storage(1024);
        let mut map: Map<_, U64Key, U64Key, Unit> = Map::new(storage.clone(), Unit);
        for i in 0..50u64 {
            map.set(U64Key(i), U64Key(i)).unwrap();
        }
        let mut seen = std::collections::HashSet::new();
        let mut digests = Vec::new();
        let hash_seed = storage.borrow().config().hash_seed();
        map.iterate(|k, v| {
            assert_eq!(k, v);
            assert!(seen.insert(k.0));
            digests.push(Digester::new(&k.encode(), hash_seed).digest(0));
            Ok(true)
        })
        .unwrap();
        assert_eq!(seen.len(), 50);
        let mut sorted = digests.clone();
        sorted.sort_unstable();
        assert_eq!(digests, sorted, "iteration order must be digest-sorted");
    }

    #[test]
    fn iterator_matches_iterate() {
        let storage = new_storage(256);
        let mut map: Map<_, U64Key, U64Key, Unit> = Map::new(storage, Unit);
        for i in 0..80u64 {
            map.set(U64Key(i), U64Key(i)).unwrap();
        }
        let mut from_iterate = Vec::new();
        map.iterate(|k, _| {
            from_iterate.push(k.0);
            Ok(true)
        })
        .unwrap();
        let from_iterator: Vec<u64> = map.iterator().unwrap().map(|r| r.unwrap().0 .0).collect();
        assert_eq!(from_iterate, from_iterator);
    }

    #[test]
    fn forced_digest_collision_keeps_both_keys_retrievable() {
        // A constant digester (hash_seed irrelevant since we stub level 0
        // via the key encoding directly isn't possible without a custom
        // digester; instead we drive enough insertions that xxh3 level-0
        // collisions are exercised incidentally, and additionally probe
        // the bucket/collision path directly against the module-private
        // helpers for a deterministic forced collision).
        let storage = new_storage(1024);
        let s = storage.borrow();
        let seed = s.config().hash_seed();
        drop(s);
        // Search a small range for two inputs whose level-0 digests
        // collide, to exercise the Single -> Collision upgrade path
        // end-to-end through the public Map API.
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
        let mut map: Map<_, U64Key, U64Key, Unit> = Map::new(storage, Unit);
        map.set(U64Key(a), U64Key(a)).unwrap();
        map.set(U64Key(b), U64Key(b)).unwrap();
        assert_eq!(map.get(&U64Key(a)).unwrap(), Some(U64Key(a)));
        assert_eq!(map.get(&U64Key(b)).unwrap(), Some(U64Key(b)));
        assert_eq!(map.count().unwrap(), 2);
        map.remove(&U64Key(a)).unwrap();
        assert_eq!(map.get(&U64Key(a)).unwrap(), None);
        assert_eq!(map.get(&U64Key(b)).unwrap(), Some(U64Key(b)));
        assert_eq!(map.count().unwrap(), 1);
    }

    #[test]
    fn open_recovers_type_info_after_commit() {
        let storage = new_storage(1024);
        let root = {
            let mut map: Map<_, U64Key, U64Key, Unit> = Map::new(storage.clone(), Unit);
            map.set(U64Key(7), U64Key(77)).unwrap();
            map.commit().unwrap();
            map.root_id()
        };
        let reopened: Map<_, U64Key, U64Key, Unit> = Map::open(storage, root).unwrap();
        assert_eq!(reopened.get(&U64Key(7)).unwrap(), Some(U64Key(77)));
    }

    #[test]
    fn deep_remove_frees_every_slab() {
        let storage = new_storage(128);
        let mut map: Map<_, U64Key, U64Key, Unit> = Map::new(storage.clone(), Unit);
        for i in 0..100u64 {
            map.set(U64Key(i), U64Key(i)).unwrap();
        }
        map.commit().unwrap();
        map.deep_remove().unwrap();
        storage.borrow_mut().commit().unwrap();
        assert_eq!(storage.borrow().count(), 0);
    }
}
