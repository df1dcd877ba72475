//! The Array tree (C4): an ordered, indexed sequence backed by a
//! slab-addressed, copy-on-write, high-fanout B+-tree.
//!
//! Addressing walks meta children subtracting each child's recursive
//! count until the target lands inside one, ties broken leftward.
//! Mutation always retrieves, clones to an owned [`Slab`], mutates the
//! clone, and re-`store`s it — `SlabStorage::store` is what marks a
//! slab dirty, so in-place mutation through a retrieved handle alone
//! would be silently lost.

use crate::codec::{make_storable, resolve_storable};
use crate::policy;
use crate::typeinfo::{decode_root_extra, encode_root_extra, ElementCodec, TypeInfo, ROOT_KIND_ARRAY};
use crate::util::{encoded_len, relocate};
use crate::{deep, StorageHandle};
use slabtree_core::{Error, Header, Result, SlabId, StorageConfig};
use slabtree_storage::{BlobStore, Slab, SlabStorage, Storable};
use std::marker::PhantomData;

const ARRAY_DATA_FIXED_OVERHEAD: u32 = 2 + 3 + 16; // version+flags, 0x99 len header, next pointer
const ARRAY_META_FIXED_OVERHEAD: u32 = 2 + 2; // version+flags, child count u16

enum Outcome {
    Updated(Header),
    Split(Header, Header),
}

/// An ordered, indexed sequence of `V` values.
pub struct Array<B: BlobStore, V: ElementCodec, TI: TypeInfo> {
    storage: StorageHandle<B>,
    root: SlabId,
    type_info: TI,
    _marker: PhantomData<V>,
}

impl<B: BlobStore, V: ElementCodec, TI: TypeInfo> Array<B, V, TI> {
    /// Create a brand-new, empty array rooted at a freshly issued slab.
    pub fn new(storage: StorageHandle<B>, type_info: TI) -> Self {
        let root = {
            let s = storage.borrow();
            let id = s.generate_id();
            s.store(
                id,
                Slab::ArrayData {
                    id,
                    next: SlabId::sentinel(),
                    elements: Vec::new(),
                },
            );
            id
        };
        Array {
            storage,
            root,
            type_info,
            _marker: PhantomData,
        }
    }

    /// Open a previously committed array by its root id.
    pub fn open(storage: StorageHandle<B>, root: SlabId) -> Result<Self> {
        let type_info = {
            let s = storage.borrow();
            let extra = s.read_extra_data(root)?;
            match extra {
                Some(bytes) => decode_root_extra::<TI>(&bytes, ROOT_KIND_ARRAY, "Array", root)?,
                None => {
                    return Err(Error::TypeInfoMismatch {
                        id: root,
                        expected: "Array",
                    })
                }
            }
        };
        Ok(Array {
            storage,
            root,
            type_info,
            _marker: PhantomData,
        })
    }

    /// This array's root id, stable across every mutation except a root
    /// split/collapse (which preserves it anyway).
    pub fn root_id(&self) -> SlabId {
        self.root
    }

    /// The opaque type descriptor this array was created or opened with.
    pub fn type_info(&self) -> &TI {
        &self.type_info
    }

    /// Number of elements in the array.
    pub fn count(&self) -> Result<u32> {
        let s = self.storage.borrow();
        Ok(s.retrieve(self.root)?.borrow().count())
    }

    /// Fetch the element at `index`.
    pub fn get(&self, index: u32) -> Result<V> {
        let s = self.storage.borrow();
        let count = s.retrieve(self.root)?.borrow().count();
        if index >= count {
            return Err(Error::IndexOutOfBounds {
                index: index as u64,
                len: count as u64,
            });
        }
        let storable = get_rec(&s, self.root, index)?;
        resolve_storable::<B, V>(&s, &storable)
    }

    /// Replace the element at `index`, returning the previous value.
    pub fn set(&mut self, index: u32, value: V) -> Result<V> {
        let old = {
            let s = self.storage.borrow();
            let count = s.retrieve(self.root)?.borrow().count();
            if index >= count {
                return Err(Error::IndexOutOfBounds {
                    index: index as u64,
                    len: count as u64,
                });
            }
            let storable = make_storable(&s, &value)?;
            let config = s.config();
            let (old, outcome) = set_rec(&s, self.root, index, storable, config)?;
            apply_root_outcome(&s, self.root, outcome)?;
            old
        };
        let s = self.storage.borrow();
        resolve_storable::<B, V>(&s, &old)
    }

    /// Insert `value` so it becomes element `index`, shifting everything
    /// at or after `index` one place to the right. `index == count()` is
    /// a valid append.
    pub fn insert(&mut self, index: u32, value: V) -> Result<()> {
        let s = self.storage.borrow();
        let count = s.retrieve(self.root)?.borrow().count();
        if index > count {
            return Err(Error::IndexOutOfBounds {
                index: index as u64,
                len: count as u64,
            });
        }
        let storable = make_storable(&s, &value)?;
        let config = s.config();
        let outcome = insert_rec(&s, self.root, index, storable, config)?;
        apply_root_outcome(&s, self.root, outcome)
    }

    /// Append `value` as the new last element.
    pub fn append(&mut self, value: V) -> Result<()> {
        let count = self.count()?;
        self.insert(count, value)
    }

    /// Remove and return the element at `index`.
    pub fn remove(&mut self, index: u32) -> Result<V> {
        let removed = {
            let s = self.storage.borrow();
            let count = s.retrieve(self.root)?.borrow().count();
            if index >= count {
                return Err(Error::IndexOutOfBounds {
                    index: index as u64,
                    len: count as u64,
                });
            }
            let config = s.config();
            let (removed, outcome) = remove_rec(&s, self.root, index, config)?;
            apply_root_outcome(&s, self.root, outcome)?;
            removed
        };
        let s = self.storage.borrow();
        resolve_storable::<B, V>(&s, &removed)
    }

    /// Visit every element in index order, stopping early if `f`
    /// returns `Ok(false)`.
    pub fn iterate<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(V) -> Result<bool>,
    {
        let s = self.storage.borrow();
        let mut leaf_id = Some(leftmost_leaf(&s, self.root)?);
        while let Some(id) = leaf_id {
            let handle = s.retrieve(id)?;
            let (elements, next) = match &*handle.borrow() {
                Slab::ArrayData { elements, next, .. } => (elements.clone(), *next),
                other => {
                    return Err(Error::WrongSlabType {
                        id,
                        expected: "ArrayData",
                        found: other.kind_name(),
                    })
                }
            };
            for e in elements {
                let value = resolve_storable::<B, V>(&s, &e)?;
                if !f(value)? {
                    return Ok(());
                }
            }
            leaf_id = if next.is_sentinel() { None } else { Some(next) };
        }
        Ok(())
    }

    /// Repeatedly remove and visit the last element until the array is
    /// empty or `f` returns `Ok(false)`.
    pub fn pop_iterate<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(V) -> Result<bool>,
    {
        loop {
            let count = self.count()?;
            if count == 0 {
                return Ok(());
            }
            let value = self.remove(count - 1)?;
            if !f(value)? {
                return Ok(());
            }
        }
    }

    /// A lazy, forward iterator over the array's elements.
    pub fn iterator(&self) -> Result<ArrayIter<'_, B, V, TI>> {
        let s = self.storage.borrow();
        let leaf = leftmost_leaf(&s, self.root)?;
        Ok(ArrayIter {
            array: self,
            next_leaf: Some(leaf),
            buf: Vec::new().into_iter(),
        })
    }

    /// Free every slab reachable from this array's root.
    pub fn deep_remove(self) -> Result<()> {
        let s = self.storage.borrow();
        deep::deep_remove(&s, self.root)
    }

    /// Rebuild this array under a fresh address, returning the new
    /// root id. `dest` must already be constructed for that address.
    /// The new root is committed immediately, carrying this array's
    /// `TypeInfo` preamble, so it can be reopened via `Array::open`
    /// without a further explicit `commit()`.
    pub fn deep_copy(&self, dest: &StorageHandle<B>) -> Result<SlabId> {
        let new_root = {
            let src = self.storage.borrow();
            let dst = dest.borrow();
            deep::deep_copy(&src, &dst, self.root)?
        };
        let mut dst = dest.borrow_mut();
        let extra = encode_root_extra(ROOT_KIND_ARRAY, &self.type_info);
        dst.commit_root(new_root, &extra)?;
        dst.commit()?;
        Ok(new_root)
    }

    /// Commit this array's root (carrying its `TypeInfo` preamble) and
    /// every other dirty slab in the shared storage.
    pub fn commit(&self) -> Result<()> {
        let mut s = self.storage.borrow_mut();
        let extra = encode_root_extra(ROOT_KIND_ARRAY, &self.type_info);
        s.commit_root(self.root, &extra)?;
        s.commit()
    }

    /// Check every structural invariant across this array's whole tree
    /// (see [`crate::validate`]).
    pub fn validate(&self) -> Result<crate::ValidationReport> {
        let s = self.storage.borrow();
        crate::validate(&s, self.root, s.config())
    }

}

fn apply_root_outcome<B: BlobStore>(s: &SlabStorage<B>, root: SlabId, outcome: Outcome) -> Result<()> {
    if let Outcome::Split(left, right) = outcome {
        debug_assert_eq!(left.id, root);
        let new_left_id = s.generate_id();
        let left_handle = s.retrieve(left.id)?;
        let left_slab = left_handle.borrow().clone();
        let relocated = relocate(left_slab, new_left_id);
        s.store(new_left_id, relocated);
        s.remove(root);
        let new_left = Header::new(new_left_id, left.count, left.size);
        s.store(
            root,
            Slab::ArrayMeta {
                id: root,
                children: vec![new_left, right],
            },
        );
    }
    collapse_if_singleton(s, root)
}

/// A lazy, forward iterator over an [`Array`]'s elements.
pub struct ArrayIter<'a, B: BlobStore, V: ElementCodec, TI: TypeInfo> {
    array: &'a Array<B, V, TI>,
    next_leaf: Option<SlabId>,
    buf: std::vec::IntoIter<Storable>,
}

impl<'a, B: BlobStore, V: ElementCodec, TI: TypeInfo> Iterator for ArrayIter<'a, B, V, TI> {
    type Item = Result<V>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(storable) = self.buf.next() {
                let s = self.array.storage.borrow();
                return Some(resolve_storable::<B, V>(&s, &storable));
            }
            let leaf_id = self.next_leaf.take()?;
            let s = self.array.storage.borrow();
            let handle = match s.retrieve(leaf_id) {
                Ok(h) => h,
                Err(e) => return Some(Err(e)),
            };
            let (elements, next) = match &*handle.borrow() {
                Slab::ArrayData { elements, next, .. } => (elements.clone(), *next),
                other => {
                    return Some(Err(Error::WrongSlabType {
                        id: leaf_id,
                        expected: "ArrayData",
                        found: other.kind_name(),
                    }))
                }
            };
            if !next.is_sentinel() {
                self.next_leaf = Some(next);
            }
            self.buf = elements.into_iter();
        }
    }
}

fn leftmost_leaf<B: BlobStore>(s: &SlabStorage<B>, id: SlabId) -> Result<SlabId> {
    let handle = s.retrieve(id)?;
    let first_child = match &*handle.borrow() {
        Slab::ArrayData { .. } => return Ok(id),
        Slab::ArrayMeta { children, .. } => children[0].id,
        other => {
            return Err(Error::WrongSlabType {
                id,
                expected: "Array",
                found: other.kind_name(),
            })
        }
    };
    leftmost_leaf(s, first_child)
}

/// Locates the child strictly containing `index` (for get/set/remove,
/// where `index < count` always holds). Ties broken leftward.
fn locate_child(children: &[Header], index: u32) -> (SlabId, u32, usize) {
    let mut remaining = index;
    for (i, c) in children.iter().enumerate() {
        if remaining < c.count {
            return (c.id, remaining, i);
        }
        remaining -= c.count;
    }
    let last = children.len() - 1;
    (children[last].id, children[last].count, last)
}

/// Locates the child that should absorb an insertion at `index`, where
/// `index == count` (append) is legal. Ties at a child boundary favor
/// the earlier child.
fn locate_insert_child(children: &[Header], index: u32) -> (SlabId, u32, usize) {
    let mut remaining = index;
    for (i, c) in children.iter().enumerate() {
        if remaining <= c.count {
            return (c.id, remaining, i);
        }
        remaining -= c.count;
    }
    unreachable!("meta slab must have at least one child")
}

fn get_rec<B: BlobStore>(s: &SlabStorage<B>, id: SlabId, index: u32) -> Result<Storable> {
    let handle = s.retrieve(id)?;
    let next = match &*handle.borrow() {
        Slab::ArrayData { elements, .. } => return Ok(elements[index as usize].clone()),
        Slab::ArrayMeta { children, .. } => locate_child(children, index),
        other => {
            return Err(Error::WrongSlabType {
                id,
                expected: "Array",
                found: other.kind_name(),
            })
        }
    };
    let (child_id, local_index, _) = next;
    get_rec(s, child_id, local_index)
}

fn insert_rec<B: BlobStore>(
    s: &SlabStorage<B>,
    id: SlabId,
    index: u32,
    storable: Storable,
    config: StorageConfig,
) -> Result<Outcome> {
    let handle = s.retrieve(id)?;
    let is_meta = matches!(&*handle.borrow(), Slab::ArrayMeta { .. });
    if !is_meta {
        let mut slab = handle.borrow().clone();
        match &mut slab {
            Slab::ArrayData { elements, .. } => elements.insert(index as usize, storable),
            other => {
                return Err(Error::WrongSlabType {
                    id,
                    expected: "ArrayData",
                    found: other.kind_name(),
                })
            }
        }
        return finish_leaf(s, id, slab, config);
    }
    let (child_id, local_index, child_idx) = {
        let slab = handle.borrow();
        match &*slab {
            Slab::ArrayMeta { children, .. } => locate_insert_child(children, index),
            _ => unreachable!(),
        }
    };
    let child_outcome = insert_rec(s, child_id, local_index, storable, config)?;
    let mut slab = handle.borrow().clone();
    let children = match &mut slab {
        Slab::ArrayMeta { children, .. } => children,
        _ => unreachable!(),
    };
    splice_child_outcome(s, children, child_idx, child_outcome, config)?;
    finish_meta(s, id, slab, config)
}

fn remove_rec<B: BlobStore>(
    s: &SlabStorage<B>,
    id: SlabId,
    index: u32,
    config: StorageConfig,
) -> Result<(Storable, Outcome)> {
    let handle = s.retrieve(id)?;
    let is_meta = matches!(&*handle.borrow(), Slab::ArrayMeta { .. });
    if !is_meta {
        let mut slab = handle.borrow().clone();
        let removed = match &mut slab {
            Slab::ArrayData { elements, .. } => elements.remove(index as usize),
            other => {
                return Err(Error::WrongSlabType {
                    id,
                    expected: "ArrayData",
                    found: other.kind_name(),
                })
            }
        };
        let outcome = finish_leaf(s, id, slab, config)?;
        return Ok((removed, outcome));
    }
    let (child_id, local_index, child_idx) = {
        let slab = handle.borrow();
        match &*slab {
            Slab::ArrayMeta { children, .. } => locate_child(children, index),
            _ => unreachable!(),
        }
    };
    let (removed, child_outcome) = remove_rec(s, child_id, local_index, config)?;
    let mut slab = handle.borrow().clone();
    let children = match &mut slab {
        Slab::ArrayMeta { children, .. } => children,
        _ => unreachable!(),
    };
    splice_child_outcome(s, children, child_idx, child_outcome, config)?;
    let outcome = finish_meta(s, id, slab, config)?;
    Ok((removed, outcome))
}

fn set_rec<B: BlobStore>(
    s: &SlabStorage<B>,
    id: SlabId,
    index: u32,
    new_storable: Storable,
    config: StorageConfig,
) -> Result<(Storable, Outcome)> {
    let handle = s.retrieve(id)?;
    let is_meta = matches!(&*handle.borrow(), Slab::ArrayMeta { .. });
    if !is_meta {
        let mut slab = handle.borrow().clone();
        let old = match &mut slab {
            Slab::ArrayData { elements, .. } => {
                std::mem::replace(&mut elements[index as usize], new_storable)
            }
            other => {
                return Err(Error::WrongSlabType {
                    id,
                    expected: "ArrayData",
                    found: other.kind_name(),
                })
            }
        };
        let outcome = finish_leaf(s, id, slab, config)?;
        return Ok((old, outcome));
    }
    let (child_id, local_index, child_idx) = {
        let slab = handle.borrow();
        match &*slab {
            Slab::ArrayMeta { children, .. } => locate_child(children, index),
            _ => unreachable!(),
        }
    };
    let (old, child_outcome) = set_rec(s, child_id, local_index, new_storable, config)?;
    let mut slab = handle.borrow().clone();
    let children = match &mut slab {
        Slab::ArrayMeta { children, .. } => children,
        _ => unreachable!(),
    };
    splice_child_outcome(s, children, child_idx, child_outcome, config)?;
    let outcome = finish_meta(s, id, slab, config)?;
    Ok((old, outcome))
}

fn splice_child_outcome<B: BlobStore>(
    s: &SlabStorage<B>,
    children: &mut Vec<Header>,
    child_idx: usize,
    outcome: Outcome,
    config: StorageConfig,
) -> Result<()> {
    match outcome {
        Outcome::Updated(h) => {
            let underfull = h.size < config.min_threshold();
            children[child_idx] = h;
            if underfull {
                fix_underfull_child(s, children, child_idx, config)?;
            }
        }
        Outcome::Split(h1, h2) => {
            children[child_idx] = h1;
            children.insert(child_idx + 1, h2);
        }
    }
    Ok(())
}

fn finish_leaf<B: BlobStore>(
    s: &SlabStorage<B>,
    id: SlabId,
    slab: Slab,
    config: StorageConfig,
) -> Result<Outcome> {
    let size = encoded_len(&slab);
    if size <= config.max_threshold() {
        let header = Header::new(id, slab.count(), size);
        s.store(id, slab);
        return Ok(Outcome::Updated(header));
    }
    let (next, elements) = match slab {
        Slab::ArrayData { next, elements, .. } => (next, elements),
        _ => unreachable!("finish_leaf called on non-leaf slab"),
    };
    let sizes: Vec<u32> = elements.iter().map(Storable::byte_size).collect();
    let k = policy::split_boundary(&sizes, ARRAY_DATA_FIXED_OVERHEAD, config.min_threshold());
    let mut elements = elements;
    let right_elements = elements.split_off(k);
    let right_id = s.generate_id();
    let left = Slab::ArrayData {
        id,
        next: right_id,
        elements,
    };
    let right = Slab::ArrayData {
        id: right_id,
        next,
        elements: right_elements,
    };
    let lh = Header::new(id, left.count(), encoded_len(&left));
    let rh = Header::new(right_id, right.count(), encoded_len(&right));
    s.store(id, left);
    s.store(right_id, right);
    Ok(Outcome::Split(lh, rh))
}

fn finish_meta<B: BlobStore>(
    s: &SlabStorage<B>,
    id: SlabId,
    slab: Slab,
    config: StorageConfig,
) -> Result<Outcome> {
    let size = encoded_len(&slab);
    if size <= config.max_threshold() {
        let header = Header::new(id, slab.count(), size);
        s.store(id, slab);
        return Ok(Outcome::Updated(header));
    }
    let children = match slab {
        Slab::ArrayMeta { children, .. } => children,
        _ => unreachable!("finish_meta called on non-meta slab"),
    };
    let sizes = vec![Header::ENCODED_LEN as u32; children.len()];
    let k = policy::split_boundary(&sizes, ARRAY_META_FIXED_OVERHEAD, config.min_threshold());
    let mut children = children;
    let right_children = children.split_off(k);
    let right_id = s.generate_id();
    let left = Slab::ArrayMeta { id, children };
    let right = Slab::ArrayMeta {
        id: right_id,
        children: right_children,
    };
    let lh = Header::new(id, left.count(), encoded_len(&left));
    let rh = Header::new(right_id, right.count(), encoded_len(&right));
    s.store(id, left);
    s.store(right_id, right);
    Ok(Outcome::Split(lh, rh))
}

fn fix_underfull_child<B: BlobStore>(
    s: &SlabStorage<B>,
    children: &mut Vec<Header>,
    idx: usize,
    config: StorageConfig,
) -> Result<()> {
    if children.len() <= 1 || children[idx].size >= config.min_threshold() {
        return Ok(());
    }
    if idx + 1 < children.len() && try_fix_pair(s, children, idx, idx + 1, config)? {
        return Ok(());
    }
    if idx > 0 {
        try_fix_pair(s, children, idx - 1, idx, config)?;
    }
    Ok(())
}

fn try_fix_pair<B: BlobStore>(
    s: &SlabStorage<B>,
    children: &mut Vec<Header>,
    left_idx: usize,
    right_idx: usize,
    config: StorageConfig,
) -> Result<bool> {
    let left_id = children[left_idx].id;
    let is_meta = matches!(&*s.retrieve(left_id)?.borrow(), Slab::ArrayMeta { .. });
    if is_meta {
        fix_pair_meta(s, children, left_idx, right_idx, config)
    } else {
        fix_pair_leaf(s, children, left_idx, right_idx, config)
    }
}

fn fix_pair_leaf<B: BlobStore>(
    s: &SlabStorage<B>,
    children: &mut Vec<Header>,
    left_idx: usize,
    right_idx: usize,
    config: StorageConfig,
) -> Result<bool> {
    let left_id = children[left_idx].id;
    let right_id = children[right_idx].id;
    let (_, mut left_elems) = match s.retrieve(left_id)?.borrow().clone() {
        Slab::ArrayData { next, elements, .. } => (next, elements),
        other => {
            return Err(Error::WrongSlabType {
                id: left_id,
                expected: "ArrayData",
                found: other.kind_name(),
            })
        }
    };
    let (right_next, mut right_elems) = match s.retrieve(right_id)?.borrow().clone() {
        Slab::ArrayData { next, elements, .. } => (next, elements),
        other => {
            return Err(Error::WrongSlabType {
                id: right_id,
                expected: "ArrayData",
                found: other.kind_name(),
            })
        }
    };
    let left_total = children[left_idx].size;
    let right_total = children[right_idx].size;
    let underfull_is_left = left_total < config.min_threshold();

    let rebalanced = if underfull_is_left {
        let donor_sizes: Vec<u32> = right_elems.iter().map(Storable::byte_size).collect();
        policy::rebalance_count(
            left_total,
            right_total,
            &donor_sizes,
            config.min_threshold(),
            config.max_threshold(),
        )
        .map(|k| {
            let moved: Vec<_> = right_elems.drain(..k).collect();
            left_elems.extend(moved);
        })
    } else {
        let donor_sizes: Vec<u32> = left_elems.iter().rev().map(Storable::byte_size).collect();
        policy::rebalance_count(
            right_total,
            left_total,
            &donor_sizes,
            config.min_threshold(),
            config.max_threshold(),
        )
        .map(|k| {
            let split_at = left_elems.len() - k;
            let mut moved = left_elems.split_off(split_at);
            moved.extend(right_elems.drain(..));
            right_elems = moved;
        })
    };

    if rebalanced.is_some() {
        let left_slab = Slab::ArrayData {
            id: left_id,
            next: right_id,
            elements: left_elems,
        };
        let right_slab = Slab::ArrayData {
            id: right_id,
            next: right_next,
            elements: right_elems,
        };
        children[left_idx] = Header::new(left_id, left_slab.count(), encoded_len(&left_slab));
        children[right_idx] = Header::new(right_id, right_slab.count(), encoded_len(&right_slab));
        s.store(left_id, left_slab);
        s.store(right_id, right_slab);
        return Ok(true);
    }

    if policy::can_merge(left_total, right_total, ARRAY_DATA_FIXED_OVERHEAD, config.max_threshold()) {
        left_elems.extend(right_elems);
        let merged = Slab::ArrayData {
            id: left_id,
            next: right_next,
            elements: left_elems,
        };
        children[left_idx] = Header::new(left_id, merged.count(), encoded_len(&merged));
        s.store(left_id, merged);
        s.remove(right_id);
        children.remove(right_idx);
        return Ok(true);
    }

    Ok(false)
}

fn fix_pair_meta<B: BlobStore>(
    s: &SlabStorage<B>,
    children: &mut Vec<Header>,
    left_idx: usize,
    right_idx: usize,
    config: StorageConfig,
) -> Result<bool> {
    let left_id = children[left_idx].id;
    let right_id = children[right_idx].id;
    let mut left_children = match s.retrieve(left_id)?.borrow().clone() {
        Slab::ArrayMeta { children, .. } => children,
        other => {
            return Err(Error::WrongSlabType {
                id: left_id,
                expected: "ArrayMeta",
                found: other.kind_name(),
            })
        }
    };
    let mut right_children = match s.retrieve(right_id)?.borrow().clone() {
        Slab::ArrayMeta { children, .. } => children,
        other => {
            return Err(Error::WrongSlabType {
                id: right_id,
                expected: "ArrayMeta",
                found: other.kind_name(),
            })
        }
    };
    let left_total = children[left_idx].size;
    let right_total = children[right_idx].size;
    let underfull_is_left = left_total < config.min_threshold();
    let unit = Header::ENCODED_LEN as u32;

    let rebalanced = if underfull_is_left {
        let donor_sizes = vec![unit; right_children.len()];
        policy::rebalance_count(
            left_total,
            right_total,
            &donor_sizes,
            config.min_threshold(),
            config.max_threshold(),
        )
        .map(|k| {
            let moved: Vec<_> = right_children.drain(..k).collect();
            left_children.extend(moved);
        })
    } else {
        let donor_sizes = vec![unit; left_children.len()];
        policy::rebalance_count(
            right_total,
            left_total,
            &donor_sizes,
            config.min_threshold(),
            config.max_threshold(),
        )
        .map(|k| {
            let split_at = left_children.len() - k;
            let mut moved = left_children.split_off(split_at);
            moved.extend(right_children.drain(..));
            right_children = moved;
        })
    };

    if rebalanced.is_some() {
        let left_slab = Slab::ArrayMeta {
            id: left_id,
            children: left_children,
        };
        let right_slab = Slab::ArrayMeta {
            id: right_id,
            children: right_children,
        };
        children[left_idx] = Header::new(left_id, left_slab.count(), encoded_len(&left_slab));
        children[right_idx] = Header::new(right_id, right_slab.count(), encoded_len(&right_slab));
        s.store(left_id, left_slab);
        s.store(right_id, right_slab);
        return Ok(true);
    }

    if policy::can_merge(left_total, right_total, ARRAY_META_FIXED_OVERHEAD, config.max_threshold()) {
        left_children.extend(right_children);
        let merged = Slab::ArrayMeta {
            id: left_id,
            children: left_children,
        };
        children[left_idx] = Header::new(left_id, merged.count(), encoded_len(&merged));
        s.store(left_id, merged);
        s.remove(right_id);
        children.remove(right_idx);
        return Ok(true);
    }

    Ok(false)
}

fn collapse_if_singleton<B: BlobStore>(s: &SlabStorage<B>, root: SlabId) -> Result<()> {
    loop {
        let handle = s.retrieve(root)?;
        let only_child_id = match &*handle.borrow() {
            Slab::ArrayMeta { children, .. } if children.len() == 1 => children[0].id,
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
    use slabtree_core::{Address, StorageConfig};
    use slabtree_storage::InMemoryBlobStore;
    use std::cell::RefCell;
    use std::rc::Rc;

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
        let config = StorageConfig::new(target_threshold, 0);
        Rc::new(RefCell::new(SlabStorage::new(
            Address::from_u64(1),
            config,
            InMemoryBlobStore::new(),
            0,
        )))
    }

    #[test]
    fn append_and_get_round_trip() {
        let storage = new_storage(1024);
        let mut array: Array<_, U64, Unit> = Array::new(storage, Unit);
        for i in 0..10 {
            array.append(U64(i)).unwrap();
        }
        assert_eq!(array.count().unwrap(), 10);
        for i in 0..10 {
            assert_eq!(array.get(i).unwrap(), U64(i as u64));
        }
    }

    #[test]
    fn insert_shifts_subsequent_elements() {
        let storage = new_storage(1024);
        let mut array: Array<_, U64, Unit> = Array::new(storage, Unit);
        array.append(U64(0)).unwrap();
        array.append(U64(1)).unwrap();
        array.insert(1, U64(99)).unwrap();
        assert_eq!(array.get(0).unwrap(), U64(0));
        assert_eq!(array.get(1).unwrap(), U64(99));
        assert_eq!(array.get(2).unwrap(), U64(1));
    }

    #[test]
    fn out_of_bounds_get_is_an_error() {
        let storage = new_storage(1024);
        let array: Array<_, U64, Unit> = Array::new(storage, Unit);
        assert!(matches!(
            array.get(0).unwrap_err(),
            Error::IndexOutOfBounds { index: 0, len: 0 }
        ));
    }

    #[test]
    fn many_appends_force_splits_and_preserve_order() {
        // Small threshold forces the tree past one leaf quickly.
        let storage = new_storage(128);
        let mut array: Array<_, U64, Unit> = Array::new(storage, Unit);
        for i in 0..200u64 {
            array.append(U64(i)).unwrap();
        }
        assert_eq!(array.count().unwrap(), 200);
        for i in 0..200u64 {
            assert_eq!(array.get(i as u32).unwrap(), U64(i));
        }
        let mut collected = Vec::new();
        array.iterate(|v| {
            collected.push(v.0);
            Ok(true)
        }).unwrap();
        assert_eq!(collected, (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn remove_from_large_array_shrinks_tree_and_preserves_order() {
        let storage = new_storage(128);
        let mut array: Array<_, U64, Unit> = Array::new(storage, Unit);
        for i in 0..200u64 {
            array.append(U64(i)).unwrap();
        }
        for _ in 0..150 {
            array.remove(0).unwrap();
        }
        assert_eq!(array.count().unwrap(), 50);
        for i in 0..50u64 {
            assert_eq!(array.get(i as u32).unwrap(), U64(i + 150));
        }
    }

    #[test]
    fn pop_iterate_drains_last_to_first() {
        let storage = new_storage(1024);
        let mut array: Array<_, U64, Unit> = Array::new(storage, Unit);
        for i in 0..5u64 {
            array.append(U64(i)).unwrap();
        }
        let mut popped = Vec::new();
        array.pop_iterate(|v| {
            popped.push(v.0);
            Ok(true)
        }).unwrap();
        assert_eq!(popped, vec![4, 3, 2, 1, 0]);
        assert_eq!(array.count().unwrap(), 0);
    }

    #[test]
    fn iterator_matches_iterate() {
        let storage = new_storage(128);
        let mut array: Array<_, U64, Unit> = Array::new(storage, Unit);
        for i in 0..100u64 {
            array.append(U64(i)).unwrap();
        }
        let collected: Vec<u64> = array
            .iterator()
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(collected, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn open_recovers_type_info_after_commit() {
        let storage = new_storage(1024);
        let root = {
            let mut array: Array<_, U64, Unit> = Array::new(storage.clone(), Unit);
            array.append(U64(7)).unwrap();
            array.commit().unwrap();
            array.root_id()
        };
        let reopened: Array<_, U64, Unit> = Array::open(storage, root).unwrap();
        assert_eq!(reopened.get(0).unwrap(), U64(7));
    }

    #[test]
    fn root_split_preserves_root_id() {
        let storage = new_storage(128);
        let mut array: Array<_, U64, Unit> = Array::new(storage, Unit);
        let original_root = array.root_id();
        for i in 0..200u64 {
            array.append(U64(i)).unwrap();
        }
        assert_eq!(array.root_id(), original_root);
    }

    #[test]
    fn deep_remove_frees_every_slab() {
        let storage = new_storage(128);
        let mut array: Array<_, U64, Unit> = Array::new(storage.clone(), Unit);
        for i in 0..100u64 {
            array.append(U64(i)).unwrap();
        }
        array.commit().unwrap();
        array.deep_remove().unwrap();
        storage.borrow_mut().commit().unwrap();
        assert_eq!(storage.borrow().count(), 0);
    }
}
