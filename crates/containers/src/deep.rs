//! `DeepRemove`/`DeepCopy` (§4.4): shared structural walks over any slab
//! tree, independent of the Array/Map distinction and of the element
//! codec — they only need to see `Storable` pointers and child headers.

use slabtree_core::{Header, Result, SlabId};
use slabtree_storage::{
    BlobStore, CollisionBody, CollisionGroup, GroupNode, MapChild, MapElement, Slab, SlabStorage,
    Storable,
};

/// Recursively free every slab reachable from `root`, including spilled
/// Storable slabs and the roots of nested containers held as values.
/// Freeing is bottom-up: children first, `root` itself last.
pub fn deep_remove<B: BlobStore>(storage: &SlabStorage<B>, root: SlabId) -> Result<()> {
    if root.is_sentinel() {
        return Ok(());
    }
    let handle = storage.retrieve(root)?;
    let slab = handle.borrow().clone();
    match &slab {
        Slab::ArrayData { elements, .. } => {
            for e in elements {
                remove_if_pointer(storage, e)?;
            }
        }
        Slab::ArrayMeta { children, .. } => {
            for c in children {
                deep_remove(storage, c.id)?;
            }
        }
        Slab::MapData { elements, .. } => {
            for e in elements {
                deep_remove_map_element(storage, e)?;
            }
        }
        Slab::MapMeta { children, .. } => {
            for c in children {
                deep_remove(storage, c.header.id)?;
            }
        }
        Slab::Storable { .. } => {}
        Slab::MapCollision { body, .. } => deep_remove_body(storage, body)?,
    }
    storage.remove(root);
    Ok(())
}

fn remove_if_pointer<B: BlobStore>(storage: &SlabStorage<B>, storable: &Storable) -> Result<()> {
    if let Storable::Pointer(id) = storable {
        deep_remove(storage, *id)?;
    }
    Ok(())
}

fn deep_remove_map_element<B: BlobStore>(storage: &SlabStorage<B>, e: &MapElement) -> Result<()> {
    match e {
        MapElement::Single { key, value, .. } => {
            remove_if_pointer(storage, key)?;
            remove_if_pointer(storage, value)
        }
        MapElement::Collision { group, .. } => deep_remove_group(storage, group),
    }
}

fn deep_remove_group<B: BlobStore>(storage: &SlabStorage<B>, group: &CollisionGroup) -> Result<()> {
    match group {
        CollisionGroup::Inline(body) => deep_remove_body(storage, body),
        CollisionGroup::External { id, .. } => deep_remove(storage, *id),
    }
}

fn deep_remove_body<B: BlobStore>(storage: &SlabStorage<B>, body: &CollisionBody) -> Result<()> {
    for (_, node) in &body.entries {
        match node {
            GroupNode::Entry(k, v) => {
                remove_if_pointer(storage, k)?;
                remove_if_pointer(storage, v)?;
            }
            GroupNode::SubGroup(sub) => deep_remove_body(storage, sub)?,
        }
    }
    for (k, v) in &body.bucket {
        remove_if_pointer(storage, k)?;
        remove_if_pointer(storage, v)?;
    }
    Ok(())
}

/// Rebuild the tree rooted at `root` under a new owning address, reusing
/// `dest` (already constructed for that address) and allocating a fresh
/// id for every slab — including spilled Storables and nested container
/// roots — while preserving leaf chaining (`next` pointers) and every
/// other byte of content.
pub fn deep_copy<B: BlobStore>(
    src: &SlabStorage<B>,
    dest: &SlabStorage<B>,
    root: SlabId,
) -> Result<SlabId> {
    if root.is_sentinel() {
        return Ok(SlabId::sentinel());
    }
    let (new_id, _, _) = deep_copy_inner(src, dest, root)?;
    Ok(new_id)
}

/// Copies one slab (recursively) and reports `(new_id, leftmost_leaf,
/// rightmost_leaf)` so the caller — if it is a meta slab stitching
/// several children together — can link consecutive children's leaf
/// chains without a separate whole-tree relinking pass.
fn deep_copy_inner<B: BlobStore>(
    src: &SlabStorage<B>,
    dest: &SlabStorage<B>,
    root: SlabId,
) -> Result<(SlabId, SlabId, SlabId)> {
    let handle = src.retrieve(root)?;
    let slab = handle.borrow().clone();
    let new_id = dest.generate_id();
    let (copied, leftmost, rightmost) = match slab {
        Slab::ArrayData { elements, .. } => {
            let mut new_elements = Vec::with_capacity(elements.len());
            for e in &elements {
                new_elements.push(copy_storable(src, dest, e)?);
            }
            (
                Slab::ArrayData {
                    id: new_id,
                    next: SlabId::sentinel(),
                    elements: new_elements,
                },
                new_id,
                new_id,
            )
        }
        Slab::ArrayMeta { children, .. } => {
            let mut new_children = Vec::with_capacity(children.len());
            let mut prev_right: Option<SlabId> = None;
            let mut leftmost: Option<SlabId> = None;
            let mut rightmost = new_id;
            for c in &children {
                let (child_new, child_left, child_right) = deep_copy_inner(src, dest, c.id)?;
                leftmost.get_or_insert(child_left);
                if let Some(pr) = prev_right {
                    link_next(dest, pr, child_left)?;
                }
                prev_right = Some(child_right);
                rightmost = child_right;
                new_children.push(Header::new(child_new, c.count, c.size));
            }
            (
                Slab::ArrayMeta {
                    id: new_id,
                    children: new_children,
                },
                leftmost.unwrap_or(new_id),
                rightmost,
            )
        }
        Slab::MapData { elements, .. } => {
            let mut new_elements = Vec::with_capacity(elements.len());
            for e in &elements {
                new_elements.push(copy_map_element(src, dest, e)?);
            }
            (
                Slab::MapData {
                    id: new_id,
                    next: SlabId::sentinel(),
                    elements: new_elements,
                },
                new_id,
                new_id,
            )
        }
        Slab::MapMeta { children, .. } => {
            let mut new_children = Vec::with_capacity(children.len());
            let mut prev_right: Option<SlabId> = None;
            let mut leftmost: Option<SlabId> = None;
            let mut rightmost = new_id;
            for c in &children {
                let (child_new, child_left, child_right) = deep_copy_inner(src, dest, c.header.id)?;
                leftmost.get_or_insert(child_left);
                if let Some(pr) = prev_right {
                    link_next(dest, pr, child_left)?;
                }
                prev_right = Some(child_right);
                rightmost = child_right;
                new_children.push(MapChild {
                    header: Header::new(child_new, c.header.count, c.header.size),
                    first_digest: c.first_digest,
                });
            }
            (
                Slab::MapMeta {
                    id: new_id,
                    children: new_children,
                },
                leftmost.unwrap_or(new_id),
                rightmost,
            )
        }
        Slab::Storable { payload, .. } => (
            Slab::Storable {
                id: new_id,
                payload,
            },
            new_id,
            new_id,
        ),
        Slab::MapCollision { body, .. } => (
            Slab::MapCollision {
                id: new_id,
                body: copy_body(src, dest, &body)?,
            },
            new_id,
            new_id,
        ),
    };
    dest.store(new_id, copied);
    Ok((new_id, leftmost, rightmost))
}

fn link_next<B: BlobStore>(dest: &SlabStorage<B>, leaf_id: SlabId, next_id: SlabId) -> Result<()> {
    let handle = dest.retrieve(leaf_id)?;
    let mut slab = handle.borrow().clone();
    match &mut slab {
        Slab::ArrayData { next, .. } | Slab::MapData { next, .. } => *next = next_id,
        _ => return Ok(()),
    }
    dest.store(leaf_id, slab);
    Ok(())
}

fn copy_storable<B: BlobStore>(
    src: &SlabStorage<B>,
    dest: &SlabStorage<B>,
    s: &Storable,
) -> Result<Storable> {
    match s {
        Storable::Inline(bytes) => Ok(Storable::Inline(bytes.clone())),
        Storable::Pointer(id) => Ok(Storable::Pointer(deep_copy(src, dest, *id)?)),
    }
}

fn copy_map_element<B: BlobStore>(
    src: &SlabStorage<B>,
    dest: &SlabStorage<B>,
    e: &MapElement,
) -> Result<MapElement> {
    match e {
        MapElement::Single {
            digest0,
            key,
            value,
        } => Ok(MapElement::Single {
            digest0: *digest0,
            key: copy_storable(src, dest, key)?,
            value: copy_storable(src, dest, value)?,
        }),
        MapElement::Collision { digest0, group } => Ok(MapElement::Collision {
            digest0: *digest0,
            group: copy_group(src, dest, group)?,
        }),
    }
}

fn copy_group<B: BlobStore>(
    src: &SlabStorage<B>,
    dest: &SlabStorage<B>,
    g: &CollisionGroup,
) -> Result<CollisionGroup> {
    match g {
        CollisionGroup::Inline(body) => Ok(CollisionGroup::Inline(copy_body(src, dest, body)?)),
        CollisionGroup::External { id, count } => Ok(CollisionGroup::External {
            id: deep_copy(src, dest, *id)?,
            count: *count,
        }),
    }
}

fn copy_body<B: BlobStore>(
    src: &SlabStorage<B>,
    dest: &SlabStorage<B>,
    body: &CollisionBody,
) -> Result<CollisionBody> {
    let mut entries = Vec::with_capacity(body.entries.len());
    for (digest, node) in &body.entries {
        let new_node = match node {
            GroupNode::Entry(k, v) => {
                GroupNode::Entry(copy_storable(src, dest, k)?, copy_storable(src, dest, v)?)
            }
            GroupNode::SubGroup(sub) => GroupNode::SubGroup(Box::new(copy_body(src, dest, sub)?)),
        };
        entries.push((*digest, new_node));
    }
    let mut bucket = Vec::with_capacity(body.bucket.len());
    for (k, v) in &body.bucket {
        bucket.push((copy_storable(src, dest, k)?, copy_storable(src, dest, v)?));
    }
    Ok(CollisionBody {
        level: body.level,
        entries,
        bucket,
    })
}

#[cfg(test)]
mod tests {
    use crate::array::Array;
    use crate::map::Map;
    use crate::typeinfo::{ElementCodec, TypeInfo};
    use slabtree_core::{Address, Result, StorageConfig};
    use slabtree_storage::{InMemoryBlobStore, SlabStorage};
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

    fn new_storage(target_threshold: u32, address: u64) -> crate::StorageHandle<InMemoryBlobStore> {
        let config = StorageConfig::new(target_threshold, 0);
        Rc::new(RefCell::new(SlabStorage::new(
            Address::from_u64(address),
            config,
            InMemoryBlobStore::new(),
            0,
        )))
    }

    #[test]
    fn deep_remove_array_drops_every_slab_it_touched() {
        let storage = new_storage(128, 1);
        let mut array: Array<_, U64, Unit> = Array::new(storage.clone(), Unit);
        for i in 0..200u64 {
            array.append(U64(i)).unwrap();
        }
        assert!(storage.borrow().count() > 1);
        array.deep_remove().unwrap();
        assert_eq!(storage.borrow().count(), 0);
    }

    #[test]
    fn deep_copy_array_is_element_equal_and_reopenable_at_a_new_address() {
        let src_storage = new_storage(128, 1);
        let mut src: Array<_, U64, Unit> = Array::new(src_storage.clone(), Unit);
        for i in 0..200u64 {
            src.append(U64(i)).unwrap();
        }
        src.commit().unwrap();

        let dest_storage = new_storage(128, 2);
        let dest_root = src.deep_copy(&dest_storage).unwrap();
        assert_ne!(dest_root, src.root_id());

        let copy: Array<_, U64, Unit> = Array::open(dest_storage.clone(), dest_root).unwrap();
        assert_eq!(copy.count().unwrap(), src.count().unwrap());
        for i in 0..200u64 {
            assert_eq!(copy.get(i as u32).unwrap(), src.get(i as u32).unwrap());
        }
        copy.validate().unwrap();

        // Copying allocates fresh ids; the two trees do not share a
        // single slab.
        let src_ids: std::collections::HashSet<_> =
            src_storage.borrow().backing_snapshot().into_iter().map(|(id, _)| id).collect();
        let dest_ids: std::collections::HashSet<_> =
            dest_storage.borrow().backing_snapshot().into_iter().map(|(id, _)| id).collect();
        assert!(src_ids.is_disjoint(&dest_ids));
    }

    #[test]
    fn deep_copy_map_is_element_equal_at_a_new_address() {
        let src_storage = new_storage(256, 1);
        let mut src: Map<_, U64, U64, Unit> = Map::new(src_storage.clone(), Unit);
        for i in 0..100u64 {
            src.set(U64(i), U64(i * 7)).unwrap();
        }
        src.commit().unwrap();

        let dest_storage = new_storage(256, 2);
        let dest_root = src.deep_copy(&dest_storage).unwrap();
        let copy: Map<_, U64, U64, Unit> = Map::open(dest_storage, dest_root).unwrap();

        assert_eq!(copy.count().unwrap(), src.count().unwrap());
        for i in 0..100u64 {
            assert_eq!(copy.get(&U64(i)).unwrap(), src.get(&U64(i)).unwrap());
        }
        copy.validate().unwrap();
    }
}
