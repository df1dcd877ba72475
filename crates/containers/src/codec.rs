//! Bridges the opaque [`ElementCodec`] trait to the engine's `Storable`
//! framing: deciding inline vs. spill on write, and resolving a
//! `Storable` back to a value — descending through a spilled Storable
//! slab, or through a nested container's root — on read.

use crate::typeinfo::ElementCodec;
use slabtree_core::{Error, Result};
use slabtree_storage::{BlobStore, Slab, SlabStorage, SpillDecision, Storable};

/// Turn a value into the `Storable` its owning data slab should hold:
/// a pointer directly to a nested container's root, an inline payload,
/// or a pointer to a freshly written Storable slab when the encoded
/// value is too large to live inline.
pub fn make_storable<B: BlobStore, V: ElementCodec>(
    storage: &SlabStorage<B>,
    value: &V,
) -> Result<Storable> {
    if let Some(id) = value.as_nested_root() {
        return Ok(Storable::Pointer(id));
    }
    let encoded = value.encode();
    match Storable::inline_or_spill(encoded, storage.config().max_inline_element_size()) {
        SpillDecision::Inline(storable) => Ok(storable),
        SpillDecision::Spill(bytes) => {
            let max = storage.config().max_threshold();
            let size = bytes.len() as u32;
            if size > max {
                return Err(Error::OverLimit { size, max });
            }
            let id = storage.generate_id();
            storage.store(id, Slab::Storable { id, payload: bytes });
            Ok(Storable::Pointer(id))
        }
    }
}

/// Resolve a `Storable` back into a value: decode inline bytes
/// directly, or follow a pointer to either a Storable slab (decode its
/// payload) or a nested container's root (`from_nested_root`).
pub fn resolve_storable<B: BlobStore, V: ElementCodec>(
    storage: &SlabStorage<B>,
    storable: &Storable,
) -> Result<V> {
    match storable {
        Storable::Inline(bytes) => V::decode(bytes),
        Storable::Pointer(id) => {
            let handle = storage.retrieve(*id)?;
            let is_storable_slab = matches!(&*handle.borrow(), Slab::Storable { .. });
            if is_storable_slab {
                let slab = handle.borrow();
                match &*slab {
                    Slab::Storable { payload, .. } => V::decode(payload),
                    _ => unreachable!(),
                }
            } else {
                Ok(V::from_nested_root(*id))
            }
        }
    }
}

/// Raw encoded bytes behind a key's `Storable`, for re-digesting a key
/// already stored in a collision group without requiring the caller to
/// still hold the original value. Keys are never nested container
/// roots, so a pointer here always names a Storable slab.
pub fn storable_bytes<B: BlobStore>(storage: &SlabStorage<B>, storable: &Storable) -> Result<Vec<u8>> {
    match storable {
        Storable::Inline(bytes) => Ok(bytes.clone()),
        Storable::Pointer(id) => {
            let handle = storage.retrieve(*id)?;
            let slab = handle.borrow();
            match &*slab {
                Slab::Storable { payload, .. } => Ok(payload.clone()),
                other => Err(Error::WrongSlabType {
                    id: *id,
                    expected: "Storable",
                    found: other.kind_name(),
                }),
            }
        }
    }
}
