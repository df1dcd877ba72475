//! Small helpers shared by the Array and Map trees.

use slabtree_core::SlabId;
use slabtree_storage::Slab;

/// Rewrite a slab's own `id` field in place. Used when promoting a root
/// split: the slab that used to be the root keeps its content but must
/// move to a freshly generated id so the old root id can become the new
/// wrapping meta slab (§4.2 "Root collapse/promotion").
pub fn relocate(mut slab: Slab, new_id: SlabId) -> Slab {
    match &mut slab {
        Slab::ArrayData { id, .. }
        | Slab::ArrayMeta { id, .. }
        | Slab::MapData { id, .. }
        | Slab::MapMeta { id, .. }
        | Slab::Storable { id, .. }
        | Slab::MapCollision { id, .. } => *id = new_id,
    }
    slab
}

/// Exact encoded length of a non-root slab: version + flags + body, with
/// no extra-data preamble. Only the current container root ever carries
/// one, and nothing stores a header describing the root itself, so every
/// size this engine tracks in a parent's bookkeeping uses this form.
pub fn encoded_len(slab: &Slab) -> u32 {
    2 + slab.body_size(false)
}
