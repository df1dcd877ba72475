//! External collaborators the engine treats as opaque: application-level
//! value codecs and the per-container `TypeInfo` token carried in a root
//! slab's extra-data preamble.
//!
//! Neither trait here is interpreted by the engine. `TypeInfo::encode`
//! and `ElementCodec::encode` are opaque byte producers this crate frames
//! and stores; CBOR machinery and cryptographic hashing are likewise
//! collaborators out of scope (§1) — this module only fixes the seams
//! they plug into.

use slabtree_core::{Result, SlabId};

/// Opaque per-container type descriptor, carried in a root slab's
/// extra-data preamble so `open(root_id)` can recognize a freshly-opened
/// root as the kind of container the caller expected (`TypeInfoMismatch`
/// otherwise).
pub trait TypeInfo: Clone + std::fmt::Debug + PartialEq {
    /// Serialize to the bytes stored in the root's extra-data preamble.
    fn encode(&self) -> Vec<u8>;

    /// Parse the bytes written by `encode`.
    fn decode(bytes: &[u8]) -> Result<Self>
    where
        Self: Sized;
}

/// Opaque element codec for values held in a container (array elements,
/// map keys and values). The engine only ever asks for `encode`/`decode`
/// and the resulting byte length; it never inspects the bytes themselves.
///
/// A value may itself be the root of a nested container (composition,
/// §3); `as_nested_root`/`from_nested_root` are the seam for that case,
/// bypassing the inline/spill decision entirely since the pointer is to
/// another tree's root, not to a Storable slab.
pub trait ElementCodec: Clone + std::fmt::Debug {
    /// Serialize this value for storage inline or in a Storable slab.
    fn encode(&self) -> Vec<u8>;

    /// Parse bytes previously produced by `encode`.
    fn decode(bytes: &[u8]) -> Result<Self>
    where
        Self: Sized;

    /// If this value is itself the root of a nested container, its root
    /// [`SlabId`]. Stored as a pointer Storable directly, skipping the
    /// inline/spill decision `encode` would otherwise go through.
    fn as_nested_root(&self) -> Option<SlabId> {
        None
    }

    /// Reconstruct a value from a nested container's root id. Only
    /// called when a decoded pointer Storable resolves to something
    /// other than a Storable slab. Codecs that never nest containers
    /// need not override this.
    fn from_nested_root(id: SlabId) -> Self
    where
        Self: Sized,
    {
        let _ = id;
        unimplemented!(
            "ElementCodec::from_nested_root not implemented for a codec with no nested containers"
        )
    }
}

/// Map keys additionally need an equality comparator for the linear
/// bucket a digester escalates to once its levels are exhausted (§4.3).
pub trait MapKey: ElementCodec + PartialEq {}
impl<T: ElementCodec + PartialEq> MapKey for T {}

/// Discriminant byte distinguishing an Array root from a Map root inside
/// a shared extra-data preamble. The reference wire format leaves the
/// root/kind encoding entirely to the opaque `TypeInfo` the external
/// codec produces; since this engine does not depend on a concrete CBOR
/// library, it prepends one plain tag byte of its own ahead of the
/// opaque `TypeInfo` bytes so `open` can fail fast on a kind mismatch
/// without needing to understand `TypeInfo`'s own encoding.
pub(crate) const ROOT_KIND_ARRAY: u8 = 0;
pub(crate) const ROOT_KIND_MAP: u8 = 1;

pub(crate) fn encode_root_extra<TI: TypeInfo>(kind: u8, type_info: &TI) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 16);
    out.push(kind);
    out.extend_from_slice(&type_info.encode());
    out
}

pub(crate) fn decode_root_extra<TI: TypeInfo>(
    bytes: &[u8],
    expected_kind: u8,
    expected_name: &'static str,
    id: SlabId,
) -> Result<TI> {
    use slabtree_core::Error;
    if bytes.is_empty() || bytes[0] != expected_kind {
        return Err(Error::TypeInfoMismatch {
            id,
            expected: expected_name,
        });
    }
    TI::decode(&bytes[1..])
}
