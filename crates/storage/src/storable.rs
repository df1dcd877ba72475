//! The Storable leaf payload: inline bytes or a cross-slab pointer.
//!
//! User value codecs (application-level `TypeInfo` and element
//! serializers) are an external collaborator: this module never
//! interprets the bytes a codec produces, it only decides whether they
//! fit inline and frames them so they can be located again on decode.
//!
//! CBOR encoder/decoder machinery is likewise a collaborator out of this
//! engine's scope. The one piece of CBOR this module reproduces
//! byte-for-byte is the pointer tag (`0xD8 0xFF`) the spec calls out
//! explicitly; inline payloads are framed with an explicit big-endian
//! length prefix rather than a general CBOR item skip, so decoding never
//! needs to understand the codec's own encoding.

use byteorder::{BigEndian, ByteOrder};
use slabtree_core::{Error, Result, SlabId};

/// CBOR tag `0xD8 0xFF` marking a pointer Storable.
const POINTER_TAG: [u8; 2] = [0xD8, 0xFF];

/// Wire size of a pointer Storable: the 2-byte tag plus a 16-byte id.
pub const POINTER_ENCODED_LEN: u32 = 2 + 16;

/// A leaf payload: either an inline-encoded value or a pointer to
/// another slab holding it (a spilled Storable slab, or the root of a
/// nested container).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Storable {
    /// Bytes produced by the external element codec, small enough to
    /// live inline.
    Inline(Vec<u8>),
    /// A reference to a Storable slab (oversized element) or to a
    /// nested container's root slab.
    Pointer(SlabId),
}

impl Storable {
    /// Decide how `encoded` should be stored given the configured inline
    /// cap. Returns the `Inline` variant directly when it fits; when it
    /// doesn't, the caller (which owns a storage handle) must persist
    /// `encoded` in a fresh Storable slab and build `Storable::Pointer`
    /// to it — see `OverLimit` in [`slabtree_core::Error`] for the case
    /// where even a lone Storable slab can't hold it.
    pub fn inline_or_spill(encoded: Vec<u8>, max_inline_element_size: u32) -> SpillDecision {
        if encoded.len() as u32 <= max_inline_element_size {
            SpillDecision::Inline(Storable::Inline(encoded))
        } else {
            SpillDecision::Spill(encoded)
        }
    }

    /// Exact encoded byte size of this Storable as it appears in a data
    /// slab body.
    pub fn byte_size(&self) -> u32 {
        match self {
            Storable::Inline(bytes) => 4 + bytes.len() as u32,
            Storable::Pointer(_) => POINTER_ENCODED_LEN,
        }
    }

    /// Append this Storable's wire encoding to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Storable::Inline(bytes) => {
                let mut len_buf = [0u8; 4];
                BigEndian::write_u32(&mut len_buf, bytes.len() as u32);
                out.extend_from_slice(&len_buf);
                out.extend_from_slice(bytes);
            }
            Storable::Pointer(id) => {
                out.extend_from_slice(&POINTER_TAG);
                out.extend_from_slice(&id.to_bytes());
            }
        }
    }

    /// Decode one Storable from the front of `buf`, returning it and the
    /// number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Storable, usize)> {
        if buf.len() >= 2 && buf[0] == POINTER_TAG[0] && buf[1] == POINTER_TAG[1] {
            if buf.len() < 18 {
                return Err(truncated());
            }
            let mut id_bytes = [0u8; 16];
            id_bytes.copy_from_slice(&buf[2..18]);
            return Ok((Storable::Pointer(SlabId::from_bytes(id_bytes)), 18));
        }
        if buf.len() < 4 {
            return Err(truncated());
        }
        let len = BigEndian::read_u32(&buf[..4]) as usize;
        if buf.len() < 4 + len {
            return Err(truncated());
        }
        let bytes = buf[4..4 + len].to_vec();
        Ok((Storable::Inline(bytes), 4 + len))
    }

    /// If this Storable is a pointer, the id it points at.
    pub fn as_pointer(&self) -> Option<SlabId> {
        match self {
            Storable::Pointer(id) => Some(*id),
            Storable::Inline(_) => None,
        }
    }
}

fn truncated() -> Error {
    Error::Corruption {
        id: SlabId::sentinel(),
        reason: "truncated Storable encoding".to_string(),
    }
}

/// Outcome of [`Storable::inline_or_spill`].
pub enum SpillDecision {
    /// The value fit inline; here is the finished Storable.
    Inline(Storable),
    /// The value is too large; here are its encoded bytes, to be
    /// persisted in a fresh Storable slab by the caller.
    Spill(Vec<u8>),
}
