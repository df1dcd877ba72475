//! Slab variants and their wire encoding.
//!
//! Every slab begins with a version byte (`0x00`, the only defined
//! version) and a flags byte: bits 6-7 select data/meta/storable, bit 5
//! marks an extra-data preamble (root slabs carry the owning
//! container's opaque `TypeInfo` there), and bits 0-4 name the family
//! (Array, Map, Map collision group, ...). Everything after that is
//! family-specific and documented on each variant below.

use crate::storable::Storable;
use byteorder::{BigEndian, ByteOrder};
use slabtree_core::{Error, Header, Result, SlabId};

const VERSION: u8 = 0x00;

const KIND_DATA: u8 = 0b00 << 6;
const KIND_META: u8 = 0b01 << 6;
const KIND_STORABLE: u8 = 0b10 << 6;
const KIND_MASK: u8 = 0b11 << 6;

const FLAG_EXTRA_DATA: u8 = 1 << 5;
const FAMILY_MASK: u8 = 0b0001_1111;

const FAMILY_ARRAY: u8 = 0;
const FAMILY_MAP: u8 = 1;
const FAMILY_BASIC_ARRAY: u8 = 2;
const FAMILY_MAP_COLLISION: u8 = 3;

/// A decoded slab plus the extra-data bytes it carried, if it was
/// encoded as a container root.
pub struct Decoded {
    /// The slab body.
    pub slab: Slab,
    /// Opaque `TypeInfo` bytes, present only for roots.
    pub extra_data: Option<Vec<u8>>,
}

/// One entry in an array meta slab's child list: just the header
/// triple, no extra routing key (array routing is purely by count).
pub type ArrayChild = Header;

/// One entry in a map meta slab's child list: the header triple plus
/// the level-0 digest of the child's first element, used for routing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapChild {
    /// Header triple for the child.
    pub header: Header,
    /// Level-0 digest of the child subtree's first (leftmost) element.
    pub first_digest: u64,
}

/// A single map key/value entry or a nested collision group, keyed by
/// `digest0` within the parent data slab.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MapElement {
    /// Exactly one key/value pair at this `digest0`.
    Single {
        /// Level-0 digest shared within this slab's ordering.
        digest0: u64,
        /// The key, inline or pointed-to.
        key: Storable,
        /// The value, inline or pointed-to.
        value: Storable,
    },
    /// Two or more entries sharing `digest0`, discriminated by deeper
    /// digest levels.
    Collision {
        /// Level-0 digest shared by every entry in the group.
        digest0: u64,
        /// The group body, inline or externalized.
        group: CollisionGroup,
    },
}

impl MapElement {
    /// The digest0 this element (or group) sorts by.
    pub fn digest0(&self) -> u64 {
        match self {
            MapElement::Single { digest0, .. } => *digest0,
            MapElement::Collision { digest0, .. } => *digest0,
        }
    }

    /// Exact encoded size of this element as it appears in a map data
    /// slab body, including its discriminant tag and digest0.
    pub fn encoded_size(&self) -> u32 {
        map_element_size(self)
    }

    /// Total key/value pairs reachable under this element.
    pub fn count(&self) -> u32 {
        match self {
            MapElement::Single { .. } => 1,
            MapElement::Collision { group, .. } => group_count(group),
        }
    }
}

/// A collision group: either inline in the parent data slab, or
/// externalized to its own Map data (collision) slab once it grows
/// past the externalization cap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CollisionGroup {
    /// The group's body lives inside the parent slab.
    Inline(CollisionBody),
    /// The group has been spilled to its own slab. `count` mirrors the
    /// externalized body's recursive key/value count so the parent data
    /// slab's own `count` bookkeeping stays exact without dereferencing
    /// the pointer (the spec's count-consistency invariant, §3, applies
    /// to every slab including one whose children are spilled groups).
    External {
        /// The externalized group's slab id.
        id: SlabId,
        /// Recursive key/value pair count under that slab.
        count: u32,
    },
}

/// The recursive body of a collision group: entries are discriminated
/// by `level`'s digest; entries whose digester has been exhausted fall
/// into `bucket`, scanned linearly by the user equality comparator.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct CollisionBody {
    /// Digest level discriminating `entries` (>= 1; level 0 is always
    /// the parent slab's own sort key).
    pub level: u32,
    /// Entries keyed by their digest at `level`.
    pub entries: Vec<(u64, GroupNode)>,
    /// Entries whose digester ran out of levels; compared linearly.
    pub bucket: Vec<(Storable, Storable)>,
}

impl CollisionBody {
    /// Exact encoded size of this body as it appears wherever it is
    /// stored (inline in a parent element, or as the whole body of an
    /// externalized collision slab).
    pub fn encoded_size(&self) -> u32 {
        collision_body_size(self)
    }

    /// Total key/value pairs reachable under this body.
    pub fn count(&self) -> u32 {
        body_count(self)
    }
}

/// One entry under a collision level: either a leaf pair, or a further
/// nested group when more than one entry shares this level's digest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GroupNode {
    /// A single key/value pair.
    Entry(Storable, Storable),
    /// A deeper collision group.
    SubGroup(Box<CollisionBody>),
}

/// A decoded, in-memory slab. Mutation happens directly on this value;
/// the owning `SlabStorage` cache is the authoritative home for it
/// between encodes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Slab {
    /// Ordered sequence of Storables, optionally chained to a sibling
    /// leaf via `next`.
    ArrayData {
        /// Own id.
        id: SlabId,
        /// Next leaf in index order, or the sentinel if this is the
        /// rightmost leaf or the slab is a root.
        next: SlabId,
        /// The elements.
        elements: Vec<Storable>,
    },
    /// Ordered sequence of child headers covering a contiguous index
    /// range.
    ArrayMeta {
        /// Own id.
        id: SlabId,
        /// Children in index order.
        children: Vec<ArrayChild>,
    },
    /// Ordered sequence of key/value elements (or collision groups),
    /// sorted by digest then user comparator.
    MapData {
        /// Own id.
        id: SlabId,
        /// Next leaf in digest order, or the sentinel.
        next: SlabId,
        /// The elements.
        elements: Vec<MapElement>,
    },
    /// Ordered sequence of child headers plus each child's first-key
    /// digest.
    MapMeta {
        /// Own id.
        id: SlabId,
        /// Children in digest order.
        children: Vec<MapChild>,
    },
    /// A single oversized payload, stored alone.
    Storable {
        /// Own id.
        id: SlabId,
        /// The payload bytes, as produced by the external element
        /// codec (never itself wrapped in another `Storable`).
        payload: Vec<u8>,
    },
    /// An externalized map collision group (§4.3): a collision body that
    /// grew past the externalization cap, spilled to its own slab. Not
    /// chained into the leaf sibling list and never merges with
    /// neighbors other than its own re-inlining.
    MapCollision {
        /// Own id.
        id: SlabId,
        /// The group body.
        body: CollisionBody,
    },
}

impl Slab {
    /// This slab's own id.
    pub fn id(&self) -> SlabId {
        match self {
            Slab::ArrayData { id, .. }
            | Slab::ArrayMeta { id, .. }
            | Slab::MapData { id, .. }
            | Slab::MapMeta { id, .. }
            | Slab::Storable { id, .. }
            | Slab::MapCollision { id, .. } => *id,
        }
    }

    /// Human-readable family name, for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Slab::ArrayData { .. } => "ArrayData",
            Slab::ArrayMeta { .. } => "ArrayMeta",
            Slab::MapData { .. } => "MapData",
            Slab::MapMeta { .. } => "MapMeta",
            Slab::Storable { .. } => "Storable",
            Slab::MapCollision { .. } => "MapCollision",
        }
    }

    /// Recursive element count: total array elements, or total map
    /// pairs, reachable under this slab.
    pub fn count(&self) -> u32 {
        match self {
            Slab::ArrayData { elements, .. } => elements.len() as u32,
            Slab::ArrayMeta { children, .. } => children.iter().map(|c| c.count).sum(),
            Slab::MapData { elements, .. } => elements
                .iter()
                .map(|e| match e {
                    MapElement::Single { .. } => 1,
                    MapElement::Collision { group, .. } => group_count(group),
                })
                .sum(),
            Slab::MapMeta { children, .. } => children.iter().map(|c| c.header.count).sum(),
            Slab::Storable { .. } => 0,
            Slab::MapCollision { body, .. } => body_count(body),
        }
    }

    /// Exact encoded byte size, not counting the version/flags bytes
    /// or any extra-data preamble (callers add those when deciding
    /// whether this slab is legally sized, per the spec's envelope
    /// invariant, which is defined over the whole encoded slab).
    pub fn body_size(&self, is_root: bool) -> u32 {
        match self {
            Slab::ArrayData { elements, .. } => {
                let next = if is_root { 0 } else { 16 };
                let header = 3u32; // 0x99 XX XX
                next + header + elements.iter().map(Storable::byte_size).sum::<u32>()
            }
            Slab::ArrayMeta { children, .. } => {
                2 + children.len() as u32 * Header::ENCODED_LEN as u32
            }
            Slab::MapData { elements, .. } => {
                let next = if is_root { 0 } else { 16 };
                let header = 3u32;
                next + header + elements.iter().map(map_element_size).sum::<u32>()
            }
            Slab::MapMeta { children, .. } => {
                2 + children.len() as u32 * (Header::ENCODED_LEN as u32 + 8)
            }
            Slab::Storable { payload, .. } => payload.len() as u32,
            Slab::MapCollision { body, .. } => collision_body_size(body),
        }
    }

    /// Encode this slab's full wire representation, including the
    /// version/flags bytes and, when `extra_data` is `Some`, the
    /// root-only `TypeInfo` preamble.
    pub fn encode(&self, extra_data: Option<&[u8]>) -> Vec<u8> {
        let is_root = extra_data.is_some();
        let mut out = Vec::with_capacity(self.body_size(is_root) as usize + 8);
        out.push(VERSION);
        let kind = match self {
            Slab::ArrayData { .. } | Slab::MapData { .. } | Slab::MapCollision { .. } => KIND_DATA,
            Slab::ArrayMeta { .. } | Slab::MapMeta { .. } => KIND_META,
            Slab::Storable { .. } => KIND_STORABLE,
        };
        let family = match self {
            Slab::ArrayData { .. } | Slab::ArrayMeta { .. } => FAMILY_ARRAY,
            Slab::MapData { .. } | Slab::MapMeta { .. } => FAMILY_MAP,
            Slab::Storable { .. } => FAMILY_BASIC_ARRAY,
            Slab::MapCollision { .. } => FAMILY_MAP_COLLISION,
        };
        let mut flags = kind | family;
        if extra_data.is_some() {
            flags |= FLAG_EXTRA_DATA;
        }
        out.push(flags);
        if let Some(bytes) = extra_data {
            out.push(0x81); // CBOR array-of-1 header around [typeInfo]
            out.extend_from_slice(bytes);
        }
        match self {
            Slab::ArrayData { next, elements, .. } => {
                if !is_root {
                    out.extend_from_slice(&next.to_bytes());
                }
                write_array_header(&mut out, elements.len());
                for e in elements {
                    e.encode(&mut out);
                }
            }
            Slab::ArrayMeta { children, .. } => {
                write_u16(&mut out, children.len());
                for child in children {
                    out.extend_from_slice(&child.id.to_bytes());
                    write_u32(&mut out, child.count);
                    write_u32(&mut out, child.size);
                }
            }
            Slab::MapData { next, elements, .. } => {
                if !is_root {
                    out.extend_from_slice(&next.to_bytes());
                }
                write_array_header(&mut out, elements.len());
                for e in elements {
                    encode_map_element(e, &mut out);
                }
            }
            Slab::MapMeta { children, .. } => {
                write_u16(&mut out, children.len());
                for child in children {
                    out.extend_from_slice(&child.header.id.to_bytes());
                    write_u32(&mut out, child.header.count);
                    write_u32(&mut out, child.header.size);
                    write_u64(&mut out, child.first_digest);
                }
            }
            Slab::Storable { payload, .. } => {
                out.extend_from_slice(payload);
            }
            Slab::MapCollision { body, .. } => {
                encode_collision_body(body, &mut out);
            }
        }
        out
    }

    /// Decode a slab from its full wire representation. `id` is
    /// supplied by the caller (the storage layer knows it from the key
    /// the bytes were fetched under) rather than re-derived from the
    /// body, since only meta-slab children embed ids in their own
    /// encoding.
    pub fn decode(id: SlabId, bytes: &[u8]) -> Result<Decoded> {
        if bytes.len() < 2 {
            return Err(corrupt(id, "slab shorter than the version/flags header"));
        }
        if bytes[0] != VERSION {
            return Err(corrupt(id, "unsupported slab version"));
        }
        let flags = bytes[1];
        let kind = flags & KIND_MASK;
        let family = flags & FAMILY_MASK;
        let is_root = flags & FLAG_EXTRA_DATA != 0;
        let mut pos = 2usize;
        let extra_data = if flags & FLAG_EXTRA_DATA != 0 {
            if pos >= bytes.len() || bytes[pos] != 0x81 {
                return Err(corrupt(id, "expected CBOR array-of-1 extra-data preamble"));
            }
            pos += 1;
            let rest = bytes[pos..].to_vec();
            pos = bytes.len();
            Some(rest)
        } else {
            None
        };
        let body = &bytes[pos..];
        let slab = match (kind, family) {
            (KIND_DATA, FAMILY_ARRAY) => decode_array_data(id, body, is_root)?,
            (KIND_META, FAMILY_ARRAY) => decode_array_meta(id, body)?,
            (KIND_DATA, FAMILY_MAP) => decode_map_data(id, body, is_root)?,
            (KIND_DATA, FAMILY_MAP_COLLISION) => {
                let mut pos = 0usize;
                let group_body = decode_collision_body(id, body, &mut pos)?;
                Slab::MapCollision { id, body: group_body }
            }
            (KIND_META, FAMILY_MAP) => decode_map_meta(id, body)?,
            (KIND_STORABLE, _) => Slab::Storable {
                id,
                payload: body.to_vec(),
            },
            _ => return Err(corrupt(id, "unrecognized slab kind/family combination")),
        };
        Ok(Decoded { slab, extra_data })
    }
}

fn group_count(group: &CollisionGroup) -> u32 {
    match group {
        CollisionGroup::Inline(body) => body_count(body),
        CollisionGroup::External { count, .. } => *count,
    }
}

fn body_count(body: &CollisionBody) -> u32 {
    let nested: u32 = body
        .entries
        .iter()
        .map(|(_, node)| match node {
            GroupNode::Entry(..) => 1,
            GroupNode::SubGroup(b) => body_count(b),
        })
        .sum();
    nested + body.bucket.len() as u32
}

fn map_element_size(e: &MapElement) -> u32 {
    match e {
        MapElement::Single { key, value, .. } => 1 + 8 + key.byte_size() + value.byte_size(),
        MapElement::Collision { group, .. } => 1 + 8 + collision_group_size(group),
    }
}

fn collision_group_size(group: &CollisionGroup) -> u32 {
    match group {
        CollisionGroup::Inline(body) => 1 + collision_body_size(body),
        CollisionGroup::External { .. } => 1 + 16 + 4,
    }
}

fn collision_body_size(body: &CollisionBody) -> u32 {
    let mut size = 4 + 2 + 2; // level, entry count, bucket count
    for (_, node) in &body.entries {
        size += 8 + 1; // digest + node tag
        size += match node {
            GroupNode::Entry(k, v) => k.byte_size() + v.byte_size(),
            GroupNode::SubGroup(b) => collision_body_size(b),
        };
    }
    for (k, v) in &body.bucket {
        size += k.byte_size() + v.byte_size();
    }
    size
}

fn encode_map_element(e: &MapElement, out: &mut Vec<u8>) {
    match e {
        MapElement::Single {
            digest0,
            key,
            value,
        } => {
            out.push(0);
            write_u64(out, *digest0);
            key.encode(out);
            value.encode(out);
        }
        MapElement::Collision { digest0, group } => {
            out.push(1);
            write_u64(out, *digest0);
            encode_collision_group(group, out);
        }
    }
}

fn encode_collision_group(group: &CollisionGroup, out: &mut Vec<u8>) {
    match group {
        CollisionGroup::Inline(body) => {
            out.push(0);
            encode_collision_body(body, out);
        }
        CollisionGroup::External { id, count } => {
            out.push(1);
            out.extend_from_slice(&id.to_bytes());
            write_u32(out, *count);
        }
    }
}

fn encode_collision_body(body: &CollisionBody, out: &mut Vec<u8>) {
    write_u32(out, body.level);
    write_u16(out, body.entries.len());
    for (digest, node) in &body.entries {
        write_u64(out, *digest);
        match node {
            GroupNode::Entry(k, v) => {
                out.push(0);
                k.encode(out);
                v.encode(out);
            }
            GroupNode::SubGroup(sub) => {
                out.push(1);
                encode_collision_body(sub, out);
            }
        }
    }
    write_u16(out, body.bucket.len());
    for (k, v) in &body.bucket {
        k.encode(out);
        v.encode(out);
    }
}

fn decode_array_data(id: SlabId, body: &[u8], is_root: bool) -> Result<Slab> {
    let mut pos = 0usize;
    let next = if is_root {
        SlabId::sentinel()
    } else {
        if body.len() < pos + 16 {
            return Err(corrupt(id, "array data slab missing next pointer"));
        }
        let id = read_id(body, pos);
        pos += 16;
        id
    };
    let count = read_array_header(body, &mut pos, id)?;
    let mut elements = Vec::with_capacity(count);
    for _ in 0..count {
        let (storable, consumed) = Storable::decode(&body[pos..])?;
        pos += consumed;
        elements.push(storable);
    }
    Ok(Slab::ArrayData { id, next, elements })
}

fn decode_array_meta(id: SlabId, body: &[u8]) -> Result<Slab> {
    if body.len() < 2 {
        return Err(corrupt(id, "array meta slab missing child count"));
    }
    let count = BigEndian::read_u16(&body[..2]) as usize;
    let mut pos = 2;
    let mut children = Vec::with_capacity(count);
    for _ in 0..count {
        if body.len() < pos + Header::ENCODED_LEN {
            return Err(corrupt(id, "truncated array meta child entry"));
        }
        let child_id = read_id(body, pos);
        pos += 16;
        let cnt = BigEndian::read_u32(&body[pos..pos + 4]);
        pos += 4;
        let size = BigEndian::read_u32(&body[pos..pos + 4]);
        pos += 4;
        children.push(Header::new(child_id, cnt, size));
    }
    Ok(Slab::ArrayMeta { id, children })
}

fn decode_map_data(id: SlabId, body: &[u8], is_root: bool) -> Result<Slab> {
    let mut pos = 0usize;
    let next = if is_root {
        SlabId::sentinel()
    } else {
        if body.len() < pos + 16 {
            return Err(corrupt(id, "map data slab missing next pointer"));
        }
        let next = read_id(body, pos);
        pos += 16;
        next
    };
    let count = read_array_header(body, &mut pos, id)?;
    let mut elements = Vec::with_capacity(count);
    for _ in 0..count {
        elements.push(decode_map_element(id, body, &mut pos)?);
    }
    Ok(Slab::MapData { id, next, elements })
}

fn decode_map_element(id: SlabId, body: &[u8], pos: &mut usize) -> Result<MapElement> {
    if body.len() < *pos + 1 + 8 {
        return Err(corrupt(id, "truncated map element"));
    }
    let tag = body[*pos];
    *pos += 1;
    let digest0 = BigEndian::read_u64(&body[*pos..*pos + 8]);
    *pos += 8;
    match tag {
        0 => {
            let (key, n) = Storable::decode(&body[*pos..])?;
            *pos += n;
            let (value, n) = Storable::decode(&body[*pos..])?;
            *pos += n;
            Ok(MapElement::Single {
                digest0,
                key,
                value,
            })
        }
        1 => {
            let group = decode_collision_group(id, body, pos)?;
            Ok(MapElement::Collision { digest0, group })
        }
        _ => Err(corrupt(id, "unrecognized map element tag")),
    }
}

fn decode_collision_group(id: SlabId, body: &[u8], pos: &mut usize) -> Result<CollisionGroup> {
    if body.len() < *pos + 1 {
        return Err(corrupt(id, "truncated collision group"));
    }
    let tag = body[*pos];
    *pos += 1;
    match tag {
        0 => Ok(CollisionGroup::Inline(decode_collision_body(id, body, pos)?)),
        1 => {
            if body.len() < *pos + 16 + 4 {
                return Err(corrupt(id, "truncated external collision pointer"));
            }
            let ptr = read_id(body, *pos);
            *pos += 16;
            let count = BigEndian::read_u32(&body[*pos..*pos + 4]);
            *pos += 4;
            Ok(CollisionGroup::External { id: ptr, count })
        }
        _ => Err(corrupt(id, "unrecognized collision group tag")),
    }
}

fn decode_collision_body(id: SlabId, body: &[u8], pos: &mut usize) -> Result<CollisionBody> {
    if body.len() < *pos + 6 {
        return Err(corrupt(id, "truncated collision body header"));
    }
    let level = BigEndian::read_u32(&body[*pos..*pos + 4]);
    *pos += 4;
    let entry_count = BigEndian::read_u16(&body[*pos..*pos + 2]) as usize;
    *pos += 2;
    let mut entries = Vec::with_capacity(entry_count);
    for _ in 0..entry_count {
        if body.len() < *pos + 8 + 1 {
            return Err(corrupt(id, "truncated collision entry"));
        }
        let digest = BigEndian::read_u64(&body[*pos..*pos + 8]);
        *pos += 8;
        let node_tag = body[*pos];
        *pos += 1;
        let node = match node_tag {
            0 => {
                let (k, n) = Storable::decode(&body[*pos..])?;
                *pos += n;
                let (v, n) = Storable::decode(&body[*pos..])?;
                *pos += n;
                GroupNode::Entry(k, v)
            }
            1 => GroupNode::SubGroup(Box::new(decode_collision_body(id, body, pos)?)),
            _ => return Err(corrupt(id, "unrecognized group node tag")),
        };
        entries.push((digest, node));
    }
    if body.len() < *pos + 2 {
        return Err(corrupt(id, "truncated collision bucket count"));
    }
    let bucket_count = BigEndian::read_u16(&body[*pos..*pos + 2]) as usize;
    *pos += 2;
    let mut bucket = Vec::with_capacity(bucket_count);
    for _ in 0..bucket_count {
        let (k, n) = Storable::decode(&body[*pos..])?;
        *pos += n;
        let (v, n) = Storable::decode(&body[*pos..])?;
        *pos += n;
        bucket.push((k, v));
    }
    Ok(CollisionBody {
        level,
        entries,
        bucket,
    })
}

fn decode_map_meta(id: SlabId, body: &[u8]) -> Result<Slab> {
    if body.len() < 2 {
        return Err(corrupt(id, "map meta slab missing child count"));
    }
    let count = BigEndian::read_u16(&body[..2]) as usize;
    let mut pos = 2;
    let mut children = Vec::with_capacity(count);
    let entry_len = Header::ENCODED_LEN + 8;
    for _ in 0..count {
        if body.len() < pos + entry_len {
            return Err(corrupt(id, "truncated map meta child entry"));
        }
        let child_id = read_id(body, pos);
        pos += 16;
        let cnt = BigEndian::read_u32(&body[pos..pos + 4]);
        pos += 4;
        let size = BigEndian::read_u32(&body[pos..pos + 4]);
        pos += 4;
        let first_digest = BigEndian::read_u64(&body[pos..pos + 8]);
        pos += 8;
        children.push(MapChild {
            header: Header::new(child_id, cnt, size),
            first_digest,
        });
    }
    Ok(Slab::MapMeta { id, children })
}

fn read_id(body: &[u8], pos: usize) -> SlabId {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&body[pos..pos + 16]);
    SlabId::from_bytes(bytes)
}

fn read_array_header(body: &[u8], pos: &mut usize, id: SlabId) -> Result<usize> {
    if body.len() < *pos + 3 || body[*pos] != 0x99 {
        return Err(corrupt(id, "expected 0x99 definite-length array header"));
    }
    let count = BigEndian::read_u16(&body[*pos + 1..*pos + 3]) as usize;
    *pos += 3;
    Ok(count)
}

fn write_array_header(out: &mut Vec<u8>, len: usize) {
    out.push(0x99);
    write_u16(out, len);
}

fn write_u16(out: &mut Vec<u8>, value: usize) {
    let mut buf = [0u8; 2];
    BigEndian::write_u16(&mut buf, value as u16);
    out.extend_from_slice(&buf);
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, value);
    out.extend_from_slice(&buf);
}

fn write_u64(out: &mut Vec<u8>, value: u64) {
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, value);
    out.extend_from_slice(&buf);
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
    use slabtree_core::Address;

    fn sid(addr: u64, idx: u64) -> SlabId {
        SlabId::new(Address::from_u64(addr), idx)
    }

    #[test]
    fn array_data_round_trips_non_root() {
        let id = sid(1, 1);
        let slab = Slab::ArrayData {
            id,
            next: sid(1, 2),
            elements: vec![Storable::Inline(vec![1, 2, 3]), Storable::Pointer(sid(1, 9))],
        };
        let bytes = slab.encode(None);
        let decoded = Slab::decode(id, &bytes).unwrap();
        assert_eq!(decoded.slab, slab);
        assert!(decoded.extra_data.is_none());
    }

    #[test]
    fn array_data_root_omits_next_pointer() {
        let id = sid(1, 1);
        let slab = Slab::ArrayData {
            id,
            next: SlabId::sentinel(),
            elements: vec![Storable::Inline(vec![7])],
        };
        let bytes = slab.encode(Some(&[0xAA]));
        let decoded = Slab::decode(id, &bytes).unwrap();
        assert_eq!(decoded.slab, slab);
        assert_eq!(decoded.extra_data, Some(vec![0xAA]));
    }

    #[test]
    fn array_meta_round_trips() {
        let id = sid(2, 1);
        let slab = Slab::ArrayMeta {
            id,
            children: vec![Header::new(sid(2, 2), 10, 100), Header::new(sid(2, 3), 20, 200)],
        };
        let bytes = slab.encode(None);
        assert_eq!(bytes.len(), 2 + slab.body_size(false) as usize);
        let decoded = Slab::decode(id, &bytes).unwrap();
        assert_eq!(decoded.slab, slab);
    }

    #[test]
    fn map_data_single_and_collision_round_trip() {
        let id = sid(3, 1);
        let group = CollisionGroup::Inline(CollisionBody {
            level: 1,
            entries: vec![(
                42,
                GroupNode::Entry(Storable::Inline(vec![1]), Storable::Inline(vec![2])),
            )],
            bucket: vec![],
        });
        let slab = Slab::MapData {
            id,
            next: sid(3, 2),
            elements: vec![
                MapElement::Single {
                    digest0: 5,
                    key: Storable::Inline(vec![9]),
                    value: Storable::Inline(vec![10]),
                },
                MapElement::Collision { digest0: 6, group },
            ],
        };
        let bytes = slab.encode(None);
        let decoded = Slab::decode(id, &bytes).unwrap();
        assert_eq!(decoded.slab, slab);
    }

    #[test]
    fn map_meta_round_trips_with_first_digest() {
        let id = sid(4, 1);
        let slab = Slab::MapMeta {
            id,
            children: vec![MapChild {
                header: Header::new(sid(4, 2), 3, 64),
                first_digest: 123,
            }],
        };
        let bytes = slab.encode(None);
        let decoded = Slab::decode(id, &bytes).unwrap();
        assert_eq!(decoded.slab, slab);
    }

    #[test]
    fn map_collision_slab_round_trips() {
        let id = sid(6, 1);
        let slab = Slab::MapCollision {
            id,
            body: CollisionBody {
                level: 1,
                entries: vec![
                    (
                        7,
                        GroupNode::Entry(Storable::Inline(vec![1]), Storable::Inline(vec![2])),
                    ),
                    (
                        9,
                        GroupNode::SubGroup(Box::new(CollisionBody {
                            level: 2,
                            entries: vec![],
                            bucket: vec![(Storable::Inline(vec![3]), Storable::Inline(vec![4]))],
                        })),
                    ),
                ],
                bucket: vec![],
            },
        };
        let bytes = slab.encode(None);
        assert_eq!(bytes.len(), 2 + slab.body_size(false) as usize);
        let decoded = Slab::decode(id, &bytes).unwrap();
        assert_eq!(decoded.slab, slab);
    }

    #[test]
    fn storable_slab_round_trips() {
        let id = sid(5, 1);
        let slab = Slab::Storable {
            id,
            payload: vec![1, 2, 3, 4, 5],
        };
        let bytes = slab.encode(None);
        let decoded = Slab::decode(id, &bytes).unwrap();
        assert_eq!(decoded.slab, slab);
    }
}
