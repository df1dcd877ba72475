//! Slab identity.
//!
//! A [`SlabId`] is the stable 16-byte address of any persisted slab: an
//! 8-byte owning [`Address`] plus an 8-byte index issued monotonically by
//! the storage for that address. Ids are never reused and the all-zero id
//! is reserved as the sentinel ("no slab").

use std::fmt;

/// The 8-byte owner of a run of slab indices.
///
/// Addresses are opaque to the engine — callers typically derive one from
/// an account, contract, or tenant identifier. Only equality and byte
/// layout matter here.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub [u8; 8]);

impl Address {
    /// The zero address. Not reserved by itself — only `SlabId::sentinel()`
    /// (zero address *and* zero index) carries special meaning.
    pub const ZERO: Address = Address([0u8; 8]);

    /// Construct an address from its big-endian byte representation.
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Address(bytes)
    }

    /// Construct an address from a `u64`, stored big-endian.
    pub const fn from_u64(value: u64) -> Self {
        Address(value.to_be_bytes())
    }

    /// The raw bytes of this address.
    pub const fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", hex(&self.0))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex(&self.0))
    }
}

/// The stable identity of a slab: an owning [`Address`] plus a
/// per-address monotonic index.
///
/// `SlabId` is `Copy` and 16 bytes wide, matching the on-wire pointer
/// encoding (CBOR tag `0xD8 0xFF` followed by these 16 bytes).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SlabId {
    /// Owning address.
    pub address: Address,
    /// Monotonic index within `address`.
    pub index: u64,
}

impl SlabId {
    /// The reserved "no slab" id: zero address, zero index.
    ///
    /// `generate_id` never returns this value.
    pub const fn sentinel() -> Self {
        SlabId {
            address: Address::ZERO,
            index: 0,
        }
    }

    /// Whether this id is the sentinel.
    pub const fn is_sentinel(&self) -> bool {
        self.index == 0 && self.address.0[0] == 0 && {
            // const-fn friendly all-zero check
            let b = self.address.0;
            b[1] == 0 && b[2] == 0 && b[3] == 0 && b[4] == 0 && b[5] == 0 && b[6] == 0 && b[7] == 0
        }
    }

    /// Construct a new id from its parts. Exposed for storage
    /// implementations; containers should obtain ids only through
    /// `SlabStorage::generate_id`.
    pub const fn new(address: Address, index: u64) -> Self {
        SlabId { address, index }
    }

    /// Encode as the 16-byte wire representation: address then
    /// big-endian index.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.address.0);
        out[8..].copy_from_slice(&self.index.to_be_bytes());
        out
    }

    /// Decode the 16-byte wire representation produced by [`Self::to_bytes`].
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        let mut addr = [0u8; 8];
        addr.copy_from_slice(&bytes[..8]);
        let mut idx = [0u8; 8];
        idx.copy_from_slice(&bytes[8..]);
        SlabId {
            address: Address(addr),
            index: u64::from_be_bytes(idx),
        }
    }
}

impl fmt::Debug for SlabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlabId({}, {})", self.address, self.index)
    }
}

impl fmt::Display for SlabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.index)
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_is_all_zero() {
        assert!(SlabId::sentinel().is_sentinel());
        let id = SlabId::new(Address::from_u64(1), 0);
        assert!(!id.is_sentinel());
    }

    #[test]
    fn round_trips_through_bytes() {
        let id = SlabId::new(Address::from_u64(0xdead_beef), 42);
        let bytes = id.to_bytes();
        assert_eq!(bytes.len(), 16);
        assert_eq!(SlabId::from_bytes(bytes), id);
    }

    #[test]
    fn ordering_is_address_then_index() {
        let a = SlabId::new(Address::from_u64(1), 5);
        let b = SlabId::new(Address::from_u64(1), 6);
        let c = SlabId::new(Address::from_u64(2), 0);
        assert!(a < b);
        assert!(b < c);
    }
}
