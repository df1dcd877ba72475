//! Error types shared by the storage and container layers.

use crate::slab_id::SlabId;
use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by slab storage and the container trees built atop it.
///
/// Every variant is a plain value — nothing in this crate panics on user
/// input. Internal invariant violations (e.g. a header's `size` disagreeing
/// with the freshly re-encoded length) are programmer errors and are
/// asserted, not represented here.
#[derive(Debug, Error)]
pub enum Error {
    /// Array index out of bounds: `i > count` on insert, `i >= count`
    /// elsewhere, or any index into an empty container.
    #[error("index {index} out of bounds (len {len})")]
    IndexOutOfBounds {
        /// The offending index.
        index: u64,
        /// The container length at the time of the operation.
        len: u64,
    },

    /// Dereference of a [`SlabId`] not present in the backing store.
    #[error("slab {id} not found in storage")]
    SlabNotFound {
        /// The id that could not be resolved.
        id: SlabId,
    },

    /// Decode failure, header/body mismatch, or other structural
    /// corruption, attributed to the offending slab.
    #[error("corrupt slab {id}: {reason}")]
    Corruption {
        /// The slab whose content failed to validate.
        id: SlabId,
        /// Human-readable description of the mismatch.
        reason: String,
    },

    /// A single element is too large to satisfy the inline rule and also
    /// too large to live alone as a Storable slab.
    #[error("element of {size} bytes exceeds the maximum slab size of {max} bytes")]
    OverLimit {
        /// Encoded size of the offending element.
        size: u32,
        /// The configured maximum slab size.
        max: u32,
    },

    /// `open(root_id)` found a root slab whose container kind did not
    /// match what the caller asked to open.
    #[error("root {id} is not a {expected} container")]
    TypeInfoMismatch {
        /// The root id that was opened.
        id: SlabId,
        /// The container kind the caller expected.
        expected: &'static str,
    },

    /// A decoded slab's type-family bits do not match what its consumer
    /// expected (e.g. an array asked storage for a child and got back a
    /// map data slab).
    #[error("slab {id} has the wrong type: expected {expected}, found {found}")]
    WrongSlabType {
        /// The slab whose kind did not match.
        id: SlabId,
        /// What the caller expected.
        expected: &'static str,
        /// What was actually decoded.
        found: &'static str,
    },
}
