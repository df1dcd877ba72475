//! Per-storage sizing configuration.
//!
//! `targetThreshold` is process-wide in the reference design this engine
//! generalizes; here it is captured at `SlabStorage` construction time so
//! that multiple stores (e.g. in tests) can run with different envelopes
//! without touching global state. [`ThresholdGuard`] offers a scoped
//! override for tests that need to exercise a specific threshold and
//! restore the previous one afterward, mirroring a `SetThreshold`/`defer`
//! pattern without any actual global mutable state.

use std::cell::Cell;

/// Sizing configuration for a single [`crate::SlabId`] address space.
///
/// All derived values are computed once at construction so hot paths
/// never recompute them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StorageConfig {
    /// Maximum legal size, in bytes, of a non-root slab.
    target_threshold: u32,
    /// Minimum legal size, in bytes, of a non-root slab (`target / 2`).
    min_threshold: u32,
    /// Above this encoded size, an element is spilled to its own
    /// Storable slab instead of staying inline.
    max_inline_element_size: u32,
    /// Seed fed to the fast, non-cryptographic level-0 digest.
    hash_seed: u64,
}

/// Default `targetThreshold`, matching the reference engine's default.
pub const DEFAULT_TARGET_THRESHOLD: u32 = 1024;

impl StorageConfig {
    /// Build a configuration from an explicit target threshold and hash
    /// seed. `minThreshold` and `maxInlineElementSize` are derived.
    ///
    /// # Panics
    ///
    /// Panics if `target_threshold` is too small to admit any inline
    /// element (fewer than 16 bytes) — this is a programmer error, not a
    /// runtime condition.
    pub fn new(target_threshold: u32, hash_seed: u64) -> Self {
        assert!(
            target_threshold >= 16,
            "target_threshold must be large enough to hold slab headers and at least one element"
        );
        StorageConfig {
            target_threshold,
            min_threshold: target_threshold / 2,
            // Half of max threshold mirrors the collision-group
            // externalization cap described for map data slabs.
            max_inline_element_size: target_threshold / 2,
            hash_seed,
        }
    }

    /// Configuration using [`DEFAULT_TARGET_THRESHOLD`] and the given seed.
    pub fn with_seed(hash_seed: u64) -> Self {
        Self::new(DEFAULT_TARGET_THRESHOLD, hash_seed)
    }

    /// Maximum legal size of a non-root slab.
    pub fn max_threshold(&self) -> u32 {
        self.target_threshold
    }

    /// Minimum legal size of a non-root slab.
    pub fn min_threshold(&self) -> u32 {
        self.min_threshold
    }

    /// Above this size an element must be stored as a Storable slab and
    /// referenced by pointer rather than encoded inline.
    pub fn max_inline_element_size(&self) -> u32 {
        self.max_inline_element_size
    }

    /// Seed for the fast non-cryptographic digest (digester level 0).
    pub fn hash_seed(&self) -> u64 {
        self.hash_seed
    }

    /// Return a copy of this configuration with a different target
    /// threshold. Used by [`ThresholdGuard`] and by tests that need a
    /// tighter envelope to exercise splits deterministically.
    pub fn with_target_threshold(&self, target_threshold: u32) -> Self {
        StorageConfig::new(target_threshold, self.hash_seed)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::with_seed(0)
    }
}

thread_local! {
    static ACTIVE_OVERRIDE: Cell<Option<u32>> = Cell::new(None);
}

/// A scoped override of the ambient target threshold, for tests that want
/// to force small slabs without plumbing a `StorageConfig` through every
/// call site. The previous value (if any) is restored on drop, so this
/// composes: nested guards unwind in order.
///
/// This does not mutate any `StorageConfig` already constructed; callers
/// that want the override to take effect must read it back via
/// [`ThresholdGuard::effective_threshold`] when building their config.
pub struct ThresholdGuard {
    previous: Option<u32>,
}

impl ThresholdGuard {
    /// Install `threshold` as the active override for the current thread.
    pub fn set(threshold: u32) -> Self {
        let previous = ACTIVE_OVERRIDE.with(|cell| cell.replace(Some(threshold)));
        ThresholdGuard { previous }
    }

    /// Read the currently active override, if any.
    pub fn effective_threshold() -> Option<u32> {
        ACTIVE_OVERRIDE.with(|cell| cell.get())
    }
}

impl Drop for ThresholdGuard {
    fn drop(&mut self) {
        ACTIVE_OVERRIDE.with(|cell| cell.set(self.previous));
    }
}
