//! Map key digesting (C6).
//!
//! A [`Digester`] exposes a lazily-extensible ladder of 64-bit digests
//! for one key: level 0 is a fast, non-cryptographic hash used for
//! routing and ordinary sort order; levels 1 through 4 are successive
//! 64-bit words of a cryptographic 256-bit hash, computed only the
//! first time a caller actually needs to break a collision. Beyond
//! level 4 the digester is exhausted — see [`Digester::MAX_LEVELS`] —
//! and callers fall back to a linear-scan bucket keyed by the caller's
//! own equality comparator.
//!
//! Resolves an open question the design notes leave implicit: the
//! reference engine assumes `levels() >= 5` but does not enforce it.
//! Here the bound is a `const` and requesting a level at or past it is
//! a programmer error (`debug_assert!`), not a runtime condition —
//! callers are expected to have escalated to the bucket already.

use sha2::{Digest, Sha256};
use std::cell::RefCell;
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Per-key digest ladder.
///
/// Constructing a `Digester` only computes the cheap level-0 hash; the
/// cryptographic hash backing levels 1-4 is computed at most once, on
/// first access, and cached.
pub struct Digester {
    level0: u64,
    key_bytes: Vec<u8>,
    crypto: RefCell<Option<[u8; 32]>>,
}

impl Digester {
    /// Total number of digest levels this digester can produce
    /// (`0..MAX_LEVELS`, exclusive). A caller who has consumed digests
    /// at every level and still has colliding entries must fall back to
    /// a linear bucket.
    pub const MAX_LEVELS: u32 = 5;

    /// Build a digester over the encoded bytes of a key, seeded with
    /// the storage's configured `hash_seed`.
    pub fn new(key_bytes: &[u8], hash_seed: u64) -> Self {
        Digester {
            level0: xxh3_64_with_seed(key_bytes, hash_seed),
            key_bytes: key_bytes.to_vec(),
            crypto: RefCell::new(None),
        }
    }

    /// Number of digest levels available before a caller must escalate
    /// to the linear bucket.
    pub fn levels(&self) -> u32 {
        Self::MAX_LEVELS
    }

    /// The digest at `level`.
    ///
    /// `level == 0` is always available and cheap. `level` in `1..5`
    /// lazily computes and caches a SHA-256 digest of the key bytes,
    /// returning one of its four 64-bit big-endian words.
    ///
    /// # Panics
    ///
    /// Panics (debug builds) if `level >= Self::MAX_LEVELS` — the
    /// caller should have checked `levels()` and escalated to the
    /// linear bucket instead of asking for another digest.
    pub fn digest(&self, level: u32) -> u64 {
        debug_assert!(
            level < Self::MAX_LEVELS,
            "digest level {level} exceeds the digester's levels(); caller must use the linear bucket"
        );
        if level == 0 {
            return self.level0;
        }
        let mut crypto = self.crypto.borrow_mut();
        let bytes = crypto.get_or_insert_with(|| {
            let mut hasher = Sha256::new();
            hasher.update(&self.key_bytes);
            let digest = hasher.finalize();
            let mut out = [0u8; 32];
            out.copy_from_slice(&digest);
            out
        });
        let word = (level - 1) as usize;
        let start = word * 8;
        let mut word_bytes = [0u8; 8];
        word_bytes.copy_from_slice(&bytes[start..start + 8]);
        u64::from_be_bytes(word_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level0_is_deterministic_and_seed_sensitive() {
        let a = Digester::new(b"hello", 1);
        let b = Digester::new(b"hello", 1);
        let c = Digester::new(b"hello", 2);
        assert_eq!(a.digest(0), b.digest(0));
        assert_ne!(a.digest(0), c.digest(0));
    }

    #[test]
    fn crypto_levels_are_cached_and_distinct() {
        let d = Digester::new(b"collide-me", 0);
        let l1 = d.digest(1);
        let l2 = d.digest(2);
        let l3 = d.digest(3);
        let l4 = d.digest(4);
        assert_eq!(d.digest(1), l1, "must be cached, not recomputed");
        // Four independent 64-bit words of a 256-bit hash: vanishingly
        // unlikely to collide for this fixed input.
        let words = [l1, l2, l3, l4];
        for i in 0..words.len() {
            for j in (i + 1)..words.len() {
                assert_ne!(words[i], words[j]);
            }
        }
    }

    #[test]
    fn levels_reports_five() {
        let d = Digester::new(b"x", 0);
        assert_eq!(d.levels(), 5);
    }

    #[test]
    #[should_panic]
    fn requesting_level_past_max_panics() {
        let d = Digester::new(b"x", 0);
        d.digest(5);
    }
}
