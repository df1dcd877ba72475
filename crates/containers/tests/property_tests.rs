//! Randomized operation-sequence coverage for the §8 universal invariants.
//!
//! Where `integration_tests.rs` exercises fixed E1-E7 scenarios,
//! this suite throws `proptest`-generated sequences of
//! append/insert/remove/set (and their Map equivalents) at a fresh
//! container and re-checks `validate()` plus a shadow model after
//! every operation, across randomized `targetThreshold` choices so the
//! split/rebalance/merge arithmetic is hit at many different tree
//! shapes rather than just the one threshold the E-series happens to
//! pick.

use proptest::prelude::*;
use slabtree_containers::{storage_handle, Array, ElementCodec, Map, TypeInfo};
use slabtree_core::{Address, Result, StorageConfig};
use slabtree_storage::{InMemoryBlobStore, SlabStorage};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
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

fn new_storage(target_threshold: u32) -> slabtree_containers::StorageHandle<InMemoryBlobStore> {
    let config = StorageConfig::new(target_threshold, 0);
    storage_handle(SlabStorage::new(
        Address::from_u64(1),
        config,
        InMemoryBlobStore::new(),
        0,
    ))
}

#[derive(Clone, Debug)]
enum ArrayOp {
    Append(u64),
    Insert(u32, u64),
    Set(u32, u64),
    Remove(u32),
}

fn array_op() -> impl Strategy<Value = ArrayOp> {
    prop_oneof![
        any::<u64>().prop_map(ArrayOp::Append),
        (any::<u32>(), any::<u64>()).prop_map(|(i, v)| ArrayOp::Insert(i, v)),
        (any::<u32>(), any::<u64>()).prop_map(|(i, v)| ArrayOp::Set(i, v)),
        any::<u32>().prop_map(ArrayOp::Remove),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// A random sequence of append/insert/set/remove, checked against a
    /// `Vec<u64>` shadow model and validated after every single
    /// operation, across a range of `targetThreshold`s small enough to
    /// force splits and merges within a few dozen elements.
    #[test]
    fn array_matches_shadow_model_and_stays_valid(
        threshold in 64u32..=512,
        ops in prop::collection::vec(array_op(), 0..80),
    ) {
        let storage = new_storage(threshold);
        let mut array: Array<_, U64, Unit> = Array::new(storage, Unit);
        let mut shadow: Vec<u64> = Vec::new();

        for op in ops {
            match op {
                ArrayOp::Append(v) => {
                    array.append(U64(v)).unwrap();
                    shadow.push(v);
                }
                ArrayOp::Insert(i, v) => {
                    let i = if shadow.is_empty() { 0 } else { i % (shadow.len() as u32 + 1) };
                    array.insert(i, U64(v)).unwrap();
                    shadow.insert(i as usize, v);
                }
                ArrayOp::Set(i, v) => {
                    if !shadow.is_empty() {
                        let i = i % shadow.len() as u32;
                        array.set(i, U64(v)).unwrap();
                        shadow[i as usize] = v;
                    }
                }
                ArrayOp::Remove(i) => {
                    if !shadow.is_empty() {
                        let i = i % shadow.len() as u32;
                        array.remove(i).unwrap();
                        shadow.remove(i as usize);
                    }
                }
            }

            prop_assert_eq!(array.count().unwrap() as usize, shadow.len());
            let report = array.validate().unwrap();
            prop_assert_eq!(report.count as usize, shadow.len());
        }

        for (i, v) in shadow.iter().enumerate() {
            prop_assert_eq!(array.get(i as u32).unwrap(), U64(*v));
        }
    }
}

#[derive(Clone, Debug)]
enum MapOp {
    Set(u32, u64),
    Remove(u32),
}

fn map_op() -> impl Strategy<Value = MapOp> {
    prop_oneof![
        (any::<u32>(), any::<u64>()).prop_map(|(k, v)| MapOp::Set(k, v)),
        any::<u32>().prop_map(MapOp::Remove),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Same shadow-model treatment for `Map`, keyed over a deliberately
    /// small `u32` domain (`% 64`) so repeated sets/removes/overwrites
    /// of the same few keys are common, exercising collision-group
    /// externalize/re-inline transitions alongside ordinary splits.
    #[test]
    fn map_matches_shadow_model_and_stays_valid(
        threshold in 64u32..=512,
        ops in prop::collection::vec(map_op(), 0..80),
    ) {
        let storage = new_storage(threshold);
        let mut map: Map<_, U64, U64, Unit> = Map::new(storage, Unit);
        let mut shadow: std::collections::BTreeMap<u32, u64> = std::collections::BTreeMap::new();

        for op in ops {
            match op {
                MapOp::Set(k, v) => {
                    let k = k % 64;
                    map.set(U64(k as u64), U64(v)).unwrap();
                    shadow.insert(k, v);
                }
                MapOp::Remove(k) => {
                    let k = k % 64;
                    let removed = map.remove(&U64(k as u64)).unwrap();
                    prop_assert_eq!(removed.is_some(), shadow.contains_key(&k));
                    shadow.remove(&k);
                }
            }

            prop_assert_eq!(map.count().unwrap() as usize, shadow.len());
            let report = map.validate().unwrap();
            prop_assert_eq!(report.count as usize, shadow.len());
        }

        for (k, v) in &shadow {
            prop_assert_eq!(map.get(&U64(*k as u64)).unwrap(), Some(U64(*v)));
        }
    }
}
