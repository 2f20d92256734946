#![cfg(test)]

// Property tests for the map façades kept inside the crate so they can
// assert against engine internals (load-factor bound, probe statistics)
// without feature gates.

use crate::map::{FlatMap, NodeMap};
use crate::set::FlatSet;
use proptest::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::hash::BuildHasher;

// Pool-indexed operations shrink well: indices shrink toward earlier
// keys, the pool shrinks, and op lists shrink in length.
#[derive(Clone, Debug)]
enum OpI {
    Insert(usize, i32),
    InsertWith(usize, i32),
    Remove(usize),
    Get(usize),
    Contains(String),
    Mutate(usize, i32),
    Iterate,
    Reserve(u16),
    ShrinkToFit,
}

fn arb_scenario() -> impl Strategy<Value = (Vec<String>, Vec<OpI>)> {
    proptest::collection::vec("[a-z]{0,5}", 1..=8).prop_flat_map(|pool| {
        let idxs: Vec<usize> = (0..pool.len()).collect();
        let idx = proptest::sample::select(idxs);
        let contains_pool = proptest::sample::select(pool.clone());
        let op = prop_oneof![
            (idx.clone(), any::<i32>()).prop_map(|(i, v)| OpI::Insert(i, v)),
            (idx.clone(), any::<i32>()).prop_map(|(i, v)| OpI::InsertWith(i, v)),
            idx.clone().prop_map(OpI::Remove),
            idx.clone().prop_map(OpI::Get),
            prop_oneof![
                contains_pool.prop_map(|s: String| s),
                "[a-z]{0,5}".prop_map(|s| s)
            ]
            .prop_map(OpI::Contains),
            (idx.clone(), any::<i32>()).prop_map(|(i, d)| OpI::Mutate(i, d)),
            Just(OpI::Iterate),
            (0u16..200).prop_map(OpI::Reserve),
            Just(OpI::ShrinkToFit),
        ];
        proptest::collection::vec(op, 1..60).prop_map(move |ops| (pool.clone(), ops))
    })
}

// Shared state-machine body: run the ops against the map under test and
// a std::HashMap model with matching first-writer-wins semantics, then
// check parity and the load-factor invariant after every op.
fn run_state_machine<L, S>(
    pool: &[String],
    ops: Vec<OpI>,
    sut: &mut crate::map::Map<String, i32, L, S>,
) -> Result<(), TestCaseError>
where
    L: crate::slot::Slot<crate::region::Global, Record = (String, i32)>,
    S: BuildHasher,
{
    let mut model: HashMap<String, i32> = HashMap::new();

    for op in ops {
        match op {
            OpI::Insert(i, v) => {
                let k = pool[i].clone();
                let inserted = sut.insert(k.clone(), v);
                prop_assert_eq!(inserted, !model.contains_key(&k));
                model.entry(k).or_insert(v);
            }
            OpI::InsertWith(i, v) => {
                let k = pool[i].clone();
                let already = model.contains_key(&k);
                let mut ran = false;
                let inserted = sut.insert_with(k.clone(), || {
                    ran = true;
                    v
                });
                prop_assert_eq!(inserted, !already);
                prop_assert_eq!(ran, !already, "value must be built iff inserted");
                model.entry(k).or_insert(v);
            }
            OpI::Remove(i) => {
                let k = &pool[i];
                prop_assert_eq!(sut.remove(k.as_str()), model.remove(k));
            }
            OpI::Get(i) => {
                let k = &pool[i];
                prop_assert_eq!(sut.get(k.as_str()), model.get(k));
            }
            OpI::Contains(s) => {
                prop_assert_eq!(sut.contains_key(s.as_str()), model.contains_key(&s));
            }
            OpI::Mutate(i, d) => {
                let k = &pool[i];
                match (sut.get_mut(k.as_str()), model.get_mut(k)) {
                    (Some(sv), Some(mv)) => {
                        *sv = sv.saturating_add(d);
                        *mv = mv.saturating_add(d);
                    }
                    (None, None) => {}
                    _ => prop_assert!(false, "presence mismatch for {:?}", k),
                }
            }
            OpI::Iterate => {
                let s_keys: BTreeSet<String> = sut.iter().map(|(k, _)| k.clone()).collect();
                let m_keys: BTreeSet<String> = model.keys().cloned().collect();
                prop_assert_eq!(s_keys, m_keys);
                for (k, v) in sut.iter() {
                    prop_assert_eq!(model.get(k), Some(v));
                }
            }
            OpI::Reserve(n) => {
                let before = sut.bucket_count();
                sut.reserve(usize::from(n)).expect("reserve");
                prop_assert!(sut.bucket_count() >= before);
                prop_assert!(sut.bucket_count() >= usize::from(n));
            }
            OpI::ShrinkToFit => {
                sut.shrink_to_fit().expect("shrink");
            }
        }

        // Post-conditions after every op.
        prop_assert_eq!(sut.len(), model.len());
        prop_assert_eq!(sut.is_empty(), model.is_empty());
        prop_assert!(
            sut.len() as f64 <= f64::from(sut.max_load_factor()) * sut.bucket_count() as f64
                || sut.bucket_count() == 0
        );
    }

    // Final sweep: every model record is present with its value.
    for (k, v) in &model {
        prop_assert_eq!(sut.get(k.as_str()), Some(v));
    }
    Ok(())
}

// Property: state-machine equivalence against std::HashMap for the flat
// layout. Exercises insert/insert_with/remove/get/mutate/iterate plus
// reserve and shrink, asserting size parity and the load-factor bound
// after every operation.
proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_flat_map_state_machine((pool, ops) in arb_scenario()) {
        let mut sut: FlatMap<String, i32> = FlatMap::new();
        run_state_machine(&pool, ops, &mut sut)?;
    }
}

// Property: the same state machine over the node layout; pointer-held
// records must behave identically through rehashes and backward shifts.
proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_node_map_state_machine((pool, ops) in arb_scenario()) {
        let mut sut: NodeMap<String, i32> = NodeMap::new();
        run_state_machine(&pool, ops, &mut sut)?;
    }
}

// Worst-case collisions: a constant hasher forces every key onto one
// ideal position, so displacement, steal, saturation, and backward
// shift all run constantly.
#[derive(Clone, Default)]
struct ConstBuildHasher;
struct ConstHasher;
impl BuildHasher for ConstBuildHasher {
    type Hasher = ConstHasher;
    fn build_hasher(&self) -> Self::Hasher {
        ConstHasher
    }
}
impl std::hash::Hasher for ConstHasher {
    fn write(&mut self, _bytes: &[u8]) {}
    fn finish(&self) -> u64 {
        0
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine_with_collisions((pool, ops) in arb_scenario()) {
        let mut sut: FlatMap<String, i32, ConstBuildHasher> =
            FlatMap::with_hasher(ConstBuildHasher);
        run_state_machine(&pool, ops, &mut sut)?;
    }
}

// Property: set round trip. Inserting any multiset of keys and erasing
// a subset leaves exactly the set difference, in any iteration order.
proptest! {
    #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]
    #[test]
    fn prop_set_round_trip(
        keys in proptest::collection::vec(any::<u32>(), 0..200),
        erase_mask in proptest::collection::vec(any::<bool>(), 0..200),
    ) {
        let mut sut: FlatSet<u32> = FlatSet::new();
        let mut model: BTreeSet<u32> = BTreeSet::new();
        for &k in &keys {
            prop_assert_eq!(sut.insert(k), model.insert(k));
        }
        for (i, &k) in keys.iter().enumerate() {
            if erase_mask.get(i).copied().unwrap_or(false) {
                prop_assert_eq!(sut.remove(&k), model.remove(&k));
            }
        }
        let got: BTreeSet<u32> = sut.iter().copied().collect();
        prop_assert_eq!(got, model);
    }
}
