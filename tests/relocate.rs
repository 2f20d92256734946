// Relocation round trip for node-layout containers inside an arena
// region (the configuration whose pointers must survive the region
// being mapped at a different base address).
//
// Invariants exercised:
// - Construct-in-place: a container is built at a caller-chosen offset
//   inside the region with a caller-supplied allocator handle.
// - Relocation safety: after the region's bytes move to a different
//   base, every stored pointer (bucket array, record nodes) still
//   resolves; contents compare equal to an untouched heap copy.
// - Reattach: the stored allocator handle is refreshed per mapping, and
//   the container stays fully mutable afterwards.

use rh_hashmap::{seeded_hash_builder, Arena, ArenaRef, DefaultHashBuilder, NodeMap, NodeSet};

type RegionMap = NodeMap<u64, u64, DefaultHashBuilder, ArenaRef>;
type RegionSet = NodeSet<u64, DefaultHashBuilder, ArenaRef>;

#[test]
fn node_map_survives_relocation() {
    let arena = Arena::with_capacity(1 << 17);
    let root = arena.reserve_root::<RegionMap>().expect("root slot");

    // Build and populate the map inside the region.
    unsafe {
        let map_ptr = arena.root_at::<RegionMap>(root);
        RegionMap::construct_at(map_ptr, seeded_hash_builder(42), arena.handle());
        let map = &mut *map_ptr;
        for k in 0..300u64 {
            assert!(map.insert(k, k.wrapping_mul(3)));
        }
        for k in (0..300u64).step_by(7) {
            assert_eq!(map.erase(&k), 1);
        }
    }

    // Untouched reference copy on the process heap, same hash seed.
    let mut reference: NodeMap<u64, u64> = NodeMap::with_hasher(seeded_hash_builder(42));
    for k in 0..300u64 {
        if k % 7 != 0 {
            reference.insert(k, k.wrapping_mul(3));
        }
    }

    // Unmap and remap at a different base address.
    let moved = arena.relocated();
    unsafe {
        let map_ptr = moved.root_at::<RegionMap>(root);
        (*map_ptr).reattach_allocator(moved.handle());
        let map = &*map_ptr;

        assert_eq!(map.len(), reference.len());
        for k in 0..300u64 {
            if k % 7 != 0 {
                assert_eq!(map.get(&k), Some(&k.wrapping_mul(3)), "key {k} after remap");
            } else {
                assert_eq!(map.get(&k), None);
            }
        }
        assert!(*map == reference, "relocated map must equal the pre-move contents");
    }

    // The reopened map is fully usable: mutations, growth, erase.
    unsafe {
        let map = &mut *moved.root_at::<RegionMap>(root);
        assert!(map.insert(10_000, 1));
        assert_eq!(map.erase(&1u64), 1);
        assert!(map.reserve(1024).is_ok());
        assert_eq!(map.get(&10_000u64), Some(&1));
        assert!(*map != reference);
    }
}

#[test]
fn node_map_survives_two_relocations() {
    let arena = Arena::with_capacity(1 << 16);
    let root = arena.reserve_root::<RegionMap>().expect("root slot");
    unsafe {
        let map_ptr = arena.root_at::<RegionMap>(root);
        RegionMap::construct_at(map_ptr, seeded_hash_builder(7), arena.handle());
        let map = &mut *map_ptr;
        for k in 0..64u64 {
            map.insert(k, !k);
        }
    }

    let first = arena.relocated();
    unsafe {
        let map = &mut *first.root_at::<RegionMap>(root);
        map.reattach_allocator(first.handle());
        // Mutate between the two moves so the second one carries state
        // written under the first remap.
        for k in 64..128u64 {
            map.insert(k, !k);
        }
    }

    let second = first.relocated();
    unsafe {
        let map = &mut *second.root_at::<RegionMap>(root);
        map.reattach_allocator(second.handle());
        assert_eq!(map.len(), 128);
        for k in 0..128u64 {
            assert_eq!(map.get(&k), Some(&!k));
        }
    }
}

#[test]
fn node_set_survives_relocation() {
    let arena = Arena::with_capacity(1 << 16);
    let root = arena.reserve_root::<RegionSet>().expect("root slot");
    unsafe {
        let set_ptr = arena.root_at::<RegionSet>(root);
        RegionSet::construct_at(set_ptr, seeded_hash_builder(11), arena.handle());
        let set = &mut *set_ptr;
        for k in 0..200u64 {
            assert!(set.insert(k * k));
        }
    }

    let moved = arena.relocated();
    unsafe {
        let set = &mut *moved.root_at::<RegionSet>(root);
        set.reattach_allocator(moved.handle());
        assert_eq!(set.len(), 200);
        for k in 0..200u64 {
            assert!(set.contains(&(k * k)));
        }
        assert!(!set.contains(&3u64));
        assert!(set.remove(&0u64));
        assert_eq!(set.len(), 199);
    }
}

// A region allocator cannot hand out memory it does not have: the
// failure policy frees the table but the container stays usable and
// empty (the deliberate lossy policy for failed growth).
#[test]
fn exhausted_region_reports_and_empties() {
    let arena = Arena::with_capacity(2048);
    let root = arena.reserve_root::<RegionMap>().expect("root slot");
    unsafe {
        let map_ptr = arena.root_at::<RegionMap>(root);
        RegionMap::construct_at(map_ptr, seeded_hash_builder(1), arena.handle());
        let map = &mut *map_ptr;
        for k in 0..8u64 {
            map.insert(k, k);
        }
        let err = map.reserve(1 << 20).unwrap_err();
        assert_eq!(err, rh_hashmap::CapacityError::AllocationFailed);
        assert_eq!(map.len(), 0);
        assert_eq!(map.bucket_count(), 0);
        map.insert(5, 5);
        assert_eq!(map.get(&5u64), Some(&5));
    }
}
