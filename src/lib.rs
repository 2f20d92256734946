//! rh-hashmap: Robin Hood open-addressing maps and sets.
//!
//! One probing engine backs four containers: [`FlatMap`] / [`FlatSet`]
//! keep records inline in the bucket array, [`NodeMap`] / [`NodeSet`]
//! keep them behind allocator pointers. Insertion steals buckets from
//! records that sit closer to their ideal position, deletion
//! backward-shifts the following cluster (no tombstones), and the table
//! grows automatically on load factor or when the tracked mean probe
//! distance degrades.
//!
//! Containers are generic over a [`RegionAlloc`] memory provider. With
//! the default [`Global`] provider they behave like ordinary heap
//! containers; with a provider whose pointer type is relocation-safe
//! (such as the bundled [`Arena`] with its self-relative [`OffsetPtr`]),
//! a node-layout container built in place inside a memory region stays
//! valid when that region is later mapped at a different base address.
//!
//! Containers are single-threaded by contract (`!Send + !Sync`); debug
//! builds detect reentrant calls out of `Hash`/`Eq` implementations.
//!
//! ```
//! use rh_hashmap::FlatMap;
//!
//! let mut positions: FlatMap<String, u64> = FlatMap::new();
//! positions.insert("header".to_string(), 0);
//! positions.insert("payload".to_string(), 16);
//! assert_eq!(positions.get("payload"), Some(&16));
//! assert!(positions.erase("header") == 1);
//! ```

mod capacity;
mod hash;
mod header;
mod kv;
mod map;
mod reentrancy;
mod region;
mod set;
mod slot;
mod storage;
mod table;
mod table_proptest;

pub use capacity::{CapacityPolicy, PowerOfTwoCapacity, PrimeCapacity};
pub use hash::{seeded_hash_builder, DefaultHashBuilder};
pub use map::{FlatMap, Iter as MapIter, IterMut as MapIterMut, Map, NodeMap};
pub use region::{
    AccessHint, AllocError, Arena, ArenaRef, Global, OffsetPtr, RawPtr, RegionAlloc, StoredPtr,
};
pub use set::{FlatSet, Iter as SetIter, NodeSet, Set};
pub use slot::{InlineSlot, NodeSlot, Slot};
pub use table::CapacityError;
