//! Record shape resolution: whether a stored record is a `(key, value)`
//! pair (map) or a bare key (set), and how to project the key out of it.
//!
//! The flat (inline) layout shuffles whole records during Robin Hood
//! displacement, so no API ever hands out `&mut K`; the node layout only
//! moves pointers, but keeps the same rule for uniformity.

use core::marker::PhantomData;

/// Projection from a stored record to its key.
pub trait EntryKind {
    type Key;
    type Record;

    fn key(record: &Self::Record) -> &Self::Key;
}

/// Map records: `(K, V)`.
pub struct KeyValue<K, V>(PhantomData<fn() -> (K, V)>);

impl<K, V> EntryKind for KeyValue<K, V> {
    type Key = K;
    type Record = (K, V);

    #[inline]
    fn key(record: &(K, V)) -> &K {
        &record.0
    }
}

/// Set records: the key itself.
pub struct KeyOnly<K>(PhantomData<fn() -> K>);

impl<K> EntryKind for KeyOnly<K> {
    type Key = K;
    type Record = K;

    #[inline]
    fn key(record: &K) -> &K {
        record
    }
}
