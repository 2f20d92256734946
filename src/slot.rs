//! Two-mode record holder.
//!
//! Every bucket owns a holder: [`InlineSlot`] embeds the record in the
//! bucket array itself (flat layout), [`NodeSlot`] owns a heap record
//! through the allocator's stored-pointer type (node layout). The engine
//! drives holders through raw pointers because they live in raw bucket
//! storage whose occupancy is tracked by the header byte, not by Rust
//! initialization; a holder is only valid at positions whose header is
//! non-empty.
//!
//! All node-mode pointer motion goes through `StoredPtr::set`/`get` so
//! that self-relative pointers re-anchor at their destination.

use core::ptr;
use std::alloc::Layout;
use std::mem::MaybeUninit;

use crate::region::{AllocError, RegionAlloc, StoredPtr};

/// Storage-mode-neutral holder operations over raw bucket slots.
///
/// # Safety
///
/// Implementations must treat `construct`/`move_into` destinations as
/// uninitialized and everything else as holding a live record. Callers
/// must pass slots consistent with that state, must pair every
/// `construct` with exactly one of `clear`/`take`/`move_into`-source,
/// and must only `swap`/`move_into` holders sharing one allocator.
pub unsafe trait Slot<A: RegionAlloc>: Sized {
    type Record;

    /// Construct a holder for `record` in the vacant storage at `slot`.
    unsafe fn construct(slot: *mut Self, alloc: &A, record: Self::Record)
        -> Result<(), AllocError>;

    unsafe fn record(slot: *const Self) -> *const Self::Record;

    unsafe fn record_mut(slot: *mut Self) -> *mut Self::Record;

    /// Destroy the held record (and free its node, in node mode). The
    /// slot is vacant afterwards.
    unsafe fn clear(slot: *mut Self, alloc: &A);

    /// Move the record out, releasing any node storage. The slot is
    /// vacant afterwards.
    unsafe fn take(slot: *mut Self, alloc: &A) -> Self::Record;

    /// Move-construct `dst` (vacant) from `src` (live); `src` is vacant
    /// afterwards.
    unsafe fn move_into(dst: *mut Self, src: *mut Self);

    /// Exchange two live holders.
    unsafe fn swap(a: *mut Self, b: *mut Self);
}

/// Flat layout: the record is embedded in the bucket array.
#[repr(transparent)]
pub struct InlineSlot<R> {
    record: MaybeUninit<R>,
}

unsafe impl<R, A: RegionAlloc> Slot<A> for InlineSlot<R> {
    type Record = R;

    #[inline]
    unsafe fn construct(slot: *mut Self, _alloc: &A, record: R) -> Result<(), AllocError> {
        ptr::addr_of_mut!((*slot).record).cast::<R>().write(record);
        Ok(())
    }

    #[inline]
    unsafe fn record(slot: *const Self) -> *const R {
        ptr::addr_of!((*slot).record).cast::<R>()
    }

    #[inline]
    unsafe fn record_mut(slot: *mut Self) -> *mut R {
        ptr::addr_of_mut!((*slot).record).cast::<R>()
    }

    #[inline]
    unsafe fn clear(slot: *mut Self, _alloc: &A) {
        ptr::drop_in_place(<Self as Slot<A>>::record_mut(slot));
    }

    #[inline]
    unsafe fn take(slot: *mut Self, _alloc: &A) -> R {
        <Self as Slot<A>>::record_mut(slot).read()
    }

    #[inline]
    unsafe fn move_into(dst: *mut Self, src: *mut Self) {
        ptr::copy_nonoverlapping(src, dst, 1);
    }

    #[inline]
    unsafe fn swap(a: *mut Self, b: *mut Self) {
        ptr::swap_nonoverlapping(a, b, 1);
    }
}

/// Node layout: the bucket stores an allocator pointer to a heap record.
#[repr(transparent)]
pub struct NodeSlot<R, A: RegionAlloc> {
    ptr: A::Ptr<R>,
}

impl<R, A: RegionAlloc> NodeSlot<R, A> {
    #[inline]
    unsafe fn ptr_field(slot: *mut Self) -> *mut A::Ptr<R> {
        ptr::addr_of_mut!((*slot).ptr)
    }
}

unsafe impl<R, A: RegionAlloc> Slot<A> for NodeSlot<R, A> {
    type Record = R;

    unsafe fn construct(slot: *mut Self, alloc: &A, record: R) -> Result<(), AllocError> {
        let node = alloc.allocate(Layout::new::<R>())?.cast::<R>();
        node.write(record);
        let field = Self::ptr_field(slot);
        field.write(<A::Ptr<R> as StoredPtr<R>>::null());
        (*field).set(node);
        Ok(())
    }

    #[inline]
    unsafe fn record(slot: *const Self) -> *const R {
        (*ptr::addr_of!((*slot).ptr)).get()
    }

    #[inline]
    unsafe fn record_mut(slot: *mut Self) -> *mut R {
        (*Self::ptr_field(slot)).get()
    }

    unsafe fn clear(slot: *mut Self, alloc: &A) {
        let field = Self::ptr_field(slot);
        let node = (*field).get();
        if node.is_null() {
            return;
        }
        ptr::drop_in_place(node);
        alloc.deallocate(node.cast::<u8>(), Layout::new::<R>());
        (*field).set(ptr::null_mut());
    }

    unsafe fn take(slot: *mut Self, alloc: &A) -> R {
        let field = Self::ptr_field(slot);
        let node = (*field).get();
        debug_assert!(!node.is_null());
        let record = node.read();
        alloc.deallocate(node.cast::<u8>(), Layout::new::<R>());
        (*field).set(ptr::null_mut());
        record
    }

    unsafe fn move_into(dst: *mut Self, src: *mut Self) {
        let s = Self::ptr_field(src);
        let d = Self::ptr_field(dst);
        d.write(<A::Ptr<R> as StoredPtr<R>>::null());
        (*d).set((*s).get());
        (*s).set(ptr::null_mut());
    }

    unsafe fn swap(a: *mut Self, b: *mut Self) {
        let pa = Self::ptr_field(a);
        let pb = Self::ptr_field(b);
        let ta = (*pa).get();
        let tb = (*pb).get();
        (*pa).set(tb);
        (*pb).set(ta);
    }
}
