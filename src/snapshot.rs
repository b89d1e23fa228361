//! `Snapshot<T>`: an announcement-protected read with no reference-count
//! traffic.
//!
//! A snapshot pins its cell through one of the owning thread's snapshot
//! announcement slots instead of through the reference count, so taking
//! one costs no atomic read-modify-write on the hot path. If the slot is
//! later recycled for a newer snapshot, the engine first promotes this
//! snapshot's protection to a real reference (see
//! `engine::protect_snapshot`), and the drop path balances that by
//! decrementing instead of clearing the slot.

use crate::counted::{CellHeader, CountedCell};
use crate::engine;
use core::fmt;
use core::ops::Deref;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

/// A read of an [`AtomicStrong`](crate::AtomicStrong) that defers all
/// reference counting.
///
/// Move-only and bound to the thread that took it (the protecting
/// announcement slot belongs to that thread's worker record). Dropping
/// the snapshot returns the slot — or, if the slot was recycled in the
/// meantime, releases the reference the eviction added.
///
/// # Examples
///
/// ```
/// use sarc::{make_shared, AtomicStrong};
///
/// let slot = AtomicStrong::new(make_shared(String::from("v1")));
/// let snap = slot.get_snapshot();
/// slot.store(make_shared(String::from("v2")));
/// assert_eq!(*snap, "v1"); // still pinned to the value read
/// ```
pub struct Snapshot<T> {
    ptr: *mut CountedCell<T>,
    /// The announcement slot protecting `ptr`; null only when the
    /// snapshot itself is null.
    slot: *const AtomicPtr<CellHeader>,
}

impl<T> Snapshot<T> {
    /// The null snapshot.
    #[inline]
    pub const fn null() -> Self {
        Self {
            ptr: ptr::null_mut(),
            slot: ptr::null(),
        }
    }

    /// Whether this snapshot is null.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// A reference to the pinned value, or `None` for the null snapshot.
    #[inline]
    pub fn get(&self) -> Option<&T> {
        // SAFETY: a non-null snapshot keeps its cell alive via the
        // announcement slot or an owned reference.
        unsafe { self.ptr.as_ref().map(|cell| cell.value()) }
    }

    /// Wrap a protected pointer and the announcement slot guarding it.
    ///
    /// # Safety
    ///
    /// Either `ptr` is null, or `slot` is the caller's announcement slot
    /// currently holding `ptr`.
    #[inline]
    pub(crate) unsafe fn from_protected(
        ptr: *mut CountedCell<T>,
        slot: *const AtomicPtr<CellHeader>,
    ) -> Self {
        Self { ptr, slot }
    }

    #[inline]
    pub(crate) fn as_header(&self) -> *mut CellHeader {
        self.ptr.cast::<CellHeader>()
    }
}

impl<T> Drop for Snapshot<T> {
    fn drop(&mut self) {
        if self.ptr.is_null() {
            return;
        }
        let header = self.as_header();
        // SAFETY: non-null ptr implies a slot in the leaked global worker
        // array (from_protected's contract).
        let slot = unsafe { &*self.slot };
        if slot.load(Ordering::SeqCst) == header {
            // Still announced: return the slot. Release so the clear is
            // ordered after our last read of the cell.
            slot.store(ptr::null_mut(), Ordering::Release);
        } else {
            // The slot was recycled; the eviction gave us a reference.
            // SAFETY: that reference is ours to drop.
            unsafe { engine::release_ref(header) };
        }
    }
}

impl<T> Deref for Snapshot<T> {
    type Target = T;

    /// Panics when called on the null snapshot; use [`Snapshot::get`]
    /// when null is a possibility.
    fn deref(&self) -> &T {
        match self.get() {
            Some(value) => value,
            None => panic!("dereferenced a null Snapshot"),
        }
    }
}

impl<T> PartialEq for Snapshot<T> {
    /// Identity comparison, like [`Strong`](crate::Strong).
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for Snapshot<T> {}

impl<T: fmt::Debug> fmt::Debug for Snapshot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(value) => f.debug_tuple("Snapshot").field(value).finish(),
            None => f.write_str("Snapshot(null)"),
        }
    }
}
