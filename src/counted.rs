//! Counted cells: the heap representation behind every handle.
//!
//! A cell is a value of type `T` prepended with a fixed header holding the
//! atomic reference count and a type-erased drop function. Keeping the
//! header at offset 0 means the reclamation engine can manipulate any
//! cell's count and run its destructor from a `*mut CellHeader` alone,
//! without knowing `T`. The cell's address is its identity everywhere in
//! the crate.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Type-erased destructor for a cell. Drops the whole `CountedCell<T>`
/// allocation, including the value.
pub(crate) type DropFn = unsafe fn(*mut CellHeader);

/// Fixed-layout prefix of every counted cell.
///
/// The reference count starts at 1 (the creating handle's share). The cell
/// is deallocated exactly once, by whoever observes the `1 -> 0`
/// transition.
#[repr(C)]
pub(crate) struct CellHeader {
    refcnt: AtomicU64,
    /// Set once the cell has been installed in an atomic slot. Only
    /// published cells can ever be named by an announcement, so the final
    /// release of an unpublished cell may destroy it directly while a
    /// published one must go through the reclamation engine.
    published: AtomicBool,
    drop_fn: DropFn,
}

impl CellHeader {
    /// Add `count` references. Relaxed is enough: a new reference is only
    /// ever created from an existing protected one, so no ordering is
    /// carried through the increment itself.
    #[inline]
    pub(crate) fn add_refs(&self, count: u64) -> u64 {
        self.refcnt.fetch_add(count, Ordering::Relaxed)
    }

    /// Drop `count` references, returning the previous count. Release so
    /// that all writes to the value happen-before the destructor; the
    /// thread that observes zero must issue an acquire fence before
    /// destroying (see `engine::release_ref`).
    #[inline]
    pub(crate) fn release_refs(&self, count: u64) -> u64 {
        self.refcnt.fetch_sub(count, Ordering::Release)
    }

    /// Current reference count. Informational only, never a
    /// synchronization primitive.
    #[inline]
    pub(crate) fn use_count(&self) -> u64 {
        self.refcnt.load(Ordering::SeqCst)
    }

    /// Record that this cell is (about to be) visible through an atomic
    /// slot. Must be called before the publishing store or exchange.
    /// Sticky: once published, always published.
    #[inline]
    pub(crate) fn mark_published(&self) {
        self.published.store(true, Ordering::Relaxed);
    }

    /// Whether this cell was ever installed in an atomic slot. Read on
    /// the final-release path, after the acquire fence that closes the
    /// reference-holding chain, so the relaxed load is sufficient.
    #[inline]
    pub(crate) fn is_published(&self) -> bool {
        self.published.load(Ordering::Relaxed)
    }

    /// Run the cell's destructor and free the allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must be the header of a live cell whose count has reached
    /// zero, and no other thread may still reference it.
    #[inline]
    pub(crate) unsafe fn invoke_drop(ptr: *mut CellHeader) {
        let drop_fn = unsafe { (*ptr).drop_fn };
        unsafe { drop_fn(ptr) };
    }
}

/// A value of type `T` prepended with its [`CellHeader`].
///
/// Aligned to 64 bytes so the header (and with it the contended reference
/// count) starts on its own cache line.
#[repr(C, align(64))]
pub(crate) struct CountedCell<T> {
    header: CellHeader,
    value: T,
}

impl<T> CountedCell<T> {
    /// Allocate a fresh cell with `refcnt = 1`, returning the sole owner's
    /// raw pointer.
    pub(crate) fn allocate(value: T) -> *mut CountedCell<T> {
        Box::into_raw(Box::new(CountedCell {
            header: CellHeader {
                refcnt: AtomicU64::new(1),
                published: AtomicBool::new(false),
                drop_fn: drop_cell::<T>,
            },
            value,
        }))
    }

    #[inline]
    pub(crate) fn header(&self) -> &CellHeader {
        &self.header
    }

    #[inline]
    pub(crate) fn value(&self) -> &T {
        &self.value
    }
}

/// The concrete destructor installed in every `CountedCell<T>` header.
///
/// # Safety
///
/// `ptr` must have been produced by `CountedCell::<T>::allocate` and not
/// freed yet.
unsafe fn drop_cell<T>(ptr: *mut CellHeader) {
    // CountedCell<T> is #[repr(C)] with the header at offset 0, so the
    // header pointer is also the cell pointer.
    unsafe { drop(Box::from_raw(ptr.cast::<CountedCell<T>>())) };
}
