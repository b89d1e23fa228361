//! `AtomicStrong<T>`: a lock-free atomic slot holding a [`Strong`] handle.
//!
//! The slot stores one raw cell pointer and conceptually owns one strong
//! reference to it. Reads go through the engine's acquire protocol
//! (double-collect into an announcement) so they can never observe a
//! destroyed cell; writes exchange the pointer and retire the displaced
//! cell through the engine. Every operation linearizes at its
//! sequentially-consistent load, exchange, or compare-exchange on the
//! underlying pointer.

use crate::counted::{CellHeader, CountedCell};
use crate::engine;
use crate::snapshot::Snapshot;
use crate::strong::Strong;
use core::fmt;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicPtr, Ordering};
use crossbeam_utils::Backoff;

mod sealed {
    pub trait Sealed {}
}

/// Handles that name a cell and can stand as the `expected` side of a
/// compare-and-swap: [`Strong`] and [`Snapshot`].
///
/// Comparison is always by cell identity (address), never by value.
pub trait SharedPtr<T>: sealed::Sealed {
    /// The cell's address, as an opaque pointer. Null for null handles.
    #[doc(hidden)]
    fn cell_addr(&self) -> *mut ();
}

impl<T> sealed::Sealed for Strong<T> {}

impl<T> SharedPtr<T> for Strong<T> {
    #[inline]
    fn cell_addr(&self) -> *mut () {
        self.as_header().cast()
    }
}

impl<T> sealed::Sealed for Snapshot<T> {}

impl<T> SharedPtr<T> for Snapshot<T> {
    #[inline]
    fn cell_addr(&self) -> *mut () {
        self.as_header().cast()
    }
}

/// A lock-free atomic slot for [`Strong`] handles.
///
/// Supports concurrent `load` / `store` / `exchange` / compare-and-swap
/// from any number of threads, plus [`get_snapshot`](Self::get_snapshot)
/// for reads that skip reference counting entirely. Not copyable and not
/// movable while shared; wrap it in an `Arc` or put it in a shared
/// structure.
///
/// Protected reads (`load`, `get_snapshot`, the compare-and-swap family)
/// panic when invoked on a thread whose reclamation state is already torn
/// down — in practice, from another `thread_local` destructor running
/// during thread exit. Dropping handles during teardown is always fine.
///
/// # Examples
///
/// ```
/// use sarc::{make_shared, AtomicStrong};
///
/// let slot = AtomicStrong::new(make_shared(String::from("Hello, World")));
/// let value = slot.load();
/// assert_eq!(*value, "Hello, World");
/// assert_eq!(value.use_count(), 2); // the slot and `value`
/// ```
pub struct AtomicStrong<T> {
    cell: AtomicPtr<CellHeader>,
    _marker: PhantomData<CountedCell<T>>,
}

/// Record that a cell is about to become visible through a slot. Must
/// happen before the publishing store or exchange; see
/// `engine::release_ref` for what the mark gates.
#[inline]
fn mark_published(cell: *mut CellHeader) {
    if !cell.is_null() {
        // SAFETY: the caller holds a reference, so the cell is live.
        unsafe { (*cell).mark_published() };
    }
}

impl<T> AtomicStrong<T> {
    /// A slot initially holding `desired`. Takes over `desired`'s
    /// reference without count traffic.
    pub fn new(desired: Strong<T>) -> Self {
        let incoming = desired.release().cast::<CellHeader>();
        mark_published(incoming);
        Self {
            cell: AtomicPtr::new(incoming),
            _marker: PhantomData,
        }
    }

    /// An initially null slot.
    pub fn null() -> Self {
        Self {
            cell: AtomicPtr::new(core::ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    /// Always true: the slot is a single machine pointer.
    pub const IS_ALWAYS_LOCK_FREE: bool = true;

    /// Whether operations on this slot are lock-free. Always true.
    #[inline]
    pub fn is_lock_free(&self) -> bool {
        true
    }

    /// Load the current handle, incrementing the cell's count.
    ///
    /// Uses the acquire protocol: the observed pointer is published in
    /// this thread's announcement and re-checked before the count is
    /// touched, so the cell cannot be destroyed in between.
    pub fn load(&self) -> Strong<T> {
        let (observed, reservation) = engine::acquire(&self.cell);
        let result = if observed.is_null() {
            Strong::null()
        } else {
            // SAFETY: the reservation keeps `observed` announced until it
            // is dropped below, after the increment.
            unsafe { Strong::acquire(observed.cast::<CountedCell<T>>()) }
        };
        drop(reservation);
        result
    }

    /// Publish `desired`, retiring the displaced cell. The slot takes
    /// over `desired`'s reference.
    pub fn store(&self, desired: Strong<T>) {
        let incoming = desired.release().cast::<CellHeader>();
        mark_published(incoming);
        let displaced = self.cell.swap(incoming, Ordering::SeqCst);
        if !displaced.is_null() {
            engine::retire(displaced);
        }
    }

    /// Atomically replace the content with `desired`, returning a handle
    /// owning the former content. No count traffic on either side: the
    /// slot's reference transfers straight into the returned handle.
    pub fn exchange(&self, desired: Strong<T>) -> Strong<T> {
        let incoming = desired.release().cast::<CellHeader>();
        mark_published(incoming);
        let displaced = self.cell.swap(incoming, Ordering::SeqCst);
        // SAFETY: the slot owned one reference to the displaced cell.
        unsafe { Strong::adopt(displaced.cast::<CountedCell<T>>()) }
    }

    /// Exchange the slot's content with a non-atomic handle, with no
    /// reference-count traffic in either direction.
    ///
    /// The swapped-out handle simply takes over the slot's reference, so
    /// the operation itself never dereferences anything. Callers that go
    /// on to *read through* the swapped-out handle while other threads
    /// race writes on the slot should hold an independent reference to
    /// the slot's current content for the duration (the linked-node push
    /// idiom does this naturally; see the stack tests).
    pub fn swap(&self, desired: &mut Strong<T>) {
        let incoming = core::mem::take(desired).release().cast::<CellHeader>();
        mark_published(incoming);
        let mut current = self.cell.load(Ordering::SeqCst);
        let backoff = Backoff::new();
        loop {
            match self
                .cell
                .compare_exchange_weak(current, incoming, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    // SAFETY: the slot owned one reference to `current`;
                    // it transfers to `desired`.
                    *desired = unsafe { Strong::adopt(current.cast::<CountedCell<T>>()) };
                    return;
                }
                Err(actual) => {
                    current = actual;
                    backoff.spin();
                }
            }
        }
    }

    /// Take an announcement-protected snapshot of the current content
    /// without touching the reference count. See [`Snapshot`].
    pub fn get_snapshot(&self) -> Snapshot<T> {
        let (observed, slot) = engine::protect_snapshot(&self.cell);
        // SAFETY: `protect_snapshot` confirmed the announcement slot now
        // holds `observed` (or both are null), matching `from_protected`'s
        // contract.
        unsafe { Snapshot::from_protected(observed.cast::<CountedCell<T>>(), slot) }
    }

    /// Install a copy of `desired` if the slot currently holds
    /// `expected`'s cell. Returns whether the swap happened; `desired` is
    /// untouched either way.
    ///
    /// `expected` may be a [`Strong`] or a [`Snapshot`]; identity is the
    /// cell address. On success the displaced cell is retired and
    /// `desired`'s count is incremented for the slot's new reference.
    pub fn compare_and_swap<P: SharedPtr<T>>(&self, expected: &P, desired: &Strong<T>) -> bool {
        let expected_cell = expected.cell_addr().cast::<CellHeader>();
        let desired_cell = desired.as_header();
        mark_published(desired_cell);
        // Pin `desired` before the exchange: without this, another thread
        // could displace and free it between our success and the
        // increment below. The caller's own reference does not help,
        // because the slot's reference is the one being minted.
        let _reserved = if desired_cell.is_null() {
            None
        } else {
            Some(engine::reserve(desired_cell))
        };
        match self
            .cell
            .compare_exchange(expected_cell, desired_cell, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(displaced) => {
                if !displaced.is_null() {
                    engine::retire(displaced);
                }
                if !desired_cell.is_null() {
                    // SAFETY: pinned by the reservation above.
                    unsafe { engine::acquire_ref(desired_cell) };
                }
                true
            }
            Err(_) => false,
        }
    }

    /// Install `desired` by move if the slot currently holds `expected`'s
    /// cell.
    ///
    /// On success the slot absorbs `desired`'s reference (no count
    /// traffic) and the displaced cell is retired. On failure `desired`
    /// is handed back unchanged.
    pub fn compare_exchange<P: SharedPtr<T>>(
        &self,
        expected: &P,
        desired: Strong<T>,
    ) -> Result<(), Strong<T>> {
        let expected_cell = expected.cell_addr().cast::<CellHeader>();
        let desired_cell = desired.as_header();
        mark_published(desired_cell);
        match self
            .cell
            .compare_exchange(expected_cell, desired_cell, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(displaced) => {
                if !displaced.is_null() {
                    engine::retire(displaced);
                }
                let _ = desired.release();
                Ok(())
            }
            Err(_) => Err(desired),
        }
    }

    /// Like [`compare_and_swap`](Self::compare_and_swap) with a [`Strong`]
    /// expected, but on failure reloads the slot's current content into
    /// `expected` (through the protected load path), ready for the next
    /// attempt.
    pub fn compare_and_swap_mut(&self, expected: &mut Strong<T>, desired: &Strong<T>) -> bool {
        if self.compare_and_swap(&*expected, desired) {
            true
        } else {
            *expected = self.load();
            false
        }
    }
}

impl<T> Default for AtomicStrong<T> {
    /// An initially null slot.
    fn default() -> Self {
        Self::null()
    }
}

impl<T> From<Strong<T>> for AtomicStrong<T> {
    fn from(desired: Strong<T>) -> Self {
        Self::new(desired)
    }
}

impl<T> Drop for AtomicStrong<T> {
    fn drop(&mut self) {
        let cell = *self.cell.get_mut();
        if !cell.is_null() {
            // SAFETY: the slot owned one reference; exclusive access via
            // &mut means no concurrent reader.
            unsafe { engine::release_ref(cell) };
        }
        // Give cells retired by earlier stores a chance to go now.
        engine::flush();
    }
}

impl<T: fmt::Debug> fmt::Debug for AtomicStrong<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicStrong").field(&self.load()).finish()
    }
}

// SAFETY: the slot shares cells with the same model as Strong; all
// mutation goes through atomics and the reclamation engine.
unsafe impl<T: Send + Sync> Send for AtomicStrong<T> {}
unsafe impl<T: Send + Sync> Sync for AtomicStrong<T> {}
