//! The acquire-retire engine: announcement slots, deferred retirement,
//! and batched reclamation.
//!
//! Every thread that touches an atomic handle gets a worker id and with it
//! a record in a global, cache-padded array:
//! - one *primary* announcement used by the load/reserve protocols,
//! - a fixed array of *snapshot* announcements held open for the lifetime
//!   of a [`Snapshot`](crate::Snapshot), recycled round-robin by promoting
//!   the evicted announcement to a real reference-count increment,
//! - a retire list of displaced cell pointers pending destruction,
//! - a reentrancy flag that keeps destructors from re-entering reclamation.
//!
//! Unlike hazard pointers, the retire list has multiset semantics: the same
//! cell may be retired several times, and each announcement of it absorbs
//! exactly one pending retire per reclamation pass.
//!
//! Retire lists live in the global record rather than in thread-local
//! storage so that a recycled worker id inherits (and eventually drains)
//! its predecessor's pending work, and so [`drain_all`] can reach every
//! list at teardown.

use crate::counted::CellHeader;
use crate::table::ScanTable;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::{Cell, UnsafeCell};
use core::mem;
use core::ptr;
use core::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use crossbeam_utils::CachePadded;
use once_cell::race::OnceBox;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Snapshot announcements per worker. A thread can hold this many
/// snapshots without any reference-count traffic; further snapshots evict
/// the oldest announcement into a counted reference.
pub(crate) const SNAPSHOT_SLOTS: usize = 3;

/// Reclamation batching threshold: a worker only scans announcements once
/// it has accumulated `RETIRE_DELAY * workers` pending retires.
pub(crate) const RETIRE_DELAY: usize = 5;

// Maximum concurrently registered worker threads. Configurable via cargo
// features, e.g. `sarc = { features = ["max-workers-512"] }`. Default: 128.
#[cfg(feature = "max-workers-1024")]
pub(crate) const MAX_WORKERS: usize = 1024;
#[cfg(all(feature = "max-workers-512", not(feature = "max-workers-1024")))]
pub(crate) const MAX_WORKERS: usize = 512;
#[cfg(all(
    feature = "max-workers-256",
    not(any(feature = "max-workers-512", feature = "max-workers-1024"))
))]
pub(crate) const MAX_WORKERS: usize = 256;
#[cfg(not(any(
    feature = "max-workers-256",
    feature = "max-workers-512",
    feature = "max-workers-1024"
)))]
pub(crate) const MAX_WORKERS: usize = 128;

/// Per-worker engine state.
struct WorkerRecord {
    /// Primary announcement: the cell this worker may be about to read.
    primary: AtomicPtr<CellHeader>,
    /// Snapshot announcements, one per live announcement-protected
    /// [`Snapshot`](crate::Snapshot) (at most `SNAPSHOT_SLOTS` of them).
    snapshots: [AtomicPtr<CellHeader>; SNAPSHOT_SLOTS],
    /// Round-robin eviction cursor into `snapshots`. Owner-only.
    last_free: AtomicUsize,
    /// Set while this worker runs reclamation; blocks re-entry from
    /// destructors.
    busy: AtomicBool,
    /// Displaced cell pointers pending destruction. Owner-only, multiset.
    retired: UnsafeCell<Vec<*mut CellHeader>>,
}

// SAFETY: the atomic fields are inherently Sync. `retired` and `last_free`
// are only ever accessed by the thread that owns the worker id, except
// inside `drain_all`, whose contract forbids concurrent engine use.
unsafe impl Send for WorkerRecord {}
unsafe impl Sync for WorkerRecord {}

impl WorkerRecord {
    fn new() -> Self {
        Self {
            primary: AtomicPtr::new(ptr::null_mut()),
            snapshots: core::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            last_free: AtomicUsize::new(0),
            busy: AtomicBool::new(false),
            retired: UnsafeCell::new(Vec::new()),
        }
    }
}

/// Global engine state: the worker array and the id allocator.
struct Engine {
    workers: Box<[CachePadded<WorkerRecord>]>,
    /// High-watermark id allocator; also the bound for announcement scans.
    next_id: AtomicUsize,
    /// Recycled worker ids, reused before fresh ones are minted.
    free_ids: Mutex<Vec<usize>>,
}

impl Engine {
    fn new() -> Self {
        let mut workers = Vec::with_capacity(MAX_WORKERS);
        for _ in 0..MAX_WORKERS {
            workers.push(CachePadded::new(WorkerRecord::new()));
        }
        Self {
            workers: workers.into_boxed_slice(),
            next_id: AtomicUsize::new(0),
            free_ids: Mutex::new(Vec::new()),
        }
    }

    /// Number of worker records ever handed out. Recycled ids stay below
    /// this watermark, so scanning `workers[..workers_in_use()]` covers
    /// every announcement that can possibly be set.
    #[inline]
    fn workers_in_use(&self) -> usize {
        self.next_id.load(Ordering::Acquire).max(1)
    }

    fn lock_free_ids(&self) -> MutexGuard<'_, Vec<usize>> {
        self.free_ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn alloc_worker(&self) -> usize {
        if let Some(id) = self.lock_free_ids().pop() {
            return id;
        }
        // CAS loop: only bump the counter on success so it stays valid if
        // the assert below unwinds.
        loop {
            let current = self.next_id.load(Ordering::Relaxed);
            assert!(
                current < MAX_WORKERS,
                "sarc: exceeded maximum worker count ({MAX_WORKERS})"
            );
            match self.next_id.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current,
                Err(_) => continue,
            }
        }
    }

    /// Return a worker id to the free pool. All of the worker's handles
    /// and snapshots are gone by the time the owning thread exits, so the
    /// announcements can simply be cleared; pending retires stay on the
    /// record for the next adopter (or for [`drain_all`]).
    fn free_worker(&self, id: usize) {
        let record = &self.workers[id];
        record.primary.store(ptr::null_mut(), Ordering::Release);
        for slot in &record.snapshots {
            slot.store(ptr::null_mut(), Ordering::Release);
        }
        record.last_free.store(0, Ordering::Relaxed);

        // Best-effort drain before the id goes back to the pool.
        if !record.busy.load(Ordering::Relaxed) {
            record.busy.store(true, Ordering::Relaxed);
            while reclaim_pass(self, record) > 0 {}
            record.busy.store(false, Ordering::Relaxed);
        }

        self.lock_free_ids().push(id);
    }

    /// Snapshot every announcement into a duplicate-tolerant table.
    fn collect_announcements(&self) -> ScanTable {
        let in_use = self.workers_in_use();
        let mut table = ScanTable::with_capacity(in_use * (1 + SNAPSHOT_SLOTS));
        for record in &self.workers[..in_use] {
            let announced = record.primary.load(Ordering::SeqCst);
            if !announced.is_null() {
                table.insert(announced);
            }
            for slot in &record.snapshots {
                let announced = slot.load(Ordering::SeqCst);
                if !announced.is_null() {
                    table.insert(announced);
                }
            }
        }
        table
    }
}

/// Global singleton instance, built on first use and alive for the rest of
/// the process.
static ENGINE: OnceBox<Engine> = OnceBox::new();

#[inline]
fn engine() -> &'static Engine {
    ENGINE.get_or_init(|| Box::new(Engine::new()))
}

/// Thread-local worker handle: lazily bound worker id plus the
/// trampoline state for iterative destruction.
struct Handle {
    id: Cell<Option<usize>>,
    /// True while a destructor is running on this thread.
    destructing: Cell<bool>,
    /// Cells whose count reached zero from inside a destructor; drained
    /// iteratively by the outermost destruction loop.
    pending: UnsafeCell<Vec<*mut CellHeader>>,
}

impl Handle {
    const fn new() -> Self {
        Self {
            id: Cell::new(None),
            destructing: Cell::new(false),
            pending: UnsafeCell::new(Vec::new()),
        }
    }

    #[inline]
    fn worker_id(&self) -> usize {
        match self.id.get() {
            Some(id) => id,
            None => {
                let id = engine().alloc_worker();
                self.id.set(Some(id));
                id
            }
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            engine().free_worker(id);
        }
    }
}

thread_local! {
    static HANDLE: Handle = const { Handle::new() };
}

/// RAII wrapper around a primary announcement. Clears the announcement on
/// every exit path, including unwinding.
pub(crate) struct Reservation {
    slot: &'static AtomicPtr<CellHeader>,
}

impl Drop for Reservation {
    #[inline]
    fn drop(&mut self) {
        self.slot.store(ptr::null_mut(), Ordering::Release);
    }
}

/// A protected operation needs an announcement slot, and there is no way
/// to conjure one once the thread's reclamation handle is gone. Other
/// threads may still be reclaiming, so a bare load must never be dressed
/// up as a protected one; this is a contract violation, reported loudly.
#[cold]
fn announcement_slot_gone() -> ! {
    panic!(
        "sarc: protected operation on a thread whose reclamation state was \
         already torn down (e.g. from another thread_local destructor)"
    )
}

/// Double-collect a pointer out of `src` into the caller's primary
/// announcement: read, publish, re-read, retry until stable. Once this
/// returns, the pointer cannot be destroyed until the reservation drops.
///
/// Panics if the thread-local handle is already torn down; see
/// [`announcement_slot_gone`].
pub(crate) fn acquire(src: &AtomicPtr<CellHeader>) -> (*mut CellHeader, Reservation) {
    let slot = match HANDLE.try_with(|handle| &engine().workers[handle.worker_id()].primary) {
        Ok(slot) => slot,
        Err(_) => announcement_slot_gone(),
    };
    loop {
        let observed = src.load(Ordering::SeqCst);
        slot.store(observed, Ordering::SeqCst);
        if src.load(Ordering::SeqCst) == observed {
            return (observed, Reservation { slot });
        }
    }
}

/// Publish `ptr` in the caller's primary announcement without a
/// double-collect. The caller must already hold an independent reference
/// to `ptr`, so the cell cannot be destroyed before the announcement is
/// visible.
///
/// Panics if the thread-local handle is already torn down; see
/// [`announcement_slot_gone`].
pub(crate) fn reserve(ptr: *mut CellHeader) -> Reservation {
    match HANDLE.try_with(|handle| {
        let slot = &engine().workers[handle.worker_id()].primary;
        slot.store(ptr, Ordering::SeqCst);
        Reservation { slot }
    }) {
        Ok(reservation) => reservation,
        Err(_) => announcement_slot_gone(),
    }
}

/// Double-collect a pointer out of `src` into one of the caller's snapshot
/// announcements, which stays set until the returned slot is cleared by
/// `Snapshot::drop`.
///
/// Slot choice: an empty slot if one exists, otherwise the round-robin
/// victim. Evicting a victim promotes its incumbent from
/// announcement protection to a counted reference *before* the overwrite,
/// so snapshots still naming that slot silently convert to conventional
/// ref-counted ownership.
///
/// Returns a null slot pointer when the observed value is null (nothing to
/// protect). Panics if the thread-local handle is already torn down; see
/// [`announcement_slot_gone`].
pub(crate) fn protect_snapshot(
    src: &AtomicPtr<CellHeader>,
) -> (*mut CellHeader, *const AtomicPtr<CellHeader>) {
    let protected = HANDLE.try_with(|handle| {
        let record = &engine().workers[handle.worker_id()];
        let slot = match record
            .snapshots
            .iter()
            .find(|slot| slot.load(Ordering::Relaxed).is_null())
        {
            Some(slot) => slot,
            None => {
                let index = record.last_free.load(Ordering::Relaxed);
                let slot = &record.snapshots[index];
                let incumbent = slot.load(Ordering::Relaxed);
                // SAFETY: the incumbent is still announced in our own
                // slot, so it cannot have been destroyed. The increment
                // is ordered before the overwrite below by the SeqCst
                // store.
                unsafe { acquire_ref(incumbent) };
                record
                    .last_free
                    .store((index + 1) % SNAPSHOT_SLOTS, Ordering::Relaxed);
                slot
            }
        };
        loop {
            let observed = src.load(Ordering::SeqCst);
            slot.store(observed, Ordering::SeqCst);
            if src.load(Ordering::SeqCst) == observed {
                if observed.is_null() {
                    // The slot ended up cleared; nothing to hand back.
                    break (observed, ptr::null());
                }
                break (observed, slot as *const AtomicPtr<CellHeader>);
            }
        }
    });
    match protected {
        Ok(result) => result,
        Err(_) => announcement_slot_gone(),
    }
}

/// Append `ptr` to the caller's retire list and opportunistically run a
/// reclamation pass. Ownership of one reference transfers to the list; the
/// eventual deleter drops it.
pub(crate) fn retire(ptr: *mut CellHeader) {
    debug_assert!(!ptr.is_null());
    // When this thread's handle is already gone the push is skipped and
    // the cell leaks. Unlike a read, a leak is always safe, and it only
    // happens for cells released from inside thread-exit destructors.
    let _ = HANDLE.try_with(|handle| {
        let engine = engine();
        let id = handle.worker_id();
        let record = &engine.workers[id];
        // SAFETY: the retire list is only touched by its owning thread.
        unsafe { (*record.retired.get()).push(ptr) };
        try_reclaim(engine, id);
    });
}

/// Run reclamation if this worker has crossed the batching threshold and
/// is not already reclaiming.
fn try_reclaim(engine: &Engine, id: usize) {
    let record = &engine.workers[id];
    if record.busy.load(Ordering::Relaxed) {
        return;
    }
    let threshold = RETIRE_DELAY * engine.workers_in_use();
    // SAFETY: owner-only list access.
    if unsafe { (*record.retired.get()).len() } < threshold {
        return;
    }
    record.busy.store(true, Ordering::Relaxed);
    reclaim_pass(engine, record);
    record.busy.store(false, Ordering::Relaxed);
}

/// One reclamation pass over `record`'s retire list: snapshot all
/// announcements, keep every retired pointer that still has an
/// unconsumed announcement, and run the deleter on the rest. Returns the
/// number of deleters run.
///
/// The caller must have set `record.busy`.
fn reclaim_pass(engine: &Engine, record: &WorkerRecord) -> usize {
    // SAFETY: owner-only list access (or drain/teardown contract).
    let batch = unsafe { mem::take(&mut *record.retired.get()) };
    if batch.is_empty() {
        return 0;
    }
    let mut announced = engine.collect_announcements();
    let mut doomed = Vec::with_capacity(batch.len());
    for cell in batch {
        if announced.consume(cell) {
            // Still protected: one announcement absorbs one retire.
            // SAFETY: as above; the borrow does not overlap a deleter.
            unsafe { (*record.retired.get()).push(cell) };
        } else {
            doomed.push(cell);
        }
    }
    let destroyed = doomed.len();
    // Deleters run with the list borrow released: a destructor may
    // re-enter `retire` and push onto this same list. `busy` keeps it
    // from re-entering reclamation itself.
    for cell in doomed {
        // SAFETY: the list owned one reference per entry, and this pass
        // confirmed no announcement names the cell.
        unsafe { release_retired(cell) };
    }
    destroyed
}

/// Force reclamation of the calling thread's retire list, ignoring the
/// batching threshold.
///
/// Announcements are still honored: cells that remain announced stay
/// pending. The pass loops while it makes progress, because a destructor
/// may retire further cells. Called automatically when an
/// [`AtomicStrong`](crate::AtomicStrong) is dropped, so single-threaded
/// workloads quiesce without manual calls; other threads' lists are not
/// touched.
pub fn flush() {
    let _ = HANDLE.try_with(|handle| {
        let Some(id) = handle.id.get() else {
            return;
        };
        let engine = engine();
        let record = &engine.workers[id];
        if record.busy.load(Ordering::Relaxed) {
            return;
        }
        record.busy.store(true, Ordering::Relaxed);
        while reclaim_pass(engine, record) > 0 {}
        record.busy.store(false, Ordering::Relaxed);
    });
}

/// Drain every worker's retire list to quiescence, running each pending
/// deleter exactly once per retire and looping until no list holds
/// anything (deleters may enqueue more retires on any worker).
///
/// This is the engine's teardown operation. All busy flags are held for
/// the duration so no deleter can re-enter reclamation.
///
/// # Safety
///
/// Strictly single-threaded: no other thread may perform any operation on
/// any atomic handle concurrently, and no live `Snapshot` or in-flight
/// operation may exist on any thread. Announcements are deliberately
/// ignored.
pub unsafe fn drain_all() {
    let engine = engine();
    for record in engine.workers.iter() {
        record.busy.store(true, Ordering::Relaxed);
    }
    loop {
        let mut batch: Vec<*mut CellHeader> = Vec::new();
        for record in &engine.workers[..engine.workers_in_use()] {
            // SAFETY: single-threaded by contract.
            batch.append(unsafe { &mut *record.retired.get() });
        }
        if batch.is_empty() {
            break;
        }
        for cell in batch {
            // SAFETY: each list entry owned one reference, and the
            // single-threaded contract rules out live announcements.
            unsafe { release_retired(cell) };
        }
    }
    for record in engine.workers.iter() {
        record.busy.store(false, Ordering::Relaxed);
    }
}

/// Add one reference to a cell.
///
/// # Safety
///
/// `ptr` must point to a live cell that the caller is protecting, either
/// through an owned reference or an announcement.
#[inline]
pub(crate) unsafe fn acquire_ref(ptr: *mut CellHeader) {
    unsafe { (*ptr).add_refs(1) };
}

/// Drop one owned reference to a cell.
///
/// On the `1 -> 0` transition, an unpublished cell (never installed in an
/// atomic slot, hence never announceable) is destroyed on the spot. A
/// published cell might still be named by another thread's announcement —
/// a snapshot, or a read between its double-collect confirmation and its
/// increment — so its final release is deferred: the reference is
/// resurrected and the cell retired, leaving the actual destruction to a
/// reclamation pass that has verified no announcement remains.
///
/// # Safety
///
/// The caller must own the reference being released.
pub(crate) unsafe fn release_ref(ptr: *mut CellHeader) {
    if unsafe { (*ptr).release_refs(1) } == 1 {
        // Pair with the Release decrements of every other owner before
        // touching the cell.
        fence(Ordering::Acquire);
        if unsafe { (*ptr).is_published() } {
            unsafe { (*ptr).add_refs(1) };
            retire(ptr);
        } else {
            unsafe { destroy(ptr) };
        }
    }
}

/// Drop the reference owned by a retire-list entry. The `1 -> 0`
/// transition destroys directly: a retired cell whose count reaches one
/// is held by nothing but the list itself, so it sits in no slot, no new
/// announcement of it can be confirmed, and the pass that doomed it saw
/// none outstanding.
///
/// # Safety
///
/// `ptr` must come off a retire list whose reclamation pass (or the
/// `drain_all` contract) established that no announcement names it.
unsafe fn release_retired(ptr: *mut CellHeader) {
    if unsafe { (*ptr).release_refs(1) } == 1 {
        fence(Ordering::Acquire);
        unsafe { destroy(ptr) };
    }
}

/// Destroy a cell without synchronous recursion. A `1 -> 0` transition
/// reached from inside another destructor is queued on the thread's
/// pending list and drained by the outermost destruction loop, so tearing
/// down arbitrarily deep ownership chains uses constant stack.
unsafe fn destroy(ptr: *mut CellHeader) {
    let done = HANDLE.try_with(|handle| {
        if handle.destructing.get() {
            // SAFETY: the pending list is thread-local; the borrow is
            // released before any destructor runs.
            unsafe { (*handle.pending.get()).push(ptr) };
            return;
        }
        handle.destructing.set(true);
        // SAFETY: the count reached zero; we are the sole owner.
        unsafe { CellHeader::invoke_drop(ptr) };
        loop {
            // Re-borrow per iteration: the destructor below may push.
            let next = unsafe { (*handle.pending.get()).pop() };
            match next {
                // SAFETY: queued cells also hit zero and belong to us.
                Some(cell) => unsafe { CellHeader::invoke_drop(cell) },
                None => break,
            }
        }
        handle.destructing.set(false);
    });
    if done.is_err() {
        // This thread's handle is gone, so the trampoline is unavailable;
        // destroy inline. Sound (the cell already passed the 1 -> 0 and
        // announcement checks), but nested drops recurse here, so very
        // deep chains should not be released from thread-exit destructors.
        unsafe { CellHeader::invoke_drop(ptr) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_ids_are_distinct_and_below_watermark() {
        // Other test threads allocate ids concurrently, so only invariants
        // that hold regardless of interleaving are asserted here.
        let engine = engine();
        let a = engine.alloc_worker();
        let b = engine.alloc_worker();
        assert_ne!(a, b);
        assert!(a < engine.workers_in_use());
        assert!(b < engine.workers_in_use());
        engine.free_worker(a);
        engine.free_worker(b);
        // The watermark never shrinks: freed ids stay scannable.
        assert!(a < engine.workers_in_use());
        assert!(b < engine.workers_in_use());
    }
}
