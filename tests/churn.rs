//! Whole-process accounting under concurrent churn.
//!
//! This binary holds a single test so that the final `drain_all` call — a
//! strictly single-threaded teardown operation — cannot race another test
//! in the same process.

use sarc::{make_shared, AtomicStrong};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

struct Payload {
    tag: u64,
    check: u64,
    drops: Arc<AtomicUsize>,
}

impl Payload {
    fn new(tag: u64, drops: &Arc<AtomicUsize>) -> Self {
        Self {
            tag,
            check: tag.wrapping_mul(0x9e37_79b9_7f4a_7c15),
            drops: drops.clone(),
        }
    }
}

impl Drop for Payload {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn concurrent_churn_frees_every_cell_exactly_once() {
    const WRITERS: u64 = 4;
    const READERS: usize = 4;
    const STORES_PER_WRITER: u64 = 10_000;

    let drops = Arc::new(AtomicUsize::new(0));
    let created = Arc::new(AtomicUsize::new(0));
    let slot = Arc::new(AtomicStrong::new(make_shared(Payload::new(0, &drops))));
    created.fetch_add(1, Ordering::SeqCst);

    let mut handles = Vec::new();

    // Writers hammer the slot with fresh cells.
    for tid in 0..WRITERS {
        let slot = slot.clone();
        let drops = drops.clone();
        let created = created.clone();
        handles.push(thread::spawn(move || {
            for i in 0..STORES_PER_WRITER {
                let tag = tid * STORES_PER_WRITER + i + 1;
                slot.store(make_shared(Payload::new(tag, &drops)));
                created.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }

    // Readers continuously validate that what they dereference is a live,
    // internally consistent payload — a freed cell would fail the check
    // (and scream under a sanitizer).
    for r in 0..READERS {
        let slot = slot.clone();
        handles.push(thread::spawn(move || {
            for i in 0..40_000usize {
                if (i + r) % 2 == 0 {
                    let value = slot.load();
                    let payload = value.get().unwrap();
                    assert_eq!(payload.check, payload.tag.wrapping_mul(0x9e37_79b9_7f4a_7c15));
                } else {
                    let snap = slot.get_snapshot();
                    let payload = snap.get().unwrap();
                    assert_eq!(payload.check, payload.tag.wrapping_mul(0x9e37_79b9_7f4a_7c15));
                }
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }

    let total = created.load(Ordering::SeqCst);
    assert_eq!(total as u64, WRITERS * STORES_PER_WRITER + 1);

    // Everything except the slot's final cell is either destroyed already
    // or parked on some worker's retire list. All thread clones of the Arc
    // died on join, so this drop tears down the slot itself.
    drop(slot);

    // All threads are joined and no handle or snapshot is live, so the
    // single-threaded teardown contract holds.
    unsafe { sarc::drain_all() };

    assert_eq!(drops.load(Ordering::SeqCst), total);
}
