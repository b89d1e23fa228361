//! End-to-end scenario: a Treiber stack built on `AtomicStrong` and
//! snapshots, plus CAS linearizability under contention.
//!
//! Thread counts stay small (the harness runs tests in parallel) while
//! iteration counts stay high, mirroring a bounded pool doing many ops.

use sarc::{make_shared, AtomicStrong, Strong};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

// ============================================================================
// The stack
// ============================================================================

struct Node {
    value: u64,
    next: Strong<Node>,
}

struct Stack {
    head: AtomicStrong<Node>,
}

impl Stack {
    fn new() -> Self {
        Self {
            head: AtomicStrong::null(),
        }
    }

    fn push(&self, value: u64) {
        let mut current = self.head.load();
        loop {
            let node = make_shared(Node {
                value,
                next: current.clone(),
            });
            match self.head.compare_exchange(&current, node) {
                Ok(()) => return,
                Err(_rejected) => current = self.head.load(),
            }
        }
    }

    fn pop(&self) -> Option<u64> {
        let mut snap = self.head.get_snapshot();
        loop {
            if snap.is_null() {
                return None;
            }
            let value = snap.value;
            // The copy-variant CAS only bumps `next`'s count on success.
            if self.head.compare_and_swap(&snap, &snap.next) {
                return Some(value);
            }
            snap = self.head.get_snapshot();
        }
    }

    fn peek(&self) -> Option<u64> {
        let snap = self.head.get_snapshot();
        snap.get().map(|node| node.value)
    }

    /// Walk the list under a single snapshot. Holding the head snapshot
    /// pins the whole chain: every node owns its successor, so nothing
    /// past the head can be destroyed while the snapshot lives.
    fn find(&self, needle: u64) -> bool {
        let snap = self.head.get_snapshot();
        let mut node = snap.get();
        while let Some(current) = node {
            if current.value == needle {
                return true;
            }
            node = current.next.get();
        }
        false
    }
}

// ============================================================================
// Single-threaded behavior
// ============================================================================

#[test]
fn push_pop_lifo_order() {
    let stack = Stack::new();
    for i in 0..100 {
        stack.push(i);
    }
    assert_eq!(stack.peek(), Some(99));
    for i in (0..100).rev() {
        assert_eq!(stack.pop(), Some(i));
    }
    assert_eq!(stack.pop(), None);
    assert_eq!(stack.peek(), None);
}

#[test]
#[cfg_attr(miri, ignore)]
fn find_sees_pushed_values() {
    let stack = Stack::new();
    for i in 0..1000 {
        stack.push(2 * i);
    }
    for i in 0..1000 {
        assert!(stack.find(2 * i));
        assert!(!stack.find(2 * i + 1));
    }
}

// ============================================================================
// Concurrent scenarios
// ============================================================================

#[test]
#[cfg_attr(miri, ignore)]
fn concurrent_push_then_pop_preserves_multiset() {
    const THREADS: u64 = 4;
    const PER_THREAD: u64 = 1000;

    let stack = Arc::new(Stack::new());
    let mut handles = Vec::new();

    for tid in 0..THREADS {
        let stack = stack.clone();
        handles.push(thread::spawn(move || {
            let mut popped = Vec::with_capacity(PER_THREAD as usize);
            for i in 0..PER_THREAD {
                stack.push(tid * PER_THREAD + i);
            }
            for _ in 0..PER_THREAD {
                // The stack may be momentarily empty while other threads
                // race; every pushed value is eventually popped by someone.
                loop {
                    if let Some(value) = stack.pop() {
                        popped.push(value);
                        break;
                    }
                    thread::yield_now();
                }
            }
            popped
        }));
    }

    let mut counts: HashMap<u64, usize> = HashMap::new();
    for handle in handles {
        for value in handle.join().unwrap() {
            *counts.entry(value).or_insert(0) += 1;
        }
    }

    assert_eq!(counts.len() as u64, THREADS * PER_THREAD);
    for value in 0..THREADS * PER_THREAD {
        assert_eq!(counts.get(&value), Some(&1), "value {value} popped wrong");
    }
    assert_eq!(stack.pop(), None);
}

#[test]
#[cfg_attr(miri, ignore)]
fn concurrent_find_push_pop() {
    const THREADS: usize = 4;
    const OPS: u64 = 2000;

    let stack = Arc::new(Stack::new());
    for i in 0..OPS {
        stack.push(2 * i);
    }

    let mut handles = Vec::new();
    for tid in 0..THREADS {
        let stack = stack.clone();
        handles.push(thread::spawn(move || {
            for i in 0..OPS {
                if tid % 2 == 0 {
                    // Even-valued entries were pushed; odd ones never are.
                    let _ = stack.find(2 * i + 1);
                    stack.push(2 * (OPS + i));
                } else {
                    let _ = stack.pop();
                    let _ = stack.peek();
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

// ============================================================================
// CAS linearizability under contention
// ============================================================================

struct Versioned {
    version: u64,
}

#[test]
#[cfg_attr(miri, ignore)]
fn contended_cas_success_count_matches_installs() {
    const THREADS: usize = 4;
    const ATTEMPTS: usize = 5000;

    let slot = Arc::new(AtomicStrong::new(make_shared(Versioned { version: 0 })));
    let successes = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for _ in 0..THREADS {
        let slot = slot.clone();
        let successes = successes.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..ATTEMPTS {
                let current = slot.load();
                let next = make_shared(Versioned {
                    version: current.version + 1,
                });
                if slot.compare_and_swap(&current, &next) {
                    successes.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // Each successful CAS observed the version it replaced, so the final
    // version counts the successes exactly: no lost or duplicated install.
    let final_version = slot.load().version;
    assert_eq!(final_version, successes.load(Ordering::SeqCst) as u64);
}
