//! sarc: lock-free atomic reference-counted pointers with snapshot reads.
//!
//! A [`Strong<T>`] is a shared-ownership handle like `Arc`. An
//! [`AtomicStrong<T>`] is a lock-free slot that many threads can load,
//! store, exchange, and compare-and-swap concurrently, without a reader
//! ever touching freed memory. Safety comes from an acquire-retire scheme:
//! readers publish the pointer they are about to use in a per-thread
//! announcement, and writers defer destruction of displaced cells until no
//! announcement names them.
//!
//! # Key Features
//!
//! - **Lock-free handle store**: load / store / exchange / CAS on shared
//!   handles, linearizable at a single atomic instruction
//! - **Snapshot reads**: [`Snapshot`] pins a value through an announcement
//!   slot instead of the reference count — no atomic read-modify-write on
//!   the read path
//! - **Bounded deferral**: each thread holds at most `delay x workers`
//!   pending destructions; reclamation cost is amortized onto writers
//! - **Iterative teardown**: destroying deep ownership chains (lists,
//!   trees) never recurses, so no stack overflow
//!
//! # Example
//!
//! ```rust
//! use sarc::{make_shared, AtomicStrong};
//!
//! let slot = AtomicStrong::new(make_shared(String::from("Hello, World")));
//!
//! // Shared read: takes a counted reference under announcement protection.
//! let value = slot.load();
//! assert_eq!(*value, "Hello, World");
//! assert_eq!(value.use_count(), 2);
//!
//! // Snapshot read: no reference-count traffic at all. The snapshot stays
//! // valid even after the slot moves on.
//! let snap = slot.get_snapshot();
//! slot.store(make_shared(String::from("replacement")));
//! assert_eq!(*snap, "Hello, World");
//! ```

#![warn(missing_docs)]

extern crate alloc;

mod atomic;
mod counted;
mod engine;
mod snapshot;
mod strong;
mod table;

pub use atomic::{AtomicStrong, SharedPtr};
pub use engine::{drain_all, flush};
pub use snapshot::Snapshot;
pub use strong::{make_shared, Strong};
