//! # brkheap - A POSIX Program-Break Heap Allocator
//!
//! This crate implements a general-purpose heap allocator on top of the
//! `sbrk`/`brk` program-break primitives, in two flavors: a single-threaded
//! best-fit allocator ([`SingleHeap`]) and a multi-threaded, sharded
//! variant ([`MtHeap`]).
//!
//! ## Overview
//!
//! ```text
//!   Program Memory Layout:
//!
//!   High Address ┌─────────────────────┐
//!                │       Stack         │ ↓ grows down
//!                │         │           │
//!                │         ▼           │
//!                │                     │
//!                │         ▲           │
//!                │         │           │
//!                │       Heap          │ ↑ grows up (sbrk)
//!                ├─────────────────────┤ ← Program Break
//!                │   Uninitialized     │
//!                │       Data          │
//!                ├─────────────────────┤
//!                │   Initialized       │
//!                │       Data          │
//!                ├─────────────────────┤
//!                │       Text          │
//!   Low Address  └─────────────────────┘
//! ```
//!
//! Every allocation carries a header in front of its payload:
//!
//! ```text
//!   Single Allocation:
//!   ┌───────────────────────┬────────────────────────────────┐
//!   │    Block Header       │         User Data              │
//!   │  ┌─────────────────┐  │                                │
//!   │  │ size: N         │  │  ┌──────────────────────────┐  │
//!   │  │ is_free: bool   │  │  │                          │  │
//!   │  │ next/prev: ptr  │  │  │     N bytes usable       │  │
//!   │  └─────────────────┘  │  │                          │  │
//!   └───────────────────────┴────────────────────────────────┘
//!                           ▲
//!                           └── Pointer returned to the caller
//! ```
//!
//! `next`/`prev` link blocks in *address order*, not free-list order — the
//! same list is walked for best-fit search, coalescing, and tail-trimming.
//!
//! ## Crate Structure
//!
//! ```text
//!   brkheap
//!   ├── align        - The size-class rounding rule
//!   ├── heap         - Thin sbrk/brk wrapper; the only module touching the OS
//!   ├── diagnostics  - The five stderr messages + debug print helper
//!   ├── block        - Single-threaded block header
//!   ├── single        - SingleHeap: Part A, one address-ordered block list
//!   ├── area         - Multi-threaded block header + MemArea
//!   └── mt           - MtHeap: Part B, a sharded registry of MemAreas
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use brkheap::SingleHeap;
//!
//! let mut heap = SingleHeap::new();
//! let p = heap.allocate(64);
//! heap.free(p);
//! ```
//!
//! ## Choosing a variant
//!
//! [`SingleHeap`] assumes a single thread drives all its operations — it
//! deliberately has no `Send`/`Sync` impl, so the compiler itself rejects
//! attempts to share one across threads. [`MtHeap`] is built to be shared:
//! every operation takes `&self`, synchronizing internally by sharding the
//! heap into independently-locked areas.
//!
//! ## Safety
//!
//! This crate manages raw memory directly; most of its internals are
//! `unsafe`. The public API (`allocate`/`free`/`calloc`/`resize`) is safe
//! to call, but misuse that the allocator cannot detect (double free,
//! use-after-free, passing a pointer that didn't come from this heap and
//! happens to look plausible) remains undefined behavior, exactly as with
//! any `malloc`-family API.

pub mod align;
pub mod area;
pub mod block;
pub mod diagnostics;
pub mod heap;
pub mod mt;
pub mod single;

pub use mt::MtHeap;
pub use single::SingleHeap;

/// Shared test-only synchronization: `sbrk`/`brk` are process-global, so
/// two heap tests running concurrently under the default parallel test
/// harness could corrupt each other's break bookkeeping. Every test that
/// touches a real heap acquires this lock first, forcing them to run one
/// at a time regardless of harness parallelism.
#[cfg(test)]
pub(crate) mod test_support {
  pub static HEAP_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
}
