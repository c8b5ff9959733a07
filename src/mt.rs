//! The multi-threaded, sharded allocator: Part B of the interface.
//!
//! `MtHeap` owns the head of a singly-linked registry of [`MemArea`]s,
//! appended to (never removed from) as demand grows past the
//! eagerly-created set. Each area is independently locked; a global lock
//! serializes only the rare act of appending a new area, and is never
//! held at the same time as an area lock.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::align::align;
use crate::area::{MemArea, MtBlock, AREA_SIZE, NUM_AREAS};
use crate::diagnostics;
use crate::heap::{self, ExtendError};

const MIN_SPLIT_TAIL: usize = 4;

/// The multi-threaded heap handle. Cheaply shared as `&MtHeap` across
/// threads — every method that touches block memory takes `&self`.
pub struct MtHeap {
  head: AtomicPtr<MemArea>,
  global_lock: Mutex<()>,
  area_count: AtomicUsize,
  cursor: AtomicUsize,
  area_size: usize,
  initial_break: Option<*mut u8>,
}

// SAFETY: `head` only ever transitions null -> non-null, and from then
// on areas are appended past the tail, never replaced — every store uses
// Release and every load Acquire, and every area reachable from it
// guards its own mutable state with its own lock. The registry's append
// point (including the null -> non-null transition) is serialized by
// `global_lock`.
unsafe impl Send for MtHeap {}
unsafe impl Sync for MtHeap {}

impl Default for MtHeap {
  fn default() -> Self {
    Self::new()
  }
}

impl MtHeap {
  /// Eagerly creates [`NUM_AREAS`] areas of [`AREA_SIZE`] bytes each.
  pub fn new() -> Self {
    Self::with_config(AREA_SIZE, NUM_AREAS)
  }

  /// Same as [`MtHeap::new`], but with the area size and area count
  /// overridden. Exists so tests can exercise area-boundary behavior
  /// (the one-area-at-a-time cap, area growth) without provisioning
  /// thousands of real bytes from the OS.
  ///
  /// A non-fatal `sbrk` failure partway through eager provisioning stops
  /// the loop early rather than tearing the whole heap down: the handle
  /// is returned with however many areas were actually created (possibly
  /// zero), and the first `allocate` call that finds no room falls
  /// through to `grow_and_allocate`, which retries area creation on
  /// demand. Only an out-of-memory failure is fatal here; any other
  /// extension failure is recoverable.
  pub fn with_config(area_size: usize, num_areas: usize) -> Self {
    assert!(area_size > MtBlock::HEADER_SIZE, "area_size must exceed the block header size");

    let snapshot = heap::snapshot();
    let mut head: *mut MemArea = ptr::null_mut();
    let mut tail: *mut MemArea = ptr::null_mut();
    let mut created = 0usize;

    for _ in 0..num_areas {
      let area = match MemArea::new(area_size) {
        Ok(area) => Box::into_raw(area),
        Err(ExtendError::OutOfMemory) => {
          heap::restore(snapshot);
          diagnostics::out_of_memory_fatal();
        }
        Err(ExtendError::Other) => break,
      };
      if tail.is_null() {
        head = area;
      } else {
        unsafe {
          (*tail).next.store(area, Ordering::Release);
        }
      }
      tail = area;
      created += 1;
    }

    Self {
      head: AtomicPtr::new(head),
      global_lock: Mutex::new(()),
      area_count: AtomicUsize::new(created),
      cursor: AtomicUsize::new(0),
      area_size,
      initial_break: Some(snapshot),
    }
  }

  /// Consumes the heap: destroys every area's lock and restores the
  /// program break captured when the areas were created.
  pub fn kill(self) {}

  /// `mt_malloc(size) -> address | null`.
  pub fn allocate(&self, size: usize) -> *mut u8 {
    if size == 0 {
      return ptr::null_mut();
    }
    let s = align(size);
    if s > self.area_size - MtBlock::HEADER_SIZE {
      return ptr::null_mut();
    }

    let total = self.area_count.load(Ordering::Acquire).max(1);
    let start = self.cursor.load(Ordering::Relaxed) % total;
    let mut area = self.nth_area(start);

    let mut visited = 0;
    while visited < total {
      if area.is_null() {
        area = self.head.load(Ordering::Acquire);
        if area.is_null() {
          break;
        }
      }
      if let Some(payload) = self.try_allocate_in_area(area, s) {
        self.cursor.fetch_add(1, Ordering::Relaxed);
        return payload;
      }
      area = unsafe { (*area).next.load(Ordering::Acquire) };
      visited += 1;
    }

    self.grow_and_allocate(s)
  }

  /// `mt_free(ptr)`. Trusts the block's own lock back-pointer
  /// to find the owning area, as the header-based design intends; a
  /// pointer whose claimed lock does not match any area we manage is
  /// diagnosed as non-heap rather than dereferenced further.
  pub fn free(&self, ptr: *mut u8) {
    if ptr.is_null() {
      diagnostics::free_null_pointer();
      return;
    }
    let block = unsafe { MtBlock::from_payload(ptr) };
    let claimed_lock = unsafe { (*block).lock };
    let Some(area) = self.find_area_by_lock(claimed_lock) else {
      diagnostics::free_non_heap_pointer();
      return;
    };
    let area_ref = unsafe { &*area };
    let _guard = area_ref.lock.lock().unwrap();
    unsafe {
      (*block).is_free = true;
      mt_coalesce(block);
    }
  }

  /// `mt_calloc(nmemb, size)`.
  pub fn calloc(&self, nmemb: usize, size: usize) -> *mut u8 {
    let Some(total) = nmemb.checked_mul(size) else {
      return ptr::null_mut();
    };
    let ptr = self.allocate(total);
    if !ptr.is_null() {
      unsafe {
        ptr::write_bytes(ptr, 0, total);
      }
    }
    ptr
  }

  /// `mt_realloc(ptr, new_size)`. Backward absorption into a
  /// free predecessor is not attempted here: the predecessor's lock is
  /// the same area lock already held, but a predecessor merge would move
  /// the payload under a lock the caller didn't ask to hold across the
  /// copy, so this falls straight through to allocate-copy-free instead.
  pub fn resize(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
    if ptr.is_null() {
      return self.allocate(new_size);
    }
    if new_size == 0 {
      self.free(ptr);
      return ptr::null_mut();
    }

    let block = unsafe { MtBlock::from_payload(ptr) };
    let claimed_lock = unsafe { (*block).lock };
    let Some(area) = self.find_area_by_lock(claimed_lock) else {
      diagnostics::realloc_non_heap_pointer();
      return ptr::null_mut();
    };
    let s_new = align(new_size);

    enum Outcome {
      Done(*mut u8),
      Relocate(usize),
    }

    let outcome = {
      let area_ref = unsafe { &*area };
      let _guard = area_ref.lock.lock().unwrap();
      let s_old = unsafe { (*block).size };

      if s_new <= s_old {
        unsafe {
          mt_split_tail(area, block, s_new);
        }
        Outcome::Done(ptr)
      } else {
        let next = unsafe { (*block).next };
        if !next.is_null() && unsafe { (*next).is_free } && unsafe { (*block).size + MtBlock::HEADER_SIZE + (*next).size } >= s_new {
          unsafe {
            (*block).size += MtBlock::HEADER_SIZE + (*next).size;
            (*block).next = (*next).next;
            if !(*next).next.is_null() {
              (*(*next).next).prev = block;
            }
            mt_split_tail(area, block, s_new);
          }
          Outcome::Done(ptr)
        } else {
          Outcome::Relocate(s_old)
        }
      }
    };

    match outcome {
      Outcome::Done(p) => p,
      Outcome::Relocate(s_old) => {
        let new_ptr = self.allocate(new_size);
        if new_ptr.is_null() {
          return ptr::null_mut();
        }
        unsafe {
          ptr::copy_nonoverlapping(ptr, new_ptr, s_old);
        }
        self.free(ptr);
        new_ptr
      }
    }
  }

  fn nth_area(&self, idx: usize) -> *mut MemArea {
    let head = self.head.load(Ordering::Acquire);
    let mut area = head;
    for _ in 0..idx {
      if area.is_null() {
        return head;
      }
      area = unsafe { (*area).next.load(Ordering::Acquire) };
    }
    area
  }

  fn find_area_by_lock(&self, lock_ptr: *const Mutex<()>) -> Option<*mut MemArea> {
    if lock_ptr.is_null() {
      return None;
    }
    let mut area = self.head.load(Ordering::Acquire);
    while !area.is_null() {
      let area_ref = unsafe { &*area };
      if (&area_ref.lock as *const Mutex<()>) == lock_ptr {
        return Some(area);
      }
      area = area_ref.next.load(Ordering::Acquire);
    }
    None
  }

  fn try_allocate_in_area(&self, area: *mut MemArea, target: usize) -> Option<*mut u8> {
    let area_ref = unsafe { &*area };
    let _guard = area_ref.lock.lock().unwrap();
    let candidate = unsafe { mt_best_fit(area_ref.block_list, target) };
    if candidate.is_null() {
      return None;
    }
    unsafe {
      mt_split_and_use(area, candidate, target);
    }
    Some(MtBlock::payload(candidate))
  }

  /// One full pass over the registry found no room: append a fresh area
  /// under the global lock, then satisfy the request from it. The global
  /// lock is released before taking the new area's lock — the two are
  /// never held together.
  fn grow_and_allocate(&self, target: usize) -> *mut u8 {
    let guard = self.global_lock.lock().unwrap();

    let new_area = match MemArea::new(self.area_size) {
      Ok(area) => Box::into_raw(area),
      Err(ExtendError::OutOfMemory) => {
        if let Some(snapshot) = self.initial_break {
          heap::restore(snapshot);
        }
        diagnostics::out_of_memory_fatal();
      }
      Err(ExtendError::Other) => return ptr::null_mut(),
    };

    let head = self.head.load(Ordering::Acquire);
    if head.is_null() {
      self.head.store(new_area, Ordering::Release);
    } else {
      let mut tail = head;
      loop {
        let next = unsafe { (*tail).next.load(Ordering::Acquire) };
        if next.is_null() {
          break;
        }
        tail = next;
      }
      unsafe {
        (*tail).next.store(new_area, Ordering::Release);
      }
    }
    self.area_count.fetch_add(1, Ordering::Release);
    drop(guard);

    self.try_allocate_in_area(new_area, target).unwrap_or(ptr::null_mut())
  }
}

/// Best-fit search within one area's block list. Identical algorithm to
/// the single-threaded search; duplicated rather than shared because the
/// header types differ.
unsafe fn mt_best_fit(head: *mut MtBlock, target: usize) -> *mut MtBlock {
  let mut current = head;
  let mut best: *mut MtBlock = ptr::null_mut();
  while !current.is_null() {
    let blk = unsafe { &*current };
    if blk.is_free {
      if blk.size == target {
        return current;
      }
      if blk.size > target && (best.is_null() || blk.size < unsafe { (*best).size }) {
        best = current;
      }
    }
    current = blk.next;
  }
  best
}

/// Splits off a free remainder if it is worth keeping, stamping the new
/// block with the same area lock back-pointer as its neighbor.
unsafe fn mt_split_tail_free(area: *mut MemArea, block: *mut MtBlock, target: usize) {
  let old_size = unsafe { (*block).size };
  let remainder = old_size - target - MtBlock::HEADER_SIZE;
  let new_addr = unsafe { (block as *mut u8).add(MtBlock::HEADER_SIZE + target) };
  let old_next = unsafe { (*block).next };
  let lock_ptr: *const Mutex<()> = unsafe { &(*area).lock };
  let new_block = unsafe { MtBlock::init(new_addr, remainder, true, block, old_next, lock_ptr) };
  if !old_next.is_null() {
    unsafe {
      (*old_next).prev = new_block;
    }
  }
  unsafe {
    (*block).next = new_block;
    (*block).size = target;
  }
}

unsafe fn mt_split_and_use(area: *mut MemArea, candidate: *mut MtBlock, target: usize) {
  let old_size = unsafe { (*candidate).size };
  if old_size >= target + MtBlock::HEADER_SIZE + MIN_SPLIT_TAIL {
    unsafe {
      mt_split_tail_free(area, candidate, target);
    }
  }
  unsafe {
    (*candidate).is_free = false;
  }
}

/// Used by `resize`'s shrink path and by the post-absorption trim. Unlike
/// the single-threaded variant there is no tail-trim to the OS: area
/// memory is only ever returned at `MtHeap` teardown.
unsafe fn mt_split_tail(area: *mut MemArea, block: *mut MtBlock, target: usize) {
  let old_size = unsafe { (*block).size };
  if old_size < target + MtBlock::HEADER_SIZE + MIN_SPLIT_TAIL {
    return;
  }
  unsafe {
    mt_split_tail_free(area, block, target);
  }
  let new_block = unsafe { (*block).next };
  unsafe {
    mt_coalesce(new_block);
  }
}

/// Merges `block` with a free predecessor and/or a free successor.
unsafe fn mt_coalesce(mut block: *mut MtBlock) -> *mut MtBlock {
  unsafe {
    let prev = (*block).prev;
    if !prev.is_null() && (*prev).is_free {
      (*prev).size += MtBlock::HEADER_SIZE + (*block).size;
      (*prev).next = (*block).next;
      if !(*block).next.is_null() {
        (*(*block).next).prev = prev;
      }
      block = prev;
    }

    let next = (*block).next;
    if !next.is_null() && (*next).is_free {
      (*block).size += MtBlock::HEADER_SIZE + (*next).size;
      (*block).next = (*next).next;
      if !(*next).next.is_null() {
        (*(*next).next).prev = block;
      }
    }
  }
  block
}

impl Drop for MtHeap {
  fn drop(&mut self) {
    let mut area = *self.head.get_mut();
    while !area.is_null() {
      let next = unsafe { (*area).next.load(Ordering::Acquire) };
      unsafe {
        drop(Box::from_raw(area));
      }
      area = next;
    }
    *self.head.get_mut() = ptr::null_mut();
    if let Some(snapshot) = self.initial_break.take() {
      heap::restore(snapshot);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_support::HEAP_TEST_LOCK;
  use std::sync::Arc;
  use std::thread;

  const TEST_AREA_SIZE: usize = 512;
  const TEST_NUM_AREAS: usize = 4;

  #[test]
  fn basic_allocate_write_free() {
    let _guard = HEAP_TEST_LOCK.lock().unwrap();
    let heap = MtHeap::with_config(TEST_AREA_SIZE, TEST_NUM_AREAS);
    let p = heap.allocate(16);
    assert!(!p.is_null());
    unsafe {
      ptr::write_bytes(p, 0xAB, 16);
    }
    heap.free(p);
  }

  #[test]
  fn zero_size_allocate_returns_null() {
    let _guard = HEAP_TEST_LOCK.lock().unwrap();
    let heap = MtHeap::with_config(TEST_AREA_SIZE, TEST_NUM_AREAS);
    assert!(heap.allocate(0).is_null());
  }

  #[test]
  fn request_larger_than_one_area_returns_null_without_fallback() {
    let _guard = HEAP_TEST_LOCK.lock().unwrap();
    let heap = MtHeap::with_config(TEST_AREA_SIZE, TEST_NUM_AREAS);
    assert!(heap.allocate(TEST_AREA_SIZE).is_null());
  }

  #[test]
  fn each_block_lock_points_at_its_owning_area() {
    let _guard = HEAP_TEST_LOCK.lock().unwrap();
    let heap = MtHeap::with_config(TEST_AREA_SIZE, TEST_NUM_AREAS);
    let p = heap.allocate(32);
    assert!(!p.is_null());
    let block = unsafe { MtBlock::from_payload(p) };
    let claimed = unsafe { (*block).lock };
    assert!(heap.find_area_by_lock(claimed).is_some());
  }

  #[test]
  fn freed_block_is_reused_by_next_allocation_of_same_size() {
    let _guard = HEAP_TEST_LOCK.lock().unwrap();
    let heap = MtHeap::with_config(TEST_AREA_SIZE, TEST_NUM_AREAS);
    let p1 = heap.allocate(64);
    heap.free(p1);
    let p2 = heap.allocate(64);
    assert_eq!(p1, p2);
  }

  #[test]
  fn resize_to_zero_frees_and_returns_null() {
    let _guard = HEAP_TEST_LOCK.lock().unwrap();
    let heap = MtHeap::with_config(TEST_AREA_SIZE, TEST_NUM_AREAS);
    let p = heap.allocate(32);
    assert!(heap.resize(p, 0).is_null());
  }

  #[test]
  fn resize_without_room_moves_and_preserves_data() {
    let _guard = HEAP_TEST_LOCK.lock().unwrap();
    let heap = MtHeap::with_config(TEST_AREA_SIZE, TEST_NUM_AREAS);
    let p = heap.allocate(20);
    unsafe {
      ptr::write_bytes(p, 0x07, 20);
    }
    let q = heap.resize(p, TEST_AREA_SIZE - 64);
    assert_ne!(p, q);
    unsafe {
      assert_eq!(*q, 0x07);
    }
  }

  #[test]
  fn free_of_null_is_diagnosed_not_aborted() {
    let _guard = HEAP_TEST_LOCK.lock().unwrap();
    let heap = MtHeap::with_config(TEST_AREA_SIZE, TEST_NUM_AREAS);
    heap.free(ptr::null_mut());
  }

  #[test]
  fn free_of_non_heap_pointer_is_diagnosed_not_aborted() {
    let _guard = HEAP_TEST_LOCK.lock().unwrap();
    let heap = MtHeap::with_config(TEST_AREA_SIZE, TEST_NUM_AREAS);
    let mut stack_value = 0u8;
    heap.free(&mut stack_value as *mut u8);
  }

  #[test]
  fn area_registry_grows_once_every_area_is_full() {
    let _guard = HEAP_TEST_LOCK.lock().unwrap();
    let heap = MtHeap::with_config(TEST_AREA_SIZE, 1);
    let usable = TEST_AREA_SIZE - MtBlock::HEADER_SIZE;
    let first = heap.allocate(usable - 4);
    assert!(!first.is_null());

    let second = heap.allocate(64);
    assert!(!second.is_null());
    assert_eq!(heap.area_count.load(Ordering::Acquire), 2);
  }

  #[test]
  fn calloc_zeroes_memory() {
    let _guard = HEAP_TEST_LOCK.lock().unwrap();
    let heap = MtHeap::with_config(TEST_AREA_SIZE, TEST_NUM_AREAS);
    let p = heap.calloc(5, 4);
    assert!(!p.is_null());
    unsafe {
      for i in 0..20 {
        assert_eq!(*p.add(i), 0);
      }
    }
  }

  #[test]
  fn calloc_rejects_multiplication_overflow() {
    let _guard = HEAP_TEST_LOCK.lock().unwrap();
    let heap = MtHeap::with_config(TEST_AREA_SIZE, TEST_NUM_AREAS);
    assert!(heap.calloc(usize::MAX, 2).is_null());
  }

  #[test]
  fn concurrent_threads_see_only_their_own_writes() {
    let _guard = HEAP_TEST_LOCK.lock().unwrap();
    // 8 threads x 500 iterations, allocating 1..400 bytes, with a sleep
    // between the write and the verify-read: wide enough an interleaving
    // window to catch a block briefly handed to the wrong area or a split
    // remainder corrupted across threads.
    let heap = Arc::new(MtHeap::new());

    let handles: Vec<_> = (0..8u8)
      .map(|id| {
        let heap = Arc::clone(&heap);
        thread::spawn(move || {
          for i in 0..500 {
            let size = 1 + ((id as usize * 37 + i) % 400);
            let p = heap.allocate(size);
            assert!(!p.is_null());
            unsafe {
              ptr::write_bytes(p, id, size);
              thread::sleep(std::time::Duration::from_micros(20));
              for byte in 0..size {
                assert_eq!(*p.add(byte), id);
              }
            }
            heap.free(p);
          }
        })
      })
      .collect();

    for handle in handles {
      handle.join().unwrap();
    }
  }
}
