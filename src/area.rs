//! The multi-threaded block header and memory area.
//!
//! A [`MemArea`] is a fixed-size region carved from the heap as a unit,
//! each with its own private block list and its own lock. [`MtBlock`]
//! extends the single-threaded [`crate::block::Block`] layout with a
//! back-pointer to the owning area's lock, set at creation and at every
//! split.

use std::mem;
use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::sync::Mutex;

use crate::heap::{self, ExtendError};

/// Default size of one memory area, in bytes.
pub const AREA_SIZE: usize = 4096;

/// Default number of areas created eagerly at initialization.
pub const NUM_AREAS: usize = 8;

/// Fixed-size metadata prepended to every payload in the multi-threaded
/// heap. Same field order as [`crate::block::Block`], plus `lock`.
#[repr(C)]
pub struct MtBlock {
  pub size: usize,
  pub is_free: bool,
  pub next: *mut MtBlock,
  pub prev: *mut MtBlock,
  /// Back-pointer to the owning area's lock. Non-null for every block
  /// that was ever initialized by this crate; a null (or otherwise
  /// unrecognized) value is this crate's signal that a pointer handed to
  /// `free`/`resize` did not come from this heap.
  pub lock: *const Mutex<()>,
}

impl MtBlock {
  pub const HEADER_SIZE: usize = mem::size_of::<MtBlock>();

  /// Writes a fresh block header at `addr`.
  ///
  /// # Safety
  /// `addr` must point to at least `MtBlock::HEADER_SIZE` writable bytes.
  pub unsafe fn init(addr: *mut u8, size: usize, is_free: bool, prev: *mut MtBlock, next: *mut MtBlock, lock: *const Mutex<()>) -> *mut MtBlock {
    let block = addr as *mut MtBlock;
    unsafe {
      ptr::write(
        block,
        MtBlock {
          size,
          is_free,
          next,
          prev,
          lock,
        },
      );
    }
    block
  }

  pub fn payload(block: *mut MtBlock) -> *mut u8 {
    unsafe { (block as *mut u8).add(Self::HEADER_SIZE) }
  }

  /// # Safety
  /// `payload` must have been returned by a prior call to `payload` on a
  /// live block belonging to the same heap.
  pub unsafe fn from_payload(payload: *mut u8) -> *mut MtBlock {
    unsafe { payload.sub(Self::HEADER_SIZE) as *mut MtBlock }
  }
}

/// A fixed-size arena: one area-private block list, guarded by one lock.
///
/// `block_list` points at the area's first block and never changes after
/// construction — the multi-threaded allocator never tail-trims an area
/// back to the OS, and address-order coalescing never moves the leftmost
/// block's identity — so reading it from any thread without holding
/// `lock` is sound. Everything reachable *through* that pointer (every
/// block's `size`/`is_free`/`next`/`prev`) is mutated only while `lock`
/// is held.
pub struct MemArea {
  pub block_list: *mut MtBlock,
  pub lock: Mutex<()>,
  pub next: AtomicPtr<MemArea>,
}

// SAFETY: `block_list` is write-once at construction; every subsequent
// access to the blocks it points into is serialized by `lock`. `next` is
// itself atomic. So sharing `&MemArea` across threads is sound.
unsafe impl Sync for MemArea {}
unsafe impl Send for MemArea {}

impl MemArea {
  /// Extends the heap by `area_size` bytes and carves one free block
  /// covering the whole region (minus its own header) out of it.
  pub fn new(area_size: usize) -> Result<Box<MemArea>, ExtendError> {
    let addr = heap::extend(area_size)?;
    let area = Box::new(MemArea {
      block_list: ptr::null_mut(),
      lock: Mutex::new(()),
      next: AtomicPtr::new(ptr::null_mut()),
    });
    let lock_ptr: *const Mutex<()> = &area.lock;
    let block = unsafe { MtBlock::init(addr, area_size - MtBlock::HEADER_SIZE, true, ptr::null_mut(), ptr::null_mut(), lock_ptr) };
    let mut area = area;
    area.block_list = block;
    Ok(area)
  }
}
