//! The single-threaded block header.
//!
//! A [`Block`] is the fixed-size record prepended to every payload in the
//! single-threaded heap. It is laid out directly in the heap region itself
//! (intrusive metadata) and recovered from a user pointer by subtracting
//! `size_of::<Block>()`.

use std::mem;
use std::ptr;

/// Fixed-size metadata prepended to every payload.
///
/// Field order mirrors the original C struct: `size`, `is_free`, `next`,
/// `prev`. `next`/`prev` link the block to whichever block is physically
/// adjacent in address order, not to whichever block is next in some
/// logical free list.
#[repr(C)]
pub struct Block {
  pub size: usize,
  pub is_free: bool,
  pub next: *mut Block,
  pub prev: *mut Block,
}

impl Block {
  /// Size, in bytes, of the header itself.
  pub const HEADER_SIZE: usize = mem::size_of::<Block>();

  /// Writes a fresh block header at `addr`.
  ///
  /// # Safety
  /// `addr` must point to at least `Block::HEADER_SIZE` writable bytes.
  pub unsafe fn init(addr: *mut u8, size: usize, is_free: bool, prev: *mut Block, next: *mut Block) -> *mut Block {
    let block = addr as *mut Block;
    unsafe {
      ptr::write(
        block,
        Block {
          size,
          is_free,
          next,
          prev,
        },
      );
    }
    block
  }

  /// The address of this block's payload — the pointer handed back to callers.
  pub fn payload(block: *mut Block) -> *mut u8 {
    unsafe { (block as *mut u8).add(Self::HEADER_SIZE) }
  }

  /// Recovers the block header from a payload pointer previously returned
  /// by [`Block::payload`].
  ///
  /// # Safety
  /// `payload` must have been returned by a prior call to `payload` on a
  /// live block belonging to the same heap.
  pub unsafe fn from_payload(payload: *mut u8) -> *mut Block {
    unsafe { payload.sub(Self::HEADER_SIZE) as *mut Block }
  }
}
