//! Heap Region Manager.
//!
//! Thin wrapper around the `sbrk`/`brk` program-break primitives. This is
//! the only module that talks to the OS; everything above it works with
//! addresses already carved out of the region this module hands back.

use libc::{c_void, intptr_t};
use std::io;

/// Why a heap extension failed.
pub enum ExtendError {
  /// The kernel refused because it is out of memory. This is
  /// fatal: the caller must tear the heap down and terminate.
  OutOfMemory,
  /// Any other `sbrk` failure. Recoverable: the caller returns null.
  Other,
}

/// Returns the current program break, as reported by `sbrk(0)`.
pub fn current_break() -> *mut u8 {
  unsafe { libc::sbrk(0) as *mut u8 }
}

/// Grows the break by `n` bytes.
///
/// On success, returns the break *before* the growth — the address of the
/// newly available region. `n` must fit in an `isize`; this module never
/// calls it with a value large enough to overflow in practice, since every
/// caller sizes the request from a single header-plus-payload pair.
pub fn extend(n: usize) -> Result<*mut u8, ExtendError> {
  let prev = unsafe { libc::sbrk(n as intptr_t) };
  if prev as isize == -1 {
    let err = match io::Error::last_os_error().raw_os_error() {
      Some(code) if code == libc::ENOMEM => ExtendError::OutOfMemory,
      _ => ExtendError::Other,
    };
    return Err(err);
  }
  Ok(prev as *mut u8)
}

/// Shrinks the break by `n` bytes, releasing those pages back to the OS.
pub fn shrink(n: usize) {
  if n == 0 {
    return;
  }
  unsafe {
    libc::sbrk(-(n as isize) as intptr_t);
  }
}

/// Captures the current break so it can later be restored with [`restore`].
pub fn snapshot() -> *mut u8 {
  current_break()
}

/// Resets the break to a previously captured [`snapshot`].
pub fn restore(snapshot: *mut u8) {
  unsafe {
    libc::brk(snapshot as *mut c_void);
  }
}
