//! Textual diagnostics written to standard error on caller misuse.
//!
//! None of these surface as a `Result` or panic — they are plain
//! text on stderr, and the call site falls through to whatever null/no-op
//! behavior the operation's contract specifies. The five messages here are
//! the complete error vocabulary of the crate.

pub fn free_null_pointer() {
  eprintln!("<free error>: passed null pointer");
}

pub fn free_non_heap_pointer() {
  eprintln!("<free error>: passed non-heap pointer");
}

pub fn realloc_non_heap_pointer() {
  eprintln!("<realloc error>: passed non-heap pointer");
}

/// Out-of-memory is the one fatal case: emit the diagnostic and terminate
/// the process. Callers are expected to tear the heap down first.
pub fn out_of_memory_fatal() -> ! {
  eprintln!("<sbrk/brk error>: out of memory");
  std::process::exit(1);
}

/// Debug helper: reports the size requested, the address handed back, and
/// the current program break.
pub fn print_alloc(size: usize, addr: *mut u8) {
  println!("Allocated {} bytes, address = {:?}, program break = {:?}", size, addr, crate::heap::current_break());
}
