//! Page-granular virtual memory manager for a confined address space.
//!
//! This crate manages a single fixed, pre-reserved, page-aligned byte range
//! (the kind of slab a sandboxed runtime provisions once for a guest and
//! can never grow) and services the classic UNIX-style primitives over it:
//! `brk`/`sbrk` for linear heap growth and `map`/`remap`/`unmap` for
//! arbitrary region allocation with coalescing. The host operating system
//! is never consulted; descriptors come from a pool reserved inside the
//! range at init, and every operation runs under one per-instance lock.
//!
//! Managers are plain values. There is no global registry, so a process can
//! run any number of independent instances (one per guest, or dozens in a
//! test harness).

pub mod mem_helper;
pub mod memory;
pub mod vmmap;

pub use mem_helper::*;
pub use memory::*;
pub use vmmap::*;

#[cfg(test)]
mod tests;
