// Memory manager test suite.
//
// Each test builds its own manager over a private backing slab, so tests
// run in parallel without shared state:
// - heap_tests:  placement policy, gap reuse, coalescing, exhaustion
// - sbrk_tests:  break-frontier behavior of sbrk and brk
// - unmap_tests: the four release cases, scrubbing, bad ranges
// - remap_tests: shrink, in-place growth, moving growth
// - trace_tests: randomized workload, universal properties, coverage

mod remap_tests;

use sysdefs::constants::err_const::MemErrno;
use sysdefs::constants::mem_const::{
    MAP_ANONYMOUS, MAP_PRIVATE, PAGESIZE, PROT_READ, PROT_WRITE,
};

use crate::memory::{alloc_backing, free_backing};

pub use crate::vmmap::{Vmmap, VmmapOps};

pub const PGSZ: usize = PAGESIZE;

/// Backing slab returned to the host on drop.
pub struct TestSlab {
    pub base: usize,
    pub size: usize,
}

impl TestSlab {
    pub fn new(size: usize) -> TestSlab {
        let base = alloc_backing(size).expect("backing slab allocation failed");
        TestSlab { base, size }
    }
}

impl Drop for TestSlab {
    fn drop(&mut self) {
        free_backing(self.base, self.size);
    }
}

/// Manager over a fresh slab with scrubbing and live sanity checking
/// enabled, the configuration every scenario here runs under.
pub fn test_vmmap(npages: usize) -> (TestSlab, Vmmap) {
    let slab = TestSlab::new(npages * PGSZ);
    let vmmap = Vmmap::new(slab.base, slab.size).expect("init failed");
    vmmap.set_scrub(true);
    vmmap.set_sanity(true);
    (slab, vmmap)
}

/// Map `length` bytes with the only permitted prot/flags combination.
pub fn try_map(vmmap: &Vmmap, length: usize) -> Result<usize, MemErrno> {
    vmmap.map(None, length, PROT_READ | PROT_WRITE, MAP_ANONYMOUS | MAP_PRIVATE)
}

pub fn map_pages(vmmap: &Vmmap, npages: usize) -> usize {
    try_map(vmmap, npages * PGSZ).expect("map failed")
}

/// Region list walked head to tail yields strictly increasing addresses.
pub fn is_sorted(vmmap: &Vmmap) -> bool {
    vmmap.regions().windows(2).all(|w| w[0].0 < w[1].0)
}

/// Regions tile the mapped section exactly: the frontier sits on the head,
/// neighbors touch, and the last region ends at the end of the range.
pub fn is_flush(vmmap: &Vmmap) -> bool {
    let regions = vmmap.regions();
    let last = match regions.last() {
        Some(last) => last,
        None => return true,
    };
    if vmmap.map_bottom() != regions[0].0 {
        return false;
    }
    for pair in regions.windows(2) {
        if pair[0].0 + pair[0].1 != pair[1].0 {
            return false;
        }
    }
    last.0 + last.1 == vmmap.end_address()
}

/// Read one byte of the managed slab. Tests own the slab, so peeking at
/// released pages is fair game.
pub fn peek(addr: usize) -> u8 {
    unsafe { *(addr as *const u8) }
}

pub fn poke(addr: usize, value: u8) {
    unsafe { *(addr as *mut u8) = value }
}
