//! VMMAP data structure and structure-related operations
//!
//! This file implements the manager for a single contiguous, pre-reserved,
//! page-aligned byte range. The range is partitioned into four sections:
//!
//! ```text
//!     <--DESCRIPTORS--><---BREAK---><--UNASSIGNED--><------MAPPED------>
//!     [...............................................................]
//!     ^                ^            ^               ^                  ^
//!    base            start         brk             map                end
//! ```
//!
//! `sbrk`/`brk` manage the BREAK section, which grows upward; `map`,
//! `remap` and `unmap` manage the MAPPED section, which grows downward.
//! The two frontiers advance toward one another until the unassigned
//! middle is exhausted.
//!
//! Live mapped regions are described by [`VmmapEntry`] records kept in a
//! doubly-linked list sorted by starting address. Entries live in a
//! fixed-capacity pool sized to one descriptor per page of managed memory;
//! the links are pool indices rather than pointers, so the list carries no
//! ownership cycles. Released entries go onto a singly-linked free list
//! threaded through the same `next` field.

use parking_lot::Mutex;

use sysdefs::constants::err_const::{mem_error, MemErrno};
use sysdefs::constants::mem_const::{
    MAP_ANONYMOUS, MAP_FIXED, MAP_PRIVATE, MAP_SHARED, MEM_ERR_MAX, MREMAP_MAYMOVE, PAGESIZE,
    PROT_EXEC, PROT_READ, PROT_WRITE, SCRUB_BYTE, VMMAP_MAGIC,
};

use crate::mem_helper::{page_aligned, round_up_page};
use crate::memory;

/// Number of distinct internal branches tracked by [`VmmapCoverage`].
pub const VMMAP_COVERAGE_N: usize = 19;

/// Internal branches recorded as they fire. Consumed only by tests, which
/// merge the flags across scenarios and require every branch to have run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum VmmapCoverage {
    MapCoalesceLeft = 0,
    MapCoalesceRight,
    MapNewEntry,
    UnmapFull,
    UnmapPrefix,
    UnmapSuffix,
    UnmapMiddle,
    RemapShrinkSplit,
    RemapShrink,
    RemapGrowInPlace,
    RemapGrowCoalesce,
    RemapGrowMove,
    RemapNoChange,
    GapInterior,
    GapExhausted,
    GapTop,
    InsertAfter,
    InsertHead,
    InitDone,
}

/// One mapped region.
///
/// `prev` and `next` are indices into the descriptor pool. While an entry
/// sits on the free list only `next` is meaningful.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmmapEntry {
    pub addr: usize,  // Starting byte address, page-aligned
    pub size: usize,  // Byte length, page multiple, non-zero while live
    pub prot: i32,    // Protection flags recorded at creation
    pub flags: i32,   // Mapping flags recorded at creation
    pub prev: Option<usize>,
    pub next: Option<usize>,
}

impl VmmapEntry {
    fn cleared() -> Self {
        VmmapEntry {
            addr: 0,
            size: 0,
            prot: 0,
            flags: 0,
            prev: None,
            next: None,
        }
    }
}

/// The manager state proper. All operations on it assume the caller holds
/// the owning [`Vmmap`]'s lock; the public entry points wrap these
/// internals, and the moving-remap path re-enters them directly instead of
/// re-acquiring the lock.
#[derive(Debug)]
struct VmmapState {
    magic: u64,
    initialized: bool,

    // Range geometry, immutable after init.
    base_address: usize,
    start_address: usize,
    end_address: usize,

    // The two frontiers.
    program_break: usize,
    map_bottom: usize,

    // Descriptor pool. `entries.len()` is the bump pointer over the
    // never-used portion; `free_head` threads released entries.
    entries: Vec<VmmapEntry>,
    pool_capacity: usize,
    free_head: Option<usize>,

    // Live region list, strictly ordered by address and gap-separated.
    list_head: Option<usize>,

    scrub: bool,
    sanity: bool,
    err: String,
    coverage: [bool; VMMAP_COVERAGE_N],
}

/// Core operations every virtual memory map implementation supports. The
/// manager hands out plain byte addresses; callers treat them as opaque
/// until they reach whatever translation layer embeds the manager.
pub trait VmmapOps {
    /// Return the current break value and advance it by `increment` bytes.
    ///
    /// An increment of zero queries without mutating. The returned value is
    /// always the break before the change. Advancing past the map frontier
    /// or retreating below the heap start fails with `OutOfMemory` and
    /// leaves the break unchanged. No alignment is required of `increment`.
    fn sbrk(&self, increment: isize) -> Result<usize, MemErrno>;

    /// Set the break value to `addr`.
    ///
    /// Fails with `InvalidParameter` unless `start <= addr < map`.
    fn brk(&self, addr: usize) -> Result<(), MemErrno>;

    /// Allocate `length` bytes (rounded up to a page multiple) from the
    /// mapped section and return the starting address of the new region.
    ///
    /// `addr` is an address hint and must be `None`; `prot` must be exactly
    /// readable and writable; `flags` must be anonymous and private. The
    /// returned span is zero-filled. Placement is first-fit over the gaps
    /// between live regions, falling back to the space just below the map
    /// frontier; an allocation that ends up flush against its neighbors is
    /// coalesced with them.
    fn map(&self, addr: Option<usize>, length: usize, prot: i32, flags: i32)
        -> Result<usize, MemErrno>;

    /// Release `length` bytes starting at `addr`.
    ///
    /// The range must be page-aligned, a page multiple, and fall entirely
    /// within a single live region. Releasing the middle of a region splits
    /// it in two.
    fn unmap(&self, addr: usize, length: usize) -> Result<(), MemErrno>;

    /// Resize the `old_size`-byte range at `addr` to `new_size` bytes.
    ///
    /// `flags` must be exactly `MREMAP_MAYMOVE`. The region grows in place
    /// when it can; otherwise a fresh region is mapped, the old contents
    /// are copied over, and the old range is released, so the returned
    /// address may differ from `addr`. If that final release fails the
    /// call reports `Failure` with both regions left mapped.
    fn remap(
        &self,
        addr: usize,
        old_size: usize,
        new_size: usize,
        flags: i32,
    ) -> Result<usize, MemErrno>;

    /// Whether every structural invariant currently holds.
    fn is_sane(&self) -> bool;

    /// Toggle running the full sanity predicate on every operation's entry
    /// and exit. Slow; intended for debugging and tests.
    fn set_sanity(&self, enable: bool);
}

/// A page-granular virtual memory manager over a fixed byte range.
///
/// The manager never asks the host for memory: descriptors come from an
/// internal pool reserved at init, and the managed bytes were provided by
/// the caller. A single per-instance mutex makes the public operations
/// linearizable; there is no process-wide state, so independent managers
/// can coexist freely.
#[derive(Debug)]
pub struct Vmmap {
    state: Mutex<VmmapState>,
}

impl VmmapState {
    fn new(base: usize, size: usize) -> Result<Self, MemErrno> {
        if base == 0 || size == 0 {
            return Err(mem_error(MemErrno::InvalidParameter, "init", "bad parameter"));
        }
        if !page_aligned(base) {
            return Err(mem_error(
                MemErrno::InvalidParameter,
                "init",
                "bad base parameter: must be page aligned",
            ));
        }
        if !page_aligned(size) {
            return Err(mem_error(
                MemErrno::InvalidParameter,
                "init",
                "bad size parameter: must be page multiple",
            ));
        }
        let end = match base.checked_add(size) {
            Some(end) => end,
            None => {
                return Err(mem_error(
                    MemErrno::InvalidParameter,
                    "init",
                    "bad size parameter: range wraps the address space",
                ))
            }
        };

        // Reserve the low end of the range for the descriptor pool, one
        // descriptor per managed page, rounded up to a page boundary.
        let page_count = size / PAGESIZE;
        let reserve = match page_count
            .checked_mul(std::mem::size_of::<VmmapEntry>())
            .and_then(round_up_page)
        {
            Some(reserve) => reserve,
            None => {
                return Err(mem_error(
                    MemErrno::InvalidParameter,
                    "init",
                    "bad size parameter: descriptor reserve overflow",
                ))
            }
        };
        let start = base + reserve;

        let mut state = VmmapState {
            magic: VMMAP_MAGIC,
            initialized: true,
            base_address: base,
            start_address: start,
            end_address: end,
            program_break: start,
            map_bottom: end,
            entries: Vec::with_capacity(page_count),
            pool_capacity: page_count,
            free_head: None,
            list_head: None,
            scrub: false,
            sanity: false,
            err: String::with_capacity(MEM_ERR_MAX),
            coverage: [false; VMMAP_COVERAGE_N],
        };

        // A range too small to hold its own descriptor pool fails closed
        // here rather than surfacing as corruption later.
        if let Some(msg) = state.sanity_violation() {
            return Err(mem_error(MemErrno::Unexpected, "init", msg));
        }

        state.mark(VmmapCoverage::InitDone);
        Ok(state)
    }

    fn mark(&mut self, branch: VmmapCoverage) {
        self.coverage[branch as usize] = true;
    }

    /// Record a diagnostic and hand back the errno so failure paths read
    /// `return Err(self.fail(..))`.
    fn fail(&mut self, errno: MemErrno, op: &str, msg: &str) -> MemErrno {
        self.set_err(msg);
        mem_error(errno, op, msg)
    }

    fn set_err(&mut self, msg: &str) {
        self.err.clear();
        self.err.push_str(&msg[..msg.len().min(MEM_ERR_MAX)]);
    }

    /// Liveness plus (when enabled) the full predicate, run before an
    /// operation touches anything. A violation is reported as `errno`,
    /// which each operation picks from its own declared error kinds.
    fn ensure_entry(&mut self, op: &str, errno: MemErrno) -> Result<(), MemErrno> {
        if self.magic != VMMAP_MAGIC || !self.initialized {
            return Err(self.fail(MemErrno::InvalidParameter, op, "bad manager parameter"));
        }
        if self.sanity && !self.check_sane() {
            tracing::warn!(target: "vmmap", %op, err = %self.err, "sanity check failed on entry");
            return Err(mem_error(errno, op, "sanity check failed on entry"));
        }
        Ok(())
    }

    /// The gated post-condition check. A violation here is a bug in the
    /// manager, reported as `errno` from the operation's own error kinds.
    fn ensure_exit(&mut self, op: &str, errno: MemErrno) -> Result<(), MemErrno> {
        if self.sanity && !self.check_sane() {
            tracing::warn!(target: "vmmap", %op, err = %self.err, "sanity check failed on exit");
            return Err(mem_error(errno, op, "sanity check failed on exit"));
        }
        Ok(())
    }

    fn check_sane(&mut self) -> bool {
        match self.sanity_violation() {
            None => true,
            Some(msg) => {
                self.set_err(msg);
                false
            }
        }
    }

    /// Pure read-only invariant check. Returns the first violated clause,
    /// or `None` when the structure is sound.
    fn sanity_violation(&self) -> Option<&'static str> {
        if self.magic != VMMAP_MAGIC {
            return Some("bad magic");
        }
        if !self.initialized {
            return Some("uninitialized");
        }
        if !page_aligned(self.start_address)
            || !page_aligned(self.end_address)
            || !page_aligned(self.map_bottom)
        {
            return Some("unaligned frontier");
        }
        if self.base_address > self.start_address {
            return Some("start below base");
        }
        if self.start_address >= self.end_address {
            return Some("start not below end");
        }
        if self.program_break < self.start_address {
            return Some("break below start");
        }
        if self.program_break > self.map_bottom {
            return Some("break above map frontier");
        }
        if self.map_bottom > self.end_address {
            return Some("map frontier above end");
        }

        // The map frontier mirrors the list head.
        match self.list_head {
            Some(head) => {
                if self.map_bottom != self.entries[head].addr {
                    return Some("map frontier out of sync with list head");
                }
            }
            None => {
                if self.map_bottom != self.end_address {
                    return Some("map frontier not at end with empty list");
                }
            }
        }

        // Walk the region list: ordering, separation, alignment, links.
        let mut live = 0usize;
        let mut prev: Option<usize> = None;
        let mut cur = self.list_head;
        while let Some(idx) = cur {
            live += 1;
            if live > self.entries.len() {
                return Some("region list cycle");
            }
            let entry = &self.entries[idx];
            if entry.size == 0 {
                return Some("zero-size region");
            }
            if !page_aligned(entry.addr) || !page_aligned(entry.size) {
                return Some("unaligned region");
            }
            if entry.addr < self.start_address || self.end_of(idx) > self.end_address {
                return Some("region outside managed range");
            }
            if entry.prev != prev {
                return Some("broken region back link");
            }
            if let Some(p) = prev {
                if self.entries[p].addr >= entry.addr {
                    return Some("unordered region list");
                }
                // Coalescing forbids touching neighbors, so adjacency is
                // strictly separated, never flush.
                if self.end_of(p) == entry.addr {
                    return Some("touching region list elements");
                }
                if self.end_of(p) > entry.addr {
                    return Some("overlapping region list elements");
                }
            }
            prev = cur;
            cur = entry.next;
        }

        // Every descriptor handed out by the bump pointer is either live or
        // on the free list.
        let mut free = 0usize;
        let mut cur = self.free_head;
        while let Some(idx) = cur {
            free += 1;
            if free > self.entries.len() {
                return Some("free list cycle");
            }
            cur = self.entries[idx].next;
        }
        if live + free != self.entries.len() {
            return Some("descriptor accounting mismatch");
        }
        if self.entries.len() > self.pool_capacity {
            return Some("descriptor pool overrun");
        }

        None
    }

    // ===== Descriptor pool =====

    /// Take a descriptor from the free list, falling back to the bump
    /// pointer over the never-used portion of the pool.
    fn free_list_get(&mut self) -> Option<usize> {
        if let Some(idx) = self.free_head {
            self.free_head = self.entries[idx].next;
            return Some(idx);
        }
        if self.entries.len() < self.pool_capacity {
            self.entries.push(VmmapEntry::cleared());
            return Some(self.entries.len() - 1);
        }
        None
    }

    /// Clear a descriptor and push it onto the free list.
    fn free_list_put(&mut self, idx: usize) {
        let entry = &mut self.entries[idx];
        entry.addr = 0;
        entry.size = 0;
        entry.prot = 0;
        entry.flags = 0;
        entry.prev = None;
        entry.next = self.free_head;
        self.free_head = Some(idx);
    }

    fn new_entry(&mut self, addr: usize, size: usize, prot: i32, flags: i32) -> Option<usize> {
        let idx = self.free_list_get()?;
        let entry = &mut self.entries[idx];
        entry.addr = addr;
        entry.size = size;
        entry.prot = prot;
        entry.flags = flags;
        entry.prev = None;
        entry.next = None;
        Some(idx)
    }

    // ===== Region list =====

    fn end_of(&self, idx: usize) -> usize {
        self.entries[idx].addr + self.entries[idx].size
    }

    /// Size of the gap between this region and its right neighbor, or the
    /// end of the range when it is the last one.
    fn right_gap(&self, idx: usize) -> usize {
        match self.entries[idx].next {
            Some(next) => self.entries[next].addr - self.end_of(idx),
            None => self.end_address - self.end_of(idx),
        }
    }

    /// Link `idx` after `prev`, or at the head when `prev` is `None`.
    fn list_insert_after(&mut self, prev: Option<usize>, idx: usize) {
        match prev {
            Some(p) => {
                let old_next = self.entries[p].next;
                self.entries[idx].prev = Some(p);
                self.entries[idx].next = old_next;
                if let Some(n) = old_next {
                    self.entries[n].prev = Some(idx);
                }
                self.entries[p].next = Some(idx);
                self.mark(VmmapCoverage::InsertAfter);
            }
            None => {
                self.entries[idx].prev = None;
                self.entries[idx].next = self.list_head;
                if let Some(h) = self.list_head {
                    self.entries[h].prev = Some(idx);
                }
                self.list_head = Some(idx);
                self.mark(VmmapCoverage::InsertHead);
            }
        }
    }

    fn list_remove(&mut self, idx: usize) {
        let prev = self.entries[idx].prev;
        let next = self.entries[idx].next;
        match prev {
            Some(p) => self.entries[p].next = next,
            None => self.list_head = next,
        }
        if let Some(n) = next {
            self.entries[n].prev = prev;
        }
        self.entries[idx].prev = None;
        self.entries[idx].next = None;
    }

    /// Find the live region containing `addr`.
    fn list_find(&self, addr: usize) -> Option<usize> {
        let mut cur = self.list_head;
        while let Some(idx) = cur {
            if addr >= self.entries[idx].addr && addr < self.end_of(idx) {
                return Some(idx);
            }
            cur = self.entries[idx].next;
        }
        None
    }

    /// Keep the map frontier equal to the first live region's address, or
    /// the end of the range when the list is empty.
    fn sync_map_bottom(&mut self) {
        self.map_bottom = match self.list_head {
            Some(head) => self.entries[head].addr,
            None => self.end_address,
        };
    }

    /// First-fit gap search for `length` bytes.
    ///
    /// Walks the list in address order looking at each region's right gap
    /// (the gap to the end of the range included); the allocation takes the
    /// lowest `length` bytes of the first gap that fits, flush against the
    /// region on its left. When no interior gap fits, the bytes immediately
    /// below the map frontier are taken instead, unless that would run the
    /// frontier into the break.
    ///
    /// Returns the chosen start plus the left and right neighbor indices.
    fn find_gap(&mut self, length: usize) -> Option<(usize, Option<usize>, Option<usize>)> {
        let mut cur = self.list_head;
        while let Some(idx) = cur {
            if self.right_gap(idx) >= length {
                self.mark(VmmapCoverage::GapInterior);
                return Some((self.end_of(idx), Some(idx), self.entries[idx].next));
            }
            cur = self.entries[idx].next;
        }

        let start = match self.map_bottom.checked_sub(length) {
            Some(start) if start >= self.program_break => start,
            _ => {
                self.mark(VmmapCoverage::GapExhausted);
                return None;
            }
        };
        self.mark(VmmapCoverage::GapTop);
        Some((start, None, self.list_head))
    }

    // ===== Operations =====

    fn sbrk_locked(&mut self, increment: isize) -> Result<usize, MemErrno> {
        let old_break = self.program_break;
        if increment == 0 {
            return Ok(old_break);
        }
        if increment > 0 {
            if increment as usize > self.map_bottom - self.program_break {
                return Err(self.fail(MemErrno::OutOfMemory, "sbrk", "out of memory"));
            }
            self.program_break += increment as usize;
        } else {
            // Magnitude arithmetic keeps the underflow check free of
            // signed wraparound.
            let decrement = increment.unsigned_abs();
            if decrement > self.program_break - self.start_address {
                return Err(self.fail(
                    MemErrno::OutOfMemory,
                    "sbrk",
                    "break would retreat below heap start",
                ));
            }
            self.program_break -= decrement;
        }
        Ok(old_break)
    }

    fn brk_locked(&mut self, addr: usize) -> Result<(), MemErrno> {
        if addr < self.start_address || addr >= self.map_bottom {
            return Err(self.fail(MemErrno::InvalidParameter, "brk", "address is out of range"));
        }
        self.program_break = addr;
        Ok(())
    }

    fn map_locked(
        &mut self,
        addr: Option<usize>,
        length: usize,
        prot: i32,
        flags: i32,
    ) -> Result<usize, MemErrno> {
        if addr.is_some() {
            // Placement is wholly owned by the gap policy; hints would
            // punch holes in the frontier invariant.
            return Err(self.fail(
                MemErrno::InvalidParameter,
                "map",
                "bad addr parameter: must be none",
            ));
        }
        if length == 0 {
            return Err(self.fail(MemErrno::InvalidParameter, "map", "bad length parameter"));
        }
        if prot & PROT_READ == 0 {
            return Err(self.fail(
                MemErrno::InvalidParameter,
                "map",
                "bad prot parameter: need PROT_READ",
            ));
        }
        if prot & PROT_WRITE == 0 {
            return Err(self.fail(
                MemErrno::InvalidParameter,
                "map",
                "bad prot parameter: need PROT_WRITE",
            ));
        }
        if prot & PROT_EXEC != 0 {
            return Err(self.fail(
                MemErrno::InvalidParameter,
                "map",
                "bad prot parameter: remove PROT_EXEC",
            ));
        }
        if flags & MAP_ANONYMOUS == 0 {
            return Err(self.fail(
                MemErrno::InvalidParameter,
                "map",
                "bad flags parameter: need MAP_ANONYMOUS",
            ));
        }
        if flags & MAP_PRIVATE == 0 {
            return Err(self.fail(
                MemErrno::InvalidParameter,
                "map",
                "bad flags parameter: need MAP_PRIVATE",
            ));
        }
        if flags & MAP_SHARED != 0 {
            return Err(self.fail(
                MemErrno::InvalidParameter,
                "map",
                "bad flags parameter: remove MAP_SHARED",
            ));
        }
        if flags & MAP_FIXED != 0 {
            return Err(self.fail(
                MemErrno::InvalidParameter,
                "map",
                "bad flags parameter: remove MAP_FIXED",
            ));
        }

        let length = match round_up_page(length) {
            Some(length) => length,
            None => {
                return Err(self.fail(
                    MemErrno::InvalidParameter,
                    "map",
                    "bad length parameter: rounding overflow",
                ))
            }
        };

        let (start, left, right) = match self.find_gap(length) {
            Some(found) => found,
            None => return Err(self.fail(MemErrno::OutOfMemory, "map", "out of memory")),
        };

        if let Some(l) = left {
            // The interior policy places allocations flush against the
            // region on their left, so grow that region over the gap
            // instead of minting a descriptor.
            self.entries[l].size += length;

            if let Some(r) = right {
                if start + length == self.entries[r].addr {
                    // The gap is now filled end to end; fold the right
                    // neighbor in and retire its descriptor.
                    self.list_remove(r);
                    let right_size = self.entries[r].size;
                    self.entries[l].size += right_size;
                    self.free_list_put(r);
                }
            }
            self.mark(VmmapCoverage::MapCoalesceLeft);
        } else if let Some(r) = right.filter(|&r| start + length == self.entries[r].addr) {
            // Flush against the right neighbor only: extend it downward.
            self.entries[r].addr = start;
            self.entries[r].size += length;
            self.sync_map_bottom();
            self.mark(VmmapCoverage::MapCoalesceRight);
        } else {
            let idx = match self.new_entry(start, length, prot, flags) {
                Some(idx) => idx,
                None => {
                    // No descriptor left for the gap in hand: the pool is
                    // a resource like the bytes themselves.
                    return Err(self.fail(
                        MemErrno::OutOfMemory,
                        "map",
                        "descriptor pool exhausted",
                    ));
                }
            };
            self.list_insert_after(left, idx);
            self.sync_map_bottom();
            self.mark(VmmapCoverage::MapNewEntry);
        }

        memory::fill_bytes(start, length, 0);
        Ok(start)
    }

    fn unmap_locked(&mut self, addr: usize, length: usize) -> Result<(), MemErrno> {
        if addr == 0 {
            return Err(self.fail(MemErrno::InvalidParameter, "unmap", "bad addr parameter"));
        }
        if !page_aligned(addr) {
            return Err(self.fail(
                MemErrno::InvalidParameter,
                "unmap",
                "bad addr parameter: must be page aligned",
            ));
        }
        if length == 0 {
            return Err(self.fail(MemErrno::InvalidParameter, "unmap", "bad length parameter"));
        }
        if !page_aligned(length) {
            return Err(self.fail(
                MemErrno::InvalidParameter,
                "unmap",
                "bad length parameter: must be page multiple",
            ));
        }
        let end = match addr.checked_add(length) {
            Some(end) => end,
            None => {
                return Err(self.fail(
                    MemErrno::InvalidParameter,
                    "unmap",
                    "bad length parameter: range overflow",
                ))
            }
        };

        let idx = match self.list_find(addr) {
            Some(idx) => idx,
            None => {
                return Err(self.fail(MemErrno::InvalidParameter, "unmap", "address not found"))
            }
        };
        let vad_addr = self.entries[idx].addr;
        let vad_end = self.end_of(idx);
        if end > vad_end {
            // The range runs past its containing region; spanning several
            // regions is not a release of any one of them.
            return Err(self.fail(MemErrno::InvalidParameter, "unmap", "illegal range"));
        }

        // Four cases, by where the released range sits inside the region:
        //
        //     full:   [uuuuuuuuuuuuuuuu]
        //     prefix: [uuuu............]
        //     suffix: [............uuuu]
        //     middle: [....uuuu........]
        if vad_addr == addr && vad_end == end {
            if self.scrub {
                memory::fill_bytes(addr, length, SCRUB_BYTE);
            }
            self.list_remove(idx);
            self.sync_map_bottom();
            self.free_list_put(idx);
            self.mark(VmmapCoverage::UnmapFull);
        } else if vad_addr == addr {
            if self.scrub {
                memory::fill_bytes(addr, length, SCRUB_BYTE);
            }
            self.entries[idx].addr += length;
            self.entries[idx].size -= length;
            self.sync_map_bottom();
            self.mark(VmmapCoverage::UnmapPrefix);
        } else if vad_end == end {
            if self.scrub {
                memory::fill_bytes(addr, length, SCRUB_BYTE);
            }
            self.entries[idx].size -= length;
            self.mark(VmmapCoverage::UnmapSuffix);
        } else {
            // The right piece needs its own descriptor; take it before
            // mutating anything so pool exhaustion leaves state untouched.
            let prot = self.entries[idx].prot;
            let flags = self.entries[idx].flags;
            let right = match self.new_entry(end, vad_end - end, prot, flags) {
                Some(right) => right,
                None => {
                    return Err(self.fail(
                        MemErrno::Failure,
                        "unmap",
                        "descriptor pool exhausted",
                    ))
                }
            };
            if self.scrub {
                memory::fill_bytes(addr, length, SCRUB_BYTE);
            }
            self.entries[idx].size = addr - vad_addr;
            self.list_insert_after(Some(idx), right);
            self.sync_map_bottom();
            self.mark(VmmapCoverage::UnmapMiddle);
        }

        Ok(())
    }

    fn remap_locked(
        &mut self,
        addr: usize,
        old_size: usize,
        new_size: usize,
        flags: i32,
    ) -> Result<usize, MemErrno> {
        if addr == 0 {
            return Err(self.fail(MemErrno::InvalidParameter, "remap", "bad addr parameter"));
        }
        if !page_aligned(addr) {
            return Err(self.fail(
                MemErrno::InvalidParameter,
                "remap",
                "bad addr parameter: must be page aligned",
            ));
        }
        if old_size == 0 {
            return Err(self.fail(
                MemErrno::InvalidParameter,
                "remap",
                "bad old_size parameter: must be non-zero",
            ));
        }
        if new_size == 0 {
            return Err(self.fail(
                MemErrno::InvalidParameter,
                "remap",
                "bad new_size parameter: must be non-zero",
            ));
        }
        if flags != MREMAP_MAYMOVE {
            return Err(self.fail(
                MemErrno::InvalidParameter,
                "remap",
                "bad flags parameter: must be MREMAP_MAYMOVE",
            ));
        }

        let old_size = match round_up_page(old_size) {
            Some(old_size) => old_size,
            None => {
                return Err(self.fail(
                    MemErrno::InvalidParameter,
                    "remap",
                    "bad old_size parameter: rounding overflow",
                ))
            }
        };
        let new_size = match round_up_page(new_size) {
            Some(new_size) => new_size,
            None => {
                return Err(self.fail(
                    MemErrno::InvalidParameter,
                    "remap",
                    "bad new_size parameter: rounding overflow",
                ))
            }
        };
        let old_end = match addr.checked_add(old_size) {
            Some(old_end) => old_end,
            None => {
                return Err(self.fail(
                    MemErrno::InvalidParameter,
                    "remap",
                    "bad old_size parameter: range overflow",
                ))
            }
        };

        let idx = match self.list_find(addr) {
            Some(idx) => idx,
            None => {
                return Err(self.fail(MemErrno::InvalidParameter, "remap", "mapping not found"))
            }
        };
        let vad_end = self.end_of(idx);
        if old_end > vad_end {
            return Err(self.fail(MemErrno::InvalidParameter, "remap", "illegal range"));
        }

        if new_size < old_size {
            let new_end = addr + new_size;

            // Bytes between the shrunk range and the region's original
            // right edge stay mapped and get their own descriptor.
            if vad_end != old_end {
                let prot = self.entries[idx].prot;
                let vflags = self.entries[idx].flags;
                let right = match self.new_entry(old_end, vad_end - old_end, prot, vflags) {
                    Some(right) => right,
                    None => {
                        return Err(self.fail(
                            MemErrno::Failure,
                            "remap",
                            "descriptor pool exhausted",
                        ))
                    }
                };
                self.list_insert_after(Some(idx), right);
                self.sync_map_bottom();
                self.mark(VmmapCoverage::RemapShrinkSplit);
            }

            self.entries[idx].size = new_end - self.entries[idx].addr;
            if self.scrub {
                memory::fill_bytes(new_end, old_size - new_size, SCRUB_BYTE);
            }
            self.mark(VmmapCoverage::RemapShrink);
            Ok(addr)
        } else if new_size > old_size {
            let delta = new_size - old_size;

            if vad_end == old_end && self.right_gap(idx) >= delta {
                // The request sits at the region's tail and the right gap
                // absorbs the growth: extend in place.
                self.entries[idx].size += delta;
                memory::fill_bytes(old_end, delta, 0);
                self.mark(VmmapCoverage::RemapGrowInPlace);

                if let Some(next) = self.entries[idx].next {
                    if self.end_of(idx) == self.entries[next].addr {
                        let next_size = self.entries[next].size;
                        self.entries[idx].size += next_size;
                        self.list_remove(next);
                        self.sync_map_bottom();
                        self.free_list_put(next);
                        self.mark(VmmapCoverage::RemapGrowCoalesce);
                    }
                }
                Ok(addr)
            } else {
                // Grow by moving: fresh mapping, copy, release the old
                // range. The fresh region never intersects the old one,
                // which makes the copy sound.
                let prot = self.entries[idx].prot;
                let vflags = self.entries[idx].flags;
                let new_addr = self.map_locked(None, new_size, prot, vflags)?;
                memory::copy_bytes(addr, new_addr, old_size);
                if self.unmap_locked(addr, old_size).is_err() {
                    return Err(self.fail(MemErrno::Failure, "remap", "unmapping failed"));
                }
                self.mark(VmmapCoverage::RemapGrowMove);
                Ok(new_addr)
            }
        } else {
            self.mark(VmmapCoverage::RemapNoChange);
            Ok(addr)
        }
    }

    // ===== Introspection =====

    fn regions_locked(&self) -> Vec<(usize, usize)> {
        let mut regions = Vec::new();
        let mut cur = self.list_head;
        while let Some(idx) = cur {
            regions.push((self.entries[idx].addr, self.entries[idx].size));
            cur = self.entries[idx].next;
        }
        regions
    }

    fn live_count(&self) -> usize {
        let mut count = 0;
        let mut cur = self.list_head;
        while let Some(idx) = cur {
            count += 1;
            cur = self.entries[idx].next;
        }
        count
    }

    fn free_count(&self) -> usize {
        let mut count = 0;
        let mut cur = self.free_head;
        while let Some(idx) = cur {
            count += 1;
            cur = self.entries[idx].next;
        }
        count
    }
}

impl Vmmap {
    /// Build a manager over the `size`-byte range starting at `base`.
    ///
    /// `base` must be non-zero and page-aligned, `size` a non-zero page
    /// multiple, and the range must not wrap the address space. The low
    /// pages of the range are reserved for the descriptor pool; everything
    /// above them is heap until the break, then unassigned, then mapped.
    /// Scrubbing and live sanity checking start out disabled.
    pub fn new(base: usize, size: usize) -> Result<Self, MemErrno> {
        let state = VmmapState::new(base, size)?;
        Ok(Vmmap {
            state: Mutex::new(state),
        })
    }

    /// Toggle overwriting released bytes with the scrub pattern before they
    /// become reusable.
    pub fn set_scrub(&self, enable: bool) {
        self.state.lock().scrub = enable;
    }

    /// The diagnostic recorded by the most recent failed operation, empty
    /// after a success.
    pub fn last_error(&self) -> String {
        self.state.lock().err.clone()
    }

    /// Address/size pairs of the live regions in address order.
    pub fn regions(&self) -> Vec<(usize, usize)> {
        self.state.lock().regions_locked()
    }

    pub fn base_address(&self) -> usize {
        self.state.lock().base_address
    }

    pub fn start_address(&self) -> usize {
        self.state.lock().start_address
    }

    pub fn end_address(&self) -> usize {
        self.state.lock().end_address
    }

    pub fn program_break(&self) -> usize {
        self.state.lock().program_break
    }

    pub fn map_bottom(&self) -> usize {
        self.state.lock().map_bottom
    }

    pub fn region_count(&self) -> usize {
        self.state.lock().live_count()
    }

    pub fn free_descriptor_count(&self) -> usize {
        self.state.lock().free_count()
    }

    /// Descriptors handed out by the bump pointer so far (live plus freed).
    pub fn pool_used(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Snapshot of the branch-coverage flags.
    pub fn coverage(&self) -> [bool; VMMAP_COVERAGE_N] {
        self.state.lock().coverage
    }

    /// Render the manager's layout for logging: the frontiers and pool
    /// counters, plus the live region table when `full` is set.
    pub fn dump(&self, full: bool) -> String {
        use std::fmt::Write;

        let state = self.state.lock();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "vmmap: base={:#x} start={:#x} brk={:#x} map={:#x} end={:#x}",
            state.base_address,
            state.start_address,
            state.program_break,
            state.map_bottom,
            state.end_address,
        );
        let _ = writeln!(
            out,
            "pool: used={} free={} capacity={}",
            state.entries.len(),
            state.free_count(),
            state.pool_capacity,
        );
        if full {
            let mut cur = state.list_head;
            while let Some(idx) = cur {
                let entry = &state.entries[idx];
                let _ = writeln!(
                    out,
                    "region: addr={:#x} size={:#x} prot={:#x} flags={:#x}",
                    entry.addr, entry.size, entry.prot, entry.flags,
                );
                cur = entry.next;
            }
        }
        out
    }
}

impl VmmapOps for Vmmap {
    // Gated sanity violations are reported with a kind taken from the
    // failing operation's own error set: OutOfMemory is all sbrk has; brk
    // and remap carry Failure for a failed operation; map and unmap treat
    // a corrupt manager like their liveness check does, as an invalid
    // manager argument (unmap's exit keeps Unexpected, the kind its
    // post-condition contract names).
    fn sbrk(&self, increment: isize) -> Result<usize, MemErrno> {
        let mut state = self.state.lock();
        state.err.clear();
        state.ensure_entry("sbrk", MemErrno::OutOfMemory)?;
        let old_break = state.sbrk_locked(increment)?;
        state.ensure_exit("sbrk", MemErrno::OutOfMemory)?;
        Ok(old_break)
    }

    fn brk(&self, addr: usize) -> Result<(), MemErrno> {
        let mut state = self.state.lock();
        state.err.clear();
        state.ensure_entry("brk", MemErrno::InvalidParameter)?;
        state.brk_locked(addr)?;
        state.ensure_exit("brk", MemErrno::Failure)?;
        Ok(())
    }

    fn map(
        &self,
        addr: Option<usize>,
        length: usize,
        prot: i32,
        flags: i32,
    ) -> Result<usize, MemErrno> {
        let mut state = self.state.lock();
        state.err.clear();
        state.ensure_entry("map", MemErrno::InvalidParameter)?;
        let start = state.map_locked(addr, length, prot, flags)?;
        state.ensure_exit("map", MemErrno::InvalidParameter)?;
        tracing::trace!(target: "vmmap", addr = start, length, "map");
        Ok(start)
    }

    fn unmap(&self, addr: usize, length: usize) -> Result<(), MemErrno> {
        let mut state = self.state.lock();
        state.err.clear();
        state.ensure_entry("unmap", MemErrno::InvalidParameter)?;
        state.unmap_locked(addr, length)?;
        state.ensure_exit("unmap", MemErrno::Unexpected)?;
        tracing::trace!(target: "vmmap", addr, length, "unmap");
        Ok(())
    }

    fn remap(
        &self,
        addr: usize,
        old_size: usize,
        new_size: usize,
        flags: i32,
    ) -> Result<usize, MemErrno> {
        let mut state = self.state.lock();
        state.err.clear();
        state.ensure_entry("remap", MemErrno::InvalidParameter)?;
        let new_addr = state.remap_locked(addr, old_size, new_size, flags)?;
        state.ensure_exit("remap", MemErrno::Failure)?;
        tracing::trace!(target: "vmmap", addr, old_size, new_size, new_addr, "remap");
        Ok(new_addr)
    }

    fn is_sane(&self) -> bool {
        let mut state = self.state.lock();
        state.err.clear();
        state.check_sane()
    }

    fn set_sanity(&self, enable: bool) {
        self.state.lock().sanity = enable;
    }
}
