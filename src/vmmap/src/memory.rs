//! The byte-touching edge of the manager.
//!
//! Everything else in this crate works on plain `usize` addresses; the few
//! places that actually dereference the managed range (zero-fill on map,
//! scrub on release, the copy half of a moving remap) and the helpers that
//! obtain a page-aligned backing slab from the host all live here.

use sysdefs::constants::mem_const::PAGESIZE;

/// Check if a return value from `libc::mmap` indicates an error.
///
/// Valid mmap addresses are always page-aligned, while error returns are
/// negative errno values cast to `usize`. An unaligned value outside the
/// errno range means the host gave us something neither shape allows, and
/// there is no way to continue from that.
fn mmap_failed(ret: usize) -> bool {
    if ret % PAGESIZE == 0 {
        return false;
    }

    // Errno returns are -1 to -PAGESIZE, i.e. the top page of the address
    // space once cast.
    let min_errno = usize::MAX - PAGESIZE + 1;
    if ret >= min_errno {
        return true;
    }

    panic!(
        "mmap returned unaligned address outside errno range: {:#x}",
        ret
    );
}

/// Reserve a page-aligned, read-write, anonymous backing slab from the host.
///
/// This is how embedders (and the test suite) obtain the raw range a
/// manager is then initialized over. The manager itself never calls this.
pub fn alloc_backing(size: usize) -> Option<usize> {
    let ret = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
            -1,
            0,
        )
    } as usize;

    if mmap_failed(ret) {
        None
    } else {
        Some(ret)
    }
}

/// Return a backing slab obtained with [`alloc_backing`] to the host.
pub fn free_backing(addr: usize, size: usize) {
    unsafe {
        libc::munmap(addr as *mut libc::c_void, size);
    }
}

/// Fill `len` bytes starting at `addr` with `byte`.
///
/// Callers must pass a range inside a live managed slab.
pub(crate) fn fill_bytes(addr: usize, len: usize, byte: u8) {
    unsafe {
        std::ptr::write_bytes(addr as *mut u8, byte, len);
    }
}

/// Copy `len` bytes from `src` to `dst`. The ranges must not overlap; the
/// placement policy guarantees that for the moving-remap path because the
/// fresh region never intersects the live region it replaces.
pub(crate) fn copy_bytes(src: usize, dst: usize, len: usize) {
    unsafe {
        std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len);
    }
}
