// Resize tests: shrink with and without a split, in-place growth with
// coalescing, moving growth, and validation.

use crate::tests::*;
use sysdefs::constants::err_const::MemErrno;
use sysdefs::constants::mem_const::{MREMAP_MAYMOVE, SCRUB_BYTE};

// === NO CHANGE ===

/// Test: a same-size remap returns the original address untouched
#[test]
fn test_remap_same_size_is_identity() {
    let (_slab, vmmap) = test_vmmap(64);

    let addr = map_pages(&vmmap, 4);
    poke(addr, 0x55);

    let out = vmmap
        .remap(addr, 4 * PGSZ, 4 * PGSZ, MREMAP_MAYMOVE)
        .expect("remap failed");
    assert_eq!(out, addr);
    assert_eq!(peek(addr), 0x55);
    assert_eq!(vmmap.regions(), vec![(addr, 4 * PGSZ)]);
}

// === SHRINK ===

/// Test: shrinking a whole region keeps its address and scrubs the tail
#[test]
fn test_remap_shrink() {
    let (_slab, vmmap) = test_vmmap(64);

    let addr = map_pages(&vmmap, 8);
    let out = vmmap
        .remap(addr, 8 * PGSZ, 4 * PGSZ, MREMAP_MAYMOVE)
        .expect("remap failed");

    assert_eq!(out, addr);
    assert_eq!(vmmap.regions(), vec![(addr, 4 * PGSZ)]);
    assert_eq!(peek(addr + 4 * PGSZ), SCRUB_BYTE);
    assert_eq!(peek(addr + 8 * PGSZ - 1), SCRUB_BYTE);
}

/// Test: shrinking a leading slice of a larger region splits off the rest
/// Bytes past the old range stay mapped under their own descriptor
#[test]
fn test_remap_shrink_splits_right_excess() {
    let (_slab, vmmap) = test_vmmap(64);

    let addr = map_pages(&vmmap, 8);
    poke(addr + 5 * PGSZ, 0x66);

    // The old range covers only the first half of the region.
    let out = vmmap
        .remap(addr, 4 * PGSZ, 2 * PGSZ, MREMAP_MAYMOVE)
        .expect("remap failed");

    assert_eq!(out, addr);
    assert_eq!(
        vmmap.regions(),
        vec![(addr, 2 * PGSZ), (addr + 4 * PGSZ, 4 * PGSZ)]
    );
    // The released slice between them was scrubbed, the excess kept.
    assert_eq!(peek(addr + 2 * PGSZ), SCRUB_BYTE);
    assert_eq!(peek(addr + 5 * PGSZ), 0x66);
    assert!(vmmap.is_sane());
}

// === GROW IN PLACE ===

/// Test: a region with a large enough right gap grows without moving
/// The grown bytes read as zero even though the gap held scrubbed garbage
#[test]
fn test_remap_grow_in_place() {
    let (_slab, vmmap) = test_vmmap(1024);

    let a = map_pages(&vmmap, 8);
    let b = map_pages(&vmmap, 8);
    // Release the upper region so the lower one has an eight-page gap.
    vmmap.unmap(a, 8 * PGSZ).expect("unmap failed");
    assert_eq!(peek(b + 8 * PGSZ), SCRUB_BYTE);

    let out = vmmap
        .remap(b, 8 * PGSZ, 16 * PGSZ, MREMAP_MAYMOVE)
        .expect("remap failed");

    assert_eq!(out, b);
    assert_eq!(vmmap.regions(), vec![(b, 16 * PGSZ)]);
    assert_eq!(peek(b + 8 * PGSZ), 0);
    assert_eq!(peek(b + 16 * PGSZ - 1), 0);
}

/// Test: in-place growth that lands flush on the next region coalesces
#[test]
fn test_remap_grow_coalesces_right() {
    let (_slab, vmmap) = test_vmmap(64);

    let q = map_pages(&vmmap, 16);
    vmmap.unmap(q + 4 * PGSZ, 4 * PGSZ).expect("unmap failed");
    assert_eq!(vmmap.region_count(), 2);

    let out = vmmap
        .remap(q, 4 * PGSZ, 8 * PGSZ, MREMAP_MAYMOVE)
        .expect("remap failed");

    assert_eq!(out, q);
    assert_eq!(vmmap.regions(), vec![(q, 16 * PGSZ)]);
    assert!(vmmap.is_sane());
}

// === GROW BY MOVE ===

/// Test: a region with no right gap moves when it grows
/// The old contents arrive at the new address and the old range is
/// released
#[test]
fn test_remap_grow_moves_when_blocked() {
    let (_slab, vmmap) = test_vmmap(1024);

    let x = map_pages(&vmmap, 8);
    let y = map_pages(&vmmap, 8);
    assert_eq!(y, x - 8 * PGSZ);

    poke(y, 0x77);
    poke(y + 8 * PGSZ - 1, 0x88);

    // Y's right gap is zero (X sits flush above it), so growth must move.
    let out = vmmap
        .remap(y, 8 * PGSZ, 16 * PGSZ, MREMAP_MAYMOVE)
        .expect("remap failed");

    assert_ne!(out, y);
    assert_eq!(peek(out), 0x77);
    assert_eq!(peek(out + 8 * PGSZ - 1), 0x88);
    // Fresh pages beyond the copied prefix read as zero.
    assert_eq!(peek(out + 8 * PGSZ), 0);
    // The old range was released and scrubbed.
    assert_eq!(peek(y), SCRUB_BYTE);
    assert!(is_sorted(&vmmap));
    assert!(vmmap.is_sane());
}

/// Test: a move that cannot find space fails without touching the region
#[test]
fn test_remap_grow_out_of_memory() {
    let (_slab, vmmap) = test_vmmap(16);

    let addr = map_pages(&vmmap, 4);
    poke(addr, 0x99);
    let before = vmmap.regions();

    let err = vmmap
        .remap(addr, 4 * PGSZ, 4096 * PGSZ, MREMAP_MAYMOVE)
        .unwrap_err();
    assert_eq!(err, MemErrno::OutOfMemory);
    assert_eq!(vmmap.regions(), before);
    assert_eq!(peek(addr), 0x99);
    assert!(vmmap.is_sane());
}

// === VALIDATION ===

/// Test: remap validates flags, sizes, and the containing region
#[test]
fn test_remap_rejects_bad_parameters() {
    let (_slab, vmmap) = test_vmmap(64);

    let addr = map_pages(&vmmap, 4);

    assert_eq!(
        vmmap.remap(addr, 4 * PGSZ, 8 * PGSZ, 0).unwrap_err(),
        MemErrno::InvalidParameter
    );
    assert_eq!(
        vmmap.remap(addr, 0, 8 * PGSZ, MREMAP_MAYMOVE).unwrap_err(),
        MemErrno::InvalidParameter
    );
    assert_eq!(
        vmmap.remap(addr, 4 * PGSZ, 0, MREMAP_MAYMOVE).unwrap_err(),
        MemErrno::InvalidParameter
    );
    assert_eq!(
        vmmap.remap(addr + 1, PGSZ, PGSZ, MREMAP_MAYMOVE).unwrap_err(),
        MemErrno::InvalidParameter
    );
    // Nothing is mapped at the start of the range.
    assert_eq!(
        vmmap
            .remap(vmmap.start_address(), PGSZ, PGSZ, MREMAP_MAYMOVE)
            .unwrap_err(),
        MemErrno::InvalidParameter
    );
    // An old range overrunning its region is rejected.
    assert_eq!(
        vmmap
            .remap(addr, 8 * PGSZ, 2 * PGSZ, MREMAP_MAYMOVE)
            .unwrap_err(),
        MemErrno::InvalidParameter
    );

    assert_eq!(vmmap.regions(), vec![(addr, 4 * PGSZ)]);
    assert!(vmmap.is_sane());
}
