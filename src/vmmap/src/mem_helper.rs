//! Address-alignment helpers shared by the manager internals and its tests.

use sysdefs::constants::mem_const::PAGESIZE;

/// Round a byte length up to the next page multiple.
///
/// Returns `None` when the rounded value would not fit in `usize`, so
/// callers can reject absurd lengths instead of wrapping.
pub fn round_up_page(length: usize) -> Option<usize> {
    if length % PAGESIZE == 0 {
        Some(length)
    } else {
        (length / PAGESIZE + 1).checked_mul(PAGESIZE)
    }
}

/// Whether an address or length sits on a page boundary.
pub fn page_aligned(value: usize) -> bool {
    value % PAGESIZE == 0
}

/// Number of whole pages covered by a page-multiple byte length.
pub fn page_count(size: usize) -> usize {
    size / PAGESIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up_page() {
        assert_eq!(round_up_page(0), Some(0));
        assert_eq!(round_up_page(1), Some(PAGESIZE));
        assert_eq!(round_up_page(PAGESIZE), Some(PAGESIZE));
        assert_eq!(round_up_page(PAGESIZE + 1), Some(2 * PAGESIZE));
        // Lengths that would round past the top of the address space are
        // refused rather than wrapped.
        assert_eq!(round_up_page(usize::MAX), None);
    }
}
