//! Utility functions.

/// Aligns an address or size up to the next multiple of `align`.
/// `align` must be a power of two; an alignment of zero leaves `addr` as is.
pub fn align_up(addr: u64, align: u64) -> u64 {
    if align == 0 {
        return addr;
    }
    assert!(align.is_power_of_two());
    (addr + align - 1) & !(align - 1)
}

/// Like [`align_up`], but returns `None` instead of wrapping past `u64::MAX`.
pub fn checked_align_up(addr: u64, align: u64) -> Option<u64> {
    if align == 0 {
        return Some(addr);
    }
    if !align.is_power_of_two() {
        return None;
    }
    Some(addr.checked_add(align - 1)? & !(align - 1))
}

/// Returns true for alignments accepted by the layout engine: non-zero powers of two.
pub fn is_valid_align(align: u64) -> bool {
    align.is_power_of_two()
}
